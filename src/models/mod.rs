pub mod stix;

use std::net::IpAddr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Which intelligence sources contributed to an indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Source {
    #[serde(rename = "LOCAL")]
    Local,
    #[serde(rename = "EXTERNAL")]
    External,
}

impl Source {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "LOCAL",
            Self::External => "EXTERNAL",
        }
    }
}

/// One contributing source, surfaced on the wire as an external reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceEntry {
    pub source_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    pub observed_at: DateTime<Utc>,
}

/// Geolocation attached to an indicator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoData {
    pub country_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    pub lat: f64,
    pub lon: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub isp: Option<String>,
}

/// The central entity: one IP-keyed threat record with fused confidence.
///
/// Created or refreshed wholesale by a rebuild cycle; never mutated after
/// commit within a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Indicator {
    pub ip: String,
    pub sources: Vec<Source>,
    pub local_confidence: Option<u8>,
    pub external_confidence: Option<u8>,
    pub final_confidence: u8,
    pub first_reported_at: DateTime<Utc>,
    pub last_reported_at: DateTime<Utc>,
    pub categories: Vec<String>,
    pub labels: Vec<String>,
    pub freshness: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo: Option<GeoData>,
    pub provenance: Vec<ProvenanceEntry>,
    pub processed_at: DateTime<Utc>,
}

impl Indicator {
    #[must_use]
    pub fn has_source(&self, source: Source) -> bool {
        self.sources.contains(&source)
    }
}

/// Row projected from the read-only local threat table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalRecord {
    pub ip: String,
    pub confidence: u8,
    pub categories: Vec<String>,
    pub first_reported_at: DateTime<Utc>,
    pub last_reported_at: DateTime<Utc>,
    pub report_count: i64,
}

/// External per-IP reputation from the blacklist provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReputationRecord {
    pub ip: String,
    pub confidence: u8,
    pub categories: Vec<String>,
    pub reporter_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub raw: serde_json::Value,
}

/// Cached geolocation lookup result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoRecord {
    pub ip: String,
    pub country_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    pub lat: f64,
    pub lon: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub isp: Option<String>,
    pub provider_name: String,
    pub fetched_at: DateTime<Utc>,
}

impl GeoRecord {
    #[must_use]
    pub fn into_geo_data(self) -> GeoData {
        GeoData {
            country_code: self.country_code,
            country_name: self.country_name,
            city: self.city,
            lat: self.lat,
            lon: self.lon,
            asn: self.asn,
            isp: self.isp,
        }
    }
}

/// UTC-day request counter state for the reputation provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetState {
    pub day: NaiveDate,
    pub requests_used: i64,
    pub limit: i64,
}

impl BudgetState {
    #[must_use]
    pub const fn exhausted(&self) -> bool {
        self.requests_used >= self.limit
    }
}

/// The atomically-committed output of one rebuild cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Monotonically increasing across rebuilds; pagination cursors are
    /// bound to it.
    pub generation: u64,
    pub built_at: DateTime<Utc>,
    pub indicators: Vec<Indicator>,
}

/// Bookkeeping for the most recent rebuild, surfaced via /stats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebuildSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub local_count: usize,
    pub external_count: usize,
    pub with_geo: usize,
    pub geo_success_ratio: f64,
    pub budget_exhausted: bool,
}

/// Returns 4 or 6 for a valid address, `None` otherwise.
#[must_use]
pub fn ip_version(ip: &str) -> Option<u8> {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(_)) => Some(4),
        Ok(IpAddr::V6(_)) => Some(6),
        Err(_) => None,
    }
}

#[must_use]
pub fn is_valid_ip(ip: &str) -> bool {
    ip_version(ip).is_some()
}

/// True for addresses that never have meaningful geolocation or reputation:
/// private ranges, loopback, link-local, multicast, unspecified.
#[must_use]
pub fn is_non_routable(ip: &str) -> bool {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        Ok(IpAddr::V6(v6)) => v6.is_loopback() || v6.is_multicast() || v6.is_unspecified(),
        Err(_) => true,
    }
}
