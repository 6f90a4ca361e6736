//! Serialization of indicators into the STIX 2.1 shape served over TAXII,
//! including the Elastic custom-threat-intelligence extension fields.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ip_version, Indicator};

pub const TAXII_CONTENT_TYPE: &str = "application/taxii+json;version=2.1";
pub const STIX_MEDIA_TYPE: &str = "application/stix+json;version=2.1";
pub const SPEC_VERSION: &str = "2.1";

/// Namespace for deriving stable indicator ids from IP addresses. The same
/// address always maps to the same STIX id across rebuilds.
const INDICATOR_NAMESPACE: Uuid = Uuid::from_bytes([
    0x7d, 0x5b, 0x22, 0x4e, 0x30, 0xa1, 0x4c, 0x1f, 0x9a, 0x3e, 0x5e, 0x1d, 0x2f, 0x86, 0x41,
    0x7b,
]);

/// How long an indicator stays valid past its last report.
const VALIDITY_DAYS: i64 = 30;

#[must_use]
pub fn indicator_id(ip: &str) -> String {
    format!("indicator--{}", Uuid::new_v5(&INDICATOR_NAMESPACE, ip.as_bytes()))
}

#[must_use]
pub fn ip_pattern(ip: &str) -> String {
    match ip_version(ip) {
        Some(6) => format!("[ipv6-addr:value = '{ip}']"),
        _ => format!("[ipv4-addr:value = '{ip}']"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalReference {
    pub source_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Wire form of one indicator. Custom extension fields carry the fused
/// scoring detail and Elastic-shaped geolocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StixIndicator {
    #[serde(rename = "type")]
    pub object_type: String,
    pub spec_version: String,
    pub id: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub pattern: String,
    pub pattern_type: String,
    pub valid_from: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
    pub labels: Vec<String>,
    pub confidence: u8,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub x_local_confidence: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x_external_confidence: Option<u8>,
    pub x_source_set: Vec<String>,
    pub x_categories: Vec<String>,
    pub x_freshness: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub x_elastic_geo_country_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x_elastic_geo_country_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x_elastic_geo_city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x_elastic_geo_coordinates: Option<LatLon>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x_elastic_geo_location: Option<LatLon>,
    /// GeoJSON point order: longitude first.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x_elastic_geo_point: Option<[f64; 2]>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub external_references: Vec<ExternalReference>,
}

impl From<&Indicator> for StixIndicator {
    fn from(indicator: &Indicator) -> Self {
        let geo = indicator.geo.as_ref();
        let coordinates = geo.map(|g| LatLon { lat: g.lat, lon: g.lon });

        Self {
            object_type: "indicator".to_string(),
            spec_version: SPEC_VERSION.to_string(),
            id: indicator_id(&indicator.ip),
            created: indicator.processed_at,
            modified: indicator.processed_at,
            pattern: ip_pattern(&indicator.ip),
            pattern_type: "stix".to_string(),
            valid_from: indicator.last_reported_at,
            valid_until: Some(indicator.last_reported_at + Duration::days(VALIDITY_DAYS)),
            labels: indicator.labels.clone(),
            confidence: indicator.final_confidence,
            x_local_confidence: indicator.local_confidence,
            x_external_confidence: indicator.external_confidence,
            x_source_set: indicator.sources.iter().map(|s| s.as_str().to_string()).collect(),
            x_categories: indicator.categories.clone(),
            x_freshness: indicator.freshness,
            x_elastic_geo_country_code: geo.map(|g| g.country_code.clone()),
            x_elastic_geo_country_name: geo.and_then(|g| g.country_name.clone()),
            x_elastic_geo_city: geo.and_then(|g| g.city.clone()),
            x_elastic_geo_coordinates: coordinates,
            x_elastic_geo_location: coordinates,
            x_elastic_geo_point: geo.map(|g| [g.lon, g.lat]),
            external_references: indicator
                .provenance
                .iter()
                .map(|entry| ExternalReference {
                    source_name: entry.source_name.clone(),
                    url: entry.source_url.clone(),
                    description: None,
                })
                .collect(),
        }
    }
}

/// STIX bundle carrying a page of indicators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StixBundle {
    #[serde(rename = "type")]
    pub object_type: String,
    pub id: String,
    pub spec_version: String,
    pub objects: Vec<StixIndicator>,
}

impl StixBundle {
    #[must_use]
    pub fn new(objects: Vec<StixIndicator>) -> Self {
        Self {
            object_type: "bundle".to_string(),
            id: format!("bundle--{}", Uuid::new_v4()),
            spec_version: SPEC_VERSION.to_string(),
            objects,
        }
    }
}

/// TAXII 2.1 envelope wrapping every collection response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    pub data: T,
}

/// One manifest entry per indicator in a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id: String,
    pub date_added: DateTime<Utc>,
    pub version: DateTime<Utc>,
    pub media_type: String,
}

impl ManifestEntry {
    #[must_use]
    pub fn from_indicator(indicator: &Indicator) -> Self {
        Self {
            id: indicator_id(&indicator.ip),
            date_added: indicator.processed_at,
            version: indicator.processed_at,
            media_type: STIX_MEDIA_TYPE.to_string(),
        }
    }
}
