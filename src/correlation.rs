//! Intelligence fusion: weighted confidence scoring that prioritizes local
//! detections, recency decay, and category-to-label mapping.

use chrono::{DateTime, Utc};

use crate::errors::ServiceError;
use crate::models::{Indicator, LocalRecord, ProvenanceEntry, ReputationRecord, Source};

/// Local confidence at or above this gets the boost floor applied.
const HIGH_LOCAL_THRESHOLD: u8 = 75;

const LOCAL_SOURCE_NAME: &str = "Local Detection";
const EXTERNAL_SOURCE_NAME: &str = "AbuseIPDB";

#[derive(Debug, Clone)]
pub struct CorrelationEngine {
    local_weight: f64,
    external_weight: f64,
    local_boost: u8,
    minimum_final_confidence: u8,
}

impl CorrelationEngine {
    /// Weights must sum to 1.0 (within 0.001); anything else is a
    /// configuration error and refuses to start.
    pub fn new(
        local_weight: f64,
        external_weight: f64,
        local_boost: u8,
        minimum_final_confidence: u8,
    ) -> Result<Self, ServiceError> {
        if (local_weight + external_weight - 1.0).abs() > 1e-3 {
            return Err(ServiceError::config(format!(
                "confidence weights must sum to 1.0, got {local_weight} + {external_weight}"
            )));
        }
        Ok(Self { local_weight, external_weight, local_boost, minimum_final_confidence })
    }

    /// Fuse local and external confidence into the final score.
    ///
    /// Deterministic: the same inputs always produce the same output.
    #[must_use]
    pub fn score(&self, local: Option<u8>, external: Option<u8>) -> u8 {
        match (local, external) {
            (Some(l), None) => {
                if l >= HIGH_LOCAL_THRESHOLD {
                    self.apply_floor(u16::from(l) + u16::from(self.local_boost))
                } else {
                    l
                }
            }
            (None, Some(e)) => {
                (f64::from(e) * self.external_weight).round().min(100.0) as u8
            }
            (Some(l), Some(e)) => {
                let weighted = f64::from(l) * self.local_weight
                    + f64::from(e) * self.external_weight;
                let weighted = weighted.round().min(100.0) as u16;
                if l >= HIGH_LOCAL_THRESHOLD {
                    self.apply_floor(weighted)
                } else {
                    weighted.min(100) as u8
                }
            }
            (None, None) => 0,
        }
    }

    fn apply_floor(&self, score: u16) -> u8 {
        score.max(u16::from(self.minimum_final_confidence)).min(100) as u8
    }

    /// Recency decay: step curve over the age of the last report.
    #[must_use]
    pub fn freshness(last_reported_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let age_days = (now - last_reported_at).num_days();
        match age_days {
            i64::MIN..=1 => 1.0,
            2..=7 => 0.9,
            8..=30 => 0.7,
            31..=90 => 0.5,
            91..=180 => 0.3,
            _ => 0.1,
        }
    }

    /// Map reporter category tags to STIX threat labels. Unknown or
    /// non-numeric categories contribute nothing; an empty result defaults
    /// to `malicious-activity`.
    #[must_use]
    pub fn stix_labels(categories: &[String]) -> Vec<String> {
        let mut labels: Vec<&str> = categories
            .iter()
            .filter_map(|category| category.parse::<u32>().ok())
            .filter_map(|id| match id {
                7 => Some("phishing"),
                8 => Some("fraud"),
                3 | 5 | 9 | 13 => Some("anonymization"),
                1..=23 => Some("malicious-activity"),
                _ => None,
            })
            .collect();
        labels.sort_unstable();
        labels.dedup();

        if labels.is_empty() {
            labels.push("malicious-activity");
        }
        labels.into_iter().map(String::from).collect()
    }

    /// Correlate one IP's local and external intelligence into an indicator.
    /// At least one input must be present.
    pub fn correlate(
        &self,
        ip: &str,
        local: Option<&LocalRecord>,
        external: Option<&ReputationRecord>,
        now: DateTime<Utc>,
    ) -> Result<Indicator, ServiceError> {
        if local.is_none() && external.is_none() {
            return Err(ServiceError::fatal(format!("no source data for {ip}")));
        }

        let local_confidence = local.map(|l| l.confidence);
        let external_confidence = external.map(|e| e.confidence);
        let final_confidence = self.score(local_confidence, external_confidence);

        let mut sources = Vec::new();
        if local.is_some() {
            sources.push(Source::Local);
        }
        if external.is_some() {
            sources.push(Source::External);
        }

        let mut categories: Vec<String> = local
            .map(|l| l.categories.clone())
            .unwrap_or_default()
            .into_iter()
            .chain(external.map(|e| e.categories.clone()).unwrap_or_default())
            .collect();
        categories.sort_unstable();
        categories.dedup();

        let first_reported_at = local
            .map(|l| l.first_reported_at)
            .or_else(|| external.and_then(|e| e.last_seen))
            .unwrap_or(now);
        let last_reported_at = local
            .map(|l| l.last_reported_at)
            .or_else(|| external.and_then(|e| e.last_seen))
            .unwrap_or(now);

        let mut provenance = Vec::new();
        if let Some(external) = external {
            provenance.push(ProvenanceEntry {
                source_name: EXTERNAL_SOURCE_NAME.to_string(),
                source_url: Some(format!("https://www.abuseipdb.com/check/{ip}")),
                observed_at: external.last_seen.unwrap_or(now),
            });
        }
        if let Some(local) = local {
            provenance.push(ProvenanceEntry {
                source_name: LOCAL_SOURCE_NAME.to_string(),
                source_url: None,
                observed_at: local.last_reported_at,
            });
        }

        Ok(Indicator {
            ip: ip.to_string(),
            sources,
            local_confidence,
            external_confidence,
            final_confidence,
            first_reported_at,
            last_reported_at,
            labels: Self::stix_labels(&categories),
            categories,
            freshness: Self::freshness(last_reported_at, now),
            geo: None,
            provenance,
            processed_at: now,
        })
    }
}
