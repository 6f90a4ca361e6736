use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ServiceError;

/// Application settings loaded from environment variables.
///
/// The confidence weights intentionally have no default: the split between
/// local and external intelligence is an operational decision, and starting
/// with an unconfigured split silently changes every score the service
/// publishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Read-only connection string for the local threat database.
    pub database_url: String,
    /// Redis endpoint; `None` selects the in-process cache backend.
    pub redis_url: Option<String>,

    pub reputation_api_url: String,
    pub reputation_api_key: String,
    pub reputation_daily_limit: i64,
    pub reputation_min_confidence: u8,
    pub reputation_cache_ttl_secs: u64,

    pub local_confidence_weight: f64,
    pub external_confidence_weight: f64,
    pub local_confidence_boost: u8,
    pub minimum_final_confidence: u8,

    pub preprocess_interval_secs: u64,
    pub preprocessing_ttl_secs: u64,
    pub batch_size: usize,
    pub auto_start_processing: bool,

    pub geo_request_delay_ms: u64,
    pub geo_cache_ttl_secs: u64,

    pub listen_addr: String,
    pub listen_port: u16,
    pub log_level: String,
}

const DEFAULT_REPUTATION_API_URL: &str = "https://api.abuseipdb.com/api/v2";

impl Settings {
    /// Load settings from the environment, failing on missing required
    /// values or an invalid weight split.
    pub fn from_env() -> Result<Self, ServiceError> {
        let local_weight: f64 = require_parsed("LOCAL_CONFIDENCE_WEIGHT")?;
        let external_weight: f64 = require_parsed("EXTERNAL_CONFIDENCE_WEIGHT")?;
        if (local_weight + external_weight - 1.0).abs() > 1e-3 {
            return Err(ServiceError::config(format!(
                "LOCAL_CONFIDENCE_WEIGHT + EXTERNAL_CONFIDENCE_WEIGHT must sum to 1.0, got {}",
                local_weight + external_weight
            )));
        }

        let preprocess_interval_secs = parsed_or("PREPROCESS_INTERVAL", 300)?;
        // Snapshot TTL must outlive the rebuild interval plus slack, or the
        // served snapshot lapses between cycles.
        let preprocessing_ttl_secs =
            parsed_or("PREPROCESSING_TTL", preprocess_interval_secs * 3)?;
        if preprocessing_ttl_secs < preprocess_interval_secs {
            return Err(ServiceError::config(format!(
                "PREPROCESSING_TTL ({preprocessing_ttl_secs}s) must be >= PREPROCESS_INTERVAL ({preprocess_interval_secs}s)"
            )));
        }

        Ok(Self {
            database_url: require("DATABASE_URL")?,
            redis_url: std::env::var("REDIS_URL").ok().filter(|v| !v.is_empty()),
            reputation_api_url: std::env::var("REPUTATION_API_URL")
                .unwrap_or_else(|_| DEFAULT_REPUTATION_API_URL.to_string()),
            reputation_api_key: require("REPUTATION_API_KEY")?,
            reputation_daily_limit: parsed_or("REPUTATION_DAILY_LIMIT", 1000)?,
            reputation_min_confidence: parsed_or("REPUTATION_MIN_CONFIDENCE", 50)?,
            reputation_cache_ttl_secs: parsed_or("REPUTATION_CACHE_TTL", 3600)?,
            local_confidence_weight: local_weight,
            external_confidence_weight: external_weight,
            local_confidence_boost: parsed_or("LOCAL_CONFIDENCE_BOOST", 10)?,
            minimum_final_confidence: parsed_or("MINIMUM_FINAL_CONFIDENCE", 85)?,
            preprocess_interval_secs,
            preprocessing_ttl_secs,
            batch_size: parsed_or("BATCH_SIZE", 100)?,
            auto_start_processing: parsed_or("AUTO_START_PROCESSING", true)?,
            geo_request_delay_ms: parsed_or("GEO_REQUEST_DELAY", 1000)?,
            geo_cache_ttl_secs: parsed_or("GEO_CACHE_TTL", 86_400)?,
            listen_addr: std::env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0".to_string()),
            listen_port: parsed_or("LISTEN_PORT", 8000)?,
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    pub fn preprocess_interval(&self) -> Duration {
        Duration::from_secs(self.preprocess_interval_secs)
    }

    pub fn preprocessing_ttl(&self) -> Duration {
        Duration::from_secs(self.preprocessing_ttl_secs)
    }

    pub fn geo_request_delay(&self) -> Duration {
        Duration::from_millis(self.geo_request_delay_ms)
    }

    pub fn reputation_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.reputation_cache_ttl_secs)
    }

    pub fn geo_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.geo_cache_ttl_secs)
    }
}

fn require(key: &str) -> Result<String, ServiceError> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ServiceError::config(format!("{key} must be set")))
}

fn require_parsed<T: std::str::FromStr>(key: &str) -> Result<T, ServiceError>
where
    T::Err: std::fmt::Display,
{
    require(key)?
        .parse()
        .map_err(|e| ServiceError::config(format!("invalid {key}: {e}")))
}

fn parsed_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ServiceError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.is_empty() => raw
            .parse()
            .map_err(|e| ServiceError::config(format!("invalid {key}: {e}"))),
        _ => Ok(default),
    }
}
