//! Shared fixtures: in-memory store, stubbed reputation source, and stub geo
//! providers so cycles run without touching the network.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use ioc_exchange::api::{self, AppState};
use ioc_exchange::cache::IocCache;
use ioc_exchange::config::Settings;
use ioc_exchange::db::MemoryThreatStore;
use ioc_exchange::enrichment::{BlacklistPage, GeoEnricher, GeoProvider, ReputationSource};
use ioc_exchange::errors::ServiceError;
use ioc_exchange::models::{GeoRecord, Indicator, LocalRecord, ReputationRecord, Source};
use ioc_exchange::workers::IocProcessor;

pub fn test_settings() -> Settings {
    Settings {
        database_url: "postgres://readonly@localhost/threats".to_string(),
        redis_url: None,
        reputation_api_url: "http://127.0.0.1:0".to_string(),
        reputation_api_key: "test-key".to_string(),
        reputation_daily_limit: 1000,
        reputation_min_confidence: 50,
        reputation_cache_ttl_secs: 3600,
        local_confidence_weight: 0.8,
        external_confidence_weight: 0.2,
        local_confidence_boost: 10,
        minimum_final_confidence: 85,
        preprocess_interval_secs: 300,
        preprocessing_ttl_secs: 900,
        batch_size: 100,
        auto_start_processing: false,
        geo_request_delay_ms: 1,
        geo_cache_ttl_secs: 86_400,
        listen_addr: "127.0.0.1".to_string(),
        listen_port: 0,
        log_level: "debug".to_string(),
    }
}

pub fn local_record(ip: &str, confidence: u8) -> LocalRecord {
    let now = Utc::now();
    LocalRecord {
        ip: ip.to_string(),
        confidence,
        categories: vec!["22".to_string()],
        first_reported_at: now - chrono::Duration::hours(4),
        last_reported_at: now,
        report_count: 1,
    }
}

pub fn reputation_record(ip: &str, confidence: u8) -> ReputationRecord {
    ReputationRecord {
        ip: ip.to_string(),
        confidence,
        categories: vec!["abuseipdb-blacklist".to_string()],
        reporter_count: 5,
        last_seen: Some(Utc::now()),
        raw: serde_json::Value::Null,
    }
}

pub fn indicator(ip: &str, final_confidence: u8) -> Indicator {
    let now = Utc::now();
    Indicator {
        ip: ip.to_string(),
        sources: vec![Source::Local],
        local_confidence: Some(final_confidence),
        external_confidence: None,
        final_confidence,
        first_reported_at: now,
        last_reported_at: now,
        categories: vec!["22".to_string()],
        labels: vec!["malicious-activity".to_string()],
        freshness: 1.0,
        geo: None,
        provenance: Vec::new(),
        processed_at: now,
    }
}

/// Stubbed reputation source: serves a fixed record set, or simulates an
/// exhausted budget.
pub struct StubReputation {
    pub records: Vec<ReputationRecord>,
    pub exhausted: bool,
}

impl StubReputation {
    pub fn with_records(records: Vec<ReputationRecord>) -> Self {
        Self { records, exhausted: false }
    }

    pub fn exhausted() -> Self {
        Self { records: Vec::new(), exhausted: true }
    }
}

#[async_trait]
impl ReputationSource for StubReputation {
    async fn get_blacklist(&self, min_confidence: u8) -> Result<BlacklistPage, ServiceError> {
        if self.exhausted {
            return Err(ServiceError::BudgetExhausted { limit: 0 });
        }
        Ok(BlacklistPage {
            records: self
                .records
                .iter()
                .filter(|r| r.confidence >= min_confidence)
                .cloned()
                .collect(),
            from_cache: false,
        })
    }

    async fn check(&self, ip: &str) -> Result<Option<ReputationRecord>, ServiceError> {
        if self.exhausted {
            return Err(ServiceError::BudgetExhausted { limit: 0 });
        }
        Ok(self.records.iter().find(|r| r.ip == ip).cloned())
    }
}

/// Geo provider that always answers with a fixed country.
pub struct StaticGeoProvider;

#[async_trait]
impl GeoProvider for StaticGeoProvider {
    fn name(&self) -> &'static str {
        "static-test"
    }

    async fn fetch(&self, ip: &str) -> Result<Option<GeoRecord>, ServiceError> {
        Ok(Some(GeoRecord {
            ip: ip.to_string(),
            country_code: "NL".to_string(),
            country_name: Some("Netherlands".to_string()),
            city: Some("Amsterdam".to_string()),
            lat: 52.37,
            lon: 4.89,
            asn: Some("AS1104".to_string()),
            isp: Some("Example ISP".to_string()),
            provider_name: "static-test".to_string(),
            fetched_at: Utc::now(),
        }))
    }
}

/// Geo provider that always fails.
pub struct FailingGeoProvider;

#[async_trait]
impl GeoProvider for FailingGeoProvider {
    fn name(&self) -> &'static str {
        "failing-test"
    }

    async fn fetch(&self, _ip: &str) -> Result<Option<GeoRecord>, ServiceError> {
        Err(ServiceError::transient("provider down"))
    }
}

pub struct Harness {
    pub cache: Arc<IocCache>,
    pub processor: Arc<IocProcessor>,
    pub state: Arc<AppState>,
    pub router: axum::Router,
    /// Held open so the admin trigger endpoint sees a live preprocessor.
    pub trigger_rx: mpsc::Receiver<()>,
}

pub fn build_harness(
    locals: Vec<LocalRecord>,
    reputation: StubReputation,
    geo_providers: Vec<Arc<dyn GeoProvider>>,
) -> Harness {
    let settings = Arc::new(test_settings());
    let cache = Arc::new(IocCache::in_memory());
    build_harness_with_cache(settings, cache, locals, reputation, geo_providers)
}

pub fn build_harness_with_cache(
    settings: Arc<Settings>,
    cache: Arc<IocCache>,
    locals: Vec<LocalRecord>,
    reputation: StubReputation,
    geo_providers: Vec<Arc<dyn GeoProvider>>,
) -> Harness {
    let geo = Arc::new(GeoEnricher::new(
        geo_providers,
        Duration::from_millis(settings.geo_request_delay_ms),
        cache.clone(),
        Duration::from_secs(settings.geo_cache_ttl_secs),
    ));
    let processor = Arc::new(
        IocProcessor::new(
            Arc::new(MemoryThreatStore::new(locals)),
            Arc::new(reputation),
            geo,
            cache.clone(),
            settings.clone(),
        )
        .expect("processor construction"),
    );

    let (trigger_tx, trigger_rx) = mpsc::channel(1);
    let state = Arc::new(AppState {
        settings,
        cache: cache.clone(),
        collections: api::default_collections(),
        processor: processor.clone(),
        rebuild_trigger: trigger_tx,
    });
    let router = api::router(state.clone());

    Harness { cache, processor, state, router, trigger_rx }
}
