//! Prometheus collectors for cache, upstream, and rebuild observability.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder,
};

pub struct ServiceMetrics {
    pub registry: Registry,
    /// Cache operations by backend, operation, and outcome (hit/miss/ok/error).
    pub cache_operations_total: IntCounterVec,
    /// Outbound reputation API requests by outcome.
    pub reputation_requests_total: IntCounterVec,
    /// Outbound geolocation requests by provider and outcome.
    pub geo_requests_total: IntCounterVec,
    /// Rebuild cycles by outcome (completed/failed/skipped).
    pub rebuilds_total: IntCounterVec,
    pub rebuild_duration_seconds: Histogram,
}

impl ServiceMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let cache_operations_total = IntCounterVec::new(
            Opts::new("ioc_cache_operations_total", "Cache operations by backend and outcome"),
            &["backend", "op", "outcome"],
        )
        .expect("cache_operations_total");

        let reputation_requests_total = IntCounterVec::new(
            Opts::new("ioc_reputation_requests_total", "Outbound reputation API requests"),
            &["outcome"],
        )
        .expect("reputation_requests_total");

        let geo_requests_total = IntCounterVec::new(
            Opts::new("ioc_geo_requests_total", "Outbound geolocation requests"),
            &["provider", "outcome"],
        )
        .expect("geo_requests_total");

        let rebuilds_total = IntCounterVec::new(
            Opts::new("ioc_rebuilds_total", "Preprocessor rebuild cycles"),
            &["outcome"],
        )
        .expect("rebuilds_total");

        let rebuild_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("ioc_rebuild_duration_seconds", "Rebuild cycle duration")
                .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0]),
        )
        .expect("rebuild_duration_seconds");

        registry.register(Box::new(cache_operations_total.clone())).expect("register");
        registry.register(Box::new(reputation_requests_total.clone())).expect("register");
        registry.register(Box::new(geo_requests_total.clone())).expect("register");
        registry.register(Box::new(rebuilds_total.clone())).expect("register");
        registry.register(Box::new(rebuild_duration_seconds.clone())).expect("register");

        Self {
            registry,
            cache_operations_total,
            reputation_requests_total,
            geo_requests_total,
            rebuilds_total,
            rebuild_duration_seconds,
        }
    }
}

pub static METRICS: Lazy<ServiceMetrics> = Lazy::new(ServiceMetrics::new);

pub fn record_cache_op(backend: &str, op: &str, outcome: &str) {
    METRICS.cache_operations_total.with_label_values(&[backend, op, outcome]).inc();
}

pub fn record_reputation_request(outcome: &str) {
    METRICS.reputation_requests_total.with_label_values(&[outcome]).inc();
}

pub fn record_geo_request(provider: &str, outcome: &str) {
    METRICS.geo_requests_total.with_label_values(&[provider, outcome]).inc();
}

pub fn record_rebuild(outcome: &str, duration_secs: f64) {
    METRICS.rebuilds_total.with_label_values(&[outcome]).inc();
    if outcome == "completed" {
        METRICS.rebuild_duration_seconds.observe(duration_secs);
    }
}

/// Cache read hit ratio across both backends; 0.0 before any reads.
#[must_use]
pub fn cache_hit_ratio() -> f64 {
    let mut hits = 0u64;
    let mut misses = 0u64;
    for backend in ["redis", "memory"] {
        hits += METRICS.cache_operations_total.with_label_values(&[backend, "get", "hit"]).get();
        misses +=
            METRICS.cache_operations_total.with_label_values(&[backend, "get", "miss"]).get();
    }
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

/// Text exposition of the service registry for GET /metrics.
#[must_use]
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&METRICS.registry.gather(), &mut buffer) {
        tracing::error!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
