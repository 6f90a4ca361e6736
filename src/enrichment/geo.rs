//! Per-IP geolocation over a pool of free providers.
//!
//! Providers are tried in order until one returns a usable record (country
//! code plus coordinates). A process-global pacer keeps a minimum interval
//! between any two outbound geo requests so the free tiers stay happy; the
//! per-IP cache short-circuits the chain entirely.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::cache::{self, IocCache};
use crate::errors::ServiceError;
use crate::metrics;
use crate::models::{is_non_routable, GeoRecord};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// One geolocation capability: a name and a fetch.
#[async_trait]
pub trait GeoProvider: Send + Sync {
    fn name(&self) -> &'static str;
    /// `Ok(None)` means the provider answered but had no usable record.
    async fn fetch(&self, ip: &str) -> Result<Option<GeoRecord>, ServiceError>;
}

/// Enforces a minimum spacing between outbound requests. The lock is held
/// across the sleep, so the check-and-set section is globally serialized.
pub struct RequestPacer {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RequestPacer {
    #[must_use]
    pub fn new(min_interval: Duration) -> Self {
        Self { min_interval, last_request: Mutex::new(None) }
    }

    pub async fn pace(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

pub struct GeoEnricher {
    providers: Vec<Arc<dyn GeoProvider>>,
    pacer: RequestPacer,
    cache: Arc<IocCache>,
    cache_ttl: Duration,
}

impl GeoEnricher {
    #[must_use]
    pub fn new(
        providers: Vec<Arc<dyn GeoProvider>>,
        request_delay: Duration,
        cache: Arc<IocCache>,
        cache_ttl: Duration,
    ) -> Self {
        Self { providers, pacer: RequestPacer::new(request_delay), cache, cache_ttl }
    }

    /// The default chain of free providers, in preference order.
    pub fn with_default_providers(
        request_delay: Duration,
        cache: Arc<IocCache>,
        cache_ttl: Duration,
    ) -> Result<Self, ServiceError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ServiceError::config(format!("building geo client: {e}")))?;
        let providers: Vec<Arc<dyn GeoProvider>> = vec![
            Arc::new(IpApiProvider { http: http.clone() }),
            Arc::new(IpWhoisProvider { http: http.clone() }),
            Arc::new(GeoJsProvider { http }),
        ];
        Ok(Self::new(providers, request_delay, cache, cache_ttl))
    }

    /// Geolocate one address. All failures are non-fatal: the indicator is
    /// simply produced without geo data.
    pub async fn enrich(&self, ip: &str) -> Option<GeoRecord> {
        if is_non_routable(ip) {
            debug!(ip, "skipping geolocation for non-routable address");
            return None;
        }

        // A cache failure downgrades to a miss; enrichment keeps working.
        if let Ok(Some(record)) = self.cache.get::<GeoRecord>(&cache::geo_key(ip)).await {
            debug!(ip, "geo cache hit");
            return Some(record);
        }

        for provider in &self.providers {
            self.pacer.pace().await;
            match provider.fetch(ip).await {
                Ok(Some(record)) => {
                    metrics::record_geo_request(provider.name(), "ok");
                    debug!(ip, provider = provider.name(), "geolocation found");
                    if let Err(e) =
                        self.cache.set(&cache::geo_key(ip), &record, self.cache_ttl).await
                    {
                        warn!(ip, error = %e, "failed to cache geo record");
                    }
                    return Some(record);
                }
                Ok(None) => {
                    metrics::record_geo_request(provider.name(), "unusable");
                }
                Err(e) => {
                    metrics::record_geo_request(provider.name(), "error");
                    warn!(ip, provider = provider.name(), error = %e, "geo provider failed");
                }
            }
        }

        debug!(ip, "no geolocation data from any provider");
        None
    }
}

fn value_as_f64(value: Option<&serde_json::Value>) -> Option<f64> {
    match value? {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn value_as_string(value: Option<&serde_json::Value>) -> Option<String> {
    value.and_then(|v| v.as_str()).filter(|s| !s.is_empty()).map(String::from)
}

/// ip-api.com: free, no key, `status` discriminated.
pub struct IpApiProvider {
    http: reqwest::Client,
}

fn parse_ip_api(ip: &str, body: &serde_json::Value) -> Option<GeoRecord> {
    if body.get("status").and_then(|s| s.as_str()) != Some("success") {
        return None;
    }
    let country_code = value_as_string(body.get("countryCode"))?;
    let lat = value_as_f64(body.get("lat"))?;
    let lon = value_as_f64(body.get("lon"))?;
    Some(GeoRecord {
        ip: ip.to_string(),
        country_code,
        country_name: value_as_string(body.get("country")),
        city: value_as_string(body.get("city")),
        lat,
        lon,
        asn: value_as_string(body.get("as")),
        isp: value_as_string(body.get("isp")),
        provider_name: "ip-api.com".to_string(),
        fetched_at: Utc::now(),
    })
}

#[async_trait]
impl GeoProvider for IpApiProvider {
    fn name(&self) -> &'static str {
        "ip-api.com"
    }

    async fn fetch(&self, ip: &str) -> Result<Option<GeoRecord>, ServiceError> {
        let url = format!(
            "http://ip-api.com/json/{ip}?fields=status,message,country,countryCode,city,lat,lon,isp,as"
        );
        let body: serde_json::Value =
            self.http.get(url).send().await?.error_for_status()?.json().await?;
        Ok(parse_ip_api(ip, &body))
    }
}

/// ipwhois.app: free, no key, `success` discriminated. Coordinates sometimes
/// arrive as strings.
pub struct IpWhoisProvider {
    http: reqwest::Client,
}

fn parse_ipwhois(ip: &str, body: &serde_json::Value) -> Option<GeoRecord> {
    if body.get("success").and_then(|s| s.as_bool()) != Some(true) {
        return None;
    }
    let country_code = value_as_string(body.get("country_code"))?;
    let lat = value_as_f64(body.get("latitude"))?;
    let lon = value_as_f64(body.get("longitude"))?;
    Some(GeoRecord {
        ip: ip.to_string(),
        country_code,
        country_name: value_as_string(body.get("country")),
        city: value_as_string(body.get("city")),
        lat,
        lon,
        asn: value_as_string(body.get("asn")),
        isp: value_as_string(body.get("isp")),
        provider_name: "ipwhois.app".to_string(),
        fetched_at: Utc::now(),
    })
}

#[async_trait]
impl GeoProvider for IpWhoisProvider {
    fn name(&self) -> &'static str {
        "ipwhois.app"
    }

    async fn fetch(&self, ip: &str) -> Result<Option<GeoRecord>, ServiceError> {
        let url = format!("http://ipwhois.app/json/{ip}");
        let body: serde_json::Value =
            self.http.get(url).send().await?.error_for_status()?.json().await?;
        Ok(parse_ipwhois(ip, &body))
    }
}

/// geojs.io: free, no key, coordinates as strings.
pub struct GeoJsProvider {
    http: reqwest::Client,
}

fn parse_geojs(ip: &str, body: &serde_json::Value) -> Option<GeoRecord> {
    let country_code = value_as_string(body.get("country_code"))?;
    let lat = value_as_f64(body.get("latitude"))?;
    let lon = value_as_f64(body.get("longitude"))?;
    Some(GeoRecord {
        ip: ip.to_string(),
        country_code,
        country_name: value_as_string(body.get("country")),
        city: value_as_string(body.get("city")),
        lat,
        lon,
        asn: body.get("asn").map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }),
        isp: value_as_string(body.get("organization")),
        provider_name: "geojs.io".to_string(),
        fetched_at: Utc::now(),
    })
}

#[async_trait]
impl GeoProvider for GeoJsProvider {
    fn name(&self) -> &'static str {
        "geojs.io"
    }

    async fn fetch(&self, ip: &str) -> Result<Option<GeoRecord>, ServiceError> {
        let url = format!("https://get.geojs.io/v1/ip/geo/{ip}.json");
        let body: serde_json::Value =
            self.http.get(url).send().await?.error_for_status()?.json().await?;
        Ok(parse_geojs(ip, &body))
    }
}
