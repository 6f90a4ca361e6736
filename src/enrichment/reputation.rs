//! Rate-budgeted client for the external IP reputation service.
//!
//! Every outbound request is gated by a UTC-day counter held in the cache,
//! so the free-tier daily limit survives restarts. Responses are cached so
//! an exhausted budget degrades to stale data instead of failing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::cache::{self, IocCache};
use crate::errors::ServiceError;
use crate::metrics;
use crate::models::{BudgetState, ReputationRecord};

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const BLACKLIST_FETCH_LIMIT: u32 = 10_000;
/// Keep day counters around past midnight so /stats can still report
/// yesterday briefly.
const BUDGET_COUNTER_TTL: Duration = Duration::from_secs(2 * 86_400);

/// A blacklist fetch result; `from_cache` marks stale-ok data served after
/// the daily budget ran out.
#[derive(Debug, Clone)]
pub struct BlacklistPage {
    pub records: Vec<ReputationRecord>,
    pub from_cache: bool,
}

/// Seam between the preprocessor and the reputation provider, so cycles can
/// be driven by a stub in tests.
#[async_trait]
pub trait ReputationSource: Send + Sync {
    async fn get_blacklist(&self, min_confidence: u8) -> Result<BlacklistPage, ServiceError>;
    async fn check(&self, ip: &str) -> Result<Option<ReputationRecord>, ServiceError>;
}

pub struct ReputationClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    daily_limit: i64,
    cache: Arc<IocCache>,
    cache_ttl: Duration,
}

impl ReputationClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        daily_limit: i64,
        cache: Arc<IocCache>,
        cache_ttl: Duration,
    ) -> Result<Self, ServiceError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ServiceError::config(format!("building reputation client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            daily_limit,
            cache,
            cache_ttl,
        })
    }

    /// Current UTC-day budget usage.
    pub async fn budget_state(&self) -> Result<BudgetState, ServiceError> {
        let day = Utc::now().date_naive();
        let requests_used = self.cache.get_counter(&cache::budget_key(day)).await?;
        Ok(BudgetState { day, requests_used, limit: self.daily_limit })
    }

    /// Atomically claim one request against today's budget. The counter is
    /// keyed by UTC date, so it resets at midnight without coordination.
    async fn consume_budget(&self) -> Result<(), ServiceError> {
        let key = cache::budget_key(Utc::now().date_naive());
        let used = self.cache.incr_counter(&key, Some(BUDGET_COUNTER_TTL)).await?;
        if used > self.daily_limit {
            warn!(used, limit = self.daily_limit, "reputation daily budget exhausted");
            return Err(ServiceError::BudgetExhausted { limit: self.daily_limit });
        }
        debug!(used, limit = self.daily_limit, "reputation budget consumed");
        Ok(())
    }

    /// Send with exponential backoff on 429 and 5xx. Other client errors
    /// surface immediately; retries exhausted surfaces TRANSIENT.
    async fn send_with_retry(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, ServiceError> {
        let mut delay = INITIAL_BACKOFF;
        let mut attempt = 0u32;

        loop {
            let cloned = request
                .try_clone()
                .ok_or_else(|| ServiceError::fatal("reputation request is not cloneable"))?;

            let outcome = match cloned.send().await {
                Ok(response) if response.status().is_success() => {
                    metrics::record_reputation_request("ok");
                    return Ok(response);
                }
                Ok(response)
                    if response.status() == StatusCode::TOO_MANY_REQUESTS
                        || response.status().is_server_error() =>
                {
                    metrics::record_reputation_request("retryable");
                    format!("upstream returned {}", response.status())
                }
                Ok(response) => {
                    metrics::record_reputation_request("rejected");
                    return Err(ServiceError::transient(format!(
                        "reputation API rejected request: {}",
                        response.status()
                    )));
                }
                Err(e) => {
                    metrics::record_reputation_request("error");
                    format!("request failed: {e}")
                }
            };

            attempt += 1;
            if attempt > MAX_RETRIES {
                return Err(ServiceError::transient(format!(
                    "reputation API unavailable after {MAX_RETRIES} retries: {outcome}"
                )));
            }

            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
            warn!(attempt, ?delay, outcome, "retrying reputation request");
            tokio::time::sleep(delay + jitter).await;
            delay = (delay * 2).min(MAX_BACKOFF);
        }
    }
}

#[async_trait]
impl ReputationSource for ReputationClient {
    async fn get_blacklist(&self, min_confidence: u8) -> Result<BlacklistPage, ServiceError> {
        match self.consume_budget().await {
            Ok(()) => {}
            Err(err @ ServiceError::BudgetExhausted { .. }) => {
                if let Some(records) =
                    self.cache.get::<Vec<ReputationRecord>>(cache::KEY_BLACKLIST).await?
                {
                    info!(count = records.len(), "serving cached blacklist, budget exhausted");
                    return Ok(BlacklistPage { records, from_cache: true });
                }
                return Err(err);
            }
            Err(other) => return Err(other),
        }

        let request = self
            .http
            .get(format!("{}/blacklist", self.base_url))
            .header("Key", &self.api_key)
            .header("Accept", "application/json")
            .query(&[
                ("confidenceMinimum", min_confidence.to_string()),
                ("limit", BLACKLIST_FETCH_LIMIT.to_string()),
            ]);

        let response = self.send_with_retry(request).await?;
        let body: serde_json::Value = response.json().await?;
        let records = parse_blacklist(&body);
        info!(count = records.len(), "fetched reputation blacklist");

        self.cache.set(cache::KEY_BLACKLIST, &records, self.cache_ttl).await?;
        Ok(BlacklistPage { records, from_cache: false })
    }

    async fn check(&self, ip: &str) -> Result<Option<ReputationRecord>, ServiceError> {
        if let Ok(Some(record)) =
            self.cache.get::<ReputationRecord>(&cache::reputation_key(ip)).await
        {
            debug!(ip, "reputation cache hit");
            return Ok(Some(record));
        }

        self.consume_budget().await?;

        let request = self
            .http
            .get(format!("{}/check", self.base_url))
            .header("Key", &self.api_key)
            .header("Accept", "application/json")
            .query(&[("ipAddress", ip), ("maxAgeInDays", "90")]);

        let response = self.send_with_retry(request).await?;
        let body: serde_json::Value = response.json().await?;

        let Some(record) = parse_check(&body) else {
            debug!(ip, "no reputation data for address");
            return Ok(None);
        };

        self.cache.set(&cache::reputation_key(ip), &record, self.cache_ttl).await?;
        Ok(Some(record))
    }
}

#[derive(Debug, Deserialize)]
struct BlacklistEntry {
    #[serde(rename = "ipAddress")]
    ip_address: Option<String>,
    #[serde(rename = "abuseConfidenceScore")]
    abuse_confidence_score: Option<i64>,
    #[serde(rename = "lastReportedAt")]
    last_reported_at: Option<DateTime<Utc>>,
    #[serde(rename = "totalReports")]
    total_reports: Option<i64>,
}

/// Parse a blacklist response body. Records missing their address or score
/// are skipped with a warning; the batch never fails on one bad record.
fn parse_blacklist(body: &serde_json::Value) -> Vec<ReputationRecord> {
    let Some(entries) = body.get("data").and_then(|d| d.as_array()) else {
        warn!("blacklist response missing data array");
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|raw| {
            let entry: BlacklistEntry = match serde_json::from_value(raw.clone()) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "skipping malformed blacklist record");
                    return None;
                }
            };
            let (Some(ip), Some(score)) = (entry.ip_address, entry.abuse_confidence_score)
            else {
                warn!("skipping blacklist record missing address or confidence");
                return None;
            };
            Some(ReputationRecord {
                ip,
                confidence: score.clamp(0, 100) as u8,
                categories: vec!["abuseipdb-blacklist".to_string()],
                reporter_count: entry.total_reports.unwrap_or(1),
                last_seen: entry.last_reported_at,
                raw: raw.clone(),
            })
        })
        .collect()
}

fn parse_check(body: &serde_json::Value) -> Option<ReputationRecord> {
    let data = body.get("data")?;
    let ip = data.get("ipAddress")?.as_str()?.to_string();
    let score = data.get("abuseConfidenceScore")?.as_i64()?;

    let last_seen = data
        .get("lastReportedAt")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));

    Some(ReputationRecord {
        ip,
        confidence: score.clamp(0, 100) as u8,
        categories: Vec::new(),
        reporter_count: data.get("totalReports").and_then(|v| v.as_i64()).unwrap_or(0),
        last_seen,
        raw: data.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn blacklist_parsing_skips_incomplete_records() {
        let body = json!({
            "data": [
                {"ipAddress": "198.51.100.7", "abuseConfidenceScore": 75, "totalReports": 42},
                {"ipAddress": "203.0.113.99"},
                {"abuseConfidenceScore": 88},
                "not-an-object",
                {"ipAddress": "192.0.2.5", "abuseConfidenceScore": 120,
                 "someFutureField": {"nested": true}}
            ]
        });

        let records = parse_blacklist(&body);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].ip, "198.51.100.7");
        assert_eq!(records[0].confidence, 75);
        assert_eq!(records[0].reporter_count, 42);
        // Out-of-range scores clamp; unknown fields are ignored.
        assert_eq!(records[1].confidence, 100);
    }

    #[test]
    fn blacklist_parsing_handles_missing_data() {
        assert!(parse_blacklist(&json!({})).is_empty());
        assert!(parse_blacklist(&json!({"data": "wrong-type"})).is_empty());
    }

    #[test]
    fn check_parsing_requires_address_and_score() {
        let body = json!({"data": {
            "ipAddress": "198.51.100.7",
            "abuseConfidenceScore": 63,
            "totalReports": 9,
            "lastReportedAt": "2026-07-01T10:00:00+00:00"
        }});
        let record = parse_check(&body).unwrap();
        assert_eq!(record.ip, "198.51.100.7");
        assert_eq!(record.confidence, 63);
        assert!(record.last_seen.is_some());

        assert!(parse_check(&json!({"data": {"ipAddress": "1.2.3.4"}})).is_none());
        assert!(parse_check(&json!({})).is_none());
    }

    #[tokio::test]
    async fn budget_counter_blocks_requests_past_the_limit() {
        let cache = Arc::new(IocCache::in_memory());
        let client = ReputationClient::new(
            "http://127.0.0.1:0",
            "test-key",
            3,
            cache.clone(),
            Duration::from_secs(3600),
        )
        .unwrap();

        for _ in 0..3 {
            client.consume_budget().await.unwrap();
        }
        let err = client.consume_budget().await.unwrap_err();
        assert!(matches!(err, ServiceError::BudgetExhausted { limit: 3 }));

        let state = client.budget_state().await.unwrap();
        assert_eq!(state.limit, 3);
        assert!(state.exhausted());
    }

    #[tokio::test]
    async fn check_serves_cached_record_without_spending_budget() {
        let cache = Arc::new(IocCache::in_memory());
        let record = ReputationRecord {
            ip: "198.51.100.7".to_string(),
            confidence: 63,
            categories: Vec::new(),
            reporter_count: 9,
            last_seen: None,
            raw: serde_json::Value::Null,
        };
        cache
            .set(&cache::reputation_key("198.51.100.7"), &record, Duration::from_secs(600))
            .await
            .unwrap();

        // Zero budget: any outbound attempt would fail, so a success proves
        // the cached record short-circuited the request.
        let client = ReputationClient::new(
            "http://127.0.0.1:0",
            "test-key",
            0,
            cache,
            Duration::from_secs(3600),
        )
        .unwrap();

        let fetched = client.check("198.51.100.7").await.unwrap().unwrap();
        assert_eq!(fetched.confidence, 63);
        assert_eq!(client.budget_state().await.unwrap().requests_used, 0);
    }

    #[tokio::test]
    async fn exhausted_budget_serves_cached_blacklist() {
        let cache = Arc::new(IocCache::in_memory());
        let cached = vec![ReputationRecord {
            ip: "198.51.100.7".to_string(),
            confidence: 75,
            categories: vec!["abuseipdb-blacklist".to_string()],
            reporter_count: 1,
            last_seen: None,
            raw: serde_json::Value::Null,
        }];
        cache.set(cache::KEY_BLACKLIST, &cached, Duration::from_secs(600)).await.unwrap();

        // Limit of zero: every request is over budget.
        let client = ReputationClient::new(
            "http://127.0.0.1:0",
            "test-key",
            0,
            cache,
            Duration::from_secs(3600),
        )
        .unwrap();

        let page = client.get_blacklist(50).await.unwrap();
        assert!(page.from_cache);
        assert_eq!(page.records.len(), 1);
    }
}
