//! TTL-governed key/value cache backing the indicator snapshot, enrichment
//! records, and the reputation request budget.
//!
//! The backend is chosen once at startup: Redis when configured and
//! reachable, an in-process map otherwise. Counters need a single atomic
//! home, so the two backends are never written in parallel.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::errors::ServiceError;
use crate::metrics;

const KEY_PREFIX: &str = "ioc_exchange:";

/// Snapshot of all preprocessed indicators.
pub const KEY_SNAPSHOT: &str = "preprocessed_iocs";
/// Snapshot subset with final confidence >= 80.
pub const KEY_HIGH_CONFIDENCE: &str = "high_confidence_iocs";
/// Most recent rebuild bookkeeping.
pub const KEY_LAST_REBUILD: &str = "last_rebuild";
/// Monotonic snapshot generation counter.
pub const KEY_GENERATION: &str = "snapshot_generation";
/// Cached reputation blacklist page.
pub const KEY_BLACKLIST: &str = "rep:blacklist";

#[must_use]
pub fn reputation_key(ip: &str) -> String {
    format!("rep:{ip}")
}

#[must_use]
pub fn geo_key(ip: &str) -> String {
    format!("geo:{ip}")
}

#[must_use]
pub fn budget_key(day: chrono::NaiveDate) -> String {
    format!("rep:budget:{}", day.format("%Y-%m-%d"))
}

struct MemoryEntry {
    payload: Vec<u8>,
    expires_at: DateTime<Utc>,
}

impl MemoryEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

struct CounterEntry {
    value: i64,
    expires_at: Option<DateTime<Utc>>,
}

enum Backend {
    Redis(redis::Client),
    Memory {
        entries: RwLock<HashMap<String, MemoryEntry>>,
        counters: RwLock<HashMap<String, CounterEntry>>,
    },
}

pub struct IocCache {
    backend: Backend,
}

impl IocCache {
    /// Connect to Redis when a URL is configured and reachable; otherwise
    /// serve from an in-process map. Stale data beats failing, so an
    /// unreachable Redis degrades with a warning instead of refusing to
    /// start.
    pub async fn connect(redis_url: Option<&str>) -> Self {
        if let Some(url) = redis_url {
            match redis::Client::open(url) {
                Ok(client) => match client.get_async_connection().await {
                    Ok(mut conn) => {
                        let ping: Result<String, _> =
                            redis::cmd("PING").query_async(&mut conn).await;
                        if ping.is_ok() {
                            info!("redis cache connection established");
                            return Self { backend: Backend::Redis(client) };
                        }
                        warn!("redis ping failed, using in-process cache");
                    }
                    Err(e) => {
                        warn!(error = %e, "redis unreachable, using in-process cache");
                    }
                },
                Err(e) => {
                    warn!(error = %e, "invalid redis url, using in-process cache");
                }
            }
        }
        Self::in_memory()
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory {
                entries: RwLock::new(HashMap::new()),
                counters: RwLock::new(HashMap::new()),
            },
        }
    }

    #[must_use]
    pub const fn backend_name(&self) -> &'static str {
        match self.backend {
            Backend::Redis(_) => "redis",
            Backend::Memory { .. } => "memory",
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ServiceError> {
        let full_key = format!("{KEY_PREFIX}{key}");
        let payload = match &self.backend {
            Backend::Redis(client) => {
                let mut conn = self.redis_conn(client).await?;
                let data: Option<Vec<u8>> = conn
                    .get(&full_key)
                    .await
                    .map_err(|e| self.unreachable("get", &e))?;
                data
            }
            Backend::Memory { entries, .. } => {
                let now = Utc::now();
                let store = entries.read().await;
                store
                    .get(&full_key)
                    .filter(|entry| !entry.is_expired(now))
                    .map(|entry| entry.payload.clone())
            }
        };

        match payload {
            Some(bytes) => {
                metrics::record_cache_op(self.backend_name(), "get", "hit");
                let value = serde_json::from_slice(&bytes).map_err(|e| {
                    ServiceError::fatal(format!("corrupt cache entry {key}: {e}"))
                })?;
                debug!(key, "cache hit");
                Ok(Some(value))
            }
            None => {
                metrics::record_cache_op(self.backend_name(), "get", "miss");
                debug!(key, "cache miss");
                Ok(None)
            }
        }
    }

    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), ServiceError> {
        let full_key = format!("{KEY_PREFIX}{key}");
        let payload = serde_json::to_vec(value)
            .map_err(|e| ServiceError::fatal(format!("serializing cache entry {key}: {e}")))?;

        match &self.backend {
            Backend::Redis(client) => {
                let mut conn = self.redis_conn(client).await?;
                let _: () = conn
                    .set_ex(&full_key, payload, ttl.as_secs() as usize)
                    .await
                    .map_err(|e| self.unreachable("set", &e))?;
            }
            Backend::Memory { entries, .. } => {
                let mut store = entries.write().await;
                let now = Utc::now();
                store.retain(|_, entry| !entry.is_expired(now));
                store.insert(
                    full_key,
                    MemoryEntry {
                        payload,
                        expires_at: now
                            + chrono::Duration::from_std(ttl)
                                .unwrap_or_else(|_| chrono::Duration::days(365)),
                    },
                );
            }
        }
        metrics::record_cache_op(self.backend_name(), "set", "ok");
        debug!(key, ttl_secs = ttl.as_secs(), "cache set");
        Ok(())
    }

    /// Replace a key's value in one step. A single-key SET is atomic in both
    /// backends, so readers observe either the previous value or the new
    /// one, never an intermediate state.
    pub async fn atomic_swap<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), ServiceError> {
        self.set(key, value, ttl).await
    }

    /// Atomically increment a counter, returning the post-increment value.
    /// The TTL applies when the increment creates the counter.
    pub async fn incr_counter(
        &self,
        key: &str,
        ttl: Option<Duration>,
    ) -> Result<i64, ServiceError> {
        let full_key = format!("{KEY_PREFIX}{key}");
        match &self.backend {
            Backend::Redis(client) => {
                let mut conn = self.redis_conn(client).await?;
                let value: i64 = conn
                    .incr(&full_key, 1i64)
                    .await
                    .map_err(|e| self.unreachable("incr", &e))?;
                if value == 1 {
                    if let Some(ttl) = ttl {
                        let _: bool = conn
                            .expire(&full_key, ttl.as_secs() as usize)
                            .await
                            .map_err(|e| self.unreachable("expire", &e))?;
                    }
                }
                Ok(value)
            }
            Backend::Memory { counters, .. } => {
                let mut store = counters.write().await;
                let now = Utc::now();
                store.retain(|_, entry| entry.expires_at.map_or(true, |at| now < at));
                let entry = store.entry(full_key).or_insert_with(|| CounterEntry {
                    value: 0,
                    expires_at: ttl.map(|ttl| {
                        now + chrono::Duration::from_std(ttl)
                            .unwrap_or_else(|_| chrono::Duration::days(365))
                    }),
                });
                entry.value += 1;
                Ok(entry.value)
            }
        }
    }

    pub async fn get_counter(&self, key: &str) -> Result<i64, ServiceError> {
        let full_key = format!("{KEY_PREFIX}{key}");
        match &self.backend {
            Backend::Redis(client) => {
                let mut conn = self.redis_conn(client).await?;
                let value: Option<i64> = conn
                    .get(&full_key)
                    .await
                    .map_err(|e| self.unreachable("get_counter", &e))?;
                Ok(value.unwrap_or(0))
            }
            Backend::Memory { counters, .. } => {
                let now = Utc::now();
                let store = counters.read().await;
                Ok(store
                    .get(&full_key)
                    .filter(|entry| entry.expires_at.map_or(true, |at| now < at))
                    .map_or(0, |entry| entry.value))
            }
        }
    }

    /// Reschedule a key's expiry to an absolute instant.
    pub async fn expire(&self, key: &str, at: DateTime<Utc>) -> Result<(), ServiceError> {
        let full_key = format!("{KEY_PREFIX}{key}");
        match &self.backend {
            Backend::Redis(client) => {
                let mut conn = self.redis_conn(client).await?;
                let _: bool = conn
                    .expire_at(&full_key, at.timestamp() as usize)
                    .await
                    .map_err(|e| self.unreachable("expire_at", &e))?;
            }
            Backend::Memory { entries, .. } => {
                let mut store = entries.write().await;
                if let Some(entry) = store.get_mut(&full_key) {
                    entry.expires_at = at;
                }
            }
        }
        Ok(())
    }

    /// Liveness probe for the health endpoint.
    pub async fn ping(&self) -> bool {
        match &self.backend {
            Backend::Redis(client) => match client.get_async_connection().await {
                Ok(mut conn) => {
                    let pong: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
                    pong.is_ok()
                }
                Err(_) => false,
            },
            Backend::Memory { .. } => true,
        }
    }

    async fn redis_conn(
        &self,
        client: &redis::Client,
    ) -> Result<redis::aio::Connection, ServiceError> {
        client
            .get_async_connection()
            .await
            .map_err(|e| ServiceError::unavailable(format!("redis connection failed: {e}")))
    }

    fn unreachable(&self, op: &str, err: &redis::RedisError) -> ServiceError {
        metrics::record_cache_op("redis", op, "error");
        ServiceError::unavailable(format!("redis {op} failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn memory_set_get_round_trip() {
        let cache = IocCache::in_memory();
        let value = json!({"ip": "203.0.113.10", "confidence": 90});

        cache.set("test_key", &value, Duration::from_secs(60)).await.unwrap();
        let loaded: serde_json::Value = cache.get("test_key").await.unwrap().unwrap();
        assert_eq!(loaded, value);

        let missing: Option<serde_json::Value> = cache.get("other_key").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn entries_expire() {
        let cache = IocCache::in_memory();
        cache.set("ttl_key", &json!(1), Duration::from_millis(30)).await.unwrap();

        let present: Option<serde_json::Value> = cache.get("ttl_key").await.unwrap();
        assert!(present.is_some());

        tokio::time::sleep(Duration::from_millis(60)).await;
        let expired: Option<serde_json::Value> = cache.get("ttl_key").await.unwrap();
        assert!(expired.is_none());
    }

    #[tokio::test]
    async fn atomic_swap_replaces_wholesale() {
        let cache = IocCache::in_memory();
        cache.atomic_swap("snap", &json!([1, 2, 3]), Duration::from_secs(60)).await.unwrap();
        cache.atomic_swap("snap", &json!([4]), Duration::from_secs(60)).await.unwrap();

        let current: serde_json::Value = cache.get("snap").await.unwrap().unwrap();
        assert_eq!(current, json!([4]));
    }

    #[tokio::test]
    async fn counters_increment_atomically() {
        let cache = IocCache::in_memory();
        assert_eq!(cache.get_counter("uses").await.unwrap(), 0);
        assert_eq!(cache.incr_counter("uses", None).await.unwrap(), 1);
        assert_eq!(cache.incr_counter("uses", None).await.unwrap(), 2);
        assert_eq!(cache.get_counter("uses").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn counter_ttl_applies() {
        let cache = IocCache::in_memory();
        cache.incr_counter("day_uses", Some(Duration::from_millis(30))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.get_counter("day_uses").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn expire_reschedules_entry() {
        let cache = IocCache::in_memory();
        cache.set("soon", &json!(1), Duration::from_secs(3600)).await.unwrap();
        cache.expire("soon", Utc::now() - chrono::Duration::seconds(1)).await.unwrap();

        let gone: Option<serde_json::Value> = cache.get("soon").await.unwrap();
        assert!(gone.is_none());
    }

    #[tokio::test]
    async fn memory_backend_always_pings() {
        let cache = IocCache::in_memory();
        assert!(cache.ping().await);
        assert_eq!(cache.backend_name(), "memory");
    }
}
