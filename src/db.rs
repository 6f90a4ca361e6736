//! Read-only projection of the locally-reported attacker IP table.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::errors::ServiceError;
use crate::models::LocalRecord;

/// Read-only access to locally-reported threat IPs. Implementations must
/// never issue writes against the table.
#[async_trait]
pub trait LocalThreatStore: Send + Sync {
    /// All local reports, deduplicated by IP: the most recent
    /// `last_reported_at` wins, ties broken by higher confidence.
    async fn fetch_all(&self) -> Result<Vec<LocalRecord>, ServiceError>;
}

pub struct PostgresThreatStore {
    pool: PgPool,
}

impl PostgresThreatStore {
    /// The pool connects lazily so the service can start while the database
    /// is briefly down; reads surface TRANSIENT until it returns.
    pub fn connect_lazy(database_url: &str) -> Result<Self, ServiceError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)
            .map_err(|e| ServiceError::config(format!("invalid DATABASE_URL: {e}")))?;
        Ok(Self { pool })
    }

    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LocalThreatStore for PostgresThreatStore {
    async fn fetch_all(&self) -> Result<Vec<LocalRecord>, ServiceError> {
        let rows = sqlx::query(
            "SELECT ip_address, confidence, categories, reported_at, created_at \
             FROM reported_ips ORDER BY reported_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let ip: String = row.try_get("ip_address")?;
            let confidence: i32 = row.try_get("confidence")?;
            let categories: Option<serde_json::Value> = row.try_get("categories")?;
            let reported_at: DateTime<Utc> = row.try_get("reported_at")?;
            let created_at: DateTime<Utc> = row.try_get("created_at")?;

            records.push(LocalRecord {
                ip,
                confidence: confidence.clamp(0, 100) as u8,
                categories: normalize_categories(categories.as_ref()),
                first_reported_at: created_at.min(reported_at),
                last_reported_at: reported_at,
                report_count: 1,
            });
        }

        let deduped = dedupe_by_ip(records);
        debug!(count = deduped.len(), "fetched local threat reports");
        Ok(deduped)
    }
}

/// In-memory store used by tests and local development.
#[derive(Default)]
pub struct MemoryThreatStore {
    records: Vec<LocalRecord>,
}

impl MemoryThreatStore {
    #[must_use]
    pub fn new(records: Vec<LocalRecord>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl LocalThreatStore for MemoryThreatStore {
    async fn fetch_all(&self) -> Result<Vec<LocalRecord>, ServiceError> {
        Ok(dedupe_by_ip(self.records.clone()))
    }
}

/// Categories arrive as JSONB written by several reporters: plain strings,
/// bare numbers, or `{id: …}` objects. Anything else is dropped.
fn normalize_categories(value: Option<&serde_json::Value>) -> Vec<String> {
    let Some(serde_json::Value::Array(items)) = value else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Object(map) => {
                map.get("id").or_else(|| map.get("category_id")).map(|id| match id {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
            }
            _ => None,
        })
        .collect()
}

fn dedupe_by_ip(records: Vec<LocalRecord>) -> Vec<LocalRecord> {
    let mut by_ip: HashMap<String, LocalRecord> = HashMap::with_capacity(records.len());
    for record in records {
        match by_ip.get_mut(&record.ip) {
            None => {
                by_ip.insert(record.ip.clone(), record);
            }
            Some(existing) => {
                let newer = record.last_reported_at > existing.last_reported_at
                    || (record.last_reported_at == existing.last_reported_at
                        && record.confidence > existing.confidence);
                let merged_count = existing.report_count + record.report_count;
                let earliest = existing.first_reported_at.min(record.first_reported_at);
                if newer {
                    *existing = record;
                }
                existing.report_count = merged_count;
                existing.first_reported_at = earliest;
            }
        }
    }
    let mut deduped: Vec<LocalRecord> = by_ip.into_values().collect();
    deduped.sort_by(|a, b| b.last_reported_at.cmp(&a.last_reported_at));
    deduped
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn record(ip: &str, confidence: u8, reported_at: DateTime<Utc>) -> LocalRecord {
        LocalRecord {
            ip: ip.to_string(),
            confidence,
            categories: Vec::new(),
            first_reported_at: reported_at,
            last_reported_at: reported_at,
            report_count: 1,
        }
    }

    #[test]
    fn categories_normalize_mixed_shapes() {
        let value = json!(["22", 14, {"id": 7}, {"category_id": "18"}, null, [1]]);
        assert_eq!(
            normalize_categories(Some(&value)),
            vec!["22".to_string(), "14".to_string(), "7".to_string(), "18".to_string()]
        );
        assert!(normalize_categories(None).is_empty());
        assert!(normalize_categories(Some(&json!("not-an-array"))).is_empty());
    }

    #[tokio::test]
    async fn dedupe_keeps_most_recent_report() {
        let now = Utc::now();
        let store = MemoryThreatStore::new(vec![
            record("203.0.113.10", 60, now - Duration::hours(2)),
            record("203.0.113.10", 90, now),
            record("198.51.100.7", 70, now),
        ]);

        let records = store.fetch_all().await.unwrap();
        assert_eq!(records.len(), 2);
        let merged = records.iter().find(|r| r.ip == "203.0.113.10").unwrap();
        assert_eq!(merged.confidence, 90);
        assert_eq!(merged.report_count, 2);
        assert_eq!(merged.first_reported_at, now - Duration::hours(2));
    }

    #[tokio::test]
    async fn dedupe_ties_break_on_higher_confidence() {
        let now = Utc::now();
        let store = MemoryThreatStore::new(vec![
            record("203.0.113.10", 60, now),
            record("203.0.113.10", 95, now),
        ]);

        let records = store.fetch_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].confidence, 95);
    }
}
