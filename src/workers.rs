//! Background preprocessor: periodically rebuilds the enriched indicator
//! snapshot and commits it to the cache, so the serving path never waits on
//! an upstream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};

use crate::cache::{IocCache, KEY_GENERATION, KEY_HIGH_CONFIDENCE, KEY_LAST_REBUILD, KEY_SNAPSHOT};
use crate::config::Settings;
use crate::correlation::CorrelationEngine;
use crate::db::LocalThreatStore;
use crate::enrichment::{GeoEnricher, ReputationSource};
use crate::errors::ServiceError;
use crate::metrics;
use crate::models::{Indicator, LocalRecord, RebuildSummary, ReputationRecord, Snapshot};

/// Indicators at or above this confidence land in the high-confidence
/// collection.
pub const HIGH_CONFIDENCE_THRESHOLD: u8 = 80;

/// The rebuild bookkeeping record outlives several snapshot generations so
/// the health endpoint can detect a stalled preprocessor.
const LAST_REBUILD_TTL: Duration = Duration::from_secs(86_400);

#[derive(Debug)]
pub enum CycleOutcome {
    Completed(RebuildSummary),
    /// Another cycle was already running; this trigger coalesced into it.
    Skipped,
}

pub struct IocProcessor {
    store: Arc<dyn LocalThreatStore>,
    reputation: Arc<dyn ReputationSource>,
    geo: Arc<GeoEnricher>,
    engine: CorrelationEngine,
    cache: Arc<IocCache>,
    settings: Arc<Settings>,
    processing: AtomicBool,
    last_rebuild: RwLock<Option<RebuildSummary>>,
}

impl IocProcessor {
    pub fn new(
        store: Arc<dyn LocalThreatStore>,
        reputation: Arc<dyn ReputationSource>,
        geo: Arc<GeoEnricher>,
        cache: Arc<IocCache>,
        settings: Arc<Settings>,
    ) -> Result<Self, ServiceError> {
        let engine = CorrelationEngine::new(
            settings.local_confidence_weight,
            settings.external_confidence_weight,
            settings.local_confidence_boost,
            settings.minimum_final_confidence,
        )?;
        Ok(Self {
            store,
            reputation,
            geo,
            engine,
            cache,
            settings,
            processing: AtomicBool::new(false),
            last_rebuild: RwLock::new(None),
        })
    }

    pub async fn last_rebuild(&self) -> Option<RebuildSummary> {
        if let Some(summary) = self.last_rebuild.read().await.clone() {
            return Some(summary);
        }
        // After a restart the in-memory copy is empty but the cache may
        // still hold the record from the previous process.
        self.cache.get::<RebuildSummary>(KEY_LAST_REBUILD).await.ok().flatten()
    }

    /// Drive the rebuild loop: one cycle per interval tick or admin
    /// trigger, strictly serialized.
    pub async fn run(self: Arc<Self>, mut trigger: mpsc::Receiver<()>) {
        if self.settings.auto_start_processing {
            self.run_and_log().await;
        }

        let period = self.settings.preprocess_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut triggers_open = true;

        loop {
            if triggers_open {
                tokio::select! {
                    _ = ticker.tick() => {}
                    received = trigger.recv() => {
                        if received.is_none() {
                            triggers_open = false;
                            continue;
                        }
                        info!("on-demand rebuild trigger received");
                    }
                }
            } else {
                ticker.tick().await;
            }
            self.run_and_log().await;
        }
    }

    async fn run_and_log(&self) {
        match self.run_cycle().await {
            Ok(CycleOutcome::Completed(summary)) => {
                info!(total = summary.total, "rebuild cycle completed");
            }
            Ok(CycleOutcome::Skipped) => {}
            Err(e) => error!(error = %e, "rebuild cycle failed, previous snapshot retained"),
        }
    }

    /// Run one rebuild cycle. Concurrent invocations coalesce: a running
    /// cycle makes this return `Skipped` immediately.
    pub async fn run_cycle(&self) -> Result<CycleOutcome, ServiceError> {
        if self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("rebuild already in progress, skipping trigger");
            return Ok(CycleOutcome::Skipped);
        }

        let clock = Instant::now();
        let result = self.execute_cycle().await;
        self.processing.store(false, Ordering::SeqCst);

        match result {
            Ok(summary) => {
                metrics::record_rebuild("completed", clock.elapsed().as_secs_f64());
                Ok(CycleOutcome::Completed(summary))
            }
            Err(e) => {
                metrics::record_rebuild("failed", clock.elapsed().as_secs_f64());
                Err(e)
            }
        }
    }

    async fn execute_cycle(&self) -> Result<RebuildSummary, ServiceError> {
        let started_at = Utc::now();
        let clock = Instant::now();
        info!("starting rebuild cycle");

        // 1. Local reports are the primary source; losing them aborts the
        // cycle and the previous snapshot stays served.
        let locals = self.store.fetch_all().await?;
        info!(count = locals.len(), "fetched local reports");

        // 2. External blacklist, budget-gated. Exhausted budget or an
        // upstream outage degrades to whatever the cache had.
        let mut budget_exhausted = false;
        let externals = match self
            .reputation
            .get_blacklist(self.settings.reputation_min_confidence)
            .await
        {
            Ok(page) => {
                budget_exhausted = page.from_cache;
                page.records
            }
            Err(ServiceError::BudgetExhausted { .. }) => {
                warn!("reputation budget exhausted and no cached blacklist, proceeding local-only");
                budget_exhausted = true;
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, "blacklist fetch failed, proceeding local-only");
                Vec::new()
            }
        };
        info!(count = externals.len(), from_cache = budget_exhausted, "fetched external records");

        let local_count = locals.len();
        let external_count = externals.len();

        // 3. Keyset: local order first (already recency-sorted), then
        // external-only addresses.
        let local_map: HashMap<String, LocalRecord> =
            locals.iter().map(|r| (r.ip.clone(), r.clone())).collect();
        let external_map: HashMap<String, ReputationRecord> =
            externals.iter().map(|r| (r.ip.clone(), r.clone())).collect();

        let mut keyset: Vec<String> = locals.iter().map(|r| r.ip.clone()).collect();
        keyset.extend(
            externals.iter().filter(|r| !local_map.contains_key(&r.ip)).map(|r| r.ip.clone()),
        );

        // 4. Correlate and geo-enrich in batches. One bad address never
        // aborts the cycle.
        let mut indicators: Vec<Indicator> = Vec::with_capacity(keyset.len());
        let mut with_geo = 0usize;
        for (batch_index, batch) in keyset.chunks(self.settings.batch_size.max(1)).enumerate() {
            tracing::debug!(batch = batch_index + 1, size = batch.len(), "processing batch");
            for ip in batch {
                let correlated = match self.engine.correlate(
                    ip,
                    local_map.get(ip),
                    external_map.get(ip),
                    started_at,
                ) {
                    Ok(indicator) => indicator,
                    Err(e) => {
                        warn!(ip = %ip, error = %e, "skipping address");
                        continue;
                    }
                };
                let mut indicator = correlated;
                if let Some(geo) = self.geo.enrich(ip).await {
                    indicator.geo = Some(geo.into_geo_data());
                    with_geo += 1;
                }
                indicators.push(indicator);
            }
        }

        // A non-empty keyset that produced nothing means every address
        // failed; keep serving the previous snapshot.
        if !keyset.is_empty() && indicators.is_empty() {
            return Err(ServiceError::fatal("rebuild produced no indicators"));
        }

        // 5–6. Commit both snapshot keys atomically under one generation.
        let generation = self.cache.incr_counter(KEY_GENERATION, None).await?.max(0) as u64;
        let built_at = Utc::now();
        let high_confidence: Vec<Indicator> = indicators
            .iter()
            .filter(|i| i.final_confidence >= HIGH_CONFIDENCE_THRESHOLD)
            .cloned()
            .collect();
        let high_count = high_confidence.len();

        let ttl = self.settings.preprocessing_ttl();
        let total = indicators.len();
        self.cache
            .atomic_swap(KEY_SNAPSHOT, &Snapshot { generation, built_at, indicators }, ttl)
            .await?;
        self.cache
            .atomic_swap(
                KEY_HIGH_CONFIDENCE,
                &Snapshot { generation, built_at, indicators: high_confidence },
                ttl,
            )
            .await?;

        // 7. Bookkeeping.
        let finished_at = Utc::now();
        let geo_success_ratio =
            if total == 0 { 0.0 } else { with_geo as f64 / total as f64 };
        let summary = RebuildSummary {
            started_at,
            finished_at,
            total,
            local_count,
            external_count,
            with_geo,
            geo_success_ratio,
            budget_exhausted,
        };
        self.cache.set(KEY_LAST_REBUILD, &summary, LAST_REBUILD_TTL).await?;
        *self.last_rebuild.write().await = Some(summary.clone());

        let soft_deadline = self
            .settings
            .preprocess_interval()
            .saturating_mul(3)
            .max(Duration::from_secs(15 * 60));
        if clock.elapsed() > soft_deadline {
            warn!(
                elapsed_secs = clock.elapsed().as_secs(),
                "rebuild cycle exceeded its soft deadline"
            );
        }

        info!(
            generation,
            total,
            high_confidence = high_count,
            with_geo,
            duration_secs = clock.elapsed().as_secs_f64(),
            "rebuild cycle committed"
        );
        Ok(summary)
    }
}
