//! End-to-end rebuild cycle tests against the in-memory store and stubbed
//! upstream sources.

mod common;

use std::sync::Arc;

use common::{
    build_harness, build_harness_with_cache, local_record, reputation_record, test_settings,
    FailingGeoProvider, StaticGeoProvider, StubReputation,
};
use ioc_exchange::cache::{IocCache, KEY_HIGH_CONFIDENCE, KEY_SNAPSHOT};
use ioc_exchange::enrichment::{GeoEnricher, GeoProvider};
use ioc_exchange::models::{Snapshot, Source};
use ioc_exchange::models::stix::StixIndicator;
use ioc_exchange::workers::{CycleOutcome, IocProcessor};

fn completed(outcome: CycleOutcome) -> ioc_exchange::models::RebuildSummary {
    match outcome {
        CycleOutcome::Completed(summary) => summary,
        CycleOutcome::Skipped => panic!("cycle unexpectedly skipped"),
    }
}

#[tokio::test]
async fn dual_source_cycle_fuses_and_commits() {
    let harness = build_harness(
        vec![local_record("192.0.2.5", 85)],
        StubReputation::with_records(vec![
            reputation_record("192.0.2.5", 75),
            reputation_record("198.51.100.7", 75),
        ]),
        vec![Arc::new(StaticGeoProvider)],
    );

    let summary = completed(harness.processor.run_cycle().await.unwrap());
    assert_eq!(summary.total, 2);
    assert_eq!(summary.local_count, 1);
    assert_eq!(summary.external_count, 2);
    assert!(!summary.budget_exhausted);

    let snapshot: Snapshot = harness.cache.get(KEY_SNAPSHOT).await.unwrap().unwrap();
    assert_eq!(snapshot.indicators.len(), 2);

    let dual = snapshot.indicators.iter().find(|i| i.ip == "192.0.2.5").unwrap();
    // round(85*0.8 + 75*0.2) = 83, floored to 85 by the high-local boost.
    assert_eq!(dual.final_confidence, 85);
    assert_eq!(dual.sources, vec![Source::Local, Source::External]);
    assert_eq!(dual.local_confidence, Some(85));
    assert_eq!(dual.external_confidence, Some(75));
    assert!(dual.geo.is_some());

    let external_only = snapshot.indicators.iter().find(|i| i.ip == "198.51.100.7").unwrap();
    assert_eq!(external_only.final_confidence, 15);
    assert_eq!(external_only.sources, vec![Source::External]);

    // Wire shape for the dual-source indicator.
    let stix = StixIndicator::from(dual);
    assert_eq!(stix.pattern, "[ipv4-addr:value = '192.0.2.5']");
    assert_eq!(stix.x_source_set, vec!["LOCAL".to_string(), "EXTERNAL".to_string()]);
    assert_eq!(stix.confidence, 85);
}

#[tokio::test]
async fn local_only_indicator_gets_boosted() {
    let harness = build_harness(
        vec![local_record("203.0.113.10", 90)],
        StubReputation::with_records(Vec::new()),
        vec![Arc::new(StaticGeoProvider)],
    );

    completed(harness.processor.run_cycle().await.unwrap());
    let snapshot: Snapshot = harness.cache.get(KEY_SNAPSHOT).await.unwrap().unwrap();

    let only = &snapshot.indicators[0];
    assert_eq!(only.ip, "203.0.113.10");
    // 90 + 10 boost clamps to the top of the scale.
    assert_eq!(only.final_confidence, 100);
    assert_eq!(only.sources, vec![Source::Local]);
    assert_eq!(only.external_confidence, None);

    let stix = StixIndicator::from(only);
    assert_eq!(stix.pattern, "[ipv4-addr:value = '203.0.113.10']");
    assert_eq!(stix.x_source_set, vec!["LOCAL".to_string()]);
}

#[tokio::test]
async fn empty_sources_commit_an_empty_snapshot() {
    let harness = build_harness(
        Vec::new(),
        StubReputation::with_records(Vec::new()),
        vec![Arc::new(StaticGeoProvider)],
    );

    let summary = completed(harness.processor.run_cycle().await.unwrap());
    assert_eq!(summary.total, 0);

    let snapshot: Snapshot = harness.cache.get(KEY_SNAPSHOT).await.unwrap().unwrap();
    assert!(snapshot.indicators.is_empty());
    assert!(snapshot.generation >= 1);
}

#[tokio::test]
async fn exhausted_budget_degrades_to_local_only() {
    let harness = build_harness(
        vec![local_record("203.0.113.10", 90)],
        StubReputation::exhausted(),
        vec![Arc::new(StaticGeoProvider)],
    );

    let summary = completed(harness.processor.run_cycle().await.unwrap());
    assert!(summary.budget_exhausted);
    assert_eq!(summary.total, 1);
    assert_eq!(summary.external_count, 0);

    let snapshot: Snapshot = harness.cache.get(KEY_SNAPSHOT).await.unwrap().unwrap();
    assert_eq!(snapshot.indicators[0].sources, vec![Source::Local]);
}

#[tokio::test]
async fn geo_outage_still_produces_indicators() {
    let harness = build_harness(
        vec![local_record("203.0.113.10", 90)],
        StubReputation::with_records(Vec::new()),
        vec![Arc::new(FailingGeoProvider)],
    );

    let summary = completed(harness.processor.run_cycle().await.unwrap());
    assert_eq!(summary.total, 1);
    assert_eq!(summary.with_geo, 0);
    assert_eq!(summary.geo_success_ratio, 0.0);

    let snapshot: Snapshot = harness.cache.get(KEY_SNAPSHOT).await.unwrap().unwrap();
    let only = &snapshot.indicators[0];
    assert!(only.geo.is_none());

    // No geo means no x_elastic_geo_* fields on the wire.
    let value = serde_json::to_value(StixIndicator::from(only)).unwrap();
    assert!(!value.as_object().unwrap().keys().any(|k| k.starts_with("x_elastic_geo")));
}

#[tokio::test]
async fn high_confidence_snapshot_matches_the_predicate() {
    let harness = build_harness(
        vec![
            local_record("203.0.113.1", 90),
            local_record("203.0.113.2", 79),
            local_record("203.0.113.3", 50),
            local_record("203.0.113.4", 40),
        ],
        StubReputation::with_records(vec![reputation_record("198.51.100.7", 75)]),
        vec![Arc::new(StaticGeoProvider)],
    );

    completed(harness.processor.run_cycle().await.unwrap());

    let full: Snapshot = harness.cache.get(KEY_SNAPSHOT).await.unwrap().unwrap();
    let high: Snapshot = harness.cache.get(KEY_HIGH_CONFIDENCE).await.unwrap().unwrap();

    let expected: Vec<&str> = full
        .indicators
        .iter()
        .filter(|i| i.final_confidence >= 80)
        .map(|i| i.ip.as_str())
        .collect();
    let actual: Vec<&str> = high.indicators.iter().map(|i| i.ip.as_str()).collect();
    assert_eq!(actual, expected);
    assert_eq!(high.generation, full.generation);

    assert!(high.indicators.iter().all(|i| i.final_confidence >= 80));
    // The boosted locals (90 -> 100, 79 -> 89) qualify; the 50 and 40 locals
    // pass through unboosted and the external-only 75 scores 15.
    assert_eq!(high.indicators.len(), 2);
}

#[tokio::test]
async fn failed_fetch_retains_previous_snapshot() {
    let settings = Arc::new(test_settings());
    let cache = Arc::new(IocCache::in_memory());

    // First cycle with a healthy store commits generation N.
    let healthy = build_harness_with_cache(
        settings.clone(),
        cache.clone(),
        vec![local_record("203.0.113.10", 90)],
        StubReputation::with_records(Vec::new()),
        vec![Arc::new(StaticGeoProvider)],
    );
    completed(healthy.processor.run_cycle().await.unwrap());
    let before: Snapshot = cache.get(KEY_SNAPSHOT).await.unwrap().unwrap();

    // A store whose every record fails correlation cannot happen, but a
    // keyset that produces nothing can: simulate with a store that errors.
    struct BrokenStore;
    #[async_trait::async_trait]
    impl ioc_exchange::db::LocalThreatStore for BrokenStore {
        async fn fetch_all(
            &self,
        ) -> Result<Vec<ioc_exchange::models::LocalRecord>, ioc_exchange::errors::ServiceError>
        {
            Err(ioc_exchange::errors::ServiceError::transient("connection refused"))
        }
    }

    let geo: Vec<Arc<dyn GeoProvider>> = vec![Arc::new(StaticGeoProvider)];
    let broken = IocProcessor::new(
        Arc::new(BrokenStore),
        Arc::new(StubReputation::with_records(Vec::new())),
        Arc::new(GeoEnricher::new(
            geo,
            std::time::Duration::from_millis(1),
            cache.clone(),
            std::time::Duration::from_secs(60),
        )),
        cache.clone(),
        settings,
    )
    .unwrap();

    broken.run_cycle().await.unwrap_err();

    let after: Snapshot = cache.get(KEY_SNAPSHOT).await.unwrap().unwrap();
    assert_eq!(after.generation, before.generation);
    assert_eq!(after.indicators, before.indicators);
}

#[tokio::test]
async fn concurrent_triggers_coalesce() {
    // A provider that actually suspends, so the second cycle attempt runs
    // while the first one is mid-flight.
    struct SlowGeoProvider;
    #[async_trait::async_trait]
    impl GeoProvider for SlowGeoProvider {
        fn name(&self) -> &'static str {
            "slow-test"
        }
        async fn fetch(
            &self,
            _ip: &str,
        ) -> Result<Option<ioc_exchange::models::GeoRecord>, ioc_exchange::errors::ServiceError>
        {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            Ok(None)
        }
    }

    let harness = build_harness(
        vec![local_record("203.0.113.10", 90)],
        StubReputation::with_records(Vec::new()),
        vec![Arc::new(SlowGeoProvider)],
    );

    let processor = harness.processor.clone();
    let (a, b) = tokio::join!(processor.run_cycle(), harness.processor.run_cycle());

    let outcomes = [a.unwrap(), b.unwrap()];
    let completed_count =
        outcomes.iter().filter(|o| matches!(o, CycleOutcome::Completed(_))).count();
    let skipped_count = outcomes.iter().filter(|o| matches!(o, CycleOutcome::Skipped)).count();
    assert_eq!(completed_count, 1);
    assert_eq!(skipped_count, 1);
}

#[tokio::test]
async fn rebuild_is_idempotent_for_identical_sources() {
    let harness = build_harness(
        vec![local_record("192.0.2.5", 85), local_record("203.0.113.10", 60)],
        StubReputation::with_records(vec![reputation_record("192.0.2.5", 75)]),
        vec![Arc::new(StaticGeoProvider)],
    );

    completed(harness.processor.run_cycle().await.unwrap());
    let first: Snapshot = harness.cache.get(KEY_SNAPSHOT).await.unwrap().unwrap();

    completed(harness.processor.run_cycle().await.unwrap());
    let second: Snapshot = harness.cache.get(KEY_SNAPSHOT).await.unwrap().unwrap();

    assert!(second.generation > first.generation);
    let project = |snapshot: &Snapshot| -> Vec<(String, u8, Vec<Source>)> {
        snapshot
            .indicators
            .iter()
            .map(|i| (i.ip.clone(), i.final_confidence, i.sources.clone()))
            .collect()
    };
    assert_eq!(project(&first), project(&second));
}

#[tokio::test]
async fn generation_increases_monotonically() {
    let harness = build_harness(
        vec![local_record("203.0.113.10", 90)],
        StubReputation::with_records(Vec::new()),
        vec![Arc::new(StaticGeoProvider)],
    );

    let mut previous = 0;
    for _ in 0..3 {
        completed(harness.processor.run_cycle().await.unwrap());
        let snapshot: Snapshot = harness.cache.get(KEY_SNAPSHOT).await.unwrap().unwrap();
        assert!(snapshot.generation > previous);
        previous = snapshot.generation;
    }
}

#[tokio::test]
async fn last_rebuild_summary_is_recorded() {
    let harness = build_harness(
        vec![local_record("203.0.113.10", 90)],
        StubReputation::with_records(Vec::new()),
        vec![Arc::new(StaticGeoProvider)],
    );

    assert!(harness.processor.last_rebuild().await.is_none());
    completed(harness.processor.run_cycle().await.unwrap());

    let summary = harness.processor.last_rebuild().await.unwrap();
    assert_eq!(summary.total, 1);
    assert!(summary.finished_at >= summary.started_at);
    assert_eq!(summary.geo_success_ratio, 1.0);
}
