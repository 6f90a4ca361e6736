//! Liveness and observability snapshot endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde_json::json;

use super::AppState;
use crate::cache::{self, KEY_HIGH_CONFIDENCE, KEY_SNAPSHOT};
use crate::errors::ServiceError;
use crate::metrics;
use crate::models::Snapshot;

/// OK while the last rebuild finished within three intervals; DEGRADED when
/// the preprocessor has gone quiet; FAIL when the cache is unreachable.
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if !state.cache.ping().await {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "fail",
                "cache": false,
                "timestamp": Utc::now(),
            })),
        );
    }

    let last_rebuild = state.processor.last_rebuild().await;
    let stale_after = chrono::Duration::seconds(state.settings.preprocess_interval_secs as i64 * 3);
    let fresh = last_rebuild
        .as_ref()
        .map_or(false, |summary| Utc::now() - summary.finished_at <= stale_after);

    let status = if fresh { "ok" } else { "degraded" };
    (
        StatusCode::OK,
        Json(json!({
            "status": status,
            "cache": true,
            "last_rebuild_finished_at": last_rebuild.map(|s| s.finished_at),
            "timestamp": Utc::now(),
        })),
    )
}

pub async fn get_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let total = state
        .cache
        .get::<Snapshot>(KEY_SNAPSHOT)
        .await?
        .map_or(0, |snapshot| snapshot.indicators.len());
    let high_confidence = state
        .cache
        .get::<Snapshot>(KEY_HIGH_CONFIDENCE)
        .await?
        .map_or(0, |snapshot| snapshot.indicators.len());

    let today = Utc::now().date_naive();
    let requests_used = state.cache.get_counter(&cache::budget_key(today)).await?;
    let limit = state.settings.reputation_daily_limit;
    let last_rebuild = state.processor.last_rebuild().await;

    let budget_exhausted = requests_used >= limit
        || last_rebuild.as_ref().map_or(false, |summary| summary.budget_exhausted);
    let rebuild_duration_secs = last_rebuild
        .as_ref()
        .map(|summary| (summary.finished_at - summary.started_at).num_milliseconds() as f64 / 1000.0);

    Ok(Json(json!({
        "iocs": {
            "total": total,
            "high_confidence": high_confidence,
        },
        "budget": {
            "day": today,
            "requests_used": requests_used,
            "limit": limit,
            "budget_exhausted": budget_exhausted,
        },
        "cache": {
            "backend": state.cache.backend_name(),
            "hit_ratio": metrics::cache_hit_ratio(),
        },
        "last_rebuild": last_rebuild,
        "rebuild_duration_secs": rebuild_duration_secs,
    })))
}
