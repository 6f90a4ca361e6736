//! REST listing of the cached snapshot, plus plain export formats. Serves
//! only from the cache so consumer latency stays decoupled from upstreams.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use super::AppState;
use crate::cache::KEY_SNAPSHOT;
use crate::errors::ServiceError;
use crate::exporters;
use crate::models::{Indicator, Snapshot};

const DEFAULT_PAGE_SIZE: usize = 100;
const MAX_PAGE_SIZE: usize = 1000;
const EXPORT_LIMIT: usize = 10_000;

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub skip: Option<usize>,
    pub limit: Option<usize>,
    pub min_confidence: Option<u8>,
}

pub async fn list_iocs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let snapshot = load_snapshot(&state).await?;
    let filtered = filter_by_confidence(&snapshot.indicators, query.min_confidence);

    let skip = query.skip.unwrap_or(0);
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let items: Vec<&Indicator> = filtered.iter().skip(skip).take(limit).copied().collect();
    let page = skip / limit + 1;

    Ok(Json(json!({
        "total": filtered.len(),
        "items": items,
        "page": page,
        "page_size": limit,
    })))
}

pub async fn get_ioc(
    State(state): State<Arc<AppState>>,
    Path(ip): Path<String>,
) -> Result<Json<Indicator>, ServiceError> {
    let snapshot = load_snapshot(&state).await?;
    snapshot
        .indicators
        .into_iter()
        .find(|indicator| indicator.ip == ip)
        .map(Json)
        .ok_or_else(|| ServiceError::not_found(format!("indicator {ip}")))
}

#[derive(Debug, Default, Deserialize)]
pub struct ExportQuery {
    pub min_confidence: Option<u8>,
    pub limit: Option<usize>,
}

pub async fn export_iocs(
    State(state): State<Arc<AppState>>,
    Path(format): Path<String>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, ServiceError> {
    let snapshot = load_snapshot(&state).await?;
    let filtered = filter_by_confidence(&snapshot.indicators, query.min_confidence);
    let limit = query.limit.unwrap_or(EXPORT_LIMIT).min(EXPORT_LIMIT);
    let selected: Vec<Indicator> = filtered.into_iter().take(limit).cloned().collect();

    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let (content, media_type, filename) = match format.as_str() {
        "json" => (exporters::to_json(&selected), "application/json", format!("iocs_{stamp}.json")),
        "csv" => (exporters::to_csv(&selected), "text/csv", format!("iocs_{stamp}.csv")),
        "txt" => {
            (exporters::to_txt(&selected, true), "text/plain", format!("iocs_{stamp}.txt"))
        }
        other => {
            return Err(ServiceError::InvalidRequest(format!("unsupported export format: {other}")))
        }
    };

    Ok((
        [
            (header::CONTENT_TYPE, media_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={filename}"),
            ),
        ],
        content,
    )
        .into_response())
}

async fn load_snapshot(state: &AppState) -> Result<Snapshot, ServiceError> {
    state
        .cache
        .get::<Snapshot>(KEY_SNAPSHOT)
        .await?
        .ok_or_else(|| ServiceError::unavailable("indicator snapshot not built yet"))
}

fn filter_by_confidence(
    indicators: &[Indicator],
    min_confidence: Option<u8>,
) -> Vec<&Indicator> {
    indicators
        .iter()
        .filter(|indicator| min_confidence.map_or(true, |min| indicator.final_confidence >= min))
        .collect()
}
