//! TAXII 2.1 surface: discovery, api-root, collections, objects, manifest.
//!
//! Every response is envelope-wrapped and served from the preprocessed
//! snapshot; a cache miss is the consumer's signal to retry, never a reason
//! to hit an upstream inline.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{AppState, Collection};
use crate::errors::ServiceError;
use crate::models::stix::{Envelope, ManifestEntry, StixBundle, StixIndicator, TAXII_CONTENT_TYPE};
use crate::models::{Indicator, Snapshot};

const MAX_CONTENT_LENGTH: u64 = 10 * 1024 * 1024;

/// JSON responder with the TAXII media type.
pub struct TaxiiJson<T>(pub T);

impl<T: Serialize> IntoResponse for TaxiiJson<T> {
    fn into_response(self) -> Response {
        match serde_json::to_vec(&self.0) {
            Ok(body) => {
                ([(header::CONTENT_TYPE, TAXII_CONTENT_TYPE)], body).into_response()
            }
            Err(e) => ServiceError::fatal(format!("serializing response: {e}")).into_response(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ObjectsQuery {
    pub limit: Option<usize>,
    pub added_after: Option<String>,
    pub next: Option<String>,
}

pub async fn discovery() -> TaxiiJson<serde_json::Value> {
    TaxiiJson(json!({
        "title": "IOC Exchange TAXII Server",
        "description": "Threat intelligence indicators fused from local detections and external reputation",
        "default": "/taxii2/iocs/",
        "api_roots": ["/taxii2/iocs/"],
    }))
}

pub async fn api_root() -> TaxiiJson<serde_json::Value> {
    TaxiiJson(json!({
        "title": "IOC Exchange API Root",
        "versions": [TAXII_CONTENT_TYPE],
        "max_content_length": MAX_CONTENT_LENGTH,
    }))
}

pub async fn list_collections(
    State(state): State<Arc<AppState>>,
) -> TaxiiJson<serde_json::Value> {
    let descriptors: Vec<serde_json::Value> =
        state.collections.iter().map(Collection::descriptor).collect();
    TaxiiJson(json!({ "collections": descriptors }))
}

pub async fn collection_detail(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<TaxiiJson<serde_json::Value>, ServiceError> {
    let collection = resolve(&state, &id)?;
    Ok(TaxiiJson(collection.descriptor()))
}

pub async fn collection_objects(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ObjectsQuery>,
) -> Result<TaxiiJson<Envelope<StixBundle>>, ServiceError> {
    let collection = resolve(&state, &id)?;
    let snapshot = load_snapshot(&state, collection).await?;
    let filtered = filter_indicators(&snapshot, collection, &query)?;
    let page = paginate(&filtered, snapshot.generation, &query)?;

    let objects: Vec<StixIndicator> = page.items.iter().map(|i| StixIndicator::from(*i)).collect();
    Ok(TaxiiJson(Envelope { more: page.more, next: page.next, data: StixBundle::new(objects) }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ManifestData {
    pub objects: Vec<ManifestEntry>,
}

pub async fn collection_manifest(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ObjectsQuery>,
) -> Result<TaxiiJson<Envelope<ManifestData>>, ServiceError> {
    let collection = resolve(&state, &id)?;
    let snapshot = load_snapshot(&state, collection).await?;
    let filtered = filter_indicators(&snapshot, collection, &query)?;
    let page = paginate(&filtered, snapshot.generation, &query)?;

    let objects: Vec<ManifestEntry> =
        page.items.iter().map(|i| ManifestEntry::from_indicator(i)).collect();
    Ok(TaxiiJson(Envelope { more: page.more, next: page.next, data: ManifestData { objects } }))
}

fn resolve<'a>(state: &'a AppState, id: &str) -> Result<&'a Collection, ServiceError> {
    state.collection(id).ok_or_else(|| ServiceError::not_found(format!("collection {id}")))
}

async fn load_snapshot(
    state: &AppState,
    collection: &Collection,
) -> Result<Snapshot, ServiceError> {
    state
        .cache
        .get::<Snapshot>(collection.cache_key)
        .await?
        .ok_or_else(|| ServiceError::unavailable("indicator snapshot not built yet"))
}

fn filter_indicators<'a>(
    snapshot: &'a Snapshot,
    collection: &Collection,
    query: &ObjectsQuery,
) -> Result<Vec<&'a Indicator>, ServiceError> {
    let added_after = query
        .added_after
        .as_deref()
        .map(parse_added_after)
        .transpose()?;

    Ok(snapshot
        .indicators
        .iter()
        .filter(|indicator| collection.matches(indicator))
        .filter(|indicator| added_after.map_or(true, |after| indicator.processed_at > after))
        .collect())
}

fn parse_added_after(raw: &str) -> Result<DateTime<Utc>, ServiceError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| ServiceError::InvalidRequest(format!("invalid added_after value: {raw}")))
}

struct Page<'a> {
    items: Vec<&'a Indicator>,
    more: bool,
    next: Option<String>,
}

/// Index-based pagination bound to the snapshot generation. A cursor from an
/// older generation terminates the walk instead of interleaving snapshots.
fn paginate<'a>(
    filtered: &[&'a Indicator],
    generation: u64,
    query: &ObjectsQuery,
) -> Result<Page<'a>, ServiceError> {
    let offset = match query.next.as_deref() {
        None => 0,
        Some(cursor) => {
            let (cursor_generation, offset) = decode_cursor(cursor)?;
            if cursor_generation != generation {
                return Ok(Page { items: Vec::new(), more: false, next: None });
            }
            offset
        }
    };

    let remaining = filtered.get(offset..).unwrap_or(&[]);
    match query.limit {
        None => Ok(Page { items: remaining.to_vec(), more: false, next: None }),
        Some(limit) => {
            let items: Vec<&Indicator> = remaining.iter().take(limit).copied().collect();
            let consumed = offset + items.len();
            let more = consumed < filtered.len();
            Ok(Page {
                items,
                more,
                next: more.then(|| encode_cursor(generation, consumed)),
            })
        }
    }
}

fn encode_cursor(generation: u64, offset: usize) -> String {
    BASE64.encode(format!("{generation}:{offset}"))
}

fn decode_cursor(cursor: &str) -> Result<(u64, usize), ServiceError> {
    let invalid = || ServiceError::InvalidRequest("invalid next cursor".to_string());
    let decoded = BASE64.decode(cursor).map_err(|_| invalid())?;
    let text = String::from_utf8(decoded).map_err(|_| invalid())?;
    let (generation, offset) = text.split_once(':').ok_or_else(invalid)?;
    Ok((generation.parse().map_err(|_| invalid())?, offset.parse().map_err(|_| invalid())?))
}
