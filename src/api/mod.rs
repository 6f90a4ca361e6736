pub mod health;
pub mod iocs;
pub mod taxii;

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::cache::{IocCache, KEY_HIGH_CONFIDENCE, KEY_SNAPSHOT};
use crate::config::Settings;
use crate::metrics;
use crate::models::stix::STIX_MEDIA_TYPE;
use crate::models::Indicator;
use crate::workers::{IocProcessor, HIGH_CONFIDENCE_THRESHOLD};

/// A named, filtered view of the snapshot.
#[derive(Debug, Clone)]
pub struct Collection {
    pub id: &'static str,
    pub title: &'static str,
    pub description: &'static str,
    /// Snapshot key the preprocessor maintains for this view.
    pub cache_key: &'static str,
    pub min_confidence: Option<u8>,
}

impl Collection {
    #[must_use]
    pub fn matches(&self, indicator: &Indicator) -> bool {
        self.min_confidence.map_or(true, |min| indicator.final_confidence >= min)
    }

    #[must_use]
    pub fn descriptor(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "title": self.title,
            "description": self.description,
            "can_read": true,
            "can_write": false,
            "media_types": [STIX_MEDIA_TYPE],
        })
    }
}

#[must_use]
pub fn default_collections() -> Vec<Collection> {
    vec![
        Collection {
            id: "all-indicators",
            title: "All Indicators",
            description: "IP indicators fused from local detections and external reputation",
            cache_key: KEY_SNAPSHOT,
            min_confidence: None,
        },
        Collection {
            id: "high-confidence",
            title: "High Confidence Indicators",
            description: "Indicators with a final confidence of 80 or above",
            cache_key: KEY_HIGH_CONFIDENCE,
            min_confidence: Some(HIGH_CONFIDENCE_THRESHOLD),
        },
    ]
}

pub struct AppState {
    pub settings: Arc<Settings>,
    pub cache: Arc<IocCache>,
    pub collections: Vec<Collection>,
    pub processor: Arc<IocProcessor>,
    pub rebuild_trigger: mpsc::Sender<()>,
}

impl AppState {
    #[must_use]
    pub fn collection(&self, id: &str) -> Option<&Collection> {
        self.collections.iter().find(|c| c.id == id)
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/taxii2", get(taxii::discovery))
        .route("/taxii2/iocs/", get(taxii::api_root))
        .route("/taxii2/iocs/collections/", get(taxii::list_collections))
        .route("/taxii2/iocs/collections/:id/", get(taxii::collection_detail))
        .route("/taxii2/iocs/collections/:id/objects/", get(taxii::collection_objects))
        .route("/taxii2/iocs/collections/:id/manifest/", get(taxii::collection_manifest))
        .route("/api/v1/iocs", get(iocs::list_iocs))
        .route("/api/v1/iocs/export/:format", get(iocs::export_iocs))
        .route("/api/v1/iocs/:ip", get(iocs::get_ioc))
        .route("/admin/preprocess", post(trigger_preprocess))
        .route("/health", get(health::health_check))
        .route("/stats", get(health::get_stats))
        .route("/metrics", get(metrics_handler))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Internal rebuild trigger. A full channel means a trigger is already
/// queued behind the running cycle, which is the coalescing the contract
/// asks for.
async fn trigger_preprocess(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.rebuild_trigger.try_send(()) {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({"status": "scheduled"}))),
        Err(mpsc::error::TrySendError::Full(())) => {
            (StatusCode::ACCEPTED, Json(json!({"status": "coalesced"})))
        }
        Err(mpsc::error::TrySendError::Closed(())) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "preprocessor not running"})),
        ),
    }
}

async fn metrics_handler() -> String {
    metrics::render()
}
