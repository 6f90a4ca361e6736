use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Error taxonomy for the service.
///
/// `Config` and `Fatal` are terminal for the operation that raised them;
/// `Transient` and `BudgetExhausted` are expected operational conditions the
/// caller degrades around.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("configuration error: {reason}")]
    Config { reason: String },

    #[error("transient upstream failure: {context}")]
    Transient { context: String },

    #[error("reputation daily budget exhausted ({limit} requests)")]
    BudgetExhausted { limit: i64 },

    #[error("{resource} not found")]
    NotFound { resource: String },

    #[error("service unavailable: {reason}")]
    ServiceUnavailable { reason: String },

    #[error("invariant violation: {context}")]
    Fatal { context: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ServiceError {
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config { reason: reason.into() }
    }

    pub fn transient(context: impl Into<String>) -> Self {
        Self::Transient { context: context.into() }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound { resource: resource.into() }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::ServiceUnavailable { reason: reason.into() }
    }

    pub fn fatal(context: impl Into<String>) -> Self {
        Self::Fatal { context: context.into() }
    }

    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::BudgetExhausted { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Config { .. } | Self::Transient { .. } | Self::Fatal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable error code string for consumer-facing responses. Never carries
    /// internal detail.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Config { .. } => "configuration_error",
            Self::Transient { .. } => "transient_upstream_error",
            Self::BudgetExhausted { .. } => "budget_exhausted",
            Self::NotFound { .. } => "not_found",
            Self::ServiceUnavailable { .. } => "service_unavailable",
            Self::Fatal { .. } => "internal_error",
            Self::InvalidRequest(_) => "invalid_request",
        }
    }
}

impl From<sqlx::Error> for ServiceError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::ColumnNotFound(col) => {
                Self::fatal(format!("local threat table schema mismatch: missing column {col}"))
            }
            sqlx::Error::ColumnDecode { index, source } => Self::fatal(format!(
                "local threat table schema mismatch: column {index} failed to decode: {source}"
            )),
            other => Self::transient(format!("database query failed: {other}")),
        }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        Self::transient(format!("http request failed: {err}"))
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();

        // Consumer-facing message is the stable summary only; stack traces
        // and upstream detail stay in the logs.
        let message = match &self {
            Self::NotFound { resource } => format!("{resource} not found"),
            Self::ServiceUnavailable { .. } => {
                "snapshot not available yet, retry shortly".to_string()
            }
            Self::InvalidRequest(reason) => reason.clone(),
            _ => "internal server error".to_string(),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
                "status": status.as_u16(),
            }
        }));

        let mut response = (status, body).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, header::HeaderValue::from_static("30"));
        }
        response
    }
}
