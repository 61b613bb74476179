//! Error types for fedibridge
//!
//! All errors in the engine are converted to `AppError`,
//! which implements `IntoResponse` for proper HTTP error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Engine-wide error type
///
/// The four federation failure classes (`Discovery`, `ActorFetch`,
/// `SignatureInvalid`, `DeliveryFailure`) are what callers branch on;
/// the remaining variants are ambient plumbing failures.
#[derive(Debug, Error)]
pub enum AppError {
    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Authentication required (401)
    #[error("Authentication required")]
    Unauthorized,

    /// Access denied (403)
    #[error("Access denied")]
    Forbidden,

    /// Validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// WebFinger resolution failed (502). Never retried automatically.
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Remote actor document unreachable or structurally invalid (502)
    #[error("Actor fetch error: {0}")]
    ActorFetch(String),

    /// Signature missing, malformed or not matching (401). Always fatal.
    #[error("Invalid signature: {0}")]
    SignatureInvalid(String),

    /// Remote inbox rejected or could not be reached (502)
    #[error("Delivery failure: {0}")]
    DeliveryFailure(String),

    /// Network level failure, including timeouts (502)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP client construction error (500)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Whether a failed unit of work may be attempted again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::ActorFetch(_)
                | AppError::DeliveryFailure(_)
                | AppError::Transport(_)
                | AppError::Database(_)
        )
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Maps each error variant to appropriate HTTP status code
    /// and JSON error body.
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, error_message, error_type) = match &self {
            AppError::NotFound => (StatusCode::NOT_FOUND, self.to_string(), "not_found"),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string(), "unauthorized"),
            // The reason stays in the logs; remote peers only learn that it failed.
            AppError::SignatureInvalid(_) => (
                StatusCode::UNAUTHORIZED,
                "Invalid signature".to_string(),
                "invalid_signature",
            ),
            AppError::Forbidden => (StatusCode::FORBIDDEN, self.to_string(), "forbidden"),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone(), "validation"),
            AppError::Discovery(msg) => (StatusCode::BAD_GATEWAY, msg.clone(), "discovery"),
            AppError::ActorFetch(msg) => (StatusCode::BAD_GATEWAY, msg.clone(), "actor_fetch"),
            AppError::DeliveryFailure(msg) => (StatusCode::BAD_GATEWAY, msg.clone(), "delivery"),
            AppError::Transport(msg) => (StatusCode::BAD_GATEWAY, msg.clone(), "transport"),
            AppError::HttpClient(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                self.to_string(),
                "http_client",
            ),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
                "database",
            ),
            AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone(), "config"),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                "internal",
            ),
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, "Request rejected");
        }

        use crate::metrics::ERRORS_TOTAL;
        ERRORS_TOTAL.with_label_values(&[error_type]).inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
