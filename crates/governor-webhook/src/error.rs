//! Webhook error type

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

/// Error type for webhook operations
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// The admission review request was invalid or malformed
    #[error("invalid admission review: {0}")]
    InvalidReview(String),

    /// TLS material could not be loaded
    #[error("tls configuration error: {0}")]
    Tls(String),

    /// The server failed while serving
    #[error("server error: {0}")]
    Server(#[from] std::io::Error),

    /// An error occurred during JSON serialization/deserialization
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::InvalidReview(_) => StatusCode::BAD_REQUEST,
            WebhookError::Tls(_) | WebhookError::Server(_) | WebhookError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(serde_json::json!({"error": self.to_string()}))).into_response()
    }
}
