use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use cyberchat_store::StoreError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Message not intended for this server")]
    InvalidReceiver,

    #[error("Failed to decrypt message")]
    DecryptionFailed,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            ServerError::InvalidReceiver => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::DecryptionFailed => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::Store(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Store unavailable".to_string(),
            ),
            ServerError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
