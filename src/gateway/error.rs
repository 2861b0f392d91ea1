use crate::chat::RegistryError;
use crate::history::HistoryError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("invalid request body: {0}")]
    InvalidBody(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conversation not found: {session_id}")]
    ConversationNotFound { session_id: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            ApiError::InvalidBody(details) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "invalid request body", "details": details }),
            ),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, json!({ "error": msg })),
            ApiError::ConversationNotFound { session_id } => (
                StatusCode::NOT_FOUND,
                json!({ "error": "Conversation not found", "sessionId": session_id }),
            ),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, json!({ "error": msg })),
            ApiError::Internal(e) => {
                tracing::error!("internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "internal server error" }),
                )
            }
        };
        (status, axum::Json(body)).into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        ApiError::Conflict(err.to_string())
    }
}

impl From<HistoryError> for ApiError {
    fn from(err: HistoryError) -> Self {
        match err {
            HistoryError::InvalidInput(msg) => ApiError::BadRequest(msg),
            HistoryError::NotFound(what) => {
                tracing::debug!("history lookup missed: {what}");
                ApiError::NotFound("Project not found".into())
            }
            io @ HistoryError::Io { .. } => ApiError::Internal(io.into()),
        }
    }
}
