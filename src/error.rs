use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::types::ConversationStatus;

/// Error taxonomy shared by every component. Each variant carries a stable
/// snake_case code so bulk results and clients can match on it.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Permission(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: ConversationStatus,
        to: ConversationStatus,
    },
    #[error("{0}")]
    Conflict(String),
    #[error("conversation is closed")]
    ClosedConversation,
    #[error("message rate limit exceeded for this conversation")]
    RateLimit,
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation_error",
            ApiError::Permission(_) => "permission_error",
            ApiError::NotFound(_) => "not_found",
            ApiError::InvalidTransition { .. } => "invalid_transition",
            ApiError::Conflict(_) => "conflict",
            ApiError::ClosedConversation => "closed_conversation",
            ApiError::RateLimit => "rate_limit_exceeded",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Permission(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidTransition { .. }
            | ApiError::Conflict(_)
            | ApiError::ClosedConversation => StatusCode::CONFLICT,
            ApiError::RateLimit => StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({ "error": self.code(), "message": self.to_string() });
        (self.status(), Json(body)).into_response()
    }
}
