//! HTTP error mapping for the ingest API.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced to HTTP clients.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    /// Upstream error relayed with its original status code.
    #[error("Upstream error: {message}")]
    Upstream {
        status: axum::http::StatusCode,
        message: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    status: u16,
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            Self::UpstreamTimeout(msg) => (StatusCode::GATEWAY_TIMEOUT, msg.clone()),
            Self::Upstream { status, message } => (*status, message.clone()),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };
        let body = ErrorBody {
            error: message,
            status: status.as_u16(),
        };
        (status, axum::Json(body)).into_response()
    }
}

impl From<downbeat_store::StoreError> for HttpError {
    fn from(err: downbeat_store::StoreError) -> Self {
        Self::Internal(err.to_string())
    }
}
