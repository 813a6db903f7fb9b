//! Unified error type for the HTTP side of the server.
//!
//! WebSocket-level failures travel as `error` frames (see `protocol`); this
//! type only covers the plain HTTP routes.  Internal detail is logged in
//! full but never returned to the caller.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("cache error: {0}")]
    Cache(#[from] quill_core::CacheError),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        match &self {
            ServerError::Cache(e) => error!(error = %e, "cache error"),
        }
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "internal server error" })),
        )
            .into_response()
    }
}
