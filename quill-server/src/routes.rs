//! Axum router construction.
//!
//! The public surface is the WebSocket endpoint; `/healthz` and `/stats`
//! exist for probes and operators.

use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::error::ServerError;
use crate::session;
use crate::state::AppState;

pub fn build(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/healthz", get(healthz))
        .route("/stats", get(stats))
        .with_state(state)
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| session::serve(socket, state))
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn stats(State(state): State<AppState>) -> Result<Json<Value>, ServerError> {
    let tasks = state.manager.stats();
    let cache = state.cache.stats().await?;
    Ok(Json(json!({
        "tasks": tasks,
        "cache": cache,
        "sessions": {
            "active": state.registry.len(),
            "max": state.config.max_connections,
        },
    })))
}
