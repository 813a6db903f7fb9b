//! Shared application state injected into the Axum handlers and every
//! WebSocket session.

use std::sync::Arc;

use quill_core::{BlobStore, ResultCache, TaskManager};
use tokio_util::sync::CancellationToken;

use crate::auth::TokenValidator;
use crate::config::Config;
use crate::session::SessionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
    pub manager: Arc<TaskManager>,
    pub blobs: Arc<BlobStore>,
    pub cache: ResultCache,
    pub validator: Arc<dyn TokenValidator>,
    /// Cancelled once at process shutdown; sessions derive child tokens.
    pub shutdown: CancellationToken,
}
