//! quill-server – entry point.
//!
//! Startup order:
//! 1. Parse configuration from environment variables.
//! 2. Initialise structured tracing (JSON in production, pretty in dev).
//! 3. Open the result cache and the blob store.
//! 4. Build the engine gate for the configured concurrency mode.
//! 5. Start the task manager and its worker pool.
//! 6. Build the Axum router and serve until ctrl-c, then drain.

mod auth;
mod config;
mod error;
mod protocol;
mod routes;
mod session;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quill_core::{
    BlobStore, DeletePolicy, EngineGate, EventSink, MockEngine, ResultCache, SpeechEngine,
    TaskManager, TaskManagerConfig,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::auth::StaticTokenValidator;
use crate::config::{ConcurrencyMode, Config};
use crate::session::SessionRegistry;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cfg = Config::from_env();

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cfg.log_level.parse().unwrap_or_default()),
        )
        .with_target(true);
    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "quill-server starting");

    // ── 3. Stores ──────────────────────────────────────────────────────────────
    if let Some(path) = cfg.cache_url.strip_prefix("sqlite://") {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
    }
    let cache = ResultCache::open(&cfg.cache_url, cfg.cache_ttl(), cfg.cache_enabled).await?;
    info!(url = %cfg.cache_url, enabled = cfg.cache_enabled, "result cache ready");

    let policy = if cfg.delete_after_transcription {
        DeletePolicy::Immediate
    } else {
        DeletePolicy::Retain
    };
    let blobs = Arc::new(BlobStore::open(&cfg.blob_dir, policy).await?);
    info!(dir = %cfg.blob_dir, "blob store ready");

    // ── 4. Engine gate ─────────────────────────────────────────────────────────
    let gate = match cfg.concurrency_mode {
        ConcurrencyMode::Lock => EngineGate::serialized(Box::new(MockEngine::default())),
        ConcurrencyMode::Pool => EngineGate::pooled(
            (0..cfg.max_concurrent_tasks.max(1))
                .map(|_| Box::new(MockEngine::default()) as Box<dyn SpeechEngine>)
                .collect(),
        ),
    };
    info!(mode = gate.mode(), "engine gate ready");

    // ── 5. Task manager ────────────────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    cache.spawn_sweeper(Duration::from_secs(3600), shutdown.clone());

    let registry = Arc::new(SessionRegistry::new(cfg.max_connections));
    let manager = TaskManager::start(
        TaskManagerConfig {
            max_concurrent: cfg.max_concurrent_tasks,
            max_queue_size: cfg.max_queue_size,
            max_file_size: cfg.max_file_size(),
            allowed_extensions: cfg.allowed_extensions.clone(),
            retry_times: cfg.retry_times,
            task_timeout: cfg.task_timeout(),
            merge_gap: cfg.merge_gap(),
            completion_retention: Duration::from_secs(3600),
        },
        gate,
        Arc::clone(&blobs),
        cache.clone(),
        Arc::clone(&registry) as Arc<dyn EventSink>,
    );

    // ── 6. HTTP/WebSocket server ───────────────────────────────────────────────
    let state = AppState {
        config: Arc::new(cfg.clone()),
        registry: Arc::clone(&registry),
        manager: Arc::clone(&manager),
        blobs,
        cache,
        validator: Arc::new(StaticTokenValidator::new(cfg.auth_token.clone())),
        shutdown: shutdown.clone(),
    };
    let app = routes::build(state);

    let addr: SocketAddr = cfg.bind_address().parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "server listening");

    let signal_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            signal_token.cancel();
        })
        .await?;

    // ── 7. Drain ───────────────────────────────────────────────────────────────
    registry.close_all();
    manager.shutdown().await;
    info!("shutdown complete");
    Ok(())
}
