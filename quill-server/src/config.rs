//! Server configuration, loaded from environment variables at startup.

use std::time::Duration;

/// Runtime configuration for quill-server.
///
/// Every field has a sensible default so the server works out-of-the-box
/// without any environment variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// Interface to bind (default `"0.0.0.0"`).
    pub host: String,
    /// TCP port (default `8765`).
    pub port: u16,
    /// Hard cap on simultaneous WebSocket sessions.
    pub max_connections: usize,
    /// Upload size limit in megabytes.
    pub max_file_size_mb: u64,
    /// Accepted file extensions, lower-case with the leading dot.
    pub allowed_extensions: Vec<String>,
    /// Server-side ping cadence in seconds.
    pub heartbeat_interval_s: u64,
    /// Seconds of inbound silence before a session is closed.
    pub connection_timeout_s: u64,

    /// Worker pool size.
    pub max_concurrent_tasks: usize,
    /// Bound on admitted-but-unfinished tasks.
    pub max_queue_size: usize,
    /// Per-task hard deadline in minutes.
    pub task_timeout_minutes: u64,
    /// Transient-fault retries allowed per task.
    pub retry_times: u32,
    /// Delete uploaded artifacts once no live task references them.
    pub delete_after_transcription: bool,
    /// `"lock"` serializes one engine instance; `"pool"` runs
    /// `max_concurrent_tasks` independent instances.
    pub concurrency_mode: ConcurrencyMode,
    /// Same-speaker sentences closer than this many seconds merge.
    pub merge_gap_s: f64,

    pub cache_enabled: bool,
    pub cache_ttl_hours: u64,
    /// sqlx SQLite URL for the result cache.
    pub cache_url: String,
    /// Root directory for uploaded artifacts.
    pub blob_dir: String,

    pub auth_enabled: bool,
    /// Static token accepted by the auth gate when enabled.
    pub auth_token: Option<String>,

    /// `tracing` filter string, e.g. `"info"` or `"debug,sqlx=warn"`.
    pub log_level: String,
    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyMode {
    Lock,
    Pool,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            host: env_or("QUILL_HOST", "0.0.0.0"),
            port: parse_env("QUILL_PORT", 8765),
            max_connections: parse_env("QUILL_MAX_CONNECTIONS", 100),
            max_file_size_mb: parse_env("QUILL_MAX_FILE_SIZE_MB", 5000),
            allowed_extensions: parse_list(
                "QUILL_ALLOWED_EXTENSIONS",
                ".wav,.mp3,.mp4,.m4a,.flac,.aac,.ogg,.opus",
            ),
            heartbeat_interval_s: parse_env("QUILL_HEARTBEAT_INTERVAL_S", 30),
            connection_timeout_s: parse_env("QUILL_CONNECTION_TIMEOUT_S", 120),
            max_concurrent_tasks: parse_env("QUILL_MAX_CONCURRENT_TASKS", 4),
            max_queue_size: parse_env("QUILL_MAX_QUEUE_SIZE", 100),
            task_timeout_minutes: parse_env("QUILL_TASK_TIMEOUT_MINUTES", 30),
            retry_times: parse_env("QUILL_RETRY_TIMES", 2),
            delete_after_transcription: parse_env("QUILL_DELETE_AFTER_TRANSCRIPTION", true),
            concurrency_mode: match env_or("QUILL_CONCURRENCY_MODE", "lock").as_str() {
                "pool" => ConcurrencyMode::Pool,
                _ => ConcurrencyMode::Lock,
            },
            merge_gap_s: parse_env("QUILL_MERGE_GAP_S", 3.0),
            cache_enabled: parse_env("QUILL_CACHE_ENABLED", true),
            cache_ttl_hours: parse_env("QUILL_CACHE_TTL_HOURS", 24 * 30),
            cache_url: env_or("QUILL_CACHE_URL", "sqlite://data/transcription_cache.db"),
            blob_dir: env_or("QUILL_BLOB_DIR", "./uploads"),
            auth_enabled: parse_env("QUILL_AUTH_ENABLED", false),
            auth_token: std::env::var("QUILL_AUTH_TOKEN").ok().filter(|t| !t.is_empty()),
            log_level: env_or("QUILL_LOG", "info"),
            log_json: parse_env("QUILL_LOG_JSON", false),
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_s.max(1))
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_s.max(1))
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_minutes * 60)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_hours * 3600)
    }

    pub fn merge_gap(&self) -> Duration {
        Duration::from_secs_f64(self.merge_gap_s.max(0.0))
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_list(key: &str, default: &str) -> Vec<String> {
    env_or(key, default)
        .split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}
