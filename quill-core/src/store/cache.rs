//! Durable result cache: raw transcripts plus lazily derived formats.
//!
//! Backed by SQLite via sqlx.  The raw transcript for a hash is written once
//! (first writer wins); derived formats are computed on demand, at most once
//! per (hash, format) across concurrent callers, and cached alongside.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::RawTranscript;
use crate::format::OutputFormat;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("no raw result cached for {0}")]
    MissingRaw(String),
    #[error("cache entry corrupt for {hash}: {detail}")]
    Corrupt { hash: String, detail: String },
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub raw_entries: u64,
    pub derived_entries: u64,
}

const CREATE_TRANSCRIPTS: &str = "\
CREATE TABLE IF NOT EXISTS transcripts (
    file_hash      TEXT PRIMARY KEY,
    raw            TEXT NOT NULL,
    created_at     INTEGER NOT NULL,
    last_access_at INTEGER NOT NULL
)";

const CREATE_DERIVED: &str = "\
CREATE TABLE IF NOT EXISTS derived_formats (
    file_hash  TEXT NOT NULL,
    format     TEXT NOT NULL,
    payload    TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (file_hash, format)
)";

const CREATE_ACCESS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_transcripts_last_access ON transcripts(last_access_at)";

#[derive(Clone)]
pub struct ResultCache {
    pool: SqlitePool,
    ttl: Duration,
    enabled: bool,
    /// Single-flight gates keyed by `hash:format`.
    flights: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl ResultCache {
    /// Open (or create) the cache database at `url`, e.g.
    /// `sqlite://data/cache.db` or `sqlite::memory:` for tests.
    pub async fn open(url: &str, ttl: Duration, enabled: bool) -> Result<Self, CacheError> {
        let opts = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        // SQLite permits limited write concurrency; a single connection
        // avoids "database is locked" failures under concurrent workers.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        for stmt in [CREATE_TRANSCRIPTS, CREATE_DERIVED, CREATE_ACCESS_INDEX] {
            sqlx::query(stmt).execute(&pool).await?;
        }

        Ok(Self {
            pool,
            ttl,
            enabled,
            flights: Arc::new(DashMap::new()),
        })
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Fetch the raw transcript for `hash`, refreshing its access time.
    pub async fn get_raw(&self, hash: &str) -> Result<Option<RawTranscript>, CacheError> {
        if !self.enabled {
            return Ok(None);
        }
        let row: Option<(String,)> =
            sqlx::query_as("SELECT raw FROM transcripts WHERE file_hash = ?1")
                .bind(hash)
                .fetch_optional(&self.pool)
                .await?;
        let Some((raw,)) = row else {
            return Ok(None);
        };
        self.touch(hash).await?;
        let transcript =
            serde_json::from_str(&raw).map_err(|e| CacheError::Corrupt {
                hash: hash.to_owned(),
                detail: e.to_string(),
            })?;
        Ok(Some(transcript))
    }

    /// Store a raw transcript.  Idempotent: the first writer wins, later
    /// calls only refresh the access time.
    pub async fn put_raw(&self, hash: &str, raw: &RawTranscript) -> Result<(), CacheError> {
        if !self.enabled {
            return Ok(());
        }
        let serialized = serde_json::to_string(raw).map_err(|e| CacheError::Corrupt {
            hash: hash.to_owned(),
            detail: e.to_string(),
        })?;
        let now = Utc::now().timestamp();
        sqlx::query(
            "INSERT INTO transcripts (file_hash, raw, created_at, last_access_at) \
             VALUES (?1, ?2, ?3, ?3) \
             ON CONFLICT(file_hash) DO UPDATE SET last_access_at = excluded.last_access_at",
        )
        .bind(hash)
        .bind(&serialized)
        .bind(now)
        .execute(&self.pool)
        .await?;
        debug!(hash, "raw transcript cached");
        Ok(())
    }

    /// Return the cached payload for (hash, format), deriving and caching it
    /// on first request.  `derive` runs at most once per key across
    /// concurrent callers.
    pub async fn get_or_derive<F>(
        &self,
        hash: &str,
        format: OutputFormat,
        derive: F,
    ) -> Result<String, CacheError>
    where
        F: FnOnce(&RawTranscript) -> String,
    {
        if let Some(payload) = self.fetch_derived(hash, format).await? {
            self.touch(hash).await?;
            return Ok(payload);
        }

        let key = format!("{hash}:{format}");
        let gate = self
            .flights
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = gate.lock().await;

        // A concurrent caller may have derived while we waited for the gate.
        if let Some(payload) = self.fetch_derived(hash, format).await? {
            self.flights.remove(&key);
            return Ok(payload);
        }

        let raw = self
            .load_raw_unconditional(hash)
            .await?
            .ok_or_else(|| CacheError::MissingRaw(hash.to_owned()))?;
        let payload = derive(&raw);

        sqlx::query(
            "INSERT OR IGNORE INTO derived_formats (file_hash, format, payload, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(hash)
        .bind(format.as_str())
        .bind(&payload)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        self.flights.remove(&key);
        debug!(hash, %format, "derived format cached");
        Ok(payload)
    }

    /// Remove the raw entry and all derived formats for `hash`.
    pub async fn evict(&self, hash: &str) -> Result<(), CacheError> {
        sqlx::query("DELETE FROM derived_formats WHERE file_hash = ?1")
            .bind(hash)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM transcripts WHERE file_hash = ?1")
            .bind(hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<CacheStats, CacheError> {
        let (raw_entries,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM transcripts")
            .fetch_one(&self.pool)
            .await?;
        let (derived_entries,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM derived_formats")
            .fetch_one(&self.pool)
            .await?;
        Ok(CacheStats {
            raw_entries: raw_entries as u64,
            derived_entries: derived_entries as u64,
        })
    }

    /// Start the background sweeper removing entries idle past the TTL.
    pub fn spawn_sweeper(&self, interval: Duration, token: CancellationToken) {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        match cache.sweep().await {
                            Ok(0) => {}
                            Ok(n) => info!(removed = n, "cache sweep removed expired entries"),
                            Err(e) => warn!(error = %e, "cache sweep failed"),
                        }
                    }
                }
            }
        });
    }

    /// Delete entries whose last access is older than the TTL.
    pub async fn sweep(&self) -> Result<u64, CacheError> {
        let cutoff = Utc::now().timestamp() - self.ttl.as_secs() as i64;
        sqlx::query(
            "DELETE FROM derived_formats WHERE file_hash IN \
             (SELECT file_hash FROM transcripts WHERE last_access_at < ?1)",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        let result = sqlx::query("DELETE FROM transcripts WHERE last_access_at < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn fetch_derived(
        &self,
        hash: &str,
        format: OutputFormat,
    ) -> Result<Option<String>, CacheError> {
        if !self.enabled {
            return Ok(None);
        }
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT payload FROM derived_formats WHERE file_hash = ?1 AND format = ?2",
        )
        .bind(hash)
        .bind(format.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(p,)| p))
    }

    /// Raw fetch that bypasses the `enabled` flag: used by the derive path,
    /// which must see a transcript written moments ago by the same worker.
    async fn load_raw_unconditional(&self, hash: &str) -> Result<Option<RawTranscript>, CacheError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT raw FROM transcripts WHERE file_hash = ?1")
                .bind(hash)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(raw,)| {
            serde_json::from_str(&raw).map_err(|e| CacheError::Corrupt {
                hash: hash.to_owned(),
                detail: e.to_string(),
            })
        })
        .transpose()
    }

    async fn touch(&self, hash: &str) -> Result<(), CacheError> {
        sqlx::query("UPDATE transcripts SET last_access_at = ?1 WHERE file_hash = ?2")
            .bind(Utc::now().timestamp())
            .bind(hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
