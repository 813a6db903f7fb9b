use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::registry::{Registry, TaskRecord};
use super::types::{
    Admission, CancelOutcome, Enqueued, EventSink, SubmitMode, SubmitRequest, TaskError, TaskEvent,
    TaskSnapshot, TaskStats, TaskStatus,
};
use crate::engine::{EngineGate, RawTranscript, TranscribeHints};
use crate::format::{self, FormatMeta, OutputFormat};
use crate::store::{BlobStore, ResultCache};

/// How many completion durations feed the queue-wait estimate.
const WAIT_ESTIMATE_WINDOW: usize = 20;

/// How often terminal tasks are considered for pruning.
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct TaskManagerConfig {
    pub max_concurrent: usize,
    pub max_queue_size: usize,
    pub max_file_size: u64,
    /// Lower-case extensions including the dot, e.g. `".wav"`.
    pub allowed_extensions: Vec<String>,
    pub retry_times: u32,
    pub task_timeout: Duration,
    pub merge_gap: Duration,
    /// How long terminal tasks stay queryable before pruning.
    pub completion_retention: Duration,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_queue_size: 100,
            max_file_size: 5_000 * 1024 * 1024,
            allowed_extensions: [".wav", ".mp3", ".mp4", ".m4a", ".flac", ".aac", ".ogg", ".opus"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            retry_times: 2,
            task_timeout: Duration::from_secs(30 * 60),
            merge_gap: Duration::from_secs(3),
            completion_retention: Duration::from_secs(3600),
        }
    }
}

/// Sole arbiter of task admission, ordering, execution, retry and
/// completion fan-out.
///
/// Tasks flow through a bounded FIFO queue drained by `max_concurrent`
/// workers that compete on a shared receiver.  Retries re-enter at the tail.
/// Every terminal transition releases the task's blob reference exactly once.
pub struct TaskManager {
    cfg: TaskManagerConfig,
    registry: Registry,
    /// `None` once shutdown has begun; dropping the sender drains workers.
    queue_tx: StdMutex<Option<mpsc::Sender<String>>>,
    gate: EngineGate,
    blobs: Arc<BlobStore>,
    cache: ResultCache,
    sink: Arc<dyn EventSink>,
    /// Task ids sitting in the queue, not yet picked up by a worker.
    queued: AtomicUsize,
    /// Recent completion durations feeding the wait estimate.
    recent: StdMutex<VecDeque<Duration>>,
    workers: StdMutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl TaskManager {
    /// Spawn the worker pool and return the shared manager handle.
    pub fn start(
        cfg: TaskManagerConfig,
        gate: EngineGate,
        blobs: Arc<BlobStore>,
        cache: ResultCache,
        sink: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        // Headroom above max_queue_size so a retry re-enqueue never blocks a
        // worker; admission enforces the visible pending bound.
        let (tx, rx) = mpsc::channel::<String>(cfg.max_queue_size + cfg.max_concurrent);
        let manager = Arc::new(Self {
            cfg: cfg.clone(),
            registry: Registry::default(),
            queue_tx: StdMutex::new(Some(tx)),
            gate,
            blobs,
            cache,
            sink,
            queued: AtomicUsize::new(0),
            recent: StdMutex::new(VecDeque::with_capacity(WAIT_ESTIMATE_WINDOW)),
            workers: StdMutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        });

        // Workers compete on a shared receiver: exactly one takes each task.
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut handles = Vec::with_capacity(cfg.max_concurrent);
        for worker_id in 0..cfg.max_concurrent {
            let manager = Arc::clone(&manager);
            let rx = Arc::clone(&rx);
            handles.push(tokio::spawn(async move {
                manager.worker_loop(worker_id, rx).await;
            }));
        }
        *manager.workers.lock().expect("worker list poisoned") = handles;

        let janitor = Arc::clone(&manager);
        tokio::spawn(async move { janitor.janitor_loop().await });

        info!(
            max_concurrent = cfg.max_concurrent,
            max_queue_size = cfg.max_queue_size,
            "task manager started"
        );
        manager
    }

    /// Admit an upload request.
    ///
    /// Validates the file, short-circuits on a cache hit, otherwise registers
    /// a Pending task that waits for the session layer to stream the blob.
    pub async fn submit(&self, req: SubmitRequest) -> Result<Admission, TaskError> {
        self.validate(&req)?;
        let task_id = Uuid::new_v4().to_string();

        if !req.force_refresh {
            if let Some(raw) = self.cache.get_raw(&req.file_hash).await? {
                let mut record = TaskRecord::new(
                    task_id.clone(),
                    req.file_name.clone(),
                    req.file_size,
                    req.file_hash.clone(),
                    req.output_format,
                    req.session_id.clone(),
                );
                record.status = TaskStatus::Completed;
                record.progress = 100.0;
                record.finished_at = Some(Utc::now());
                self.registry.insert(record);

                let payload = self
                    .completion_payload(
                        &task_id,
                        &req.file_name,
                        &req.file_hash,
                        req.output_format,
                        &raw,
                    )
                    .await?;
                info!(task_id, hash = %req.file_hash, "cache hit; completed without queueing");
                return Ok(Admission::CacheHit { task_id, payload });
            }
        }

        let counts = self.registry.counts();
        if counts.pending + counts.processing >= self.cfg.max_queue_size {
            return Err(TaskError::QueueFull {
                pending: counts.pending,
                max_queue_size: self.cfg.max_queue_size,
            });
        }

        self.registry.insert(TaskRecord::new(
            task_id.clone(),
            req.file_name,
            req.file_size,
            req.file_hash,
            req.output_format,
            req.session_id,
        ));
        debug!(task_id, "task admitted; awaiting upload");
        Ok(Admission::AwaitingUpload { task_id })
    }

    /// Called by the session layer once the blob is assembled and verified:
    /// takes the blob reference and offers the task to the queue.
    ///
    /// On `QueueFull` the reference is released again and the caller surfaces
    /// the error to the client.
    pub async fn enqueue_uploaded(&self, task_id: &str) -> Result<Enqueued, TaskError> {
        let (file_hash, status) = self
            .registry
            .with_task(task_id, |r| (r.file_hash.clone(), r.status))
            .ok_or_else(|| TaskError::UnknownTask(task_id.to_owned()))?;
        if status != TaskStatus::Pending {
            return Err(TaskError::NotAwaitingUpload {
                task_id: task_id.to_owned(),
            });
        }

        let tx = self
            .queue_tx
            .lock()
            .expect("queue sender poisoned")
            .clone()
            .ok_or(TaskError::ShuttingDown)?;

        self.blobs.acquire(&file_hash)?;
        self.registry.with_task(task_id, |r| r.blob_acquired = true);

        let position = self.queued.fetch_add(1, Ordering::Relaxed) + 1;
        if let Err(e) = tx.try_send(task_id.to_owned()) {
            self.queued.fetch_sub(1, Ordering::Relaxed);
            self.registry.with_task(task_id, |r| r.blob_acquired = false);
            self.blobs.release(&file_hash).await;
            return Err(match e {
                mpsc::error::TrySendError::Full(_) => TaskError::QueueFull {
                    pending: self.queued.load(Ordering::Relaxed),
                    max_queue_size: self.cfg.max_queue_size,
                },
                mpsc::error::TrySendError::Closed(_) => TaskError::ShuttingDown,
            });
        }

        // A worker may have dispatched the task before this returns.
        let dispatched = self
            .registry
            .with_task(task_id, |r| r.status == TaskStatus::Processing)
            .unwrap_or(false);
        if dispatched {
            return Ok(Enqueued {
                mode: SubmitMode::Immediate,
                queue_position: 0,
                estimated_wait_minutes: 0.0,
            });
        }

        let estimated_wait_minutes = self.estimate_wait_minutes(position);
        self.emit(
            task_id,
            TaskEvent::Queued {
                task_id: task_id.to_owned(),
                queue_position: position,
                estimated_wait_minutes,
            },
        );
        Ok(Enqueued {
            mode: SubmitMode::Queued,
            queue_position: position,
            estimated_wait_minutes,
        })
    }

    /// Idempotent; `UnknownTask` once the task has been pruned.
    pub fn subscribe(&self, task_id: &str, session_id: &str) -> Result<(), TaskError> {
        self.registry
            .with_task(task_id, |r| {
                r.subscribers.insert(session_id.to_owned());
            })
            .ok_or_else(|| TaskError::UnknownTask(task_id.to_owned()))
    }

    /// Idempotent; dropping the last subscriber never cancels processing.
    pub fn unsubscribe(&self, task_id: &str, session_id: &str) {
        self.registry.with_task(task_id, |r| {
            r.subscribers.remove(session_id);
        });
    }

    /// Remove a closed session from every subscription.
    pub fn purge_session(&self, session_id: &str) {
        self.registry.purge_session(session_id);
    }

    /// Cancel a Pending task.  Processing and terminal tasks are untouched;
    /// the engine is never interrupted.
    pub async fn cancel(
        &self,
        task_id: &str,
        session_id: &str,
    ) -> Result<CancelOutcome, TaskError> {
        let decided = self
            .registry
            .with_task(task_id, |r| {
                if !r.subscribers.contains(session_id) {
                    return Err(TaskError::NotSubscribed {
                        task_id: task_id.to_owned(),
                        session_id: session_id.to_owned(),
                    });
                }
                Ok(match r.status {
                    TaskStatus::Pending => {
                        r.status = TaskStatus::Cancelled;
                        r.finished_at = Some(Utc::now());
                        r.error = Some("cancelled by client".to_owned());
                        let release = r.blob_acquired.then(|| {
                            r.blob_acquired = false;
                            r.file_hash.clone()
                        });
                        (CancelOutcome::Cancelled, release)
                    }
                    TaskStatus::Processing => (CancelOutcome::AlreadyProcessing, None),
                    _ => (CancelOutcome::AlreadyTerminal, None),
                })
            })
            .ok_or_else(|| TaskError::UnknownTask(task_id.to_owned()))??;

        let (outcome, release) = decided;
        if let Some(hash) = release {
            self.blobs.release(&hash).await;
        }
        if outcome == CancelOutcome::Cancelled {
            info!(task_id, "task cancelled while pending");
        }
        Ok(outcome)
    }

    /// Mark a task Failed before it ever reached the queue (upload errors).
    /// No event is emitted; the session layer surfaces the error frame.
    pub fn fail_upload(&self, task_id: &str, message: &str) {
        self.registry.with_task(task_id, |r| {
            if !r.status.is_terminal() {
                r.status = TaskStatus::Failed;
                r.error = Some(message.to_owned());
                r.finished_at = Some(Utc::now());
            }
        });
    }

    pub fn snapshot(&self, task_id: &str) -> Option<TaskSnapshot> {
        self.registry.snapshot(task_id)
    }

    pub fn stats(&self) -> TaskStats {
        let counts = self.registry.counts();
        TaskStats {
            pending: counts.pending,
            processing: counts.processing,
            completed: counts.completed,
            failed: counts.failed,
            cancelled: counts.cancelled,
            queue_size: self.queued.load(Ordering::Relaxed),
            max_queue_size: self.cfg.max_queue_size,
            max_concurrent: self.cfg.max_concurrent,
        }
    }

    /// Close the queue and wait for workers to finish their current tasks.
    pub async fn shutdown(&self) {
        info!("task manager shutting down");
        self.queue_tx.lock().expect("queue sender poisoned").take();
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .expect("worker list poisoned")
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("task manager stopped");
    }

    // ── internals ────────────────────────────────────────────────────────────

    fn validate(&self, req: &SubmitRequest) -> Result<(), TaskError> {
        let ext = Path::new(&req.file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e.to_lowercase()))
            .unwrap_or_default();
        if !self
            .cfg
            .allowed_extensions
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&ext))
        {
            return Err(TaskError::UnsupportedFormat(req.file_name.clone()));
        }
        if req.file_size > self.cfg.max_file_size {
            return Err(TaskError::FileTooLarge {
                size: req.file_size,
                limit: self.cfg.max_file_size,
            });
        }
        Ok(())
    }

    async fn worker_loop(
        self: Arc<Self>,
        worker_id: usize,
        rx: Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>,
    ) {
        debug!(worker_id, "worker started");
        loop {
            let next = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    _ = self.shutdown.cancelled() => None,
                    task = rx.recv() => task,
                }
            };
            let Some(task_id) = next else { break };
            self.queued.fetch_sub(1, Ordering::Relaxed);
            self.process(&task_id).await;
        }
        debug!(worker_id, "worker stopped");
    }

    async fn process(&self, task_id: &str) {
        let Some(meta) = self.registry.begin_processing(task_id) else {
            // Cancelled while queued, or already pruned.
            debug!(task_id, "skipping dequeued task that is no longer pending");
            return;
        };

        self.emit(
            task_id,
            TaskEvent::Progress {
                task_id: task_id.to_owned(),
                progress: 0.0,
                status: TaskStatus::Processing,
                message: "transcription started".to_owned(),
            },
        );

        let path = match self.blobs.path_of(&meta.file_hash) {
            Ok(p) => p,
            Err(e) => {
                self.finish_failed(task_id, "storage_error", e.to_string()).await;
                return;
            }
        };

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.cfg.task_timeout,
            self.gate.transcribe(&path, &TranscribeHints::default()),
        )
        .await;

        match outcome {
            Err(_) => {
                self.finish_failed(
                    task_id,
                    "task_timeout",
                    format!(
                        "transcription exceeded {} seconds",
                        self.cfg.task_timeout.as_secs()
                    ),
                )
                .await;
            }
            Ok(Err(fault)) if fault.is_transient() && meta.retry_count < self.cfg.retry_times => {
                let attempt = meta.retry_count + 1;
                warn!(task_id, attempt, error = %fault, "transient engine fault; requeueing");
                self.registry.with_task(task_id, |r| {
                    r.status = TaskStatus::Pending;
                    r.retry_count = attempt;
                    r.progress = 0.0;
                });
                self.emit(
                    task_id,
                    TaskEvent::Progress {
                        task_id: task_id.to_owned(),
                        progress: 0.0,
                        status: TaskStatus::Pending,
                        message: format!(
                            "transient engine fault, retry {attempt}/{}: {fault}",
                            self.cfg.retry_times
                        ),
                    },
                );
                self.requeue(task_id).await;
            }
            Ok(Err(fault)) => {
                let code = if fault.detail.to_lowercase().contains("too short") {
                    "audio_too_short"
                } else {
                    "engine_error"
                };
                self.finish_failed(task_id, code, fault.detail).await;
            }
            Ok(Ok(raw)) => {
                self.record_duration(started.elapsed());
                if let Err(e) = self.cache.put_raw(&meta.file_hash, &raw).await {
                    warn!(task_id, error = %e, "failed to cache raw result");
                }
                match self
                    .completion_payload(
                        task_id,
                        &meta.file_name,
                        &meta.file_hash,
                        meta.output_format,
                        &raw,
                    )
                    .await
                {
                    Ok(payload) => self.finish_completed(task_id, payload).await,
                    Err(e) => {
                        self.finish_failed(task_id, "format_error", e.to_string()).await
                    }
                }
            }
        }
    }

    /// Retries go to the tail of the queue, behind already-waiting tasks.
    async fn requeue(&self, task_id: &str) {
        let tx = self
            .queue_tx
            .lock()
            .expect("queue sender poisoned")
            .clone();
        match tx {
            Some(tx) => {
                self.queued.fetch_add(1, Ordering::Relaxed);
                if tx.send(task_id.to_owned()).await.is_err() {
                    self.queued.fetch_sub(1, Ordering::Relaxed);
                    self.finish_failed(task_id, "shutting_down", "queue closed during retry".into())
                        .await;
                }
            }
            None => {
                self.finish_failed(task_id, "shutting_down", "queue closed during retry".into())
                    .await;
            }
        }
    }

    async fn finish_completed(&self, task_id: &str, payload: serde_json::Value) {
        self.registry.with_task(task_id, |r| {
            r.status = TaskStatus::Completed;
            r.progress = 100.0;
            r.finished_at = Some(Utc::now());
        });
        info!(task_id, "task completed");
        self.emit(
            task_id,
            TaskEvent::Completed {
                task_id: task_id.to_owned(),
                payload,
            },
        );
        self.settle_terminal(task_id).await;
    }

    async fn finish_failed(&self, task_id: &str, code: &str, message: String) {
        self.registry.with_task(task_id, |r| {
            r.status = TaskStatus::Failed;
            r.error = Some(message.clone());
            r.finished_at = Some(Utc::now());
        });
        error!(task_id, code, %message, "task failed");
        self.emit(
            task_id,
            TaskEvent::Failed {
                task_id: task_id.to_owned(),
                code: code.to_owned(),
                message,
            },
        );
        self.settle_terminal(task_id).await;
    }

    /// After the terminal event: drop subscriptions and release the blob
    /// reference taken at enqueue, exactly once.
    async fn settle_terminal(&self, task_id: &str) {
        let release = self
            .registry
            .with_task(task_id, |r| {
                r.subscribers.clear();
                r.blob_acquired.then(|| {
                    r.blob_acquired = false;
                    r.file_hash.clone()
                })
            })
            .flatten();
        if let Some(hash) = release {
            self.blobs.release(&hash).await;
        }
    }

    /// Build the client-facing completion document for `format`, going
    /// through the cache's single-flight derivation when enabled.
    async fn completion_payload(
        &self,
        task_id: &str,
        file_name: &str,
        file_hash: &str,
        output_format: OutputFormat,
        raw: &RawTranscript,
    ) -> Result<serde_json::Value, TaskError> {
        let meta = FormatMeta {
            task_id: task_id.to_owned(),
            file_name: file_name.to_owned(),
            file_hash: file_hash.to_owned(),
        };
        let merge_gap = self.cfg.merge_gap;

        let derived = if self.cache.enabled() {
            match self
                .cache
                .get_or_derive(file_hash, output_format, |raw| {
                    derive(raw, &meta, output_format, merge_gap)
                })
                .await
            {
                Ok(payload) => payload,
                Err(e) => {
                    // The transcript in hand is authoritative; a cache
                    // hiccup must not fail the task.
                    warn!(task_id, error = %e, "cache derivation failed; formatting directly");
                    derive(raw, &meta, output_format, merge_gap)
                }
            }
        } else {
            derive(raw, &meta, output_format, merge_gap)
        };

        match output_format {
            OutputFormat::Json => serde_json::from_str(&derived)
                .map_err(|e| TaskError::Storage(format!("corrupt derived payload: {e}"))),
            OutputFormat::Srt => Ok(json!({
                "format": "srt",
                "content": derived,
                "file_name": file_name,
                "file_hash": file_hash,
            })),
        }
    }

    fn emit(&self, task_id: &str, event: TaskEvent) {
        for session_id in self.registry.subscribers(task_id) {
            self.sink.deliver(&session_id, &event);
        }
    }

    fn record_duration(&self, elapsed: Duration) {
        let mut recent = self.recent.lock().expect("duration window poisoned");
        if recent.len() == WAIT_ESTIMATE_WINDOW {
            recent.pop_front();
        }
        recent.push_back(elapsed);
    }

    fn estimate_wait_minutes(&self, position: usize) -> f64 {
        let recent = self.recent.lock().expect("duration window poisoned");
        if recent.is_empty() {
            return 0.0;
        }
        let avg_secs =
            recent.iter().map(Duration::as_secs_f64).sum::<f64>() / recent.len() as f64;
        let minutes = position as f64 * avg_secs / self.cfg.max_concurrent as f64 / 60.0;
        (minutes * 10.0).round() / 10.0
    }

    async fn janitor_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let cutoff = Utc::now()
                        - chrono::Duration::from_std(self.cfg.completion_retention)
                            .unwrap_or_else(|_| chrono::Duration::seconds(3600));
                    let pruned = self.registry.prune_finished(cutoff);
                    if pruned > 0 {
                        debug!(pruned, "pruned finished tasks");
                    }
                }
            }
        }
    }
}

fn derive(
    raw: &RawTranscript,
    meta: &FormatMeta,
    output_format: OutputFormat,
    merge_gap: Duration,
) -> String {
    match output_format {
        OutputFormat::Json => format::json::merged(raw, meta, merge_gap).to_string(),
        OutputFormat::Srt => format::srt::render(raw),
    }
}
