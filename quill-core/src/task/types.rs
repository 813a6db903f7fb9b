use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::format::OutputFormat;

/// Lifecycle state of a transcription task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Error)]
pub enum TaskError {
    #[error("queue full: {pending} tasks waiting (limit {max_queue_size})")]
    QueueFull {
        pending: usize,
        max_queue_size: usize,
    },
    #[error("unsupported file type: {0}")]
    UnsupportedFormat(String),
    #[error("file too large: {size} bytes (limit {limit})")]
    FileTooLarge { size: u64, limit: u64 },
    #[error("unknown task: {0}")]
    UnknownTask(String),
    #[error("session {session_id} is not subscribed to task {task_id}")]
    NotSubscribed {
        task_id: String,
        session_id: String,
    },
    #[error("task {task_id} is not awaiting upload")]
    NotAwaitingUpload { task_id: String },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("task manager is shutting down")]
    ShuttingDown,
}

impl TaskError {
    /// Stable wire code for the error frame.
    pub fn code(&self) -> &'static str {
        match self {
            TaskError::QueueFull { .. } => "queue_full",
            TaskError::UnsupportedFormat(_) => "unsupported_format",
            TaskError::FileTooLarge { .. } => "file_too_large",
            TaskError::UnknownTask(_) => "unknown_task",
            TaskError::NotSubscribed { .. } => "cancel_failed",
            TaskError::NotAwaitingUpload { .. } => "invalid_message",
            TaskError::Storage(_) => "storage_error",
            TaskError::ShuttingDown => "shutting_down",
        }
    }
}

impl From<crate::store::BlobError> for TaskError {
    fn from(e: crate::store::BlobError) -> Self {
        TaskError::Storage(e.to_string())
    }
}

impl From<crate::store::CacheError> for TaskError {
    fn from(e: crate::store::CacheError) -> Self {
        TaskError::Storage(e.to_string())
    }
}

/// An event on a task's lifecycle, fanned out to every subscribed session.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Queued {
        task_id: String,
        queue_position: usize,
        estimated_wait_minutes: f64,
    },
    Progress {
        task_id: String,
        progress: f32,
        status: TaskStatus,
        message: String,
    },
    Completed {
        task_id: String,
        payload: serde_json::Value,
    },
    Failed {
        task_id: String,
        code: String,
        message: String,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> &str {
        match self {
            TaskEvent::Queued { task_id, .. }
            | TaskEvent::Progress { task_id, .. }
            | TaskEvent::Completed { task_id, .. }
            | TaskEvent::Failed { task_id, .. } => task_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskEvent::Completed { .. } | TaskEvent::Failed { .. })
    }
}

/// Delivery seam between the task manager and the session layer.
///
/// `deliver` must not block: slow receivers apply their own backpressure
/// policy (bounded per-session queues; terminal events close the session
/// rather than being dropped).
pub trait EventSink: Send + Sync + 'static {
    fn deliver(&self, session_id: &str, event: &TaskEvent);
}

/// A validated upload admission request.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub file_name: String,
    pub file_size: u64,
    pub file_hash: String,
    pub output_format: OutputFormat,
    pub force_refresh: bool,
    pub session_id: String,
}

/// Outcome of [`TaskManager::submit`].
#[derive(Debug, Clone)]
pub enum Admission {
    /// The raw result was already cached; the task is synthesized Completed
    /// and `payload` is the formatted completion document.
    CacheHit {
        task_id: String,
        payload: serde_json::Value,
    },
    /// The task is registered and waits for the client to stream the blob.
    AwaitingUpload { task_id: String },
}

/// How an enqueued task entered execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitMode {
    CacheHit,
    Queued,
    Immediate,
}

/// Outcome of [`TaskManager::enqueue_uploaded`].
#[derive(Debug, Clone)]
pub struct Enqueued {
    pub mode: SubmitMode,
    /// Best-effort snapshot of the queue position at enqueue time.
    pub queue_position: usize,
    pub estimated_wait_minutes: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    AlreadyProcessing,
    AlreadyTerminal,
}

/// Point-in-time view of one task, served for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub status: TaskStatus,
    pub progress: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub queue_size: usize,
    pub max_queue_size: usize,
    pub max_concurrent: usize,
}
