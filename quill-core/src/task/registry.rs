use std::collections::HashSet;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::types::{TaskSnapshot, TaskStatus};
use crate::format::OutputFormat;

/// The complete in-memory record for one task.
///
/// Records live in a [`DashMap`]; each entry's shard lock is the per-task
/// lock guarding state transitions.
#[derive(Debug)]
pub(crate) struct TaskRecord {
    pub task_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub file_hash: String,
    pub output_format: OutputFormat,
    pub status: TaskStatus,
    pub progress: f32,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub creator_session_id: String,
    pub subscribers: HashSet<String>,
    /// Set while this task holds a blob reference; cleared exactly once on
    /// the terminal transition that releases it.
    pub blob_acquired: bool,
    pub error: Option<String>,
}

impl TaskRecord {
    pub fn new(
        task_id: String,
        file_name: String,
        file_size: u64,
        file_hash: String,
        output_format: OutputFormat,
        creator_session_id: String,
    ) -> Self {
        let mut subscribers = HashSet::new();
        subscribers.insert(creator_session_id.clone());
        Self {
            task_id,
            file_name,
            file_size,
            file_hash,
            output_format,
            status: TaskStatus::Pending,
            progress: 0.0,
            retry_count: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            creator_session_id,
            subscribers,
            blob_acquired: false,
            error: None,
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.task_id.clone(),
            status: self.status,
            progress: self.progress,
            error: self.error.clone(),
        }
    }
}

/// Fields a worker needs while it runs a task, cloned out of the record so
/// no registry lock is held across the engine call.
#[derive(Debug, Clone)]
pub(crate) struct ProcessingMeta {
    pub file_name: String,
    pub file_hash: String,
    pub output_format: OutputFormat,
    pub retry_count: u32,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct StatusCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[derive(Default)]
pub(crate) struct Registry {
    tasks: DashMap<String, TaskRecord>,
}

impl Registry {
    pub fn insert(&self, record: TaskRecord) {
        self.tasks.insert(record.task_id.clone(), record);
    }

    /// Run `f` under the per-task lock.  Returns `None` for unknown tasks.
    pub fn with_task<R>(&self, task_id: &str, f: impl FnOnce(&mut TaskRecord) -> R) -> Option<R> {
        self.tasks.get_mut(task_id).map(|mut r| f(&mut r))
    }

    pub fn snapshot(&self, task_id: &str) -> Option<TaskSnapshot> {
        self.tasks.get(task_id).map(|r| r.snapshot())
    }

    /// Pending → Processing, skipping tasks cancelled while queued.
    pub fn begin_processing(&self, task_id: &str) -> Option<ProcessingMeta> {
        let mut record = self.tasks.get_mut(task_id)?;
        if record.status != TaskStatus::Pending {
            return None;
        }
        record.status = TaskStatus::Processing;
        record.started_at.get_or_insert_with(Utc::now);
        Some(ProcessingMeta {
            file_name: record.file_name.clone(),
            file_hash: record.file_hash.clone(),
            output_format: record.output_format,
            retry_count: record.retry_count,
        })
    }

    /// Snapshot of the subscriber set, for fan-out without holding the lock.
    pub fn subscribers(&self, task_id: &str) -> Vec<String> {
        self.tasks
            .get(task_id)
            .map(|r| r.subscribers.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove `session_id` from every subscriber set.
    pub fn purge_session(&self, session_id: &str) {
        for mut entry in self.tasks.iter_mut() {
            entry.subscribers.remove(session_id);
        }
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for entry in self.tasks.iter() {
            match entry.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Processing => counts.processing += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    /// Drop terminal tasks that finished before `cutoff`.
    pub fn prune_finished(&self, cutoff: DateTime<Utc>) -> usize {
        let expired: Vec<String> = self
            .tasks
            .iter()
            .filter(|r| {
                r.status.is_terminal() && r.finished_at.map(|t| t < cutoff).unwrap_or(false)
            })
            .map(|r| r.task_id.clone())
            .collect();
        for task_id in &expired {
            self.tasks.remove(task_id);
        }
        expired.len()
    }
}
