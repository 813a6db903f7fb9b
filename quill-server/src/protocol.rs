//! Wire protocol: one JSON envelope `{ "type": <string>, "data": <object> }`
//! per text frame, in both directions.  Binary payloads travel base64-encoded
//! inside `data`.  Unrecognized fields are ignored.

use chrono::Utc;
use quill_core::{OutputFormat, TaskEvent, TaskSnapshot, TaskStatus};
use serde::{Deserialize, Serialize};

// ── inbound ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth {
        token: String,
    },
    UploadRequest(UploadRequest),
    UploadData {
        task_id: String,
        file_data: String,
    },
    UploadChunk(UploadChunk),
    TaskStatus {
        task_id: String,
    },
    Cancel {
        task_id: String,
    },
    Ping {},
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadRequest {
    pub file_name: String,
    pub file_size: u64,
    pub file_hash: String,
    #[serde(default)]
    pub force_refresh: bool,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default)]
    pub upload_mode: UploadMode,
    #[serde(default)]
    pub chunk_size: Option<u64>,
    #[serde(default)]
    pub total_chunks: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadMode {
    #[default]
    Single,
    Chunked,
}

#[derive(Debug, Deserialize)]
pub struct UploadChunk {
    pub task_id: String,
    pub chunk_index: u32,
    #[serde(default)]
    pub chunk_size: Option<u64>,
    pub chunk_hash: String,
    pub chunk_data: String,
    /// Advisory only; assembly completes on the received-count, not on this.
    #[serde(default)]
    pub is_last: bool,
}

// ── outbound ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        connection_id: String,
        message: String,
        server_time: String,
    },
    AuthOk {
        message: String,
    },
    UploadReady {
        task_id: String,
        message: String,
    },
    ChunkReceived {
        task_id: String,
        chunk_index: u32,
        status: ChunkAck,
        received: u32,
        total: u32,
    },
    UploadComplete {
        task_id: String,
        message: String,
    },
    TaskQueued {
        task_id: String,
        queue_position: usize,
        estimated_wait_minutes: f64,
        message: String,
    },
    TaskProgress {
        task_id: String,
        progress: f32,
        status: TaskStatus,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        timestamp: String,
    },
    TaskComplete {
        task_id: String,
        result: serde_json::Value,
        timestamp: String,
    },
    TaskStatus(TaskSnapshot),
    TaskCancelled {
        task_id: String,
        message: String,
    },
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
    },
    Ping {
        timestamp: String,
    },
    Pong {
        timestamp: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkAck {
    Ok,
    Duplicate,
}

impl ServerMessage {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.into(),
            message: message.into(),
            task_id: None,
        }
    }

    pub fn task_error(
        code: impl Into<String>,
        message: impl Into<String>,
        task_id: impl Into<String>,
    ) -> Self {
        ServerMessage::Error {
            code: code.into(),
            message: message.into(),
            task_id: Some(task_id.into()),
        }
    }

    pub fn complete(task_id: impl Into<String>, result: serde_json::Value) -> Self {
        ServerMessage::TaskComplete {
            task_id: task_id.into(),
            result,
            timestamp: now(),
        }
    }

    /// Translate a task manager event into its wire form.  Failures surface
    /// as a `task_progress` frame with status `failed` plus an error code.
    pub fn from_event(event: &TaskEvent) -> Self {
        match event {
            TaskEvent::Queued {
                task_id,
                queue_position,
                estimated_wait_minutes,
            } => ServerMessage::TaskQueued {
                task_id: task_id.clone(),
                queue_position: *queue_position,
                estimated_wait_minutes: *estimated_wait_minutes,
                message: format!("queued at position {queue_position}"),
            },
            TaskEvent::Progress {
                task_id,
                progress,
                status,
                message,
            } => ServerMessage::TaskProgress {
                task_id: task_id.clone(),
                progress: *progress,
                status: *status,
                message: message.clone(),
                code: None,
                timestamp: now(),
            },
            TaskEvent::Completed { task_id, payload } => {
                ServerMessage::complete(task_id.clone(), payload.clone())
            }
            TaskEvent::Failed {
                task_id,
                code,
                message,
            } => ServerMessage::TaskProgress {
                task_id: task_id.clone(),
                progress: 0.0,
                status: TaskStatus::Failed,
                message: message.clone(),
                code: Some(code.clone()),
                timestamp: now(),
            },
        }
    }
}

pub fn now() -> String {
    Utc::now().to_rfc3339()
}
