//! One logical conversation with a client.
//!
//! The socket is split on upgrade: a writer task drains the session's
//! bounded outbound queue (so per-session delivery order is queue order),
//! while this actor runs the read/heartbeat loop and dispatches messages.
//! Session teardown removes every subscription; running tasks continue and
//! their results still reach the cache.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use quill_core::{Admission, CancelOutcome, SubmitRequest, TaskError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::registry::SessionHandle;
use super::upload::{
    store_single, ChunkOutcome, ChunkedUpload, PendingUpload, SingleUpload, UploadRejection,
};
use crate::protocol::{
    self, ChunkAck, ClientMessage, ServerMessage, UploadChunk, UploadMode, UploadRequest,
};
use crate::state::AppState;

/// Outbound frames buffered per session before backpressure applies.
const OUTBOUND_QUEUE_DEPTH: usize = 64;

pub async fn serve(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4().to_string();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_QUEUE_DEPTH);
    let cancel = state.shutdown.child_token();

    let handle = SessionHandle {
        outbound: out_tx.clone(),
        cancel: cancel.clone(),
    };
    if !state.registry.register(&connection_id, handle) {
        warn!(connection_id, "connection refused: server at capacity");
        if let Ok(text) = serde_json::to_string(&ServerMessage::error(
            "max_connections",
            "server connection limit reached",
        )) {
            let _ = ws_tx.send(Message::Text(text)).await;
        }
        let _ = ws_tx.send(Message::Close(None)).await;
        return;
    }
    info!(connection_id, "session established");

    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let Ok(text) = serde_json::to_string(&message) else {
                continue;
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    let mut session = Session {
        connection_id: connection_id.clone(),
        state: state.clone(),
        out: out_tx.clone(),
        authenticated: !state.config.auth_enabled,
        uploads: HashMap::new(),
        last_seen: Instant::now(),
    };
    session
        .send(ServerMessage::Connected {
            connection_id: connection_id.clone(),
            message: "connected".to_owned(),
            server_time: protocol::now(),
        })
        .await;

    let mut heartbeat = tokio::time::interval(state.config.heartbeat_interval());
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = heartbeat.tick() => {
                if session.last_seen.elapsed() > state.config.connection_timeout() {
                    warn!(connection_id, "connection timed out");
                    break;
                }
                let _ = out_tx.try_send(ServerMessage::Ping { timestamp: protocol::now() });
            }

            frame = ws_rx.next() => match frame {
                None => break,
                Some(Err(e)) => {
                    debug!(connection_id, error = %e, "websocket error");
                    break;
                }
                Some(Ok(Message::Text(text))) => {
                    session.last_seen = Instant::now();
                    if session.handle_text(&text).await.is_break() {
                        break;
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    session.last_seen = Instant::now();
                }
                Some(Ok(Message::Close(reason))) => {
                    debug!(connection_id, ?reason, "client closed");
                    break;
                }
                Some(Ok(_)) => {
                    session
                        .send(ServerMessage::error(
                            "invalid_message",
                            "binary frames are not part of the protocol",
                        ))
                        .await;
                }
            }
        }
    }

    state.registry.remove(&connection_id);
    state.manager.purge_session(&connection_id);
    for (_, upload) in session.uploads.drain() {
        upload.discard().await;
    }
    cancel.cancel();
    drop(session);
    drop(out_tx);
    let _ = writer.await;
    info!(connection_id, "session closed");
}

struct Session {
    connection_id: String,
    state: AppState,
    out: mpsc::Sender<ServerMessage>,
    authenticated: bool,
    /// Partial uploads keyed by task id.
    uploads: HashMap<String, PendingUpload>,
    last_seen: Instant,
}

impl Session {
    async fn send(&self, message: ServerMessage) {
        if self.out.send(message).await.is_err() {
            debug!(connection_id = %self.connection_id, "outbound queue closed");
        }
    }

    async fn send_task_error(&self, error: &TaskError, task_id: Option<&str>) {
        let message = match task_id {
            Some(id) => ServerMessage::task_error(error.code(), error.to_string(), id),
            None => ServerMessage::error(error.code(), error.to_string()),
        };
        self.send(message).await;
    }

    async fn handle_text(&mut self, text: &str) -> ControlFlow<()> {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(m) => m,
            Err(e) => {
                self.send(ServerMessage::error(
                    "invalid_message",
                    format!("malformed message: {e}"),
                ))
                .await;
                return ControlFlow::Continue(());
            }
        };

        if !self.authenticated {
            return match message {
                ClientMessage::Auth { token } => self.handle_auth(&token).await,
                ClientMessage::Ping {} => {
                    self.send(ServerMessage::Pong {
                        timestamp: protocol::now(),
                    })
                    .await;
                    ControlFlow::Continue(())
                }
                _ => {
                    self.send(ServerMessage::error(
                        "auth_failed",
                        "authenticate before sending requests",
                    ))
                    .await;
                    ControlFlow::Break(())
                }
            };
        }

        match message {
            ClientMessage::Auth { .. } => {
                // Already authenticated (or auth disabled); acknowledge.
                self.send(ServerMessage::AuthOk {
                    message: "already authenticated".to_owned(),
                })
                .await;
            }
            ClientMessage::UploadRequest(req) => self.handle_upload_request(req).await,
            ClientMessage::UploadData { task_id, file_data } => {
                self.handle_upload_data(task_id, file_data).await
            }
            ClientMessage::UploadChunk(chunk) => self.handle_upload_chunk(chunk).await,
            ClientMessage::TaskStatus { task_id } => self.handle_task_status(task_id).await,
            ClientMessage::Cancel { task_id } => self.handle_cancel(task_id).await,
            ClientMessage::Ping {} => {
                self.send(ServerMessage::Pong {
                    timestamp: protocol::now(),
                })
                .await;
            }
        }
        ControlFlow::Continue(())
    }

    async fn handle_auth(&mut self, token: &str) -> ControlFlow<()> {
        if self.state.validator.validate(token) {
            self.authenticated = true;
            info!(connection_id = %self.connection_id, "session authenticated");
            self.send(ServerMessage::AuthOk {
                message: "authenticated".to_owned(),
            })
            .await;
            ControlFlow::Continue(())
        } else {
            warn!(connection_id = %self.connection_id, "authentication failed");
            self.send(ServerMessage::error("auth_failed", "invalid token"))
                .await;
            ControlFlow::Break(())
        }
    }

    async fn handle_upload_request(&mut self, req: UploadRequest) {
        let chunk_shape = match req.upload_mode {
            UploadMode::Single => None,
            UploadMode::Chunked => match (req.chunk_size, req.total_chunks) {
                (Some(chunk_size), Some(total_chunks)) => Some((chunk_size, total_chunks)),
                _ => {
                    self.send(ServerMessage::error(
                        "invalid_message",
                        "chunked upload requires chunk_size and total_chunks",
                    ))
                    .await;
                    return;
                }
            },
        };

        let submit = SubmitRequest {
            file_name: req.file_name.clone(),
            file_size: req.file_size,
            file_hash: req.file_hash.clone(),
            output_format: req.output_format,
            force_refresh: req.force_refresh,
            session_id: self.connection_id.clone(),
        };

        match self.state.manager.submit(submit).await {
            Err(e) => self.send_task_error(&e, None).await,
            Ok(Admission::CacheHit { task_id, payload }) => {
                info!(connection_id = %self.connection_id, task_id, "served from cache");
                self.send(ServerMessage::complete(task_id, payload)).await;
            }
            Ok(Admission::AwaitingUpload { task_id }) => {
                let pending = match chunk_shape {
                    None => PendingUpload::Single(SingleUpload {
                        task_id: task_id.clone(),
                        expected_size: req.file_size,
                        expected_hash: req.file_hash.clone(),
                    }),
                    Some((chunk_size, total_chunks)) => {
                        match ChunkedUpload::new(
                            task_id.clone(),
                            req.file_size,
                            req.file_hash.clone(),
                            chunk_size,
                            total_chunks,
                        ) {
                            Ok(upload) => PendingUpload::Chunked(upload),
                            Err(rejection) => {
                                self.reject_upload(&task_id, rejection).await;
                                return;
                            }
                        }
                    }
                };
                self.uploads.insert(task_id.clone(), pending);
                self.send(ServerMessage::UploadReady {
                    task_id,
                    message: "ready to receive file data".to_owned(),
                })
                .await;
            }
        }
    }

    async fn handle_upload_data(&mut self, task_id: String, file_data: String) {
        match self.uploads.get(&task_id) {
            Some(PendingUpload::Single(_)) => {}
            Some(PendingUpload::Chunked(_)) => {
                self.send(ServerMessage::task_error(
                    "invalid_message",
                    "task was declared as a chunked upload",
                    task_id,
                ))
                .await;
                return;
            }
            None => {
                self.send(ServerMessage::task_error(
                    "unknown_task",
                    "no upload pending for this task",
                    task_id,
                ))
                .await;
                return;
            }
        }

        let bytes = match BASE64.decode(file_data.as_bytes()) {
            Ok(b) => b,
            Err(e) => {
                self.send(ServerMessage::task_error(
                    "invalid_message",
                    format!("file_data is not valid base64: {e}"),
                    task_id,
                ))
                .await;
                return;
            }
        };

        let result = match self.uploads.get(&task_id) {
            Some(PendingUpload::Single(single)) => {
                store_single(&self.state.blobs, single, &bytes).await
            }
            _ => return,
        };

        self.uploads.remove(&task_id);
        match result {
            Ok(()) => self.finish_upload(&task_id).await,
            Err(rejection) => self.reject_upload(&task_id, rejection).await,
        }
    }

    async fn handle_upload_chunk(&mut self, chunk: UploadChunk) {
        let bytes = match BASE64.decode(chunk.chunk_data.as_bytes()) {
            Ok(b) => b,
            Err(e) => {
                self.send(ServerMessage::task_error(
                    "invalid_message",
                    format!("chunk_data is not valid base64: {e}"),
                    chunk.task_id,
                ))
                .await;
                return;
            }
        };

        let outcome = match self.uploads.get_mut(&chunk.task_id) {
            Some(PendingUpload::Chunked(upload)) => {
                upload
                    .accept(&self.state.blobs, chunk.chunk_index, &chunk.chunk_hash, &bytes)
                    .await
            }
            Some(PendingUpload::Single(_)) => {
                self.send(ServerMessage::task_error(
                    "invalid_message",
                    "task was declared as a single-shot upload",
                    chunk.task_id,
                ))
                .await;
                return;
            }
            None => {
                self.send(ServerMessage::task_error(
                    "unknown_task",
                    "no upload pending for this task",
                    chunk.task_id,
                ))
                .await;
                return;
            }
        };

        match outcome {
            // Chunk-level rejection: the client may resend; the assembly
            // stays alive.
            Err(rejection) => {
                self.send(ServerMessage::task_error(
                    rejection.code,
                    rejection.message,
                    chunk.task_id,
                ))
                .await;
            }
            Ok(ChunkOutcome::Duplicate) => {
                let (received, total) = match self.uploads.get(&chunk.task_id) {
                    Some(PendingUpload::Chunked(u)) => (u.received_count(), u.total_chunks),
                    _ => return,
                };
                self.send(ServerMessage::ChunkReceived {
                    task_id: chunk.task_id,
                    chunk_index: chunk.chunk_index,
                    status: ChunkAck::Duplicate,
                    received,
                    total,
                })
                .await;
            }
            Ok(ChunkOutcome::Accepted {
                received,
                total,
                complete,
            }) => {
                self.send(ServerMessage::ChunkReceived {
                    task_id: chunk.task_id.clone(),
                    chunk_index: chunk.chunk_index,
                    status: ChunkAck::Ok,
                    received,
                    total,
                })
                .await;

                if complete {
                    let Some(PendingUpload::Chunked(upload)) = self.uploads.remove(&chunk.task_id)
                    else {
                        return;
                    };
                    match upload.finalize(&self.state.blobs).await {
                        Ok(true) => self.finish_upload(&chunk.task_id).await,
                        Ok(false) => {
                            self.reject_upload(
                                &chunk.task_id,
                                UploadRejection {
                                    code: "file_hash_mismatch",
                                    message: "assembled file hash does not match the declaration"
                                        .to_owned(),
                                },
                            )
                            .await;
                        }
                        Err(rejection) => self.reject_upload(&chunk.task_id, rejection).await,
                    }
                }
            }
        }
    }

    /// Blob is in place and verified: hand the task to the scheduler.
    async fn finish_upload(&mut self, task_id: &str) {
        match self.state.manager.enqueue_uploaded(task_id).await {
            Ok(_) => {
                self.send(ServerMessage::UploadComplete {
                    task_id: task_id.to_owned(),
                    message: "upload complete; transcription scheduled".to_owned(),
                })
                .await;
            }
            Err(e) => {
                self.state.manager.fail_upload(task_id, &e.to_string());
                self.send_task_error(&e, Some(task_id)).await;
            }
        }
    }

    /// An upload died before reaching the queue: fail the task quietly and
    /// surface the error frame to the uploader.
    async fn reject_upload(&mut self, task_id: &str, rejection: UploadRejection) {
        self.uploads.remove(task_id);
        self.state.manager.fail_upload(task_id, &rejection.message);
        self.send(ServerMessage::task_error(
            rejection.code,
            rejection.message,
            task_id,
        ))
        .await;
    }

    async fn handle_task_status(&mut self, task_id: String) {
        // Status queries register interest: the session starts receiving
        // this task's events as well.
        if let Err(e) = self.state.manager.subscribe(&task_id, &self.connection_id) {
            self.send_task_error(&e, Some(&task_id)).await;
            return;
        }
        match self.state.manager.snapshot(&task_id) {
            Some(snapshot) => self.send(ServerMessage::TaskStatus(snapshot)).await,
            None => {
                self.send(ServerMessage::task_error(
                    "unknown_task",
                    "no such task",
                    task_id,
                ))
                .await
            }
        }
    }

    async fn handle_cancel(&mut self, task_id: String) {
        match self.state.manager.cancel(&task_id, &self.connection_id).await {
            Ok(CancelOutcome::Cancelled) => {
                self.send(ServerMessage::TaskCancelled {
                    task_id,
                    message: "task cancelled".to_owned(),
                })
                .await;
            }
            Ok(CancelOutcome::AlreadyProcessing) => {
                self.send(ServerMessage::task_error(
                    "cancel_failed",
                    "task is already processing and will run to completion",
                    task_id,
                ))
                .await;
            }
            Ok(CancelOutcome::AlreadyTerminal) => {
                self.send(ServerMessage::task_error(
                    "cancel_failed",
                    "task already finished",
                    task_id,
                ))
                .await;
            }
            Err(e) => self.send_task_error(&e, Some(&task_id)).await,
        }
    }
}
