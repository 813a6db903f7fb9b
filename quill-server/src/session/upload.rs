//! Upload assembly for the two wire modes.
//!
//! Single-shot uploads arrive as one base64 payload and are verified in
//! memory before being written through.  Chunked uploads declare their shape
//! up front; each chunk is verified against its own hash and written at
//! `chunk_index × chunk_size`, and the whole-file hash is checked at
//! finalize.  A failed whole-file check discards the artifact without ever
//! touching a refcount.

use quill_core::{BlobStore, BlobWriter};
use sha2::{Digest, Sha256};
use tracing::debug;

pub enum PendingUpload {
    Single(SingleUpload),
    Chunked(ChunkedUpload),
}

impl PendingUpload {
    /// Drop any partial on-disk state.
    pub async fn discard(self) {
        if let PendingUpload::Chunked(chunked) = self {
            if let Some(writer) = chunked.writer {
                writer.abort().await;
            }
        }
    }
}

pub struct SingleUpload {
    pub task_id: String,
    pub expected_size: u64,
    pub expected_hash: String,
}

pub struct ChunkedUpload {
    pub task_id: String,
    pub expected_size: u64,
    pub expected_hash: String,
    pub chunk_size: u64,
    pub total_chunks: u32,
    received: Vec<bool>,
    received_count: u32,
    writer: Option<BlobWriter>,
}

/// Why a chunk (or an assembly step) was refused; maps onto an error frame.
#[derive(Debug)]
pub struct UploadRejection {
    pub code: &'static str,
    pub message: String,
}

impl UploadRejection {
    fn invalid(message: impl Into<String>) -> Self {
        Self {
            code: "invalid_message",
            message: message.into(),
        }
    }

    fn hash_mismatch(message: impl Into<String>) -> Self {
        Self {
            code: "file_hash_mismatch",
            message: message.into(),
        }
    }

    fn storage(message: impl Into<String>) -> Self {
        Self {
            code: "storage_error",
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Chunk index seen before; acknowledged and ignored.
    Duplicate,
    Accepted {
        received: u32,
        total: u32,
        complete: bool,
    },
}

impl ChunkedUpload {
    /// Validate the declared shape and create the assembler.
    pub fn new(
        task_id: String,
        expected_size: u64,
        expected_hash: String,
        chunk_size: u64,
        total_chunks: u32,
    ) -> Result<Self, UploadRejection> {
        if chunk_size == 0 || total_chunks == 0 {
            return Err(UploadRejection::invalid(
                "chunk_size and total_chunks must be positive",
            ));
        }
        let covered = chunk_size
            .checked_mul(total_chunks as u64)
            .ok_or_else(|| UploadRejection::invalid("chunk layout overflows"))?;
        let before_last = chunk_size * (total_chunks as u64 - 1);
        if expected_size <= before_last || expected_size > covered {
            return Err(UploadRejection::invalid(format!(
                "{total_chunks} chunks of {chunk_size} bytes cannot carry {expected_size} bytes"
            )));
        }
        Ok(Self {
            task_id,
            expected_size,
            expected_hash,
            chunk_size,
            total_chunks,
            received: vec![false; total_chunks as usize],
            received_count: 0,
            writer: None,
        })
    }

    pub fn received_count(&self) -> u32 {
        self.received_count
    }

    pub fn is_complete(&self) -> bool {
        self.received_count == self.total_chunks
    }

    /// Verify and write one chunk.  Duplicates are acknowledged, not
    /// rewritten.
    pub async fn accept(
        &mut self,
        store: &BlobStore,
        chunk_index: u32,
        chunk_hash: &str,
        bytes: &[u8],
    ) -> Result<ChunkOutcome, UploadRejection> {
        if chunk_index >= self.total_chunks {
            return Err(UploadRejection::invalid(format!(
                "chunk_index {chunk_index} out of range (total {})",
                self.total_chunks
            )));
        }
        if self.received[chunk_index as usize] {
            return Ok(ChunkOutcome::Duplicate);
        }

        let actual_hash = hex::encode(Sha256::digest(bytes));
        if actual_hash != chunk_hash {
            return Err(UploadRejection::hash_mismatch(format!(
                "chunk {chunk_index} hash mismatch"
            )));
        }

        let expected_len = if chunk_index + 1 == self.total_chunks {
            self.expected_size - self.chunk_size * (self.total_chunks as u64 - 1)
        } else {
            self.chunk_size
        };
        if bytes.len() as u64 != expected_len {
            return Err(UploadRejection::invalid(format!(
                "chunk {chunk_index} carries {} bytes, expected {expected_len}",
                bytes.len()
            )));
        }

        if self.writer.is_none() {
            let writer = store
                .begin_upload(&self.expected_hash, self.expected_size)
                .await
                .map_err(|e| UploadRejection::storage(e.to_string()))?;
            self.writer = Some(writer);
        }
        let writer = self.writer.as_mut().expect("writer just initialized");
        writer
            .write_chunk(chunk_index as u64 * self.chunk_size, bytes)
            .await
            .map_err(|e| UploadRejection::storage(e.to_string()))?;

        self.received[chunk_index as usize] = true;
        self.received_count += 1;
        debug!(
            task_id = %self.task_id,
            chunk_index,
            received = self.received_count,
            total = self.total_chunks,
            "chunk accepted"
        );
        Ok(ChunkOutcome::Accepted {
            received: self.received_count,
            total: self.total_chunks,
            complete: self.is_complete(),
        })
    }

    /// Verify the whole-file hash and move the artifact into the store.
    /// Returns `false` when the assembled bytes do not match the declared
    /// hash (the artifact is discarded).
    pub async fn finalize(self, store: &BlobStore) -> Result<bool, UploadRejection> {
        let writer = self
            .writer
            .ok_or_else(|| UploadRejection::invalid("no chunks were received"))?;
        let done = store
            .finalize(writer)
            .await
            .map_err(|e| UploadRejection::storage(e.to_string()))?;
        Ok(done.hash_ok)
    }
}

/// Verify a single-shot payload and write it through the blob store.
pub async fn store_single(
    store: &BlobStore,
    upload: &SingleUpload,
    bytes: &[u8],
) -> Result<(), UploadRejection> {
    if bytes.len() as u64 != upload.expected_size {
        return Err(UploadRejection::invalid(format!(
            "file size mismatch: declared {}, received {}",
            upload.expected_size,
            bytes.len()
        )));
    }
    let actual_hash = hex::encode(Sha256::digest(bytes));
    if actual_hash != upload.expected_hash {
        return Err(UploadRejection::hash_mismatch("file hash mismatch"));
    }

    let mut writer = store
        .begin_upload(&upload.expected_hash, upload.expected_size)
        .await
        .map_err(|e| UploadRejection::storage(e.to_string()))?;
    writer
        .write_chunk(0, bytes)
        .await
        .map_err(|e| UploadRejection::storage(e.to_string()))?;
    let done = store
        .finalize(writer)
        .await
        .map_err(|e| UploadRejection::storage(e.to_string()))?;
    if !done.hash_ok {
        return Err(UploadRejection::hash_mismatch("file hash mismatch"));
    }
    debug!(task_id = %upload.task_id, size = bytes.len(), "single-shot upload stored");
    Ok(())
}
