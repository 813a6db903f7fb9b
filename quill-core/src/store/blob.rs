//! Content-addressed blob storage with reference counting.
//!
//! One file per hash under the store root; uploads assemble in private temp
//! files and are moved into place atomically at finalize.  The refcount on a
//! blob tracks the live tasks referencing it; the delete policy decides what
//! happens when the count reaches zero.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),
    #[error("chunk write past declared size: offset {offset} + {len} > {size}")]
    OutOfBounds { offset: u64, len: u64, size: u64 },
    #[error("assembled size {actual} does not match declared size {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// What happens to an artifact once its refcount reaches zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletePolicy {
    /// Remove the file as soon as the last reference is released.
    Immediate,
    /// Keep the file on disk; only an explicit removal deletes it.
    Retain,
}

#[derive(Debug, Clone)]
pub struct BlobStat {
    pub size: u64,
    pub refcount: u64,
}

#[derive(Debug)]
struct BlobEntry {
    path: PathBuf,
    size: u64,
    refcount: u64,
    last_ref_at: DateTime<Utc>,
}

pub struct BlobStore {
    root: PathBuf,
    tmp: PathBuf,
    policy: DeletePolicy,
    entries: DashMap<String, BlobEntry>,
}

impl BlobStore {
    /// Open (or create) a store rooted at `root`, indexing any blobs already
    /// on disk with a refcount of zero.
    pub async fn open(root: impl Into<PathBuf>, policy: DeletePolicy) -> Result<Self, BlobError> {
        let root = root.into();
        let tmp = root.join("tmp");
        fs::create_dir_all(&tmp).await?;

        let entries = DashMap::new();
        let mut dir = fs::read_dir(&root).await?;
        while let Some(item) = dir.next_entry().await? {
            let meta = item.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            if let Some(hash) = item.file_name().to_str() {
                entries.insert(
                    hash.to_owned(),
                    BlobEntry {
                        path: item.path(),
                        size: meta.len(),
                        refcount: 0,
                        last_ref_at: Utc::now(),
                    },
                );
            }
        }
        debug!(root = %root.display(), indexed = entries.len(), "blob store opened");

        Ok(Self {
            root,
            tmp,
            policy,
            entries,
        })
    }

    /// Reserve a private temp file for assembling the blob `hash`.
    pub async fn begin_upload(&self, hash: &str, size: u64) -> Result<BlobWriter, BlobError> {
        let temp_path = self.tmp.join(format!("{}.part", Uuid::new_v4()));
        let file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        Ok(BlobWriter {
            hash: hash.to_owned(),
            expected_size: size,
            temp_path,
            file,
            high_water: 0,
        })
    }

    /// Verify the assembled bytes and move them into place.
    ///
    /// Concurrent uploads of the same hash each assemble privately; the
    /// renames target the same content-addressed path, so whichever lands
    /// last is byte-identical to the first.  A hash mismatch discards the
    /// temp file and reports `hash_ok: false` without registering anything.
    pub async fn finalize(&self, mut writer: BlobWriter) -> Result<Finalized, BlobError> {
        writer.file.flush().await?;
        drop(writer.file);

        let (actual_hash, actual_size) = hash_file(&writer.temp_path).await?;
        if actual_size != writer.expected_size {
            fs::remove_file(&writer.temp_path).await.ok();
            return Err(BlobError::SizeMismatch {
                expected: writer.expected_size,
                actual: actual_size,
            });
        }

        let final_path = self.root.join(&writer.hash);
        if actual_hash != writer.hash {
            warn!(expected = %writer.hash, actual = %actual_hash, "blob hash mismatch; discarding");
            fs::remove_file(&writer.temp_path).await.ok();
            return Ok(Finalized {
                path: final_path,
                hash_ok: false,
            });
        }

        fs::rename(&writer.temp_path, &final_path).await?;
        self.entries
            .entry(writer.hash.clone())
            .or_insert_with(|| BlobEntry {
                path: final_path.clone(),
                size: actual_size,
                refcount: 0,
                last_ref_at: Utc::now(),
            });
        debug!(hash = %writer.hash, size = actual_size, "blob finalized");

        Ok(Finalized {
            path: final_path,
            hash_ok: true,
        })
    }

    /// Take a reference on `hash` and return its on-disk path.
    pub fn acquire(&self, hash: &str) -> Result<PathBuf, BlobError> {
        let mut entry = self
            .entries
            .get_mut(hash)
            .ok_or_else(|| BlobError::NotFound(hash.to_owned()))?;
        entry.refcount += 1;
        entry.last_ref_at = Utc::now();
        Ok(entry.path.clone())
    }

    /// Path of a registered blob without touching its refcount.
    pub fn path_of(&self, hash: &str) -> Result<PathBuf, BlobError> {
        self.entries
            .get(hash)
            .map(|e| e.path.clone())
            .ok_or_else(|| BlobError::NotFound(hash.to_owned()))
    }

    /// Drop one reference; at zero the delete policy applies.
    pub async fn release(&self, hash: &str) {
        let drop_file = match self.entries.get_mut(hash) {
            Some(mut entry) => {
                entry.refcount = entry.refcount.saturating_sub(1);
                entry.last_ref_at = Utc::now();
                entry.refcount == 0 && self.policy == DeletePolicy::Immediate
            }
            None => {
                warn!(hash, "release on unknown blob");
                return;
            }
        };

        if drop_file {
            if let Some((_, entry)) = self.entries.remove_if(hash, |_, e| e.refcount == 0) {
                if let Err(e) = fs::remove_file(&entry.path).await {
                    warn!(hash, error = %e, "failed to delete released blob");
                } else {
                    debug!(hash, "blob deleted after last release");
                }
            }
        }
    }

    pub fn stat(&self, hash: &str) -> Option<BlobStat> {
        self.entries.get(hash).map(|e| BlobStat {
            size: e.size,
            refcount: e.refcount,
        })
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.entries.contains_key(hash)
    }
}

/// Handle for one in-flight upload; chunks may arrive in any order.
pub struct BlobWriter {
    hash: String,
    expected_size: u64,
    temp_path: PathBuf,
    file: fs::File,
    high_water: u64,
}

impl BlobWriter {
    pub async fn write_chunk(&mut self, offset: u64, bytes: &[u8]) -> Result<(), BlobError> {
        let end = offset + bytes.len() as u64;
        if end > self.expected_size {
            return Err(BlobError::OutOfBounds {
                offset,
                len: bytes.len() as u64,
                size: self.expected_size,
            });
        }
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(bytes).await?;
        self.high_water = self.high_water.max(end);
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.high_water
    }

    /// Discard a partial upload, removing its temp file.
    pub async fn abort(self) {
        drop(self.file);
        if let Err(e) = fs::remove_file(&self.temp_path).await {
            warn!(path = %self.temp_path.display(), error = %e, "failed to remove aborted upload");
        }
    }
}

/// Result of [`BlobStore::finalize`].
#[derive(Debug)]
pub struct Finalized {
    pub path: PathBuf,
    pub hash_ok: bool,
}

async fn hash_file(path: &Path) -> Result<(String, u64), BlobError> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), total))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    async fn store(policy: DeletePolicy) -> (tempfile::TempDir, BlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path().join("blobs"), policy).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn out_of_order_chunks_assemble_correctly() {
        let (_dir, store) = store(DeletePolicy::Immediate).await;
        let data = b"hello blob world";
        let hash = digest(data);

        let mut writer = store.begin_upload(&hash, data.len() as u64).await.unwrap();
        writer.write_chunk(6, &data[6..]).await.unwrap();
        writer.write_chunk(0, &data[..6]).await.unwrap();
        let done = store.finalize(writer).await.unwrap();
        assert!(done.hash_ok);
        assert_eq!(fs::read(&done.path).await.unwrap(), data);
    }

    #[tokio::test]
    async fn hash_mismatch_discards_without_registering() {
        let (_dir, store) = store(DeletePolicy::Immediate).await;
        let data = b"actual content";
        let claimed = digest(b"different content");

        let mut writer = store.begin_upload(&claimed, data.len() as u64).await.unwrap();
        writer.write_chunk(0, data).await.unwrap();
        let done = store.finalize(writer).await.unwrap();
        assert!(!done.hash_ok);
        assert!(!store.contains(&claimed));
        assert!(store.acquire(&claimed).is_err());
    }

    #[tokio::test]
    async fn size_mismatch_is_an_error() {
        let (_dir, store) = store(DeletePolicy::Immediate).await;
        let data = b"short";
        let hash = digest(data);

        let mut writer = store.begin_upload(&hash, 100).await.unwrap();
        writer.write_chunk(0, data).await.unwrap();
        assert!(matches!(
            store.finalize(writer).await,
            Err(BlobError::SizeMismatch { expected: 100, actual: 5 })
        ));
    }

    #[tokio::test]
    async fn refcount_gates_deletion_under_immediate_policy() {
        let (_dir, store) = store(DeletePolicy::Immediate).await;
        let data = b"refcounted";
        let hash = digest(data);

        let mut writer = store.begin_upload(&hash, data.len() as u64).await.unwrap();
        writer.write_chunk(0, data).await.unwrap();
        let done = store.finalize(writer).await.unwrap();
        assert!(done.hash_ok);

        let p1 = store.acquire(&hash).unwrap();
        let _p2 = store.acquire(&hash).unwrap();
        assert_eq!(store.stat(&hash).unwrap().refcount, 2);

        store.release(&hash).await;
        assert!(p1.exists(), "file survives while references remain");
        assert_eq!(store.stat(&hash).unwrap().refcount, 1);

        store.release(&hash).await;
        assert!(store.stat(&hash).is_none());
        assert!(!p1.exists(), "file deleted after last release");
    }

    #[tokio::test]
    async fn retain_policy_keeps_file_at_zero_references() {
        let (_dir, store) = store(DeletePolicy::Retain).await;
        let data = b"kept around";
        let hash = digest(data);

        let mut writer = store.begin_upload(&hash, data.len() as u64).await.unwrap();
        writer.write_chunk(0, data).await.unwrap();
        store.finalize(writer).await.unwrap();

        let path = store.acquire(&hash).unwrap();
        store.release(&hash).await;
        assert!(path.exists());
        assert_eq!(store.stat(&hash).unwrap().refcount, 0);
    }

    #[tokio::test]
    async fn duplicate_upload_of_existing_hash_is_idempotent() {
        let (_dir, store) = store(DeletePolicy::Immediate).await;
        let data = b"same bytes";
        let hash = digest(data);

        for _ in 0..2 {
            let mut writer = store.begin_upload(&hash, data.len() as u64).await.unwrap();
            writer.write_chunk(0, data).await.unwrap();
            let done = store.finalize(writer).await.unwrap();
            assert!(done.hash_ok);
        }
        assert_eq!(store.stat(&hash).unwrap().size, data.len() as u64);
    }

    #[tokio::test]
    async fn abort_removes_temp_file() {
        let (_dir, store) = store(DeletePolicy::Immediate).await;
        let mut writer = store.begin_upload("deadbeef", 10).await.unwrap();
        writer.write_chunk(0, b"12345").await.unwrap();
        let temp = writer.temp_path.clone();
        writer.abort().await;
        assert!(!temp.exists());
    }

    #[tokio::test]
    async fn reopen_indexes_existing_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("blobs");
        let data = b"persisted";
        let hash = digest(data);
        {
            let store = BlobStore::open(&root, DeletePolicy::Retain).await.unwrap();
            let mut writer = store.begin_upload(&hash, data.len() as u64).await.unwrap();
            writer.write_chunk(0, data).await.unwrap();
            store.finalize(writer).await.unwrap();
        }
        let reopened = BlobStore::open(&root, DeletePolicy::Retain).await.unwrap();
        assert!(reopened.contains(&hash));
        assert_eq!(reopened.stat(&hash).unwrap().refcount, 0);
    }
}
