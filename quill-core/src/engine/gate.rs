use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};
use tracing::debug;

use super::{EngineFault, RawTranscript, SpeechEngine, TranscribeHints};

type EngineSlot = Arc<Mutex<Box<dyn SpeechEngine>>>;

/// Thread-safe facade over one or more non-reentrant engine instances.
///
/// Two shapes, selected at configuration time:
///
/// - **Serialized**: a single instance behind a mutex.  Every call holds the
///   lock for the whole model run.  Lowest memory, no parallelism.
/// - **Pooled**: N independent instances behind a semaphore.  Up to N calls
///   run concurrently, each with exclusive use of one instance.
///
/// The rest of the system only sees `transcribe` and must not assume the
/// underlying engine tolerates concurrent entry.
#[derive(Clone)]
pub struct EngineGate {
    inner: Inner,
}

#[derive(Clone)]
enum Inner {
    Serialized(EngineSlot),
    Pooled {
        semaphore: Arc<Semaphore>,
        instances: Arc<[EngineSlot]>,
    },
}

impl EngineGate {
    /// One engine instance; calls are serialized behind a mutex.
    pub fn serialized(engine: Box<dyn SpeechEngine>) -> Self {
        Self {
            inner: Inner::Serialized(Arc::new(Mutex::new(engine))),
        }
    }

    /// A fixed pool of independent instances managed by a semaphore.
    ///
    /// `engines` must be non-empty; pool parallelism equals its length.
    pub fn pooled(engines: Vec<Box<dyn SpeechEngine>>) -> Self {
        assert!(!engines.is_empty(), "engine pool must hold at least one instance");
        let instances: Arc<[EngineSlot]> = engines
            .into_iter()
            .map(|e| Arc::new(Mutex::new(e)))
            .collect::<Vec<_>>()
            .into();
        Self {
            inner: Inner::Pooled {
                semaphore: Arc::new(Semaphore::new(instances.len())),
                instances,
            },
        }
    }

    pub fn mode(&self) -> &'static str {
        match self.inner {
            Inner::Serialized(_) => "lock",
            Inner::Pooled { .. } => "pool",
        }
    }

    /// Run one transcription with exclusive access to an engine instance.
    ///
    /// The blocking engine call runs on the blocking thread pool; the guard
    /// travels with it, so the instance stays unavailable until the model
    /// returns even if the caller gives up waiting.
    pub async fn transcribe(
        &self,
        path: &Path,
        hints: &TranscribeHints,
    ) -> Result<RawTranscript, EngineFault> {
        let path = path.to_path_buf();
        let hints = hints.clone();
        match &self.inner {
            Inner::Serialized(slot) => {
                let guard = Arc::clone(slot).lock_owned().await;
                run_blocking(guard, path, hints).await
            }
            Inner::Pooled {
                semaphore,
                instances,
            } => {
                let permit = Arc::clone(semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|_| EngineFault::permanent("engine pool closed"))?;
                // The permit guarantees at least one unlocked instance.
                let guard = instances
                    .iter()
                    .find_map(|slot| Arc::clone(slot).try_lock_owned().ok())
                    .ok_or_else(|| EngineFault::permanent("engine pool exhausted"))?;
                let result = run_blocking(guard, path, hints).await;
                drop(permit);
                result
            }
        }
    }
}

async fn run_blocking(
    mut guard: OwnedMutexGuard<Box<dyn SpeechEngine>>,
    path: PathBuf,
    hints: TranscribeHints,
) -> Result<RawTranscript, EngineFault> {
    debug!(path = %path.display(), "dispatching transcription to engine");
    tokio::task::spawn_blocking(move || guard.transcribe(&path, &hints))
        .await
        .map_err(|_| EngineFault::permanent("engine call panicked"))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockEngine;
    use std::path::Path;

    #[tokio::test(flavor = "multi_thread")]
    async fn serialized_gate_runs_calls_one_at_a_time() {
        let engine = MockEngine::default().with_latency(std::time::Duration::from_millis(50));
        let gate = EngineGate::serialized(Box::new(engine));

        let start = std::time::Instant::now();
        let hints = TranscribeHints::default();
        let a = gate.transcribe(Path::new("a.wav"), &hints);
        let b = gate.transcribe(Path::new("b.wav"), &hints);
        let (ra, rb) = tokio::join!(a, b);
        ra.unwrap();
        rb.unwrap();
        // Two 50 ms calls through a single instance cannot overlap.
        assert!(start.elapsed() >= std::time::Duration::from_millis(100));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pooled_gate_overlaps_up_to_pool_size() {
        let engines: Vec<Box<dyn SpeechEngine>> = (0..2)
            .map(|_| {
                Box::new(
                    MockEngine::default().with_latency(std::time::Duration::from_millis(80)),
                ) as Box<dyn SpeechEngine>
            })
            .collect();
        let gate = EngineGate::pooled(engines);

        let start = std::time::Instant::now();
        let hints = TranscribeHints::default();
        let a = gate.transcribe(Path::new("a.wav"), &hints);
        let b = gate.transcribe(Path::new("b.wav"), &hints);
        let (ra, rb) = tokio::join!(a, b);
        ra.unwrap();
        rb.unwrap();
        // Both calls fit in one latency window plus scheduling slack.
        assert!(start.elapsed() < std::time::Duration::from_millis(160));
    }
}
