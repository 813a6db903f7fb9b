mod gate;
pub mod mock;
mod raw;

pub use gate::EngineGate;
pub use raw::{RawSentence, RawTranscript};

use std::path::Path;

use thiserror::Error;

/// Optional hints forwarded verbatim to the engine.
#[derive(Debug, Clone, Default)]
pub struct TranscribeHints {
    /// Target language, if the client declared one.
    pub language: Option<String>,
    /// Comma-separated hotwords biasing recognition.
    pub hotwords: Option<String>,
}

/// Whether an engine failure is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The same input may succeed on a later attempt.
    Transient,
    /// Retrying with the same input cannot help.
    Permanent,
}

/// A failure reported by (or on behalf of) the transcription engine.
#[derive(Debug, Clone, Error)]
#[error("{detail}")]
pub struct EngineFault {
    pub kind: FaultKind,
    pub detail: String,
}

impl EngineFault {
    pub fn transient(detail: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Transient,
            detail: detail.into(),
        }
    }

    pub fn permanent(detail: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Permanent,
            detail: detail.into(),
        }
    }

    /// Classify an opaque engine error message.
    ///
    /// VAD-internal index faults and out-of-memory hiccups are known to clear
    /// on a rerun of the same input; everything else is treated as permanent.
    pub fn classify(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let lowered = detail.to_lowercase();
        let transient = lowered.contains("index out of range")
            || lowered.contains("out of memory")
            || lowered.contains("temporarily unavailable");
        Self {
            kind: if transient {
                FaultKind::Transient
            } else {
                FaultKind::Permanent
            },
            detail,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == FaultKind::Transient
    }
}

/// The transcription engine contract.
///
/// Implementations are **not reentrant**: `transcribe` takes `&mut self` and
/// blocks the calling thread for the duration of the model run.  All shared
/// access goes through [`EngineGate`], which guarantees exclusive use of each
/// instance.
pub trait SpeechEngine: Send + 'static {
    fn transcribe(
        &mut self,
        path: &Path,
        hints: &TranscribeHints,
    ) -> Result<RawTranscript, EngineFault>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_marks_vad_index_faults_transient() {
        let fault = EngineFault::classify("VAD index out of range: 512");
        assert!(fault.is_transient());
    }

    #[test]
    fn classify_defaults_to_permanent() {
        let fault = EngineFault::classify("unsupported codec in container");
        assert_eq!(fault.kind, FaultKind::Permanent);
    }
}
