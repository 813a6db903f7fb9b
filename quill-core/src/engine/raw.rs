use serde::{Deserialize, Serialize};

/// One sentence as segmented by the engine: millisecond timestamps and a
/// zero-based integer speaker id from diarization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSentence {
    pub text: String,
    pub start_ms: u64,
    pub end_ms: u64,
    pub speaker_id: u32,
}

impl RawSentence {
    pub fn new(text: impl Into<String>, start_ms: u64, end_ms: u64, speaker_id: u32) -> Self {
        Self {
            text: text.into(),
            start_ms,
            end_ms,
            speaker_id,
        }
    }
}

/// The untransformed output of one engine run.
///
/// Immutable once stored in the result cache; every client-facing document
/// is a pure function of this value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTranscript {
    pub sentences: Vec<RawSentence>,
    /// Media duration in seconds as reported by the engine.
    pub duration_secs: f64,
    /// Wall-clock seconds the engine spent on this run.
    pub processing_time_secs: f64,
}
