//! Scripted engine used by the default server wiring and the test suite.
//!
//! Real engines live out of tree and implement [`SpeechEngine`]; this one
//! replays a fixed transcript after an optional artificial latency, and can
//! be pre-loaded with faults to exercise the retry policy.

use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

use super::{EngineFault, RawSentence, RawTranscript, SpeechEngine, TranscribeHints};

pub struct MockEngine {
    sentences: Vec<RawSentence>,
    latency: Duration,
    faults: VecDeque<EngineFault>,
    calls: u64,
}

impl MockEngine {
    pub fn new(sentences: Vec<RawSentence>) -> Self {
        Self {
            sentences,
            latency: Duration::ZERO,
            faults: VecDeque::new(),
            calls: 0,
        }
    }

    /// Sleep this long inside every `transcribe` call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queue a fault to be returned instead of a transcript; faults are
    /// consumed in order, one per call.
    pub fn fail_next(mut self, fault: EngineFault) -> Self {
        self.faults.push_back(fault);
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl Default for MockEngine {
    /// A short two-speaker exchange, enough to exercise merging and SRT.
    fn default() -> Self {
        Self::new(vec![
            RawSentence::new("Hello, thanks for joining.", 0, 1_800, 0),
            RawSentence::new("Let's get started.", 2_100, 3_400, 0),
            RawSentence::new("Sounds good.", 3_900, 4_800, 1),
            RawSentence::new("First item on the agenda.", 8_500, 10_200, 0),
        ])
    }
}

impl SpeechEngine for MockEngine {
    fn transcribe(
        &mut self,
        _path: &Path,
        _hints: &TranscribeHints,
    ) -> Result<RawTranscript, EngineFault> {
        self.calls += 1;
        if let Some(fault) = self.faults.pop_front() {
            return Err(fault);
        }
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        let duration_secs = self
            .sentences
            .last()
            .map(|s| s.end_ms as f64 / 1000.0)
            .unwrap_or(0.0);
        Ok(RawTranscript {
            sentences: self.sentences.clone(),
            duration_secs,
            processing_time_secs: self.latency.as_secs_f64(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_fault_is_consumed_then_engine_recovers() {
        let mut engine =
            MockEngine::default().fail_next(EngineFault::transient("VAD index out of range"));
        let first = engine.transcribe(Path::new("x.wav"), &TranscribeHints::default());
        assert!(first.is_err());
        let second = engine.transcribe(Path::new("x.wav"), &TranscribeHints::default());
        assert_eq!(second.unwrap().sentences.len(), 4);
    }
}
