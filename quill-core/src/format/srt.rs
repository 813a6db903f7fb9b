//! SRT rendering.
//!
//! Preserves the engine's original sentence segmentation: one cue per
//! non-empty sentence, numbered from 1, with a `SpeakerN:` prefix on the
//! payload line.

use crate::engine::RawTranscript;

pub fn render(raw: &RawTranscript) -> String {
    let mut out = String::new();
    let mut index = 1usize;
    for sentence in &raw.sentences {
        let text = sentence.text.trim();
        if text.is_empty() {
            continue;
        }
        out.push_str(&format!(
            "{index}\n{} --> {}\nSpeaker{}:{}\n\n",
            srt_time(sentence.start_ms),
            srt_time(sentence.end_ms),
            sentence.speaker_id + 1,
            text,
        ));
        index += 1;
    }
    out
}

/// `HH:MM:SS,mmm`
fn srt_time(ms: u64) -> String {
    let hours = ms / 3_600_000;
    let minutes = (ms % 3_600_000) / 60_000;
    let seconds = (ms % 60_000) / 1_000;
    let millis = ms % 1_000;
    format!("{hours:02}:{minutes:02}:{seconds:02},{millis:03}")
}
