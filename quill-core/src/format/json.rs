//! Speaker-merged JSON output.
//!
//! Adjacent sentences from the same speaker are folded into one segment when
//! the silence between them is shorter than the configured merge gap.  Raw
//! integer speaker ids are mapped to `Speaker1`, `Speaker2`, … in order of
//! first appearance.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{json, Value};

use super::FormatMeta;
use crate::engine::RawTranscript;

/// Punctuation trimmed from the end of a segment before another sentence is
/// appended to it.  Terminal segments keep their punctuation.
const TRAILING_PUNCTUATION: &[char] = &['。', '.', '！', '!', '？', '?', '，', ',', '；', ';', '、'];

#[derive(Debug, Clone)]
struct MergedSegment {
    start_ms: u64,
    end_ms: u64,
    text: String,
    speaker: String,
}

pub fn merged(raw: &RawTranscript, meta: &FormatMeta, merge_gap: Duration) -> Value {
    let labels = speaker_labels(raw);
    let segments = merge_sentences(raw, &labels, merge_gap);

    let speakers: Vec<&str> = {
        let mut ordered: Vec<(&u32, &String)> = labels.iter().collect();
        ordered.sort_by_key(|(_, label)| label_index(label));
        ordered.into_iter().map(|(_, label)| label.as_str()).collect()
    };

    let full_text = segments
        .iter()
        .map(|s| s.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let total_speakers = speakers.len();
    let total_segments = segments.len();

    json!({
        "task_id": meta.task_id.clone(),
        "file_name": meta.file_name.clone(),
        "file_hash": meta.file_hash.clone(),
        "duration": round3(raw.duration_secs),
        "processing_time": round3(raw.processing_time_secs),
        "speakers": speakers,
        "segments": segments
            .iter()
            .map(|s| json!({
                "start_time": secs(s.start_ms),
                "end_time": secs(s.end_ms),
                "text": s.text.clone(),
                "speaker": s.speaker.clone(),
            }))
            .collect::<Vec<_>>(),
        "transcription_summary": {
            "total_speakers": total_speakers,
            "total_segments": total_segments,
            "full_text": full_text,
        },
    })
}

/// Map raw speaker ids to `SpeakerN` labels by order of first appearance.
fn speaker_labels(raw: &RawTranscript) -> HashMap<u32, String> {
    let mut labels = HashMap::new();
    for sentence in &raw.sentences {
        if sentence.text.trim().is_empty() {
            continue;
        }
        let next = labels.len() + 1;
        labels
            .entry(sentence.speaker_id)
            .or_insert_with(|| format!("Speaker{next}"));
    }
    labels
}

fn merge_sentences(
    raw: &RawTranscript,
    labels: &HashMap<u32, String>,
    merge_gap: Duration,
) -> Vec<MergedSegment> {
    let gap_ms = merge_gap.as_millis() as u64;
    let mut merged: Vec<MergedSegment> = Vec::new();

    for sentence in &raw.sentences {
        let text = sentence.text.trim();
        if text.is_empty() {
            continue;
        }
        let speaker = &labels[&sentence.speaker_id];

        match merged.last_mut() {
            Some(current)
                if current.speaker == *speaker
                    && sentence.start_ms.saturating_sub(current.end_ms) < gap_ms =>
            {
                let trimmed = current.text.trim_end_matches(TRAILING_PUNCTUATION).len();
                current.text.truncate(trimmed);
                current.text.push_str(text);
                current.end_ms = current.end_ms.max(sentence.end_ms);
            }
            _ => merged.push(MergedSegment {
                start_ms: sentence.start_ms,
                end_ms: sentence.end_ms,
                text: text.to_owned(),
                speaker: speaker.clone(),
            }),
        }
    }

    merged
}

fn label_index(label: &str) -> usize {
    label
        .trim_start_matches("Speaker")
        .parse::<usize>()
        .unwrap_or(usize::MAX)
}

fn secs(ms: u64) -> f64 {
    ms as f64 / 1000.0
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
