mod engine;
mod format;
mod store;
mod task;

pub use engine::{
    EngineFault, EngineGate, FaultKind, RawSentence, RawTranscript, SpeechEngine, TranscribeHints,
};
pub use engine::mock::MockEngine;
pub use format::{FormatMeta, OutputFormat};
pub use format::{json as format_json, srt as format_srt};
pub use store::{BlobError, BlobStat, BlobStore, BlobWriter, CacheError, DeletePolicy, ResultCache};
pub use task::{
    Admission, CancelOutcome, Enqueued, EventSink, SubmitMode, SubmitRequest, TaskError, TaskEvent,
    TaskManager, TaskManagerConfig, TaskSnapshot, TaskStats, TaskStatus,
};
