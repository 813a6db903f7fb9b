use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use sha2::{Digest, Sha256};

use super::*;
use crate::engine::mock::MockEngine;
use crate::engine::{EngineFault, EngineGate, SpeechEngine};
use crate::format::OutputFormat;
use crate::store::{BlobStore, DeletePolicy, ResultCache};

// ── harness ──────────────────────────────────────────────────────────────────

#[derive(Default)]
struct RecordingSink {
    events: StdMutex<Vec<(String, TaskEvent)>>,
}

impl EventSink for RecordingSink {
    fn deliver(&self, session_id: &str, event: &TaskEvent) {
        self.events
            .lock()
            .unwrap()
            .push((session_id.to_owned(), event.clone()));
    }
}

impl RecordingSink {
    fn for_session(&self, session_id: &str) -> Vec<TaskEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s == session_id)
            .map(|(_, e)| e.clone())
            .collect()
    }

    fn terminal_events(&self, task_id: &str, session_id: &str) -> usize {
        self.for_session(session_id)
            .iter()
            .filter(|e| e.task_id() == task_id && e.is_terminal())
            .count()
    }
}

struct TestEnv {
    manager: Arc<TaskManager>,
    blobs: Arc<BlobStore>,
    sink: Arc<RecordingSink>,
    _dir: tempfile::TempDir,
}

async fn build_env(cfg: TaskManagerConfig, gate: EngineGate) -> TestEnv {
    let dir = tempfile::tempdir().unwrap();
    let blobs = Arc::new(
        BlobStore::open(dir.path().join("blobs"), DeletePolicy::Immediate)
            .await
            .unwrap(),
    );
    let cache = ResultCache::open("sqlite::memory:", Duration::from_secs(3600), true)
        .await
        .unwrap();
    let sink = Arc::new(RecordingSink::default());
    let manager = TaskManager::start(
        cfg,
        gate,
        Arc::clone(&blobs),
        cache,
        Arc::clone(&sink) as Arc<dyn EventSink>,
    );
    TestEnv {
        manager,
        blobs,
        sink,
        _dir: dir,
    }
}

fn serial_gate(engine: MockEngine) -> EngineGate {
    EngineGate::serialized(Box::new(engine) as Box<dyn SpeechEngine>)
}

fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn request(session: &str, hash: &str, format: OutputFormat, force: bool) -> SubmitRequest {
    SubmitRequest {
        file_name: "meeting.wav".to_owned(),
        file_size: 16,
        file_hash: hash.to_owned(),
        output_format: format,
        force_refresh: force,
        session_id: session.to_owned(),
    }
}

/// Submit, stream the blob, and enqueue; returns the task id.
async fn upload(env: &TestEnv, session: &str, data: &[u8], format: OutputFormat, force: bool) -> String {
    let hash = digest(data);
    let mut req = request(session, &hash, format, force);
    req.file_size = data.len() as u64;
    let task_id = match env.manager.submit(req).await.unwrap() {
        Admission::AwaitingUpload { task_id } => task_id,
        Admission::CacheHit { .. } => panic!("expected a fresh admission"),
    };
    let mut writer = env.blobs.begin_upload(&hash, data.len() as u64).await.unwrap();
    writer.write_chunk(0, data).await.unwrap();
    let done = env.blobs.finalize(writer).await.unwrap();
    assert!(done.hash_ok);
    env.manager.enqueue_uploaded(&task_id).await.unwrap();
    task_id
}

async fn wait_for_status(env: &TestEnv, task_id: &str, status: TaskStatus) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if env.manager.snapshot(task_id).map(|s| s.status) == Some(status) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("task {task_id} never reached {status:?}"));
}

// ── lifecycle ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn upload_runs_to_completion_with_ordered_events() {
    let env = build_env(TaskManagerConfig::default(), serial_gate(MockEngine::default())).await;
    let data = b"first recording";
    let task_id = upload(&env, "s1", data, OutputFormat::Json, false).await;
    wait_for_status(&env, &task_id, TaskStatus::Completed).await;

    let events = env.sink.for_session("s1");
    let kinds: Vec<&str> = events
        .iter()
        .map(|e| match e {
            TaskEvent::Queued { .. } => "queued",
            TaskEvent::Progress { status: TaskStatus::Processing, .. } => "processing",
            TaskEvent::Progress { .. } => "progress",
            TaskEvent::Completed { .. } => "completed",
            TaskEvent::Failed { .. } => "failed",
        })
        .collect();
    // Queued is optional (a worker may grab the task instantly); the rest of
    // the order is fixed.
    let without_queued: Vec<&&str> = kinds.iter().filter(|k| **k != "queued").collect();
    assert_eq!(without_queued, [&"processing", &"completed"]);
    assert_eq!(env.sink.terminal_events(&task_id, "s1"), 1);

    // Blob reference released on the terminal transition; immediate policy
    // deletes the artifact.
    assert!(env.blobs.stat(&digest(data)).is_none());

    let stats = env.manager.stats();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.processing, 0);
}

#[tokio::test]
async fn completion_payload_carries_merged_document() {
    let env = build_env(TaskManagerConfig::default(), serial_gate(MockEngine::default())).await;
    let task_id = upload(&env, "s1", b"payload check", OutputFormat::Json, false).await;
    wait_for_status(&env, &task_id, TaskStatus::Completed).await;

    let events = env.sink.for_session("s1");
    let payload = events
        .iter()
        .find_map(|e| match e {
            TaskEvent::Completed { payload, .. } => Some(payload.clone()),
            _ => None,
        })
        .expect("completion event");
    assert_eq!(payload["file_name"], "meeting.wav");
    assert!(payload["segments"].as_array().unwrap().len() >= 2);
    assert_eq!(payload["speakers"], serde_json::json!(["Speaker1", "Speaker2"]));
}

// ── cache behaviour ──────────────────────────────────────────────────────────

#[tokio::test]
async fn second_submit_of_same_hash_is_a_cache_hit() {
    let env = build_env(TaskManagerConfig::default(), serial_gate(MockEngine::default())).await;
    let data = b"cache me";
    let task_id = upload(&env, "a", data, OutputFormat::Json, false).await;
    wait_for_status(&env, &task_id, TaskStatus::Completed).await;

    let hash = digest(data);
    match env
        .manager
        .submit(request("b", &hash, OutputFormat::Json, false))
        .await
        .unwrap()
    {
        Admission::CacheHit { payload, .. } => {
            assert_eq!(payload["file_hash"], hash);
        }
        Admission::AwaitingUpload { .. } => panic!("expected cache hit"),
    }
    // No queue traffic for the hit.
    assert_eq!(env.manager.stats().queue_size, 0);
}

#[tokio::test]
async fn different_format_is_derived_from_cached_raw() {
    let env = build_env(TaskManagerConfig::default(), serial_gate(MockEngine::default())).await;
    let data = b"derive me";
    let task_id = upload(&env, "a", data, OutputFormat::Json, false).await;
    wait_for_status(&env, &task_id, TaskStatus::Completed).await;

    let hash = digest(data);
    match env
        .manager
        .submit(request("c", &hash, OutputFormat::Srt, false))
        .await
        .unwrap()
    {
        Admission::CacheHit { payload, .. } => {
            assert_eq!(payload["format"], "srt");
            let content = payload["content"].as_str().unwrap();
            assert!(content.starts_with("1\n00:00:00,000 --> 00:00:01,800\nSpeaker1:"));
        }
        Admission::AwaitingUpload { .. } => panic!("expected cache hit"),
    }
}

#[tokio::test]
async fn force_refresh_bypasses_cache_and_reruns_engine() {
    let env = build_env(TaskManagerConfig::default(), serial_gate(MockEngine::default())).await;
    let data = b"run twice";
    let first = upload(&env, "a", data, OutputFormat::Json, false).await;
    wait_for_status(&env, &first, TaskStatus::Completed).await;

    let second = upload(&env, "b", data, OutputFormat::Json, true).await;
    wait_for_status(&env, &second, TaskStatus::Completed).await;
    assert_eq!(env.sink.terminal_events(&second, "b"), 1);
}

#[tokio::test]
async fn concurrent_same_hash_tasks_both_complete() {
    let engine_a = MockEngine::default().with_latency(Duration::from_millis(150));
    let mut cfg = TaskManagerConfig::default();
    cfg.max_concurrent = 2;
    let engines: Vec<Box<dyn SpeechEngine>> = vec![
        Box::new(engine_a),
        Box::new(MockEngine::default().with_latency(Duration::from_millis(150))),
    ];
    let env = build_env(cfg, EngineGate::pooled(engines)).await;

    let data = b"shared bytes";
    let hash = digest(data);
    let t1 = upload(&env, "a", data, OutputFormat::Json, true).await;
    let t2 = upload(&env, "b", data, OutputFormat::Json, true).await;

    // Both live tasks reference the same artifact.
    assert_eq!(env.blobs.stat(&hash).unwrap().refcount, 2);

    wait_for_status(&env, &t1, TaskStatus::Completed).await;
    wait_for_status(&env, &t2, TaskStatus::Completed).await;
    assert_eq!(env.sink.terminal_events(&t1, "a"), 1);
    assert_eq!(env.sink.terminal_events(&t2, "b"), 1);
    // Both terminal transitions released their reference.
    assert!(env.blobs.stat(&hash).is_none());
}

// ── admission limits ─────────────────────────────────────────────────────────

#[tokio::test]
async fn queue_full_rejects_excess_submissions() {
    let mut cfg = TaskManagerConfig::default();
    cfg.max_queue_size = 2;
    cfg.max_concurrent = 1;
    let env = build_env(
        cfg,
        serial_gate(MockEngine::default().with_latency(Duration::from_millis(500))),
    )
    .await;

    upload(&env, "a", b"task one bytes", OutputFormat::Json, true).await;
    upload(&env, "b", b"task two bytes", OutputFormat::Json, true).await;

    let err = env
        .manager
        .submit(request("c", &digest(b"task three"), OutputFormat::Json, true))
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::QueueFull { .. }));
    assert_eq!(err.code(), "queue_full");
}

#[tokio::test]
async fn validation_rejects_bad_extension_and_oversize() {
    let mut cfg = TaskManagerConfig::default();
    cfg.max_file_size = 1024;
    let env = build_env(cfg, serial_gate(MockEngine::default())).await;

    let mut bad_ext = request("s", "aabb", OutputFormat::Json, false);
    bad_ext.file_name = "notes.txt".to_owned();
    assert!(matches!(
        env.manager.submit(bad_ext).await.unwrap_err(),
        TaskError::UnsupportedFormat(_)
    ));

    let mut too_big = request("s", "ccdd", OutputFormat::Json, false);
    too_big.file_size = 4096;
    assert!(matches!(
        env.manager.submit(too_big).await.unwrap_err(),
        TaskError::FileTooLarge { .. }
    ));
}

// ── retry policy ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn transient_fault_retries_then_succeeds() {
    let engine = MockEngine::default().fail_next(EngineFault::transient("VAD index out of range"));
    let env = build_env(TaskManagerConfig::default(), serial_gate(engine)).await;

    let task_id = upload(&env, "s1", b"flaky input", OutputFormat::Json, false).await;
    wait_for_status(&env, &task_id, TaskStatus::Completed).await;

    let statuses: Vec<TaskStatus> = env
        .sink
        .for_session("s1")
        .iter()
        .filter_map(|e| match e {
            TaskEvent::Progress { status, .. } => Some(*status),
            _ => None,
        })
        .collect();
    // Processing, back to Pending on the transient fault, Processing again.
    assert_eq!(
        statuses,
        [TaskStatus::Processing, TaskStatus::Pending, TaskStatus::Processing]
    );
    assert_eq!(env.sink.terminal_events(&task_id, "s1"), 1);
}

#[tokio::test]
async fn permanent_fault_fails_without_retry() {
    let engine = MockEngine::default().fail_next(EngineFault::permanent("unsupported codec"));
    let env = build_env(TaskManagerConfig::default(), serial_gate(engine)).await;

    let task_id = upload(&env, "s1", b"broken input", OutputFormat::Json, false).await;
    wait_for_status(&env, &task_id, TaskStatus::Failed).await;

    let events = env.sink.for_session("s1");
    let failure = events
        .iter()
        .find_map(|e| match e {
            TaskEvent::Failed { code, message, .. } => Some((code.clone(), message.clone())),
            _ => None,
        })
        .expect("failure event");
    assert_eq!(failure.0, "engine_error");
    assert!(failure.1.contains("unsupported codec"));
}

#[tokio::test]
async fn retries_exhausted_fails_the_task() {
    let engine = MockEngine::default()
        .fail_next(EngineFault::transient("VAD index out of range"))
        .fail_next(EngineFault::transient("VAD index out of range"))
        .fail_next(EngineFault::transient("VAD index out of range"));
    let mut cfg = TaskManagerConfig::default();
    cfg.retry_times = 2;
    let env = build_env(cfg, serial_gate(engine)).await;

    let task_id = upload(&env, "s1", b"always flaky", OutputFormat::Json, false).await;
    wait_for_status(&env, &task_id, TaskStatus::Failed).await;
    assert_eq!(env.sink.terminal_events(&task_id, "s1"), 1);
}

// ── cancellation ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn cancel_affects_pending_but_not_processing() {
    let mut cfg = TaskManagerConfig::default();
    cfg.max_concurrent = 1;
    let env = build_env(
        cfg,
        serial_gate(MockEngine::default().with_latency(Duration::from_millis(400))),
    )
    .await;

    let t1 = upload(&env, "s1", b"long running one", OutputFormat::Json, true).await;
    let t2 = upload(&env, "s1", b"waits in queue!!", OutputFormat::Json, true).await;
    wait_for_status(&env, &t1, TaskStatus::Processing).await;

    assert_eq!(
        env.manager.cancel(&t2, "s1").await.unwrap(),
        CancelOutcome::Cancelled
    );
    assert_eq!(
        env.manager.cancel(&t1, "s1").await.unwrap(),
        CancelOutcome::AlreadyProcessing
    );

    wait_for_status(&env, &t1, TaskStatus::Completed).await;
    assert_eq!(env.sink.terminal_events(&t1, "s1"), 1);
    // The cancelled task never produced a terminal event.
    assert_eq!(env.sink.terminal_events(&t2, "s1"), 0);
    // Its blob reference was dropped at cancellation.
    assert!(env.blobs.stat(&digest(b"waits in queue!!")).is_none());
}

#[tokio::test]
async fn cancel_requires_a_subscription() {
    let mut cfg = TaskManagerConfig::default();
    cfg.max_concurrent = 1;
    let env = build_env(
        cfg,
        serial_gate(MockEngine::default().with_latency(Duration::from_millis(300))),
    )
    .await;

    let blocker = upload(&env, "s1", b"occupies worker", OutputFormat::Json, true).await;
    let target = upload(&env, "s1", b"pending target!", OutputFormat::Json, true).await;

    let err = env.manager.cancel(&target, "intruder").await.unwrap_err();
    assert!(matches!(err, TaskError::NotSubscribed { .. }));

    wait_for_status(&env, &blocker, TaskStatus::Completed).await;
}

// ── subscriptions ────────────────────────────────────────────────────────────

#[tokio::test]
async fn subscribers_receive_fanout_and_unsubscribed_do_not() {
    let mut cfg = TaskManagerConfig::default();
    cfg.max_concurrent = 1;
    let env = build_env(
        cfg,
        serial_gate(MockEngine::default().with_latency(Duration::from_millis(200))),
    )
    .await;

    let task_id = upload(&env, "creator", b"shared interest", OutputFormat::Json, true).await;
    env.manager.subscribe(&task_id, "watcher").unwrap();
    env.manager.subscribe(&task_id, "leaver").unwrap();
    env.manager.unsubscribe(&task_id, "leaver");

    wait_for_status(&env, &task_id, TaskStatus::Completed).await;

    assert_eq!(env.sink.terminal_events(&task_id, "creator"), 1);
    assert_eq!(env.sink.terminal_events(&task_id, "watcher"), 1);
    assert_eq!(env.sink.terminal_events(&task_id, "leaver"), 0);
}

#[tokio::test]
async fn result_still_cached_when_all_subscribers_leave() {
    let mut cfg = TaskManagerConfig::default();
    cfg.max_concurrent = 1;
    let env = build_env(
        cfg,
        serial_gate(MockEngine::default().with_latency(Duration::from_millis(200))),
    )
    .await;

    let data = b"orphaned result";
    let task_id = upload(&env, "creator", data, OutputFormat::Json, false).await;
    wait_for_status(&env, &task_id, TaskStatus::Processing).await;
    env.manager.unsubscribe(&task_id, "creator");
    wait_for_status(&env, &task_id, TaskStatus::Completed).await;

    assert_eq!(env.sink.terminal_events(&task_id, "creator"), 0);
    // A later submission of the same hash hits the cache.
    match env
        .manager
        .submit(request("late", &digest(data), OutputFormat::Json, false))
        .await
        .unwrap()
    {
        Admission::CacheHit { .. } => {}
        Admission::AwaitingUpload { .. } => panic!("result should have been cached"),
    }
}

#[tokio::test]
async fn subscribe_unknown_task_errors() {
    let env = build_env(TaskManagerConfig::default(), serial_gate(MockEngine::default())).await;
    assert!(matches!(
        env.manager.subscribe("missing", "s1").unwrap_err(),
        TaskError::UnknownTask(_)
    ));
}
