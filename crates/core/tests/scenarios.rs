///! End-to-end scenarios against `InMemoryStateStore`, one test per literal scenario
///! plus its adjacent testable-property checks. No live Postgres/Redis required —
///! see `tests/live_stores.rs` for the `#[ignore]`d tests against real backends.
///!
///! S6 (XL token refresh) is exercised as the deterministic unit tests in
///! `src/progress.rs` (`needs_refresh`, `TaskView::build`) rather than here: its
///! literal form polls every 30s over a 10-minute window, which is impractical to
///! run as a real-time integration test, and `tokio::time::pause` cannot fast-forward
///! the wall-clock `chrono::Utc::now()` calls the refresh decision is keyed on.
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use altec_common::config::{AdmissionConfig, DurationClassConfig, PolicyTableConfig, ProgressConfig, RetryConfig};
use altec_common::ids::WorkerId;
use altec_common::model::{Task, TaskKey, TaskKind, TaskStatus};
use altec_common::AltecError;
use altec_core::adapters::{AdapterResponse, MockAdapter, ModelAdapter};
use altec_core::admission::AdmissionGuard;
use altec_core::admission::SubmitOutcome;
use altec_core::executor::phases::build_registry;
use altec_core::executor::SegmentedExecutor;
use altec_core::policy::InputDescriptor;
use altec_core::state_store::{InMemoryStateStore, StateStore};

fn retry_config() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        initial_backoff_ms: 1,
        max_backoff_ms: 4,
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

/// A single duration class, quiet enough (long heartbeat/lease) that its background
/// heartbeat timer never fires within a test's lifetime — tests force lock expiry
/// directly instead of waiting on it.
fn quiet_policy_table(segment_count: u32) -> PolicyTableConfig {
    let mut classes = HashMap::new();
    classes.insert(
        "S".to_string(),
        DurationClassConfig {
            predicted_seconds_max: f64::MAX,
            heartbeat_interval_secs: 3600,
            lock_lease_secs: 3600,
            segment_count,
            client_refresh_interval_secs: 0,
        },
    );
    PolicyTableConfig {
        classes,
        class_order: vec!["S".to_string()],
    }
}

fn progress_config() -> ProgressConfig {
    ProgressConfig {
        progress_throttle_percent: 0.5,
        progress_throttle_message_changed: true,
        min_publish_interval_ms: 0,
    }
}

fn admission_config() -> AdmissionConfig {
    AdmissionConfig {
        reclaim_sweep_interval_secs: 3600,
        max_reclaim_attempts: 3,
        skipped_recent_success_window_secs: 3600,
    }
}

async fn wait_until(store: &Arc<dyn StateStore>, key: &TaskKey, pred: impl Fn(&Task) -> bool) -> Task {
    for _ in 0..500 {
        if let Ok(task) = store.load_task(key).await {
            if pred(&task) {
                return task;
            }
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    panic!("timed out waiting for task {key} to satisfy predicate");
}

/// S1 — clean audio transcription: a fresh submission runs every phase to completion.
#[tokio::test]
async fn scenario_s1_clean_transcription_completes() {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let adapter = Arc::new(MockAdapter::new());
    let registry = Arc::new(build_registry(adapter.clone(), retry_config()));
    let executor = Arc::new(SegmentedExecutor::new(store.clone(), registry, 3.0, progress_config()));
    let guard = AdmissionGuard::new(
        store.clone(),
        executor,
        quiet_policy_table(5),
        admission_config(),
        WorkerId::new("worker-1"),
    );

    let key = TaskKey::new(TaskKind::AudioTranscribe, "42");
    let descriptor = InputDescriptor {
        media_seconds: Some(180.0),
        gpu: true,
        ..Default::default()
    };
    let outcome = guard.submit(key.clone(), descriptor).await.unwrap();
    assert!(matches!(outcome, SubmitOutcome::Started { .. }));

    let task = wait_until(&store, &key, |t| t.status.is_terminal()).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.progress_percent, 100.0);
    assert!(task.result_ref.is_some());
    assert!(task.error.is_none());

    // Five durable phase commits, in order: preprocess, transcribe, post_optimize,
    // embed_segments, finalize — the last of which never calls the adapter.
    for operation in ["preprocess_audio", "transcribe", "post_optimize_transcript", "embed"] {
        assert_eq!(adapter.invocation_count(operation), 1, "operation {operation} should run exactly once");
    }
}

/// S2 — duplicate submission coalesces: two workers racing a concurrent submit for
/// the same key yield exactly one `started` and one `attached`, sharing a `task_id`.
/// Modeled as two workers (rather than one submitting twice) because the Admission
/// Guard's lock CAS only rejects a *different* owner — a worker re-submitting its own
/// in-flight key legitimately re-acquires rather than attaching.
#[tokio::test]
async fn scenario_s2_duplicate_submission_coalesces() {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let adapter = Arc::new(MockAdapter::new());
    let registry = Arc::new(build_registry(adapter, retry_config()));
    let executor = Arc::new(SegmentedExecutor::new(store.clone(), registry, 3.0, progress_config()));
    let guard_a = Arc::new(AdmissionGuard::new(
        store.clone(),
        executor.clone(),
        quiet_policy_table(8),
        admission_config(),
        WorkerId::new("worker-1"),
    ));
    let guard_b = Arc::new(AdmissionGuard::new(
        store.clone(),
        executor,
        quiet_policy_table(8),
        admission_config(),
        WorkerId::new("worker-2"),
    ));

    let key = TaskKey::new(TaskKind::VideoDeep, "7");
    let descriptor = InputDescriptor {
        media_seconds: Some(600.0),
        ..Default::default()
    };

    let (first, second) = tokio::join!(
        guard_a.submit(key.clone(), descriptor.clone()),
        guard_b.submit(key.clone(), descriptor.clone())
    );
    let first = first.unwrap();
    let second = second.unwrap();

    let (started, attached) = match (first, second) {
        (SubmitOutcome::Started { task_id }, SubmitOutcome::Attached { task_id: other, .. }) => (task_id, other),
        (SubmitOutcome::Attached { task_id: other, .. }, SubmitOutcome::Started { task_id }) => (task_id, other),
        other => panic!("expected exactly one started and one attached outcome, got {other:?}"),
    };
    assert_eq!(started, attached);

    // Only one Task row and one lock owner should exist for the key.
    let task = store.load_task(&key).await.unwrap();
    assert_eq!(task.id, started);
}

/// S3 — worker crash mid-job: a crash is modeled by forcing the lock to expire after
/// three phases have durably committed, then a second worker resumes from the
/// persisted `phase_cursor` without re-invoking the already-completed phases.
#[tokio::test]
async fn scenario_s3_worker_crash_resumes_without_replaying_completed_phases() {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());

    let adapter1 = Arc::new(MockAdapter::new());
    let stalling = Arc::new(StallOnceAdapter {
        inner: adapter1.clone(),
        stall_operation: "summarize",
    });
    let registry1 = Arc::new(build_registry(stalling, retry_config()));
    let executor1 = Arc::new(SegmentedExecutor::new(store.clone(), registry1, 1e6, progress_config()));
    let worker1 = WorkerId::new("worker-1");
    let guard1 = AdmissionGuard::new(
        store.clone(),
        executor1,
        quiet_policy_table(5),
        admission_config(),
        worker1.clone(),
    );

    let key = TaskKey::new(TaskKind::TextProfile, "11");
    let outcome = guard1
        .submit(key.clone(), InputDescriptor::default())
        .await
        .unwrap();
    assert!(matches!(outcome, SubmitOutcome::Started { .. }));

    // Wait for phases 0..3 (parse, extract_stats, extract_keywords) to durably commit;
    // phase 3 (summarize) is stalled indefinitely by the adapter wrapper above.
    let mid_crash = wait_until(&store, &key, |t| t.phase_cursor >= 3).await;
    assert_eq!(mid_crash.status, TaskStatus::Running);
    for operation in ["parse_document", "extract_stats", "extract_keywords"] {
        assert_eq!(adapter1.invocation_count(operation), 1);
    }
    assert_eq!(adapter1.invocation_count("summarize"), 0);

    // Simulate the crash: force worker1's lock to be expired, then run one pass of
    // what the reclaim sweeper does continuously.
    store
        .try_acquire_lock(&key, &worker1, chrono::Duration::seconds(-1))
        .await
        .unwrap();
    let expired = store.list_expired_locks(chrono::Utc::now()).await.unwrap();
    assert!(expired.contains(&key));
    store.mark_abandoned(&key).await.unwrap();

    // A second worker, with its own (unstalled) adapter, resumes the Task.
    let adapter2 = Arc::new(MockAdapter::new());
    let registry2 = Arc::new(build_registry(adapter2.clone(), retry_config()));
    let executor2 = Arc::new(SegmentedExecutor::new(store.clone(), registry2, 1e6, progress_config()));
    let guard2 = AdmissionGuard::new(
        store.clone(),
        executor2,
        quiet_policy_table(5),
        admission_config(),
        WorkerId::new("worker-2"),
    );

    let resumed = guard2
        .submit(key.clone(), InputDescriptor::default())
        .await
        .unwrap();
    assert!(matches!(resumed, SubmitOutcome::Started { .. }));

    let task = wait_until(&store, &key, |t| t.status.is_terminal()).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.progress_percent >= mid_crash.progress_percent);
    assert!(task.result_ref.is_some());
    assert!(task.error.is_none());

    // Phases already committed before the crash were never re-invoked by worker 2.
    assert_eq!(adapter2.invocation_count("parse_document"), 0);
    assert_eq!(adapter2.invocation_count("extract_stats"), 0);
    assert_eq!(adapter2.invocation_count("extract_keywords"), 0);
    assert_eq!(adapter2.invocation_count("summarize"), 1);

    // And worker 1's counters never advanced past the crash point either.
    for operation in ["parse_document", "extract_stats", "extract_keywords"] {
        assert_eq!(adapter1.invocation_count(operation), 1);
    }
}

/// S4 — hard deadline: a phase that runs past `predicted_seconds * deadline_multiplier`
/// finalizes FAILED with kind `timeout`.
#[tokio::test]
async fn scenario_s4_hard_deadline_finalizes_failed_with_timeout() {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let adapter = Arc::new(SlowAdapter {
        delay: StdDuration::from_millis(1500),
    });
    let registry = Arc::new(build_registry(adapter, retry_config()));
    // predicted_seconds(text-profile, empty descriptor) = 15.0 (the §4.3 floor);
    // a deadline_multiplier far below 1 collapses the deadline to under a second.
    let executor = Arc::new(SegmentedExecutor::new(store.clone(), registry, 0.01, progress_config()));

    let mut classes = HashMap::new();
    classes.insert(
        "S".to_string(),
        DurationClassConfig {
            predicted_seconds_max: f64::MAX,
            heartbeat_interval_secs: 1,
            lock_lease_secs: 60,
            segment_count: 5,
            client_refresh_interval_secs: 0,
        },
    );
    let policy_table = PolicyTableConfig {
        classes,
        class_order: vec!["S".to_string()],
    };

    let guard = AdmissionGuard::new(
        store.clone(),
        executor,
        policy_table,
        admission_config(),
        WorkerId::new("worker-1"),
    );

    let key = TaskKey::new(TaskKind::TextProfile, "99");
    let outcome = guard.submit(key.clone(), InputDescriptor::default()).await.unwrap();
    assert!(matches!(outcome, SubmitOutcome::Started { .. }));

    let task = wait_until(&store, &key, |t| t.status.is_terminal()).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_ref().unwrap().kind, "timeout");
    assert!(task.result_ref.is_none());
}

/// S5 — repeated-success suppression: resubmitting a recently-COMPLETED key short-
/// circuits to the cached result without invoking any phase.
#[tokio::test]
async fn scenario_s5_repeated_success_suppressed_within_window() {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let adapter = Arc::new(MockAdapter::new());
    let registry = Arc::new(build_registry(adapter.clone(), retry_config()));
    let executor = Arc::new(SegmentedExecutor::new(store.clone(), registry, 3.0, progress_config()));
    let guard = AdmissionGuard::new(
        store.clone(),
        executor,
        quiet_policy_table(5),
        admission_config(),
        WorkerId::new("worker-1"),
    );

    let key = TaskKey::new(TaskKind::TextProfile, "11");
    guard.submit(key.clone(), InputDescriptor::default()).await.unwrap();
    let completed = wait_until(&store, &key, |t| t.status.is_terminal()).await;
    assert_eq!(completed.status, TaskStatus::Completed);
    let first_result_ref = completed.result_ref.clone().unwrap();
    let parse_count_before = adapter.invocation_count("parse_document");

    let resubmit = guard.submit(key.clone(), InputDescriptor::default()).await.unwrap();
    match resubmit {
        SubmitOutcome::SkippedRecentSuccess { result_ref, .. } => {
            assert_eq!(result_ref, first_result_ref);
        }
        other => panic!("expected skipped_recent_success, got {other:?}"),
    }

    // No phase function was invoked by the resubmission.
    assert_eq!(adapter.invocation_count("parse_document"), parse_count_before);
}

/// Invokes `inner` normally except for one named operation, which blocks forever —
/// models "the worker is killed mid-call" without tearing down the test process.
struct StallOnceAdapter {
    inner: Arc<MockAdapter>,
    stall_operation: &'static str,
}

impl ModelAdapter for StallOnceAdapter {
    fn invoke<'a>(
        &'a self,
        operation: &'a str,
        input: &'a serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<AdapterResponse, AltecError>> + Send + 'a>> {
        Box::pin(async move {
            if operation == self.stall_operation {
                std::future::pending::<()>().await;
                unreachable!()
            }
            self.inner.invoke(operation, input).await
        })
    }
}

/// Invokes `inner` normally except for one named operation, which waits on a
/// `Notify` before proceeding — lets a test pin execution at a known phase boundary
/// without an unbounded stall.
struct GatedAdapter {
    inner: Arc<MockAdapter>,
    gate_operation: &'static str,
    gate: Arc<tokio::sync::Notify>,
}

impl ModelAdapter for GatedAdapter {
    fn invoke<'a>(
        &'a self,
        operation: &'a str,
        input: &'a serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<AdapterResponse, AltecError>> + Send + 'a>> {
        Box::pin(async move {
            if operation == self.gate_operation {
                self.gate.notified().await;
            }
            self.inner.invoke(operation, input).await
        })
    }
}

/// §4.2 edge policy: deletion of the underlying resource tombstones the Task. The
/// in-flight execution observes the tombstone at its next phase boundary and aborts
/// without finalizing — the Task never reaches COMPLETED or FAILED, and the phase
/// past the tombstone is never invoked.
#[tokio::test]
async fn resource_deletion_aborts_without_finalizing() {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let adapter = Arc::new(MockAdapter::new());
    let gate = Arc::new(tokio::sync::Notify::new());
    let gated = Arc::new(GatedAdapter {
        inner: adapter.clone(),
        gate_operation: "parse_document",
        gate: gate.clone(),
    });
    let registry = Arc::new(build_registry(gated, retry_config()));
    let executor = Arc::new(SegmentedExecutor::new(store.clone(), registry, 1e6, progress_config()));
    let guard = AdmissionGuard::new(
        store.clone(),
        executor,
        quiet_policy_table(5),
        admission_config(),
        WorkerId::new("worker-1"),
    );

    let key = TaskKey::new(TaskKind::TextProfile, "77");
    let outcome = guard
        .submit(key.clone(), InputDescriptor::default())
        .await
        .unwrap();
    assert!(matches!(outcome, SubmitOutcome::Started { .. }));

    // Phase 0 (parse) is parked on the gate; tombstone the resource while it's stuck
    // there, then release it. The phase-0 commit still lands, but the pre-phase check
    // ahead of phase 1 observes the tombstone and aborts before `extract_stats` runs.
    store.request_tombstone(&key).await.unwrap();
    gate.notify_one();

    tokio::time::sleep(StdDuration::from_millis(200)).await;
    let task = store.load_task(&key).await.unwrap();
    assert!(!task.status.is_terminal(), "orphaned task must not finalize");
    assert_eq!(task.phase_cursor, 1, "phase 0's commit still lands");
    assert_eq!(adapter.invocation_count("extract_stats"), 0);
}

/// Always succeeds, but only after a fixed real-time delay — used to push a phase
/// past its deadline without hanging forever.
struct SlowAdapter {
    delay: StdDuration,
}

impl ModelAdapter for SlowAdapter {
    fn invoke<'a>(
        &'a self,
        operation: &'a str,
        input: &'a serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<AdapterResponse, AltecError>> + Send + 'a>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            Ok(AdapterResponse {
                payload: serde_json::json!({ "operation": operation, "echo": input }),
            })
        })
    }
}
