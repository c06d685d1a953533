use std::future::Future;
use std::pin::Pin;

use altec_common::model::{Task, TaskError, TaskKey, TaskStatus};
use altec_common::ids::WorkerId;
use altec_common::Result;
use chrono::{DateTime, Utc};

/// Ephemeral single-holder lease on a `TaskKey`. Doubles as the heartbeat: extending
/// the lease *is* the heartbeat (see model-level note on folding Heartbeat into Lock).
#[derive(Clone, Debug, PartialEq)]
pub struct Lock {
    pub task_key: TaskKey,
    pub owner_worker: WorkerId,
    pub acquired_at: DateTime<Utc>,
    pub lease_deadline: DateTime<Utc>,
}

/// Outcome of `put_task_if_absent`.
pub enum PutOutcome {
    Created(Task),
    Existing(Task),
}

/// Outcome of `try_acquire_lock`.
pub enum AcquireOutcome {
    Acquired(Lock),
    HeldByOther {
        owner_worker: WorkerId,
        remaining: chrono::Duration,
    },
}

/// Outcome of `extend_lock`.
#[derive(Debug, PartialEq, Eq)]
pub enum ExtendOutcome {
    Ok,
    Lost,
}

/// Fields written at a phase boundary by `update_task_progress`.
#[derive(Clone, Debug)]
pub struct ProgressUpdate {
    pub phase_cursor: u32,
    pub checkpoint: Vec<u8>,
    pub progress_percent: f64,
    pub progress_message: String,
}

/// Terminal disposition passed to `finalize_task`.
#[derive(Clone, Debug)]
pub enum Finalization {
    Completed { result_ref: String },
    Failed { error: TaskError },
}

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Durable Task persistence plus ephemeral single-holder locks, with per-key CAS.
///
/// Object-safe by hand-boxing its futures (mirroring the teacher's `LlmCaller` trait)
/// rather than depending on an async-trait macro crate the teacher itself never reaches
/// for.
pub trait StateStore: Send + Sync {
    fn put_task_if_absent<'a>(&'a self, key: &'a TaskKey, initial: Task) -> BoxFut<'a, PutOutcome>;

    fn load_task<'a>(&'a self, key: &'a TaskKey) -> BoxFut<'a, Task>;

    fn update_task_progress<'a>(
        &'a self,
        key: &'a TaskKey,
        owner_worker: &'a WorkerId,
        update: ProgressUpdate,
    ) -> BoxFut<'a, ()>;

    fn finalize_task<'a>(
        &'a self,
        key: &'a TaskKey,
        owner_worker: &'a WorkerId,
        finalization: Finalization,
    ) -> BoxFut<'a, ()>;

    fn set_status<'a>(&'a self, key: &'a TaskKey, status: TaskStatus) -> BoxFut<'a, ()>;

    /// Marks a Task ABANDONED and increments `attempts` atomically — the reclaim
    /// sweeper's write, called once per expired lock it observes. Returns the new
    /// attempt count so the sweeper can decide whether the cap was exceeded.
    fn mark_abandoned<'a>(&'a self, key: &'a TaskKey) -> BoxFut<'a, u32>;

    fn request_cancel<'a>(&'a self, key: &'a TaskKey) -> BoxFut<'a, ()>;

    /// Tombstones the Task's underlying resource. Called by the (out-of-scope)
    /// deletion flow; an in-flight execution observes this before its next phase and
    /// aborts without finalizing (§4.2).
    fn request_tombstone<'a>(&'a self, key: &'a TaskKey) -> BoxFut<'a, ()>;

    fn try_acquire_lock<'a>(
        &'a self,
        key: &'a TaskKey,
        worker_id: &'a WorkerId,
        lease: chrono::Duration,
    ) -> BoxFut<'a, AcquireOutcome>;

    fn extend_lock<'a>(
        &'a self,
        key: &'a TaskKey,
        worker_id: &'a WorkerId,
        lease: chrono::Duration,
    ) -> BoxFut<'a, ExtendOutcome>;

    fn release_lock<'a>(&'a self, key: &'a TaskKey, worker_id: &'a WorkerId) -> BoxFut<'a, ()>;

    fn list_expired_locks<'a>(&'a self, now: DateTime<Utc>) -> BoxFut<'a, Vec<TaskKey>>;

    /// Cheap reachability probe against every backing store, for the `/health` route.
    fn health_check<'a>(&'a self) -> BoxFut<'a, ()>;
}
