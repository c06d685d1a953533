use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use altec_common::ids::WorkerId;
use altec_common::model::{Task, TaskKey, TaskStatus};
use altec_common::{AltecError, Result};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::traits::{
    AcquireOutcome, ExtendOutcome, Finalization, Lock, ProgressUpdate, PutOutcome, StateStore,
};

/// In-memory double for [`StateStore`], used by every unit test in this crate. CAS
/// semantics are enforced in plain Rust rather than SQL/Lua.
#[derive(Default)]
pub struct InMemoryStateStore {
    tasks: Mutex<HashMap<TaskKey, Task>>,
    locks: Mutex<HashMap<TaskKey, Lock>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

impl StateStore for InMemoryStateStore {
    fn put_task_if_absent<'a>(
        &'a self,
        key: &'a TaskKey,
        initial: Task,
    ) -> BoxFut<'a, PutOutcome> {
        Box::pin(async move {
            let mut tasks = self.tasks.lock().await;
            if let Some(existing) = tasks.get(key) {
                Ok(PutOutcome::Existing(existing.clone()))
            } else {
                tasks.insert(key.clone(), initial.clone());
                Ok(PutOutcome::Created(initial))
            }
        })
    }

    fn load_task<'a>(&'a self, key: &'a TaskKey) -> BoxFut<'a, Task> {
        Box::pin(async move {
            let tasks = self.tasks.lock().await;
            tasks
                .get(key)
                .cloned()
                .ok_or_else(|| AltecError::TaskNotFound(key.to_string()))
        })
    }

    fn update_task_progress<'a>(
        &'a self,
        key: &'a TaskKey,
        owner_worker: &'a WorkerId,
        update: ProgressUpdate,
    ) -> BoxFut<'a, ()> {
        Box::pin(async move {
            let mut tasks = self.tasks.lock().await;
            let task = tasks
                .get_mut(key)
                .ok_or_else(|| AltecError::TaskNotFound(key.to_string()))?;
            if task.owner_worker.as_ref() != Some(owner_worker) {
                return Err(AltecError::NotOwner);
            }
            task.phase_cursor = update.phase_cursor;
            task.checkpoint = update.checkpoint;
            task.progress_percent = update.progress_percent;
            task.progress_message = update.progress_message;
            task.updated_at = Utc::now();
            Ok(())
        })
    }

    fn finalize_task<'a>(
        &'a self,
        key: &'a TaskKey,
        owner_worker: &'a WorkerId,
        finalization: Finalization,
    ) -> BoxFut<'a, ()> {
        Box::pin(async move {
            let mut tasks = self.tasks.lock().await;
            let task = tasks
                .get_mut(key)
                .ok_or_else(|| AltecError::TaskNotFound(key.to_string()))?;
            if task.owner_worker.as_ref() != Some(owner_worker) {
                return Err(AltecError::NotOwner);
            }
            let now = Utc::now();
            match finalization {
                Finalization::Completed { result_ref } => {
                    task.status = TaskStatus::Completed;
                    task.result_ref = Some(result_ref);
                    task.error = None;
                }
                Finalization::Failed { error } => {
                    task.status = TaskStatus::Failed;
                    task.error = Some(error);
                }
            }
            task.completed_at = Some(now);
            task.updated_at = now;
            task.owner_worker = None;
            drop(tasks);
            self.locks.lock().await.remove(key);
            Ok(())
        })
    }

    fn set_status<'a>(&'a self, key: &'a TaskKey, status: TaskStatus) -> BoxFut<'a, ()> {
        Box::pin(async move {
            let mut tasks = self.tasks.lock().await;
            let task = tasks
                .get_mut(key)
                .ok_or_else(|| AltecError::TaskNotFound(key.to_string()))?;
            task.status = status;
            task.updated_at = Utc::now();
            Ok(())
        })
    }

    fn mark_abandoned<'a>(&'a self, key: &'a TaskKey) -> BoxFut<'a, u32> {
        Box::pin(async move {
            let mut tasks = self.tasks.lock().await;
            let task = tasks
                .get_mut(key)
                .ok_or_else(|| AltecError::TaskNotFound(key.to_string()))?;
            task.status = TaskStatus::Abandoned;
            task.attempts += 1;
            task.updated_at = Utc::now();
            Ok(task.attempts)
        })
    }

    fn request_cancel<'a>(&'a self, key: &'a TaskKey) -> BoxFut<'a, ()> {
        Box::pin(async move {
            let mut tasks = self.tasks.lock().await;
            let task = tasks
                .get_mut(key)
                .ok_or_else(|| AltecError::TaskNotFound(key.to_string()))?;
            task.cancel_requested = true;
            Ok(())
        })
    }

    fn request_tombstone<'a>(&'a self, key: &'a TaskKey) -> BoxFut<'a, ()> {
        Box::pin(async move {
            let mut tasks = self.tasks.lock().await;
            let task = tasks
                .get_mut(key)
                .ok_or_else(|| AltecError::TaskNotFound(key.to_string()))?;
            task.resource_deleted = true;
            Ok(())
        })
    }

    fn try_acquire_lock<'a>(
        &'a self,
        key: &'a TaskKey,
        worker_id: &'a WorkerId,
        lease: chrono::Duration,
    ) -> BoxFut<'a, AcquireOutcome> {
        Box::pin(async move {
            let mut locks = self.locks.lock().await;
            let now = Utc::now();
            if let Some(existing) = locks.get(key) {
                if existing.lease_deadline > now && &existing.owner_worker != worker_id {
                    return Ok(AcquireOutcome::HeldByOther {
                        owner_worker: existing.owner_worker.clone(),
                        remaining: existing.lease_deadline - now,
                    });
                }
            }
            let lock = Lock {
                task_key: key.clone(),
                owner_worker: worker_id.clone(),
                acquired_at: now,
                lease_deadline: now + lease,
            };
            locks.insert(key.clone(), lock.clone());
            drop(locks);
            let mut tasks = self.tasks.lock().await;
            if let Some(task) = tasks.get_mut(key) {
                task.owner_worker = Some(worker_id.clone());
            }
            Ok(AcquireOutcome::Acquired(lock))
        })
    }

    fn extend_lock<'a>(
        &'a self,
        key: &'a TaskKey,
        worker_id: &'a WorkerId,
        lease: chrono::Duration,
    ) -> BoxFut<'a, ExtendOutcome> {
        Box::pin(async move {
            let mut locks = self.locks.lock().await;
            match locks.get_mut(key) {
                Some(lock) if &lock.owner_worker == worker_id => {
                    lock.lease_deadline = Utc::now() + lease;
                    Ok(ExtendOutcome::Ok)
                }
                _ => Ok(ExtendOutcome::Lost),
            }
        })
    }

    fn release_lock<'a>(&'a self, key: &'a TaskKey, worker_id: &'a WorkerId) -> BoxFut<'a, ()> {
        Box::pin(async move {
            let mut locks = self.locks.lock().await;
            if let Some(lock) = locks.get(key) {
                if &lock.owner_worker == worker_id {
                    locks.remove(key);
                }
            }
            Ok(())
        })
    }

    fn list_expired_locks<'a>(&'a self, now: DateTime<Utc>) -> BoxFut<'a, Vec<TaskKey>> {
        Box::pin(async move {
            let locks = self.locks.lock().await;
            Ok(locks
                .values()
                .filter(|l| l.lease_deadline <= now)
                .map(|l| l.task_key.clone())
                .collect())
        })
    }

    fn health_check<'a>(&'a self) -> BoxFut<'a, ()> {
        Box::pin(async move { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use altec_common::model::{DurationClass, Policy, RefreshPolicy, TaskKind};

    fn policy() -> Policy {
        Policy {
            duration_class: DurationClass::S,
            predicted_seconds: 15.0,
            heartbeat_interval_secs: 60,
            lock_lease_secs: 300,
            segment_count: 4,
            client_refresh_interval_secs: RefreshPolicy::Off,
        }
    }

    #[tokio::test]
    async fn put_task_if_absent_only_creates_once() {
        let store = InMemoryStateStore::new();
        let key = TaskKey::new(TaskKind::TextProfile, "1");
        let task = Task::new(key.clone(), policy());
        let first = store.put_task_if_absent(&key, task.clone()).await.unwrap();
        assert!(matches!(first, PutOutcome::Created(_)));
        let second = store.put_task_if_absent(&key, task).await.unwrap();
        assert!(matches!(second, PutOutcome::Existing(_)));
    }

    #[tokio::test]
    async fn second_lock_acquire_sees_held_by_other() {
        let store = InMemoryStateStore::new();
        let key = TaskKey::new(TaskKind::TextProfile, "1");
        let task = Task::new(key.clone(), policy());
        store.put_task_if_absent(&key, task).await.unwrap();

        let w1 = WorkerId::new("w1");
        let w2 = WorkerId::new("w2");
        let lease = chrono::Duration::seconds(300);

        let first = store.try_acquire_lock(&key, &w1, lease).await.unwrap();
        assert!(matches!(first, AcquireOutcome::Acquired(_)));

        let second = store.try_acquire_lock(&key, &w2, lease).await.unwrap();
        assert!(matches!(second, AcquireOutcome::HeldByOther { .. }));
    }

    #[tokio::test]
    async fn update_progress_rejects_non_owner() {
        let store = InMemoryStateStore::new();
        let key = TaskKey::new(TaskKind::TextProfile, "1");
        let task = Task::new(key.clone(), policy());
        store.put_task_if_absent(&key, task).await.unwrap();

        let w1 = WorkerId::new("w1");
        let w2 = WorkerId::new("w2");
        store
            .try_acquire_lock(&key, &w1, chrono::Duration::seconds(300))
            .await
            .unwrap();

        let update = ProgressUpdate {
            phase_cursor: 1,
            checkpoint: vec![1, 2, 3],
            progress_percent: 25.0,
            progress_message: "phase done".into(),
        };
        let result = store.update_task_progress(&key, &w2, update).await;
        assert_eq!(result, Err(AltecError::NotOwner));
    }

    #[tokio::test]
    async fn expired_locks_are_listed_and_pruned_on_release() {
        let store = InMemoryStateStore::new();
        let key = TaskKey::new(TaskKind::TextProfile, "1");
        let task = Task::new(key.clone(), policy());
        store.put_task_if_absent(&key, task).await.unwrap();
        let w1 = WorkerId::new("w1");
        store
            .try_acquire_lock(&key, &w1, chrono::Duration::seconds(-1))
            .await
            .unwrap();

        let expired = store.list_expired_locks(Utc::now()).await.unwrap();
        assert_eq!(expired, vec![key.clone()]);

        store.release_lock(&key, &w1).await.unwrap();
        let expired = store.list_expired_locks(Utc::now()).await.unwrap();
        assert!(expired.is_empty());
    }
}
