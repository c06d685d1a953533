use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use altec_common::ids::WorkerId;
use altec_common::model::{Task, TaskKey, TaskStatus};
use altec_common::{AltecError, Result};
use chrono::{DateTime, Utc};

use crate::circuit_breaker::CircuitBreaker;

use super::postgres::{PostgresTaskStore, PutResult};
use super::redis_lock::RedisLockStore;
use super::traits::{
    AcquireOutcome, ExtendOutcome, Finalization, ProgressUpdate, PutOutcome, StateStore,
};

/// Production `StateStore`: durable Task rows in Postgres, ephemeral locks in Redis.
/// Dispatches each trait method to whichever backend owns that piece of state,
/// keeping the durable `owner_worker` column in sync with lock wins/losses for
/// display purposes (the lock itself is authoritative).
///
/// Every Postgres/Redis call is gated through the matching circuit breaker: a tripped
/// breaker fails the call fast with `StoreUnavailable` instead of letting it queue up
/// against a backend that's already down.
pub struct HybridStateStore {
    tasks: PostgresTaskStore,
    locks: RedisLockStore,
    postgres_breaker: Arc<CircuitBreaker>,
    redis_breaker: Arc<CircuitBreaker>,
}

impl HybridStateStore {
    pub fn new(
        tasks: PostgresTaskStore,
        locks: RedisLockStore,
        postgres_breaker: Arc<CircuitBreaker>,
        redis_breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            tasks,
            locks,
            postgres_breaker,
            redis_breaker,
        }
    }
}

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Runs `fut` through `breaker`: rejected outright while the circuit is open, and
/// recorded as a success/failure (only hard-dependency errors count as failures —
/// a `NotFound` or similar domain error shouldn't trip the breaker) otherwise.
async fn guarded<T>(breaker: &CircuitBreaker, fut: impl Future<Output = Result<T>>) -> Result<T> {
    if !breaker.allow() {
        return Err(AltecError::StoreUnavailable(format!(
            "{} circuit open",
            breaker.name()
        )));
    }
    match fut.await {
        Ok(v) => {
            breaker.record_success();
            Ok(v)
        }
        Err(e) => {
            if e.is_hard_dependency() {
                breaker.record_failure();
            }
            Err(e)
        }
    }
}

impl StateStore for HybridStateStore {
    fn put_task_if_absent<'a>(&'a self, key: &'a TaskKey, initial: Task) -> BoxFut<'a, PutOutcome> {
        Box::pin(async move {
            let result = guarded(&self.postgres_breaker, async {
                Ok(self.tasks.put_task_if_absent(key, &initial).await?)
            })
            .await?;
            Ok(match result {
                PutResult::Created(task) => PutOutcome::Created(task),
                PutResult::Existing(task) => PutOutcome::Existing(task),
            })
        })
    }

    fn load_task<'a>(&'a self, key: &'a TaskKey) -> BoxFut<'a, Task> {
        Box::pin(async move {
            guarded(&self.postgres_breaker, async { Ok(self.tasks.load_task(key).await?) }).await
        })
    }

    fn update_task_progress<'a>(
        &'a self,
        key: &'a TaskKey,
        owner_worker: &'a WorkerId,
        update: ProgressUpdate,
    ) -> BoxFut<'a, ()> {
        Box::pin(async move {
            guarded(&self.postgres_breaker, async {
                self.tasks
                    .update_task_progress(
                        key,
                        owner_worker,
                        update.phase_cursor,
                        &update.checkpoint,
                        update.progress_percent,
                        &update.progress_message,
                    )
                    .await?;
                Ok(())
            })
            .await
        })
    }

    fn finalize_task<'a>(
        &'a self,
        key: &'a TaskKey,
        owner_worker: &'a WorkerId,
        finalization: Finalization,
    ) -> BoxFut<'a, ()> {
        Box::pin(async move {
            let (status, result_ref, error) = match &finalization {
                Finalization::Completed { result_ref } => {
                    (TaskStatus::Completed, Some(result_ref.as_str()), None)
                }
                Finalization::Failed { error } => (TaskStatus::Failed, None, Some(error)),
            };
            guarded(&self.postgres_breaker, async {
                self.tasks
                    .finalize_task(key, owner_worker, status, result_ref, error)
                    .await?;
                Ok(())
            })
            .await?;
            guarded(&self.redis_breaker, async {
                Ok(self.locks.release_lock(key, owner_worker).await?)
            })
            .await?;
            Ok(())
        })
    }

    fn set_status<'a>(&'a self, key: &'a TaskKey, status: TaskStatus) -> BoxFut<'a, ()> {
        Box::pin(async move {
            guarded(&self.postgres_breaker, async {
                Ok(self.tasks.set_status(key, status).await?)
            })
            .await
        })
    }

    fn request_cancel<'a>(&'a self, key: &'a TaskKey) -> BoxFut<'a, ()> {
        Box::pin(async move {
            guarded(&self.postgres_breaker, async {
                Ok(self.tasks.request_cancel(key).await?)
            })
            .await
        })
    }

    fn mark_abandoned<'a>(&'a self, key: &'a TaskKey) -> BoxFut<'a, u32> {
        Box::pin(async move {
            guarded(&self.postgres_breaker, async {
                Ok(self.tasks.mark_abandoned(key).await?)
            })
            .await
        })
    }

    fn request_tombstone<'a>(&'a self, key: &'a TaskKey) -> BoxFut<'a, ()> {
        Box::pin(async move {
            guarded(&self.postgres_breaker, async {
                Ok(self.tasks.request_tombstone(key).await?)
            })
            .await
        })
    }

    fn try_acquire_lock<'a>(
        &'a self,
        key: &'a TaskKey,
        worker_id: &'a WorkerId,
        lease: chrono::Duration,
    ) -> BoxFut<'a, AcquireOutcome> {
        Box::pin(async move {
            let outcome = guarded(&self.redis_breaker, async {
                Ok(self.locks.try_acquire_lock(key, worker_id, lease).await?)
            })
            .await?;
            if matches!(outcome, AcquireOutcome::Acquired(_)) {
                guarded(&self.postgres_breaker, async {
                    Ok(self.tasks.set_owner(key, Some(worker_id)).await?)
                })
                .await?;
            }
            Ok(outcome)
        })
    }

    fn extend_lock<'a>(
        &'a self,
        key: &'a TaskKey,
        worker_id: &'a WorkerId,
        lease: chrono::Duration,
    ) -> BoxFut<'a, ExtendOutcome> {
        Box::pin(async move {
            guarded(&self.redis_breaker, async {
                Ok(self.locks.extend_lock(key, worker_id, lease).await?)
            })
            .await
        })
    }

    fn release_lock<'a>(&'a self, key: &'a TaskKey, worker_id: &'a WorkerId) -> BoxFut<'a, ()> {
        Box::pin(async move {
            guarded(&self.redis_breaker, async {
                Ok(self.locks.release_lock(key, worker_id).await?)
            })
            .await?;
            guarded(&self.postgres_breaker, async {
                Ok(self.tasks.set_owner(key, None).await?)
            })
            .await?;
            Ok(())
        })
    }

    fn list_expired_locks<'a>(&'a self, now: DateTime<Utc>) -> BoxFut<'a, Vec<TaskKey>> {
        Box::pin(async move {
            guarded(&self.redis_breaker, async {
                Ok(self.locks.list_expired_locks(now).await?)
            })
            .await
        })
    }

    fn health_check<'a>(&'a self) -> BoxFut<'a, ()> {
        Box::pin(async move {
            self.tasks.health_check().await?;
            self.locks.health_check().await?;
            Ok(())
        })
    }
}
