use std::sync::Arc;
use std::time::Duration as StdDuration;

use altec_common::config::AdmissionConfig;
use altec_common::ids::WorkerId;
use altec_common::model::{Task, TaskError, TaskKey, TaskStatus};
use altec_common::AltecError;
use chrono::Utc;

use crate::executor::SegmentedExecutor;
use crate::policy::{DurationEstimator, InputDescriptor};
use crate::state_store::{AcquireOutcome, Finalization, PutOutcome, StateStore};

/// What the caller of `submit` gets back — exactly the three-way outcome from §4.2,
/// never a queued/rejected state: the Admission Guard has no queue.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    Started { task_id: altec_common::ids::TaskId },
    Attached {
        task_id: altec_common::ids::TaskId,
        current_status: TaskStatus,
    },
    SkippedRecentSuccess {
        task_id: altec_common::ids::TaskId,
        result_ref: String,
    },
}

/// C2: single-flight submission collapsing plus reclaim-on-expiry. Holds no queue — a
/// submission either starts immediately, attaches to an in-flight Task, or is
/// short-circuited by the recent-success window.
pub struct AdmissionGuard {
    store: Arc<dyn StateStore>,
    executor: Arc<SegmentedExecutor>,
    policy_table: altec_common::config::PolicyTableConfig,
    config: AdmissionConfig,
    worker_id: WorkerId,
}

impl AdmissionGuard {
    pub fn new(
        store: Arc<dyn StateStore>,
        executor: Arc<SegmentedExecutor>,
        policy_table: altec_common::config::PolicyTableConfig,
        config: AdmissionConfig,
        worker_id: WorkerId,
    ) -> Self {
        Self {
            store,
            executor,
            policy_table,
            config,
            worker_id,
        }
    }

    /// `submit(task_key, input_descriptor) → SubmitOutcome`, per §4.2 steps 1–5.
    pub async fn submit(
        &self,
        key: TaskKey,
        descriptor: InputDescriptor,
    ) -> Result<SubmitOutcome, AltecError> {
        let estimator = DurationEstimator::new(&self.policy_table);
        let policy = estimator.policy(key.kind, &descriptor);
        let fresh = Task::new(key.clone(), policy);

        let existing = match self.store.put_task_if_absent(&key, fresh).await? {
            PutOutcome::Created(task) => {
                // Nobody held this key; acquire the lock and dispatch inline.
                return self.acquire_and_dispatch(key, task).await;
            }
            PutOutcome::Existing(task) => task,
        };

        // Step 2: recent-success suppression. Past the staleness window, a COMPLETED
        // Task is treated like FAILED: re-submission starts a fresh run.
        if existing.status == TaskStatus::Completed {
            if let Some(completed_at) = existing.completed_at {
                let age = Utc::now() - completed_at;
                if age.num_seconds() < self.config.skipped_recent_success_window_secs as i64 {
                    return Ok(SubmitOutcome::SkippedRecentSuccess {
                        task_id: existing.id,
                        result_ref: existing.result_ref.unwrap_or_default(),
                    });
                }
            }
            let reset = Task::new(key.clone(), estimator.policy(key.kind, &descriptor));
            let task = match self.store.put_task_if_absent(&key, reset).await? {
                PutOutcome::Created(task) | PutOutcome::Existing(task) => task,
            };
            return self.acquire_and_dispatch(key, task).await;
        }

        // Step 3/4: RUNNING — attempt the lock. If it is still live this attaches
        // (step 3); if it has expired, the store hands us the lock and this becomes a
        // reclaim (step 4), gated on `attempts < max_reclaim_attempts`.
        if existing.status == TaskStatus::Running {
            if existing.attempts >= self.config.max_reclaim_attempts {
                return Ok(SubmitOutcome::Attached {
                    task_id: existing.id,
                    current_status: existing.status,
                });
            }
            return self.reclaim_and_dispatch(key, existing).await;
        }

        // FAILED is re-submittable — a fresh run with phase_cursor/attempts reset.
        if existing.status == TaskStatus::Failed {
            let reset = Task::new(key.clone(), estimator.policy(key.kind, &descriptor));
            let task = match self.store.put_task_if_absent(&key, reset).await? {
                PutOutcome::Created(task) | PutOutcome::Existing(task) => task,
            };
            return self.acquire_and_dispatch(key, task).await;
        }

        // PENDING/ABANDONED: no live owner, safe to dispatch directly.
        self.acquire_and_dispatch(key, existing).await
    }

    async fn acquire_and_dispatch(
        &self,
        key: TaskKey,
        task: Task,
    ) -> Result<SubmitOutcome, AltecError> {
        let lease = chrono::Duration::seconds(task.policy.lock_lease_secs as i64);
        match self
            .store
            .try_acquire_lock(&key, &self.worker_id, lease)
            .await?
        {
            AcquireOutcome::Acquired(_) => {
                self.store.set_status(&key, TaskStatus::Running).await?;
                let executor = Arc::clone(&self.executor);
                let worker_id = self.worker_id.clone();
                let run_key = key.clone();
                tokio::spawn(async move {
                    if let Err(e) = executor.run(run_key.clone(), worker_id).await {
                        tracing::error!(task_key = %run_key, error = %e, "Execution loop returned an error");
                    }
                });
                Ok(SubmitOutcome::Started { task_id: task.id })
            }
            AcquireOutcome::HeldByOther { .. } => {
                // Lost the lock-acquisition race from §4.2's tie-breaking note: the
                // winner is already RUNNING, so this submission attaches instead.
                let current = self.store.load_task(&key).await?;
                Ok(SubmitOutcome::Attached {
                    task_id: current.id,
                    current_status: current.status,
                })
            }
        }
    }

    /// Step 4's reclaim path: the existing Task is RUNNING, so only a lock that has
    /// actually expired lets us in. A successful acquisition here means the previous
    /// owner crashed — mark the Task ABANDONED (bumping `attempts`) before pushing it
    /// back to RUNNING, exactly as §4.2 step 4 orders it, so the attempts counter
    /// reflects every reclaim regardless of whether `submit` or the sweeper noticed it
    /// first.
    async fn reclaim_and_dispatch(&self, key: TaskKey, task: Task) -> Result<SubmitOutcome, AltecError> {
        let lease = chrono::Duration::seconds(task.policy.lock_lease_secs as i64);
        match self
            .store
            .try_acquire_lock(&key, &self.worker_id, lease)
            .await?
        {
            AcquireOutcome::Acquired(_) => {
                self.store.mark_abandoned(&key).await?;
                self.store.set_status(&key, TaskStatus::Running).await?;
                let executor = Arc::clone(&self.executor);
                let worker_id = self.worker_id.clone();
                let run_key = key.clone();
                tokio::spawn(async move {
                    if let Err(e) = executor.run(run_key.clone(), worker_id).await {
                        tracing::error!(task_key = %run_key, error = %e, "Execution loop returned an error");
                    }
                });
                Ok(SubmitOutcome::Started { task_id: task.id })
            }
            AcquireOutcome::HeldByOther { .. } => {
                let current = self.store.load_task(&key).await?;
                Ok(SubmitOutcome::Attached {
                    task_id: current.id,
                    current_status: current.status,
                })
            }
        }
    }

    pub async fn request_cancel(&self, key: &TaskKey) -> Result<(), AltecError> {
        self.store.request_cancel(key).await
    }
}

/// Periodic background sweep over expired locks, grounded on the teacher's
/// `recover_on_startup` (once, at boot) combined with `processor_worker_loop`'s
/// continuous `reclaim_pending` scan — ALTEC only has one State Store to recover
/// from, so the two teacher mechanisms collapse into this single interval task.
pub async fn run_reclaim_sweeper(
    store: Arc<dyn StateStore>,
    config: AdmissionConfig,
) {
    let mut interval = tokio::time::interval(StdDuration::from_secs(config.reclaim_sweep_interval_secs));
    loop {
        interval.tick().await;
        let expired = match store.list_expired_locks(Utc::now()).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(error = %e, "Reclaim sweeper failed to list expired locks");
                continue;
            }
        };

        for key in expired {
            let task = match store.load_task(&key).await {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(task_key = %key, error = %e, "Reclaim sweeper failed to load task");
                    continue;
                }
            };

            if task.status != TaskStatus::Running {
                continue;
            }

            let attempts = match store.mark_abandoned(&key).await {
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(task_key = %key, error = %e, "Reclaim sweeper failed to mark task abandoned");
                    continue;
                }
            };

            if attempts >= config.max_reclaim_attempts {
                let error = TaskError::new("too_many_reclaims", "reclaim attempts exhausted");
                let owner = task
                    .owner_worker
                    .clone()
                    .unwrap_or_else(|| WorkerId::new("unknown"));
                if let Err(e) = store
                    .finalize_task(&key, &owner, Finalization::Failed { error })
                    .await
                {
                    tracing::warn!(task_key = %key, error = %e, "Reclaim sweeper failed to finalize exhausted task");
                }
                tracing::warn!(task_key = %key, "Task exceeded max reclaim attempts, marked FAILED");
            } else {
                tracing::info!(task_key = %key, attempts, "Task marked ABANDONED, eligible for reclaim");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockAdapter;
    use crate::executor::phases::build_registry;
    use crate::state_store::InMemoryStateStore;
    use altec_common::config::{DurationClassConfig, RetryConfig};
    use altec_common::model::TaskKind;
    use std::collections::HashMap;

    fn retry_config() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    fn policy_table() -> altec_common::config::PolicyTableConfig {
        let mut classes = HashMap::new();
        classes.insert(
            "S".to_string(),
            DurationClassConfig {
                predicted_seconds_max: f64::MAX,
                heartbeat_interval_secs: 1,
                lock_lease_secs: 2,
                segment_count: 1,
                client_refresh_interval_secs: 0,
            },
        );
        altec_common::config::PolicyTableConfig {
            classes,
            class_order: vec!["S".to_string()],
        }
    }

    fn progress_config() -> altec_common::config::ProgressConfig {
        altec_common::config::ProgressConfig {
            progress_throttle_percent: 0.5,
            progress_throttle_message_changed: true,
            min_publish_interval_ms: 0,
        }
    }

    fn guard() -> AdmissionGuard {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::default());
        let adapter = Arc::new(MockAdapter::new());
        let registry = Arc::new(build_registry(adapter, retry_config()));
        let executor = Arc::new(SegmentedExecutor::new(Arc::clone(&store), registry, 3.0, progress_config()));
        AdmissionGuard::new(
            store,
            executor,
            policy_table(),
            AdmissionConfig {
                reclaim_sweep_interval_secs: 5,
                max_reclaim_attempts: 3,
                skipped_recent_success_window_secs: 3600,
            },
            WorkerId::new("test-worker"),
        )
    }

    #[tokio::test]
    async fn fresh_submission_starts() {
        let guard = guard();
        let key = TaskKey::new(TaskKind::TextProfile, "11");
        let outcome = guard
            .submit(key, InputDescriptor::default())
            .await
            .unwrap();
        assert!(matches!(outcome, SubmitOutcome::Started { .. }));
    }

    #[tokio::test]
    async fn duplicate_submission_attaches() {
        let guard = guard();
        let key = TaskKey::new(TaskKind::TextProfile, "12");
        let first = guard
            .submit(key.clone(), InputDescriptor::default())
            .await
            .unwrap();
        assert!(matches!(first, SubmitOutcome::Started { .. }));

        let second = guard
            .submit(key, InputDescriptor::default())
            .await
            .unwrap();
        assert!(matches!(second, SubmitOutcome::Attached { .. }));
    }
}
