pub mod cancel;
pub mod phases;
pub mod pipeline;
pub mod retry;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use altec_common::config::ProgressConfig;
use altec_common::ids::WorkerId;
use altec_common::model::TaskKey;
use altec_common::AltecError;
use chrono::Utc;
use tokio::sync::oneshot;

use crate::state_store::{ExtendOutcome, Finalization, ProgressUpdate, StateStore};
use cancel::{CancelReason, CancelToken};
use phases::extract_result_ref;
use pipeline::{PipelineRegistry, ProgressSink, ProgressWriter};

/// Adapts the State Store's owner-checked CAS write into the [`ProgressWriter`] seam
/// a [`ProgressSink`] writes through.
struct StoreProgressWriter {
    store: Arc<dyn StateStore>,
    key: TaskKey,
    owner_worker: WorkerId,
    phase_cursor: u32,
    checkpoint: Vec<u8>,
}

impl ProgressWriter for StoreProgressWriter {
    fn write<'a>(
        &'a self,
        global_percent: f64,
        message: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), AltecError>> + Send + 'a>> {
        Box::pin(async move {
            self.store
                .update_task_progress(
                    &self.key,
                    &self.owner_worker,
                    ProgressUpdate {
                        phase_cursor: self.phase_cursor,
                        checkpoint: self.checkpoint.clone(),
                        progress_percent: global_percent,
                        progress_message: message.to_string(),
                    },
                )
                .await
        })
    }
}

/// Runs one Task's pipeline to completion, crash, or cancellation. The lock is
/// already held by the caller (the Admission Guard) when this is dispatched; this
/// function owns the lock's entire lifetime from here — extending it on every
/// heartbeat tick and releasing it on every exit path.
pub struct SegmentedExecutor {
    store: Arc<dyn StateStore>,
    registry: Arc<PipelineRegistry>,
    deadline_multiplier: f64,
    progress: ProgressConfig,
}

impl SegmentedExecutor {
    pub fn new(
        store: Arc<dyn StateStore>,
        registry: Arc<PipelineRegistry>,
        deadline_multiplier: f64,
        progress: ProgressConfig,
    ) -> Self {
        Self {
            store,
            registry,
            deadline_multiplier,
            progress,
        }
    }

    /// The execution loop from §4.4, unchanged in its invariants: pipeline-as-
    /// ordered-phase-list, checkpoint-at-phase-boundary, independent heartbeat timer,
    /// cancellation token, deadline.
    pub async fn run(&self, key: TaskKey, worker_id: WorkerId) -> Result<(), AltecError> {
        let task = self.store.load_task(&key).await?;
        let phases = self
            .registry
            .phases(key.kind)
            .ok_or_else(|| AltecError::InvalidKind(key.kind.to_string()))?
            .to_vec();
        let total = phases.len() as u32;

        let lease = chrono::Duration::seconds(task.policy.lock_lease_secs as i64);
        let heartbeat_interval =
            std::time::Duration::from_secs(task.policy.heartbeat_interval_secs);
        let deadline =
            task.started_at + chrono::Duration::seconds(
                (task.policy.predicted_seconds * self.deadline_multiplier) as i64,
            );

        let (cancel_source, cancel_token) = cancel::channel();
        let (hb_stop_tx, hb_stop_rx) = oneshot::channel::<()>();
        let heartbeat_handle = tokio::spawn(heartbeat_task(
            Arc::clone(&self.store),
            key.clone(),
            worker_id.clone(),
            lease,
            heartbeat_interval,
            deadline,
            cancel_source,
            hb_stop_rx,
        ));

        let result = self
            .run_phases(&key, &worker_id, &task.checkpoint, task.phase_cursor, &phases, total, &cancel_token)
            .await;

        let _ = hb_stop_tx.send(());
        let _ = heartbeat_handle.await;

        match result {
            PhaseLoopOutcome::Completed(checkpoint) => {
                let result_ref = extract_result_ref(&checkpoint)
                    .unwrap_or_else(|| format!("altec-result:{}", task.id));
                self.store
                    .finalize_task(&key, &worker_id, Finalization::Completed { result_ref })
                    .await?;
                tracing::info!(task_key = %key, task_id = %task.id, "Task completed");
                Ok(())
            }
            PhaseLoopOutcome::Failed(error) => {
                self.store
                    .finalize_task(&key, &worker_id, Finalization::Failed { error: error.clone() })
                    .await?;
                tracing::warn!(task_key = %key, task_id = %task.id, kind = %error.kind, "Task failed");
                Ok(())
            }
            PhaseLoopOutcome::SilentExit(reason) => {
                tracing::info!(task_key = %key, task_id = %task.id, ?reason, "Execution exited silently, new owner will continue");
                Ok(())
            }
            PhaseLoopOutcome::Orphaned => {
                tracing::info!(task_key = %key, task_id = %task.id, "Resource deleted mid-run, aborting without finalize");
                Ok(())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_phases(
        &self,
        key: &TaskKey,
        worker_id: &WorkerId,
        initial_checkpoint: &[u8],
        phase_cursor: u32,
        phases: &[Arc<dyn pipeline::Phase>],
        total: u32,
        cancel_token: &CancelToken,
    ) -> PhaseLoopOutcome {
        let mut checkpoint = initial_checkpoint.to_vec();

        for i in (phase_cursor as usize)..phases.len() {
            if cancel_token.is_cancelled() {
                return self.outcome_for_cancel(cancel_token);
            }

            // Pre-phase tombstone check (§4.2): a resource deleted mid-run aborts the
            // very next phase boundary without finalizing, rather than waiting for the
            // (much coarser) heartbeat interval to notice.
            match self.store.load_task(key).await {
                Ok(task) if task.resource_deleted => return PhaseLoopOutcome::Orphaned,
                _ => {}
            }

            let phase = &phases[i];
            let writer = Arc::new(StoreProgressWriter {
                store: Arc::clone(&self.store),
                key: key.clone(),
                owner_worker: worker_id.clone(),
                phase_cursor: (i + 1) as u32,
                checkpoint: checkpoint.clone(),
            });
            let sink = ProgressSink::new(
                i as u32,
                total,
                self.progress.progress_throttle_percent,
                self.progress.progress_throttle_message_changed,
                self.progress.min_publish_interval_ms,
                writer,
            );

            match phase.run(&checkpoint, &sink, cancel_token).await {
                Ok(next_checkpoint) => {
                    checkpoint = next_checkpoint;
                    let percent = ((i + 1) as f64 / total as f64) * 100.0;
                    let message = format!("{} done", phase.name());
                    if let Err(e) = self
                        .store
                        .update_task_progress(
                            key,
                            worker_id,
                            ProgressUpdate {
                                phase_cursor: (i + 1) as u32,
                                checkpoint: checkpoint.clone(),
                                progress_percent: percent,
                                progress_message: message,
                            },
                        )
                        .await
                    {
                        if e == AltecError::NotOwner {
                            return PhaseLoopOutcome::SilentExit(CancelReason::LockLost);
                        }
                        return PhaseLoopOutcome::Failed(e.into());
                    }
                }
                Err(pipeline::PhaseError::Cancelled) => {
                    return self.outcome_for_cancel(cancel_token);
                }
                Err(pipeline::PhaseError::ResourceDeleted) => {
                    return PhaseLoopOutcome::Orphaned;
                }
                Err(pipeline::PhaseError::Transient(msg)) | Err(pipeline::PhaseError::Permanent(msg)) => {
                    return PhaseLoopOutcome::Failed(altec_common::model::TaskError::new(
                        "permanent_upstream",
                        msg,
                    ));
                }
            }
        }

        PhaseLoopOutcome::Completed(checkpoint)
    }

    fn outcome_for_cancel(&self, cancel_token: &CancelToken) -> PhaseLoopOutcome {
        match cancel_token.reason() {
            Some(CancelReason::LockLost) | None => {
                PhaseLoopOutcome::SilentExit(CancelReason::LockLost)
            }
            Some(CancelReason::ClientRequested) => PhaseLoopOutcome::Failed(
                altec_common::model::TaskError::new("cancelled", "cancelled by client"),
            ),
            Some(CancelReason::DeadlineExceeded) => {
                PhaseLoopOutcome::Failed(altec_common::model::TaskError::new(
                    "timeout",
                    "deadline exceeded",
                ))
            }
        }
    }
}

enum PhaseLoopOutcome {
    Completed(Vec<u8>),
    Failed(altec_common::model::TaskError),
    SilentExit(CancelReason),
    Orphaned,
}

/// Independent heartbeat task — runs until cancelled or the lock is lost, extending
/// the lease on each tick (the heartbeat *is* the lease extension, per the Lock model
/// note) and watching for client cancellation / deadline expiry. Grounded on the
/// teacher's `heartbeat_task`, spawned alongside the worker loop and stopped via a
/// oneshot channel on exit.
#[allow(clippy::too_many_arguments)]
async fn heartbeat_task(
    store: Arc<dyn StateStore>,
    key: TaskKey,
    worker_id: WorkerId,
    lease: chrono::Duration,
    interval: std::time::Duration,
    deadline: chrono::DateTime<Utc>,
    cancel_source: cancel::CancelSource,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                if Utc::now() >= deadline {
                    tracing::warn!(task_key = %key, "Task deadline exceeded, cancelling");
                    cancel_source.cancel(CancelReason::DeadlineExceeded);
                    break;
                }

                match store.extend_lock(&key, &worker_id, lease).await {
                    Ok(ExtendOutcome::Ok) => {}
                    Ok(ExtendOutcome::Lost) => {
                        tracing::warn!(task_key = %key, "Lock lease lost, cancelling execution");
                        cancel_source.cancel(CancelReason::LockLost);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(task_key = %key, error = %e, "Failed to extend lock lease");
                    }
                }

                if let Ok(task) = store.load_task(&key).await {
                    if task.cancel_requested {
                        tracing::info!(task_key = %key, "Client cancellation observed");
                        cancel_source.cancel(CancelReason::ClientRequested);
                        break;
                    }
                }
            }
            _ = &mut stop => {
                break;
            }
        }
    }
}
