use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use altec_common::model::TaskKind;
use altec_common::AltecError;
use tokio::sync::Mutex;

use super::cancel::CancelToken;

/// Classification of a phase failure, per §4.4/§7. `Transient` is retried by the
/// inner bounded-retry loop before being promoted here as `Permanent`.
#[derive(Debug, Clone)]
pub enum PhaseError {
    Transient(String),
    Permanent(String),
    ResourceDeleted,
    Cancelled,
}

impl From<PhaseError> for AltecError {
    fn from(e: PhaseError) -> Self {
        match e {
            PhaseError::Transient(message) => AltecError::ModelAdapter { message, transient: true },
            PhaseError::Permanent(message) => AltecError::ModelAdapter { message, transient: false },
            PhaseError::ResourceDeleted => AltecError::ResourceDeleted,
            PhaseError::Cancelled => AltecError::CancelledByClient,
        }
    }
}

/// Sink a phase reports progress through. Maps the phase's local 0–100 percent onto
/// the global band `[i/N, (i+1)/N]` and throttles writes on two independent axes:
/// content (only updates that advance global percent by the configured threshold, or
/// whose message changed, are considered worth writing at all) and rate (even a
/// worth-writing update is held back until `min_publish_interval` has elapsed since
/// the last persisted write, protecting the State Store from poll-rate amplification
/// on jobs with many small phases). The final write of a band (`global == 100.0`)
/// always goes through regardless of rate limiting, so completion is never swallowed.
pub struct ProgressSink {
    band_start: f64,
    band_end: f64,
    throttle_percent: f64,
    throttle_message_changed: bool,
    min_publish_interval: std::time::Duration,
    writer: Arc<dyn ProgressWriter>,
    last: Mutex<(f64, String, Option<std::time::Instant>)>,
}

/// Abstraction over "publish this global percent/message" so the sink doesn't need to
/// know about the State Store directly.
pub trait ProgressWriter: Send + Sync {
    fn write<'a>(
        &'a self,
        global_percent: f64,
        message: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), AltecError>> + Send + 'a>>;
}

impl ProgressSink {
    pub fn new(
        phase_index: u32,
        total_phases: u32,
        throttle_percent: f64,
        throttle_message_changed: bool,
        min_publish_interval_ms: u64,
        writer: Arc<dyn ProgressWriter>,
    ) -> Self {
        let total = total_phases.max(1) as f64;
        Self {
            band_start: phase_index as f64 / total * 100.0,
            band_end: (phase_index + 1) as f64 / total * 100.0,
            throttle_percent,
            throttle_message_changed,
            min_publish_interval: std::time::Duration::from_millis(min_publish_interval_ms),
            writer,
            last: Mutex::new((-1.0, String::new(), None)),
        }
    }

    /// Reports local progress (0–100 within this phase's band).
    pub async fn report(&self, local_percent: f64, message: &str) -> Result<(), AltecError> {
        let local_percent = local_percent.clamp(0.0, 100.0);
        let global = self.band_start + (self.band_end - self.band_start) * (local_percent / 100.0);

        let mut last = self.last.lock().await;
        let delta = (global - last.0).abs();
        let message_changed = self.throttle_message_changed && message != last.1;
        let first_write = last.0 < 0.0;

        if !(delta >= self.throttle_percent || message_changed || first_write) {
            return Ok(());
        }

        let now = std::time::Instant::now();
        let rate_limited = last
            .2
            .is_some_and(|previous| now.duration_since(previous) < self.min_publish_interval);
        if rate_limited && global < 100.0 {
            return Ok(());
        }

        self.writer.write(global, message).await?;
        *last = (global, message.to_string(), Some(now));
        Ok(())
    }
}

/// One named, ordered unit of pipeline progress and resumption. `run` receives the
/// checkpoint produced by the previous phase and returns the checkpoint consumed by
/// the next; the executor never inspects its contents.
pub trait Phase: Send + Sync {
    fn name(&self) -> &'static str;

    fn run<'a>(
        &'a self,
        checkpoint: &'a [u8],
        sink: &'a ProgressSink,
        cancel: &'a CancelToken,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, PhaseError>> + Send + 'a>>;
}

/// `TaskKind → Vec<Phase>`, populated at startup exactly once — the Rust-native
/// replacement for a single process-wide scheduler with decorators on functions.
pub struct PipelineRegistry {
    pipelines: HashMap<TaskKind, Vec<Arc<dyn Phase>>>,
}

impl PipelineRegistry {
    pub fn new(pipelines: HashMap<TaskKind, Vec<Arc<dyn Phase>>>) -> Self {
        Self { pipelines }
    }

    pub fn phases(&self, kind: TaskKind) -> Option<&[Arc<dyn Phase>]> {
        self.pipelines.get(&kind).map(|v| v.as_slice())
    }

    pub fn phase_names(&self, kind: TaskKind) -> Vec<&'static str> {
        self.pipelines
            .get(&kind)
            .map(|phases| phases.iter().map(|p| p.name()).collect())
            .unwrap_or_default()
    }
}
