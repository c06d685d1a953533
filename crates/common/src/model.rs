use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ids::{TaskId, WorkerId};

/// The kind of analysis a Task runs. Determines which pipeline the Segmented Executor
/// dispatches and how the Duration Estimator classifies the job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    TextProfile,
    ImageAnalyze,
    AudioTranscribe,
    VideoDeep,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TextProfile => "text-profile",
            Self::ImageAnalyze => "image-analyze",
            Self::AudioTranscribe => "audio-transcribe",
            Self::VideoDeep => "video-deep",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text-profile" => Some(Self::TextProfile),
            "image-analyze" => Some(Self::ImageAnalyze),
            "audio-transcribe" => Some(Self::AudioTranscribe),
            "video-deep" => Some(Self::VideoDeep),
            _ => None,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stable identity of a Task, independent of its surrogate `TaskId` row key.
/// At most one live Task exists per `TaskKey` (enforced by the State Store).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskKey {
    pub kind: TaskKind,
    pub resource_id: String,
}

impl TaskKey {
    pub fn new(kind: TaskKind, resource_id: impl Into<String>) -> Self {
        Self {
            kind,
            resource_id: resource_id.into(),
        }
    }

    /// `task:{kind}:{resource_id}` — the wire-shape key namespace from §6.
    pub fn store_key(&self) -> String {
        format!("task:{}:{}", self.kind, self.resource_id)
    }

    /// `lock:{kind}:{resource_id}` — the companion ephemeral-lock namespace.
    pub fn lock_key(&self) -> String {
        format!("lock:{}:{}", self.kind, self.resource_id)
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.resource_id)
    }
}

/// Task lifecycle states. Transitions form the DAG from §3/§4.4:
/// PENDING → RUNNING → {COMPLETED, FAILED}; RUNNING → ABANDONED → RUNNING is the only cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Abandoned,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "abandoned" => Self::Abandoned,
            other => {
                tracing::warn!(status = other, "Unknown task status, defaulting to Pending");
                Self::Pending
            }
        }
    }
}

/// Error kind + message recorded on a FAILED Task. Never carries a stack trace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: String,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<crate::AltecError> for TaskError {
    fn from(e: crate::AltecError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

/// Predicted job duration class, driving heartbeat/lease/segment/refresh policy (§4.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DurationClass {
    S,
    M,
    L,
    Xl,
}

impl fmt::Display for DurationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::S => "S",
            Self::M => "M",
            Self::L => "L",
            Self::Xl => "XL",
        };
        write!(f, "{}", s)
    }
}

/// How often the client-facing credential should be refreshed while polling.
/// `Off` for class S jobs — the normal token's lifetime comfortably outlasts them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPolicy {
    Off,
    Every(u64),
}

/// The per-Task schedule computed once by the Duration Estimator (C3) and persisted
/// alongside the Task so that reclaims reuse identical parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub duration_class: DurationClass,
    pub predicted_seconds: f64,
    pub heartbeat_interval_secs: u64,
    pub lock_lease_secs: u64,
    pub segment_count: u32,
    pub client_refresh_interval_secs: RefreshPolicy,
}

/// Durable Task row (§3). The State Store's unit of CAS.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub key: TaskKey,
    pub status: TaskStatus,
    pub phase_cursor: u32,
    pub checkpoint: Vec<u8>,
    pub progress_percent: f64,
    pub progress_message: String,
    pub policy: Policy,
    pub attempts: u32,
    pub cancel_requested: bool,
    /// Set when the underlying resource (outside ALTEC) was deleted. An in-flight
    /// execution observes this on its next pre-phase check and aborts with
    /// `resource_deleted` instead of finalizing (§4.2 edge policies).
    pub resource_deleted: bool,
    pub owner_worker: Option<WorkerId>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<TaskError>,
    pub result_ref: Option<String>,
}

impl Task {
    /// A brand-new Task for a freshly-admitted key, PENDING, phase 0, no checkpoint.
    pub fn new(key: TaskKey, policy: Policy) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            key,
            status: TaskStatus::Pending,
            phase_cursor: 0,
            checkpoint: Vec::new(),
            progress_percent: 0.0,
            progress_message: String::new(),
            policy,
            attempts: 0,
            cancel_requested: false,
            resource_deleted: false,
            owner_worker: None,
            started_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
            result_ref: None,
        }
    }

    /// Checkpoint is only meaningful mid-execution — §3 invariant.
    pub fn checkpoint_valid(&self) -> bool {
        self.phase_cursor > 0
            && matches!(self.status, TaskStatus::Running | TaskStatus::Abandoned)
    }
}
