use altec_common::model::{Task, TaskError, TaskStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::credentials::{needs_refresh, Credential, CredentialIssuer};
use crate::executor::pipeline::PipelineRegistry;

/// The read model C5 serves to polling clients, exactly the field set from §4.5 plus
/// the `refresh` field C6 piggybacks on it.
#[derive(Clone, Debug, Serialize)]
pub struct TaskView {
    pub status: TaskStatus,
    pub phase_cursor: u32,
    pub current_phase_name: Option<&'static str>,
    pub progress_percent: f64,
    pub progress_message: String,
    pub attempts: u32,
    pub processing_time_secs: f64,
    pub error: Option<TaskError>,
    pub result_ref: Option<String>,
    pub refresh: Option<Credential>,
}

impl TaskView {
    /// Builds a `TaskView` from a Task row. `incoming_token_expiry` is the expiry of
    /// whatever credential the polling client presented (decoded by the caller before
    /// this is called) — `None` if the client presented none or it failed to decode.
    pub fn build(
        task: &Task,
        registry: &PipelineRegistry,
        issuer: &dyn CredentialIssuer,
        incoming_token_expiry: Option<DateTime<Utc>>,
    ) -> Self {
        let current_phase_name = registry
            .phase_names(task.key.kind)
            .get(task.phase_cursor as usize)
            .copied();

        let processing_time_secs = match task.completed_at {
            Some(completed_at) => (completed_at - task.started_at).num_milliseconds() as f64 / 1000.0,
            None => (Utc::now() - task.started_at).num_milliseconds() as f64 / 1000.0,
        };

        let refresh = if needs_refresh(task.policy.client_refresh_interval_secs, incoming_token_expiry) {
            issuer.issue(&task.key.store_key()).ok()
        } else {
            None
        };

        Self {
            status: task.status,
            phase_cursor: task.phase_cursor,
            current_phase_name,
            progress_percent: task.progress_percent,
            progress_message: task.progress_message.clone(),
            attempts: task.attempts,
            processing_time_secs,
            error: task.error.clone(),
            result_ref: task.result_ref.clone(),
            refresh,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockAdapter;
    use crate::credentials::JwtCredentialIssuer;
    use crate::executor::phases::build_registry;
    use altec_common::config::RetryConfig;
    use altec_common::model::{DurationClass, Policy, RefreshPolicy, TaskKey, TaskKind};
    use chrono::Duration;
    use std::sync::Arc;

    fn registry() -> PipelineRegistry {
        let adapter = Arc::new(MockAdapter::new());
        build_registry(
            adapter,
            RetryConfig {
                max_attempts: 3,
                initial_backoff_ms: 1,
                max_backoff_ms: 4,
                backoff_multiplier: 2.0,
                jitter: false,
            },
        )
    }

    fn policy(refresh: RefreshPolicy) -> Policy {
        Policy {
            duration_class: DurationClass::S,
            predicted_seconds: 15.0,
            heartbeat_interval_secs: 60,
            lock_lease_secs: 300,
            segment_count: 4,
            client_refresh_interval_secs: refresh,
        }
    }

    #[test]
    fn view_reports_current_phase_name_from_cursor() {
        let registry = registry();
        let key = TaskKey::new(TaskKind::TextProfile, "11");
        let mut task = Task::new(key, policy(RefreshPolicy::Off));
        task.phase_cursor = 1;
        let issuer = JwtCredentialIssuer::new(b"secret-material", Duration::minutes(30));

        let view = TaskView::build(&task, &registry, &issuer, None);
        assert_eq!(view.current_phase_name, Some("extract_stats"));
        assert!(view.refresh.is_none());
    }

    #[test]
    fn view_attaches_refresh_when_policy_active_and_no_incoming_token() {
        let registry = registry();
        let key = TaskKey::new(TaskKind::VideoDeep, "7");
        let task = Task::new(key, policy(RefreshPolicy::Every(600)));
        let issuer = JwtCredentialIssuer::new(b"secret-material", Duration::minutes(30));

        let view = TaskView::build(&task, &registry, &issuer, None);
        assert!(view.refresh.is_some());
    }
}
