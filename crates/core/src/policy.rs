use altec_common::config::PolicyTableConfig;
use altec_common::model::{DurationClass, Policy, RefreshPolicy};
use serde::{Deserialize, Serialize};

/// Size/duration facts about a submission, gathered by the caller before admission.
/// Only the fields relevant to the submitted `kind` need be populated.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InputDescriptor {
    pub bytes: Option<u64>,
    pub media_seconds: Option<f64>,
    pub frames_analyzed: Option<u64>,
    pub gpu: bool,
}

/// Translates an [`InputDescriptor`] into a [`Policy`] for a given task kind, table-
/// driven from `system.toml` so operators can retune heartbeat/lease/segment/refresh
/// without a rebuild.
pub struct DurationEstimator<'a> {
    table: &'a PolicyTableConfig,
}

impl<'a> DurationEstimator<'a> {
    pub fn new(table: &'a PolicyTableConfig) -> Self {
        Self { table }
    }

    pub fn policy(
        &self,
        kind: altec_common::model::TaskKind,
        descriptor: &InputDescriptor,
    ) -> Policy {
        let predicted_seconds = predicted_seconds(kind, descriptor);
        let (class_name, class_cfg) = self
            .table
            .classify(predicted_seconds)
            .expect("policy table must have at least one duration class configured");

        let duration_class = match class_name {
            "S" => DurationClass::S,
            "M" => DurationClass::M,
            "L" => DurationClass::L,
            _ => DurationClass::Xl,
        };

        let client_refresh_interval_secs = if class_cfg.client_refresh_interval_secs == 0 {
            RefreshPolicy::Off
        } else {
            RefreshPolicy::Every(class_cfg.client_refresh_interval_secs)
        };

        Policy {
            duration_class,
            predicted_seconds,
            heartbeat_interval_secs: class_cfg.heartbeat_interval_secs,
            lock_lease_secs: class_cfg.lock_lease_secs,
            segment_count: class_cfg.segment_count,
            client_refresh_interval_secs,
        }
    }
}

/// Predicted-duration formulas, one per modality, per §4.3.
fn predicted_seconds(
    kind: altec_common::model::TaskKind,
    descriptor: &InputDescriptor,
) -> f64 {
    use altec_common::model::TaskKind::*;
    match kind {
        TextProfile => {
            let bytes = descriptor.bytes.unwrap_or(0) as f64;
            (15.0f64).max(bytes / (1024.0 * 1024.0) * 5.0)
        }
        ImageAnalyze => 20.0,
        AudioTranscribe => {
            let media_seconds = descriptor.media_seconds.unwrap_or(0.0);
            let base = (30.0f64).max(media_seconds * 0.15);
            if descriptor.gpu {
                base
            } else {
                base * 4.0
            }
        }
        VideoDeep => {
            let media_seconds = descriptor.media_seconds.unwrap_or(0.0);
            let frames = descriptor.frames_analyzed.unwrap_or(0) as f64;
            (120.0f64).max(media_seconds * 0.25 + frames * 0.3)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use altec_common::config::DurationClassConfig;
    use altec_common::model::TaskKind;
    use std::collections::HashMap;

    fn default_table() -> PolicyTableConfig {
        let mut classes = HashMap::new();
        classes.insert(
            "S".to_string(),
            DurationClassConfig {
                predicted_seconds_max: 300.0,
                heartbeat_interval_secs: 60,
                lock_lease_secs: 300,
                segment_count: 4,
                client_refresh_interval_secs: 0,
            },
        );
        classes.insert(
            "M".to_string(),
            DurationClassConfig {
                predicted_seconds_max: 1800.0,
                heartbeat_interval_secs: 300,
                lock_lease_secs: 900,
                segment_count: 8,
                client_refresh_interval_secs: 1200,
            },
        );
        classes.insert(
            "L".to_string(),
            DurationClassConfig {
                predicted_seconds_max: 3600.0,
                heartbeat_interval_secs: 600,
                lock_lease_secs: 1800,
                segment_count: 10,
                client_refresh_interval_secs: 900,
            },
        );
        classes.insert(
            "XL".to_string(),
            DurationClassConfig {
                predicted_seconds_max: f64::MAX,
                heartbeat_interval_secs: 900,
                lock_lease_secs: 2700,
                segment_count: 20,
                client_refresh_interval_secs: 600,
            },
        );
        PolicyTableConfig {
            classes,
            class_order: vec!["S".into(), "M".into(), "L".into(), "XL".into()],
        }
    }

    #[test]
    fn audio_transcribe_class_s_matches_table() {
        let table = default_table();
        let estimator = DurationEstimator::new(&table);
        let descriptor = InputDescriptor {
            media_seconds: Some(180.0),
            gpu: true,
            ..Default::default()
        };
        let policy = estimator.policy(TaskKind::AudioTranscribe, &descriptor);
        assert_eq!(policy.duration_class, DurationClass::S);
        assert_eq!(policy.segment_count, 4);
        assert!(matches!(policy.client_refresh_interval_secs, RefreshPolicy::Off));
    }

    #[test]
    fn video_deep_class_l_gets_fifteen_minute_refresh() {
        let table = default_table();
        let estimator = DurationEstimator::new(&table);
        let descriptor = InputDescriptor {
            media_seconds: Some(1800.0),
            ..Default::default()
        };
        let policy = estimator.policy(TaskKind::VideoDeep, &descriptor);
        assert_eq!(policy.duration_class, DurationClass::L);
        assert_eq!(policy.segment_count, 10);
        assert_eq!(
            policy.client_refresh_interval_secs,
            RefreshPolicy::Every(900)
        );
    }

    #[test]
    fn cpu_fallback_quadruples_audio_prediction() {
        let table = default_table();
        let estimator = DurationEstimator::new(&table);
        let gpu = InputDescriptor {
            media_seconds: Some(2000.0),
            gpu: true,
            ..Default::default()
        };
        let cpu = InputDescriptor {
            media_seconds: Some(2000.0),
            gpu: false,
            ..Default::default()
        };
        let gpu_policy = estimator.policy(TaskKind::AudioTranscribe, &gpu);
        let cpu_policy = estimator.policy(TaskKind::AudioTranscribe, &cpu);
        assert_eq!(cpu_policy.predicted_seconds, gpu_policy.predicted_seconds * 4.0);
    }
}
