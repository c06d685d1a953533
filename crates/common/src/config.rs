use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level system configuration, deserialized from system.toml.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SystemConfig {
    pub server: ServerConfig,
    pub policy: PolicyTableConfig,
    pub admission: AdmissionConfig,
    pub progress: ProgressConfig,
    pub retry: RetryDefaults,
    pub store: StoreConfig,
    pub execution: ExecutionConfig,
}

/// Segmented Executor tunables that apply across every duration class.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// A Task's overall deadline is `predicted_seconds * default_deadline_multiplier`;
    /// exceeding it trips `cancelled_by_deadline` (§4.4).
    pub default_deadline_multiplier: f64,
    /// Base URL of the HTTP model adapter dispatch target. `None` runs against the
    /// in-process `MockAdapter` — suitable for local development, never production.
    #[serde(default)]
    pub model_adapter_base_url: Option<String>,
}

/// HTTP bind address and worker identity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Prefix used when minting this process's `WorkerId` (hostname/pid appended at startup).
    pub worker_id_prefix: String,
}

/// The S/M/L/XL duration-class table driving C3's policy lookup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyTableConfig {
    pub classes: HashMap<String, DurationClassConfig>,
    /// Upper bound (seconds) below which a prediction is classified `S`; analogous
    /// thresholds for `M`/`L` are implied by ascending `predicted_seconds_max`.
    pub class_order: Vec<String>,
}

/// Heartbeat/lease/segment/refresh parameters for one duration class.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DurationClassConfig {
    /// Inclusive upper bound, in seconds, of predicted duration still in this class.
    pub predicted_seconds_max: f64,
    pub heartbeat_interval_secs: u64,
    pub lock_lease_secs: u64,
    pub segment_count: u32,
    /// `0` disables mid-poll credential refresh for this class (e.g. class S).
    pub client_refresh_interval_secs: u64,
}

/// C2 Admission Guard / reclaim sweeper tunables.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdmissionConfig {
    pub reclaim_sweep_interval_secs: u64,
    pub max_reclaim_attempts: u32,
    /// Window after a COMPLETED/FAILED terminal status during which a resubmission
    /// of the same key is short-circuited to the cached terminal view instead of
    /// re-admitted, per §4.2.
    pub skipped_recent_success_window_secs: u64,
}

/// C5 Progress Publisher throttling knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Minimum percent delta before a progress update is considered "changed enough"
    /// to reset the throttle window.
    pub progress_throttle_percent: f64,
    /// Whether a changed `progress_message` alone (percent unchanged) also resets
    /// the throttle window.
    pub progress_throttle_message_changed: bool,
    /// Minimum spacing, in milliseconds, between two persisted progress writes for
    /// the same Task — protects the State Store from poll-rate amplification.
    pub min_publish_interval_ms: u64,
}

/// Default retry parameters for the executor's inner bounded-retry loop and for the
/// resilience-wrapped dependency clients. Per-target overrides can be specified.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryDefaults {
    pub model_adapter: RetryConfig,
    pub postgres: RetryConfig,
    pub redis: RetryConfig,
}

/// Retry configuration for a specific target.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

/// Circuit breaker cooldown/threshold parameters, one set per guarded dependency.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
}

/// Backing store connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    pub postgres_url: String,
    pub redis_url: String,
    pub max_postgres_connections: u32,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl PolicyTableConfig {
    /// Looks up the duration class whose bound is the first to cover `predicted_seconds`,
    /// walking `class_order` ascending; the last entry is the catch-all (XL has no
    /// effective ceiling in practice, but still carries a configured bound for clarity).
    pub fn classify(&self, predicted_seconds: f64) -> Option<(&str, &DurationClassConfig)> {
        for name in &self.class_order {
            if let Some(cfg) = self.classes.get(name) {
                if predicted_seconds <= cfg.predicted_seconds_max {
                    return Some((name.as_str(), cfg));
                }
            }
        }
        self.class_order
            .last()
            .and_then(|name| self.classes.get(name).map(|cfg| (name.as_str(), cfg)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> PolicyTableConfig {
        let mut classes = HashMap::new();
        classes.insert(
            "S".to_string(),
            DurationClassConfig {
                predicted_seconds_max: 30.0,
                heartbeat_interval_secs: 10,
                lock_lease_secs: 60,
                segment_count: 1,
                client_refresh_interval_secs: 0,
            },
        );
        classes.insert(
            "M".to_string(),
            DurationClassConfig {
                predicted_seconds_max: 300.0,
                heartbeat_interval_secs: 20,
                lock_lease_secs: 90,
                segment_count: 3,
                client_refresh_interval_secs: 120,
            },
        );
        PolicyTableConfig {
            classes,
            class_order: vec!["S".to_string(), "M".to_string()],
        }
    }

    #[test]
    fn classify_picks_first_class_whose_bound_covers_prediction() {
        let table = sample_table();
        let (name, _) = table.classify(12.0).unwrap();
        assert_eq!(name, "S");
        let (name, _) = table.classify(120.0).unwrap();
        assert_eq!(name, "M");
    }

    #[test]
    fn classify_falls_back_to_last_class_above_all_bounds() {
        let table = sample_table();
        let (name, _) = table.classify(10_000.0).unwrap();
        assert_eq!(name, "M");
    }
}
