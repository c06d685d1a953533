use super::loader::{ConfigError, CoreConfig};

/// Validate the complete system configuration.
///
/// Checks sane ranges on numeric parameters and cross-class consistency. The process
/// refuses to start on validation failure.
pub fn validate(config: &CoreConfig) -> Result<(), ConfigError> {
    let mut errors: Vec<String> = Vec::new();

    validate_policy_table(config, &mut errors);
    validate_admission(config, &mut errors);
    validate_progress(config, &mut errors);
    validate_retry(config, &mut errors);
    validate_store(config, &mut errors);
    validate_execution(config, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Validation(errors.join("; ")))
    }
}

fn validate_policy_table(config: &CoreConfig, errors: &mut Vec<String>) {
    let p = &config.system.policy;

    if p.class_order.is_empty() {
        errors.push("policy.class_order must not be empty".into());
        return;
    }

    for name in &p.class_order {
        let Some(class) = p.classes.get(name) else {
            errors.push(format!("policy.class_order references undefined class \"{name}\""));
            continue;
        };
        if class.segment_count == 0 {
            errors.push(format!("policy.classes.{name}.segment_count must be > 0"));
        }
        if class.heartbeat_interval_secs == 0 {
            errors.push(format!("policy.classes.{name}.heartbeat_interval_secs must be > 0"));
        }
        if class.lock_lease_secs <= class.heartbeat_interval_secs {
            errors.push(format!(
                "policy.classes.{name}.lock_lease_secs must exceed heartbeat_interval_secs, \
                 or a single missed heartbeat expires the lease"
            ));
        }
    }

    let mut last_bound = 0.0f64;
    for name in &p.class_order {
        if let Some(class) = p.classes.get(name) {
            if class.predicted_seconds_max < last_bound {
                errors.push("policy.class_order must list classes in ascending predicted_seconds_max".into());
                break;
            }
            last_bound = class.predicted_seconds_max;
        }
    }
}

fn validate_admission(config: &CoreConfig, errors: &mut Vec<String>) {
    let a = &config.system.admission;
    if a.max_reclaim_attempts == 0 {
        errors.push("admission.max_reclaim_attempts must be > 0".into());
    }
    if a.reclaim_sweep_interval_secs == 0 {
        errors.push("admission.reclaim_sweep_interval_secs must be > 0".into());
    }
}

fn validate_progress(config: &CoreConfig, errors: &mut Vec<String>) {
    let p = &config.system.progress;
    if !(0.0..=100.0).contains(&p.progress_throttle_percent) {
        errors.push("progress.progress_throttle_percent must be between 0.0 and 100.0".into());
    }
    if p.min_publish_interval_ms > 60_000 {
        errors.push("progress.min_publish_interval_ms must not exceed 60000 (a minute of silence per phase write is already generous)".into());
    }
}

fn validate_retry(config: &CoreConfig, errors: &mut Vec<String>) {
    let validate_one = |retry: &altec_common::config::RetryConfig, name: &str, errors: &mut Vec<String>| {
        if retry.max_attempts == 0 {
            errors.push(format!("retry.{name}.max_attempts must be > 0"));
        }
        if retry.backoff_multiplier < 1.0 {
            errors.push(format!("retry.{name}.backoff_multiplier must be >= 1.0"));
        }
        if retry.max_backoff_ms < retry.initial_backoff_ms {
            errors.push(format!("retry.{name}.max_backoff_ms must be >= initial_backoff_ms"));
        }
    };

    validate_one(&config.system.retry.model_adapter, "model_adapter", errors);
    validate_one(&config.system.retry.postgres, "postgres", errors);
    validate_one(&config.system.retry.redis, "redis", errors);
}

fn validate_store(config: &CoreConfig, errors: &mut Vec<String>) {
    let s = &config.system.store;
    if s.postgres_url.is_empty() {
        errors.push("store.postgres_url must not be empty".into());
    }
    if s.redis_url.is_empty() {
        errors.push("store.redis_url must not be empty".into());
    }
    if s.max_postgres_connections == 0 {
        errors.push("store.max_postgres_connections must be > 0".into());
    }
    if s.circuit_breaker.failure_threshold == 0 {
        errors.push("store.circuit_breaker.failure_threshold must be > 0".into());
    }
}

fn validate_execution(config: &CoreConfig, errors: &mut Vec<String>) {
    if config.system.execution.default_deadline_multiplier <= 1.0 {
        errors.push("execution.default_deadline_multiplier must be > 1.0".into());
    }
    if let Some(url) = &config.system.execution.model_adapter_base_url {
        if url.is_empty() {
            errors.push("execution.model_adapter_base_url must not be empty when set".into());
        }
    }
}
