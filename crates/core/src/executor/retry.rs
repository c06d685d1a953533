use altec_common::config::RetryConfig;
use altec_common::AltecError;

use crate::adapters::{AdapterResponse, ModelAdapter};

/// Bounded retry-with-jitter wrapper around a phase's call into a [`ModelAdapter`].
/// Grounded directly on the teacher's `LlmClient::chat` loop: ≤3 attempts by default,
/// exponential backoff (`2^n` seconds per §4.4), the same hash-based jitter trick
/// (deterministic in attempt count and wall clock, no RNG dependency) before a
/// transient error is promoted to permanent.
pub async fn invoke_with_retry(
    adapter: &dyn ModelAdapter,
    retry_config: &RetryConfig,
    operation: &str,
    input: &serde_json::Value,
) -> Result<AdapterResponse, AltecError> {
    let mut attempt = 0u32;
    let mut backoff_ms = retry_config.initial_backoff_ms;

    loop {
        attempt += 1;
        match adapter.invoke(operation, input).await {
            Ok(response) => return Ok(response),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => {
                if attempt >= retry_config.max_attempts {
                    tracing::warn!(
                        operation,
                        attempt,
                        error = %e,
                        "Model adapter call exhausted retries, promoting to permanent"
                    );
                    return Err(AltecError::ModelAdapter {
                        message: e.to_string(),
                        transient: false,
                    });
                }
                let jitter = if retry_config.jitter {
                    compute_jitter(attempt, backoff_ms)
                } else {
                    0
                };
                let wait = backoff_ms + jitter;
                tracing::warn!(operation, attempt, wait_ms = wait, error = %e, "Retrying model adapter call");
                tokio::time::sleep(std::time::Duration::from_millis(wait)).await;
                backoff_ms = (backoff_ms as f64 * retry_config.backoff_multiplier) as u64;
                backoff_ms = backoff_ms.min(retry_config.max_backoff_ms);
            }
        }
    }
}

/// Hash-based jitter, deterministic in attempt count and wall clock — no RNG
/// dependency needed for a bounded in-process retry loop.
fn compute_jitter(attempt: u32, backoff_ms: u64) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    attempt.hash(&mut hasher);
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos()
        .hash(&mut hasher);
    hasher.finish() % (backoff_ms / 2 + 1)
}
