use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use altec_common::config::CircuitBreakerConfig;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation — all calls pass through.
    Closed,
    /// Breaker tripped — calls are rejected.
    Open,
    /// Cooldown elapsed — one probe call allowed.
    HalfOpen,
}

/// A circuit breaker that opens after consecutive failures exceed a threshold,
/// and closes again after a successful probe during half-open state.
pub struct CircuitBreaker {
    name: String,
    failure_count: AtomicU32,
    failure_threshold: u32,
    cooldown: Duration,
    /// Guards (state, last_failure_time). Uses std::sync::Mutex because
    /// this is never held across await points.
    inner: Mutex<CircuitInner>,
}

struct CircuitInner {
    state: CircuitState,
    last_failure: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(name: &str, cfg: &CircuitBreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            failure_count: AtomicU32::new(0),
            failure_threshold: cfg.failure_threshold,
            cooldown: Duration::from_secs(cfg.cooldown_secs),
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                last_failure: None,
            }),
        }
    }

    /// Check whether a call should be allowed.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if let Some(last) = inner.last_failure {
                    if last.elapsed() >= self.cooldown {
                        inner.state = CircuitState::HalfOpen;
                        tracing::info!(
                            circuit = %self.name,
                            "Circuit breaker transitioning to half-open"
                        );
                        true
                    } else {
                        false
                    }
                } else {
                    inner.state = CircuitState::Closed;
                    true
                }
            }
            CircuitState::HalfOpen => true,
        }
    }

    /// Record a successful call — reset failure count, close circuit.
    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::Relaxed);
        let mut inner = self.inner.lock().unwrap();

        if inner.state != CircuitState::Closed {
            tracing::info!(
                circuit = %self.name,
                previous_state = ?inner.state,
                "Circuit breaker closing after success"
            );
            inner.state = CircuitState::Closed;
            metrics::counter!("circuit_breaker.recoveries", "circuit" => self.name.clone())
                .increment(1);
        }
    }

    /// Record a failed call — increment failure count, potentially open circuit.
    pub fn record_failure(&self) {
        let count = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
        let mut inner = self.inner.lock().unwrap();

        inner.last_failure = Some(Instant::now());

        if count >= self.failure_threshold && inner.state != CircuitState::Open {
            tracing::warn!(
                circuit = %self.name,
                failures = count,
                threshold = self.failure_threshold,
                "Circuit breaker OPEN"
            );
            inner.state = CircuitState::Open;
            metrics::counter!("circuit_breaker.trips", "circuit" => self.name.clone()).increment(1);
        }
    }

    pub fn current_state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Registry of circuit breakers for ALTEC's hard and soft dependencies. Held as
/// `Arc`s so the same breaker instance can be shared with whatever actually makes the
/// guarded calls (`HybridStateStore`, `HttpModelAdapter`) as well as with the
/// metrics-reporting task below.
pub struct CircuitBreakerRegistry {
    pub postgres: Arc<CircuitBreaker>,
    pub redis: Arc<CircuitBreaker>,
    pub model_adapter: Arc<CircuitBreaker>,
}

impl CircuitBreakerRegistry {
    pub fn new(postgres: &CircuitBreakerConfig, redis: &CircuitBreakerConfig) -> Self {
        Self {
            postgres: Arc::new(CircuitBreaker::new("postgres", postgres)),
            redis: Arc::new(CircuitBreaker::new("redis", redis)),
            model_adapter: Arc::new(CircuitBreaker::new(
                "model_adapter",
                &CircuitBreakerConfig {
                    failure_threshold: 3,
                    cooldown_secs: 120,
                },
            )),
        }
    }

    /// Whether either hard dependency (Postgres, Redis) has an open circuit.
    /// A model_adapter trip is soft — it fails individual tasks, not the service.
    pub fn any_hard_open(&self) -> Option<&str> {
        for cb in [self.postgres.as_ref(), self.redis.as_ref()] {
            if cb.current_state() == CircuitState::Open {
                return Some(cb.name());
            }
        }
        None
    }

    /// Emit gauge metrics for all circuit breaker states.
    pub fn report_metrics(&self) {
        for cb in [
            self.postgres.as_ref(),
            self.redis.as_ref(),
            self.model_adapter.as_ref(),
        ] {
            let state_value = match cb.current_state() {
                CircuitState::Closed => 0.0,
                CircuitState::HalfOpen => 0.5,
                CircuitState::Open => 1.0,
            };
            metrics::gauge!("circuit_breaker.state", "circuit" => cb.name().to_string())
                .set(state_value);
        }
    }
}
