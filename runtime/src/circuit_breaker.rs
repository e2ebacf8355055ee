//! Circuit breaker guarding external gateway calls.
//!
//! After a run of consecutive failures the circuit opens and rejects calls
//! without attempting I/O, so a struggling payment provider or supplier
//! system is not hammered while it recovers.
//!
//! # States
//!
//! - **Closed**: calls pass through; consecutive failures are counted.
//! - **Open**: calls are rejected immediately until the cooldown elapses.
//! - **HalfOpen**: exactly one probe call is in flight; everyone else is
//!   rejected until it reports back. Probe success closes the circuit, probe
//!   failure reopens it and restarts the cooldown.
//!
//! Breakers are injected at call sites and cloned freely (state is shared
//! behind `Arc`), so each test constructs its own.
//!
//! # Example
//!
//! ```rust
//! use surebook_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let breaker = CircuitBreaker::new(
//!     CircuitBreakerConfig::builder()
//!         .failure_threshold(5)
//!         .cooldown(Duration::from_secs(60))
//!         .build(),
//! );
//!
//! match breaker.call(|| async { Ok::<_, String>(42) }).await {
//!     Ok(result) => println!("Success: {result}"),
//!     Err(e) => println!("Failed: {e}"),
//! }
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::RwLock;

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: usize,
    /// How long the circuit stays open before allowing a probe
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub const fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder {
            failure_threshold: None,
            cooldown: None,
        }
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    failure_threshold: Option<usize>,
    cooldown: Option<Duration>,
}

impl CircuitBreakerConfigBuilder {
    /// Set how many consecutive failures open the circuit.
    #[must_use]
    pub const fn failure_threshold(mut self, threshold: usize) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    /// Set how long the circuit stays open before a probe is allowed.
    #[must_use]
    pub const fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = Some(cooldown);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold.unwrap_or(5),
            cooldown: self.cooldown.unwrap_or(Duration::from_secs(60)),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Calls pass through normally
    Closed,
    /// Calls are rejected immediately
    Open,
    /// A single probe call is testing recovery
    HalfOpen,
}

/// Errors from calls made through the breaker.
#[derive(Error, Debug)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, call rejected without attempting I/O
    #[error("Circuit breaker is open")]
    Open,
    /// The wrapped operation failed
    #[error("Operation failed: {0}")]
    Inner(E),
}

#[derive(Debug)]
struct BreakerState {
    state: State,
    failure_count: usize,
    opened_at: Option<Instant>,
    probe_started_at: Option<Instant>,
}

/// Fail-fast guard around an unreliable external service.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: Arc<CircuitBreakerConfig>,
    state: Arc<RwLock<BreakerState>>,
    total_calls: Arc<AtomicU64>,
    total_successes: Arc<AtomicU64>,
    total_failures: Arc<AtomicU64>,
    total_rejections: Arc<AtomicU64>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config: Arc::new(config),
            state: Arc::new(RwLock::new(BreakerState {
                state: State::Closed,
                failure_count: 0,
                opened_at: None,
                probe_started_at: None,
            })),
            total_calls: Arc::new(AtomicU64::new(0)),
            total_successes: Arc::new(AtomicU64::new(0)),
            total_failures: Arc::new(AtomicU64::new(0)),
            total_rejections: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Current state of the circuit.
    pub async fn state(&self) -> State {
        self.state.read().await.state
    }

    /// Call an operation through the circuit breaker.
    ///
    /// # Errors
    ///
    /// Returns `CircuitBreakerError::Open` if the circuit rejected the call
    /// and `CircuitBreakerError::Inner` if the operation itself failed.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        if !self.admit().await {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("surebook_breaker_rejections_total").increment(1);
            tracing::warn!("Circuit breaker is OPEN, rejecting call");
            return Err(CircuitBreakerError::Open);
        }

        match operation().await {
            Ok(result) => {
                self.on_success().await;
                self.total_successes.fetch_add(1, Ordering::Relaxed);
                Ok(result)
            }
            Err(err) => {
                self.on_failure().await;
                self.total_failures.fetch_add(1, Ordering::Relaxed);
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }

    /// Decide whether this call may proceed, transitioning state if the
    /// cooldown has elapsed.
    async fn admit(&self) -> bool {
        let mut state = self.state.write().await;

        match state.state {
            State::Closed => true,
            State::Open => {
                let cooled_down = state
                    .opened_at
                    .is_some_and(|t| t.elapsed() >= self.config.cooldown);
                if cooled_down {
                    tracing::info!("Circuit breaker transitioning OPEN -> HALF_OPEN");
                    metrics::counter!("surebook_breaker_transitions_total", "to" => "half_open")
                        .increment(1);
                    state.state = State::HalfOpen;
                    state.probe_started_at = Some(Instant::now());
                    true
                } else {
                    false
                }
            }
            State::HalfOpen => {
                // One probe at a time. A probe that never reported back stops
                // blocking further probes after another full cooldown.
                match state.probe_started_at {
                    Some(started) if started.elapsed() < self.config.cooldown => false,
                    _ => {
                        state.probe_started_at = Some(Instant::now());
                        true
                    }
                }
            }
        }
    }

    async fn on_success(&self) {
        let mut state = self.state.write().await;

        match state.state {
            State::Closed => {
                state.failure_count = 0;
            }
            State::HalfOpen => {
                tracing::info!("Circuit breaker transitioning HALF_OPEN -> CLOSED");
                metrics::counter!("surebook_breaker_transitions_total", "to" => "closed")
                    .increment(1);
                state.state = State::Closed;
                state.failure_count = 0;
                state.opened_at = None;
                state.probe_started_at = None;
            }
            State::Open => {
                // A slow call admitted before the circuit opened; its success
                // does not close the circuit early.
                state.failure_count = 0;
            }
        }
    }

    async fn on_failure(&self) {
        let mut state = self.state.write().await;

        match state.state {
            State::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        failures = state.failure_count,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker transitioning CLOSED -> OPEN"
                    );
                    metrics::counter!("surebook_breaker_transitions_total", "to" => "open")
                        .increment(1);
                    state.state = State::Open;
                    state.opened_at = Some(Instant::now());
                }
            }
            State::HalfOpen => {
                tracing::warn!("Circuit breaker transitioning HALF_OPEN -> OPEN (probe failed)");
                metrics::counter!("surebook_breaker_transitions_total", "to" => "open")
                    .increment(1);
                state.state = State::Open;
                state.opened_at = Some(Instant::now());
                state.probe_started_at = None;
            }
            State::Open => {
                state.failure_count += 1;
            }
        }
    }

    /// Counters for monitoring.
    #[must_use]
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }

    /// Reset the circuit to closed.
    ///
    /// Useful for tests and manual intervention.
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        tracing::info!("Circuit breaker manually reset to CLOSED");
        state.state = State::Closed;
        state.failure_count = 0;
        state.opened_at = None;
        state.probe_started_at = None;
    }
}

/// Counters for circuit breaker monitoring.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerMetrics {
    /// Calls attempted, including rejected ones
    pub total_calls: u64,
    /// Calls that reached the operation and succeeded
    pub total_successes: u64,
    /// Calls that reached the operation and failed
    pub total_failures: u64,
    /// Calls rejected because the circuit was open
    pub total_rejections: u64,
}

impl CircuitBreakerMetrics {
    /// Fraction of calls rejected without attempting I/O.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn rejection_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        self.total_rejections as f64 / self.total_calls as f64
    }
}
