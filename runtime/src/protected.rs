//! Protected external calls: timeout, one in-window retry, circuit breaker.
//!
//! Every gateway invocation goes through [`protected_call`], which composes,
//! innermost to outermost: an explicit timeout, a single immediate retry for
//! transport-class failures, and the circuit breaker. Each attempt counts
//! toward the breaker individually, so a retry against a dead service trips
//! the circuit twice as fast rather than hiding the second failure.
//!
//! This is orthogonal to the outbox's own backoff: the breaker protects
//! against rapid repeated failures within one attempt window, while outbox
//! retry spaces attempt windows across time.

use std::time::Duration;

use surebook_core::GatewayError;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerError};

/// Invoke a gateway operation with timeout, retry, and breaker protection.
///
/// # Errors
///
/// `CircuitBreakerError::Open` when the breaker rejected the call without
/// attempting I/O; `CircuitBreakerError::Inner` with the gateway error from
/// the final attempt otherwise.
pub async fn protected_call<F, Fut, T>(
    breaker: &CircuitBreaker,
    timeout: Duration,
    mut operation: F,
) -> Result<T, CircuitBreakerError<GatewayError>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, GatewayError>>,
{
    match one_attempt(breaker, timeout, &mut operation).await {
        Err(CircuitBreakerError::Inner(err)) if err.is_transient() => {
            tracing::warn!(error = %err, "Transient gateway failure, retrying in-window");
            one_attempt(breaker, timeout, &mut operation).await
        }
        other => other,
    }
}

async fn one_attempt<F, Fut, T>(
    breaker: &CircuitBreaker,
    timeout: Duration,
    operation: &mut F,
) -> Result<T, CircuitBreakerError<GatewayError>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, GatewayError>>,
{
    breaker
        .call(|| async move {
            match tokio::time::timeout(timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::Timeout(timeout)),
            }
        })
        .await
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreakerConfig, State};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker(threshold: usize) -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitBreakerConfig::builder()
                .failure_threshold(threshold)
                .cooldown(Duration::from_secs(60))
                .build(),
        )
    }

    #[tokio::test]
    async fn success_passes_through() {
        let breaker = breaker(5);

        let result = protected_call(&breaker, Duration::from_secs(1), || async {
            Ok::<_, GatewayError>(42)
        })
        .await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn slow_operations_time_out() {
        let breaker = breaker(5);

        let result = protected_call(&breaker, Duration::from_millis(10), || async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, GatewayError>(42)
        })
        .await;

        // Timeouts are transient, so both the attempt and its retry ran.
        assert!(matches!(
            result,
            Err(CircuitBreakerError::Inner(GatewayError::Timeout(_)))
        ));
        assert_eq!(breaker.metrics().total_failures, 2);
    }

    #[tokio::test]
    async fn transient_failure_is_retried_once() {
        let breaker = breaker(5);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result = protected_call(&breaker, Duration::from_secs(1), || {
            let c = Arc::clone(&counter);
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(GatewayError::Transport("connection reset".to_owned()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_transient_failure_is_not_retried() {
        let breaker = breaker(5);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<i32, _> =
            protected_call(&breaker, Duration::from_secs(1), || {
                let c = Arc::clone(&counter);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(GatewayError::InvalidResponse("no confirmation".to_owned()))
                }
            })
            .await;

        assert!(matches!(
            result,
            Err(CircuitBreakerError::Inner(GatewayError::InvalidResponse(_)))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn every_attempt_counts_toward_the_breaker() {
        let breaker = breaker(2);

        let result: Result<i32, _> =
            protected_call(&breaker, Duration::from_secs(1), || async {
                Err(GatewayError::Transport("refused".to_owned()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(breaker.metrics().total_failures, 2);
        assert_eq!(breaker.state().await, State::Open);
    }

    #[tokio::test]
    async fn open_breaker_rejects_without_invoking_operation() {
        let breaker = breaker(1);
        // Trip it: one failure opens at threshold 1, the in-window retry is
        // already rejected.
        let _ = protected_call(&breaker, Duration::from_secs(1), || async {
            Err::<i32, _>(GatewayError::Transport("down".to_owned()))
        })
        .await;
        assert_eq!(breaker.state().await, State::Open);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result = protected_call(&breaker, Duration::from_secs(1), || {
            let c = Arc::clone(&counter);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<_, GatewayError>(42)
            }
        })
        .await;

        assert!(matches!(result, Err(CircuitBreakerError::Open)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
