//! Runtime configuration loaded from environment variables.
//!
//! Every tunable has a compiled default, so `RuntimeConfig::default()` yields
//! a fully working engine and `from_env` only overrides what is set.

use std::env;
use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Outbox retry/backoff and claim locking
    pub outbox: OutboxConfig,
    /// Background worker polling
    pub worker: WorkerConfig,
    /// Circuit breaker thresholds
    pub breaker: BreakerConfig,
    /// Unit-of-work contention retry
    pub uow: UowRetryConfig,
    /// External gateway call timeouts
    pub gateway: GatewayConfig,
}

/// Outbox retry/backoff and claim locking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// Backoff base in seconds; attempt n waits `base * 2^(n-1)` (default: 15)
    pub backoff_base_secs: u64,
    /// Backoff cap in seconds (default: 300)
    pub backoff_cap_secs: u64,
    /// Attempts before an event is dead-lettered (default: 5)
    pub max_attempts: i32,
    /// How long a claim lock blocks other claimers, in seconds (default: 30)
    pub lock_ttl_secs: u64,
}

/// Background worker polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Seconds between outbox polls (default: 5)
    pub poll_interval_secs: u64,
    /// Maximum events claimed per poll (default: 10)
    pub batch_size: usize,
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens (default: 5)
    pub failure_threshold: usize,
    /// Seconds the circuit stays open before allowing a probe (default: 60)
    pub cooldown_secs: u64,
}

/// Unit-of-work contention retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UowRetryConfig {
    /// Total attempts including the first (default: 3)
    pub max_attempts: u32,
    /// Base delay in milliseconds, doubled per retry (default: 100)
    pub base_delay_ms: u64,
}

/// External gateway call timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Payment capture timeout in seconds (default: 5)
    pub payment_timeout_secs: u64,
    /// Supplier booking timeout in seconds (default: 30)
    pub supplier_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            outbox: OutboxConfig {
                backoff_base_secs: 15,
                backoff_cap_secs: 300,
                max_attempts: 5,
                lock_ttl_secs: 30,
            },
            worker: WorkerConfig {
                poll_interval_secs: 5,
                batch_size: 10,
            },
            breaker: BreakerConfig {
                failure_threshold: 5,
                cooldown_secs: 60,
            },
            uow: UowRetryConfig {
                max_attempts: 3,
                base_delay_ms: 100,
            },
            gateway: GatewayConfig {
                payment_timeout_secs: 5,
                supplier_timeout_secs: 30,
            },
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from environment variables, falling back to the
    /// compiled defaults for anything unset or unparseable.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            outbox: OutboxConfig {
                backoff_base_secs: env_or("SUREBOOK_OUTBOX_BACKOFF_BASE_SECS", 15),
                backoff_cap_secs: env_or("SUREBOOK_OUTBOX_BACKOFF_CAP_SECS", 300),
                max_attempts: env_or("SUREBOOK_OUTBOX_MAX_ATTEMPTS", 5),
                lock_ttl_secs: env_or("SUREBOOK_OUTBOX_LOCK_TTL_SECS", 30),
            },
            worker: WorkerConfig {
                poll_interval_secs: env_or("SUREBOOK_WORKER_POLL_INTERVAL_SECS", 5),
                batch_size: env_or("SUREBOOK_WORKER_BATCH_SIZE", 10),
            },
            breaker: BreakerConfig {
                failure_threshold: env_or("SUREBOOK_BREAKER_FAILURE_THRESHOLD", 5),
                cooldown_secs: env_or("SUREBOOK_BREAKER_COOLDOWN_SECS", 60),
            },
            uow: UowRetryConfig {
                max_attempts: env_or("SUREBOOK_UOW_MAX_ATTEMPTS", 3),
                base_delay_ms: env_or("SUREBOOK_UOW_BASE_DELAY_MS", 100),
            },
            gateway: GatewayConfig {
                payment_timeout_secs: env_or("SUREBOOK_PAYMENT_TIMEOUT_SECS", 5),
                supplier_timeout_secs: env_or("SUREBOOK_SUPPLIER_TIMEOUT_SECS", 30),
            },
        }
    }
}

impl OutboxConfig {
    /// Claim lock TTL as a time-arithmetic duration.
    #[must_use]
    pub fn lock_ttl(&self) -> Duration {
        Duration::seconds(i64::try_from(self.lock_ttl_secs).unwrap_or(i64::MAX))
    }
}

impl WorkerConfig {
    /// Poll interval for the tokio sleep timer.
    #[must_use]
    pub const fn poll_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.poll_interval_secs)
    }
}

impl BreakerConfig {
    /// Open-state cooldown for the tokio clock.
    #[must_use]
    pub const fn cooldown(&self) -> StdDuration {
        StdDuration::from_secs(self.cooldown_secs)
    }
}

impl UowRetryConfig {
    /// Base delay for the first contention retry.
    #[must_use]
    pub const fn base_delay(&self) -> StdDuration {
        StdDuration::from_millis(self.base_delay_ms)
    }
}

impl GatewayConfig {
    /// Payment capture timeout.
    #[must_use]
    pub const fn payment_timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.payment_timeout_secs)
    }

    /// Supplier booking timeout.
    #[must_use]
    pub const fn supplier_timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.supplier_timeout_secs)
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = RuntimeConfig::default();

        assert_eq!(config.outbox.backoff_base_secs, 15);
        assert_eq!(config.outbox.backoff_cap_secs, 300);
        assert_eq!(config.outbox.max_attempts, 5);
        assert_eq!(config.outbox.lock_ttl(), Duration::seconds(30));
        assert_eq!(config.worker.batch_size, 10);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.cooldown(), StdDuration::from_secs(60));
        assert_eq!(config.uow.max_attempts, 3);
        assert_eq!(config.gateway.payment_timeout(), StdDuration::from_secs(5));
        assert_eq!(
            config.gateway.supplier_timeout(),
            StdDuration::from_secs(30)
        );
    }

    #[test]
    fn unset_variables_fall_back_to_defaults() {
        // No SUREBOOK_* variables are set in the test environment.
        let config = RuntimeConfig::from_env();

        assert_eq!(config.outbox.max_attempts, 5);
        assert_eq!(config.worker.poll_interval(), StdDuration::from_secs(5));
    }
}
