//! Transactional outbox events and the dead-letter archive.
//!
//! An outbox event is a pending side effect written in the same transaction
//! as the aggregate mutation that requires it, which is what guarantees the
//! side effect is scheduled at least once — there is no separate publish step
//! to lose. At most one live event exists per (aggregate, event type);
//! delivery state is owned exclusively by the claim/release protocol on
//! [`crate::store::StorageTx`].

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::reservation::ReservationCode;
use crate::store::StorageError;

/// Well-known outbox event types.
pub mod event_types {
    /// Book the reservation with its external supplier.
    pub const BOOK_SUPPLIER: &str = "BOOK_SUPPLIER";
}

/// Delivery status of an outbox event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    /// Enqueued, never attempted.
    New,
    /// Claimed by a worker; lock fields are set.
    InProgress,
    /// Attempt failed; waiting for `next_attempt_at`.
    Retry,
    /// Side effect completed. Terminal.
    Done,
    /// Retries exhausted; archived to the dead-letter store. Terminal.
    Failed,
}

impl OutboxStatus {
    /// Storage string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::InProgress => "IN_PROGRESS",
            Self::Retry => "RETRY",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }

    /// Parse from the storage string representation.
    ///
    /// # Errors
    ///
    /// Returns an error if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, StorageError> {
        match s {
            "NEW" => Ok(Self::New),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "RETRY" => Ok(Self::Retry),
            "DONE" => Ok(Self::Done),
            "FAILED" => Ok(Self::Failed),
            _ => Err(StorageError::Database(format!(
                "Invalid outbox status: {s}"
            ))),
        }
    }

    /// Whether this status ends the event's lifecycle.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pending side effect, durably queued next to the state change that
/// requires it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Unique event id.
    pub id: Uuid,
    /// What kind of side effect this is (see [`event_types`]).
    pub event_type: String,
    /// The aggregate this event belongs to.
    pub aggregate_code: ReservationCode,
    /// Opaque snapshot data for the side effect.
    pub payload: serde_json::Value,
    /// Delivery status.
    pub status: OutboxStatus,
    /// How many delivery attempts have completed.
    pub attempts: i32,
    /// Earliest time the next attempt may be claimed.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Worker currently holding the claim, if any.
    pub locked_by: Option<String>,
    /// When the current claim expires and the event becomes claimable again.
    pub lock_expires_at: Option<DateTime<Utc>>,
    /// Error code from the most recent failed attempt.
    pub last_error_code: Option<String>,
    /// Error message from the most recent failed attempt.
    pub last_error_message: Option<String>,
    /// When the event was enqueued.
    pub created_at: DateTime<Utc>,
}

impl OutboxEvent {
    /// Builds a fresh NEW event, immediately claimable.
    #[must_use]
    pub fn new(
        aggregate_code: ReservationCode,
        event_type: impl Into<String>,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            aggregate_code,
            payload,
            status: OutboxStatus::New,
            attempts: 0,
            next_attempt_at: Some(now),
            locked_by: None,
            lock_expires_at: None,
            last_error_code: None,
            last_error_message: None,
            created_at: now,
        }
    }
}

/// Exponential retry backoff with a ceiling.
///
/// `attempts` is the attempt count after the failure being scheduled for
/// (so the first retry, `attempts = 1`, waits `base_secs`).
#[must_use]
pub fn retry_backoff(attempts: i32, base_secs: u64, cap_secs: u64) -> Duration {
    let exp = u32::try_from(attempts.saturating_sub(1).clamp(0, 30)).unwrap_or(0);
    let secs = base_secs
        .saturating_mul(2u64.saturating_pow(exp))
        .min(cap_secs);
    Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
}

/// An event that exhausted its retries, archived verbatim for manual triage.
///
/// Append-only: dead-letter records are never mutated or deleted by the
/// engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// Unique archive row id.
    pub id: Uuid,
    /// Id of the outbox event this was copied from.
    pub original_event_id: Uuid,
    /// Event type of the original event.
    pub event_type: String,
    /// Aggregate the original event belonged to.
    pub aggregate_code: ReservationCode,
    /// The original payload, byte-for-byte.
    pub payload: serde_json::Value,
    /// Error code from the final attempt.
    pub error_code: Option<String>,
    /// Error message from the final attempt.
    pub error_message: Option<String>,
    /// Total attempts made before giving up.
    pub attempts: i32,
    /// When the event was moved here.
    pub moved_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    /// Archives an outbox event, preserving its payload verbatim.
    #[must_use]
    pub fn from_event(
        event: &OutboxEvent,
        attempts: i32,
        error_code: Option<String>,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            original_event_id: event.id,
            event_type: event.event_type.clone(),
            aggregate_code: event.aggregate_code.clone(),
            payload: event.payload.clone(),
            error_code,
            error_message,
            attempts,
            moved_at: now,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn status_round_trips_through_storage_strings() {
        for status in [
            OutboxStatus::New,
            OutboxStatus::InProgress,
            OutboxStatus::Retry,
            OutboxStatus::Done,
            OutboxStatus::Failed,
        ] {
            assert_eq!(OutboxStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(OutboxStatus::parse("new").is_err());
    }

    #[test]
    fn only_done_and_failed_are_terminal() {
        assert!(OutboxStatus::Done.is_terminal());
        assert!(OutboxStatus::Failed.is_terminal());
        assert!(!OutboxStatus::New.is_terminal());
        assert!(!OutboxStatus::InProgress.is_terminal());
        assert!(!OutboxStatus::Retry.is_terminal());
    }

    #[test]
    fn new_events_are_immediately_claimable() {
        let now = Utc::now();
        let event = OutboxEvent::new(
            ReservationCode::new("R1"),
            event_types::BOOK_SUPPLIER,
            serde_json::json!({"reservation_code": "R1"}),
            now,
        );
        assert_eq!(event.status, OutboxStatus::New);
        assert_eq!(event.attempts, 0);
        assert_eq!(event.next_attempt_at, Some(now));
        assert!(event.locked_by.is_none());
    }

    #[test]
    fn backoff_doubles_then_hits_the_ceiling() {
        assert_eq!(retry_backoff(1, 15, 300), Duration::seconds(15));
        assert_eq!(retry_backoff(2, 15, 300), Duration::seconds(30));
        assert_eq!(retry_backoff(3, 15, 300), Duration::seconds(60));
        assert_eq!(retry_backoff(4, 15, 300), Duration::seconds(120));
        assert_eq!(retry_backoff(5, 15, 300), Duration::seconds(240));
        assert_eq!(retry_backoff(6, 15, 300), Duration::seconds(300));
        assert_eq!(retry_backoff(50, 15, 300), Duration::seconds(300));
    }

    #[test]
    fn dead_letter_preserves_the_payload_verbatim() {
        let now = Utc::now();
        let payload = serde_json::json!({"reservation_code": "R1", "nested": {"k": [1, 2, 3]}});
        let event = OutboxEvent::new(
            ReservationCode::new("R1"),
            event_types::BOOK_SUPPLIER,
            payload.clone(),
            now,
        );
        let dead = DeadLetterRecord::from_event(
            &event,
            5,
            Some("TIMEOUT".to_owned()),
            Some("supplier timed out".to_owned()),
            now,
        );
        assert_eq!(dead.payload, payload);
        assert_eq!(dead.original_event_id, event.id);
        assert_eq!(dead.attempts, 5);
    }

    proptest! {
        #[test]
        fn backoff_never_exceeds_the_cap(attempts in 1i32..1000, base in 1u64..120, cap in 1u64..100_000) {
            let d = retry_backoff(attempts, base, cap);
            prop_assert!(d <= Duration::seconds(i64::try_from(cap).unwrap_or(i64::MAX)));
            prop_assert!(d >= Duration::seconds(0));
        }

        #[test]
        fn backoff_is_monotonic_in_attempts(attempts in 1i32..60, base in 1u64..120, cap in 1u64..100_000) {
            prop_assert!(retry_backoff(attempts + 1, base, cap) >= retry_backoff(attempts, base, cap));
        }
    }
}
