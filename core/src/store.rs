//! Persistence contracts for the consistency engine.
//!
//! Handlers never talk to a database directly. They open a [`StorageTx`]
//! through [`Storage`], perform every read and write of one unit of work on
//! it, and commit. Dropping an uncommitted transaction rolls it back — that
//! is what makes "save the idempotency record in the same transaction as the
//! work it guards" and "enqueue the outbox event with the state change that
//! requires it" atomic.
//!
//! The store traits are deliberately narrow. In particular, aggregate
//! mutations are conditional updates: they take the version the caller last
//! observed, increment it by exactly one, and fail with
//! [`StorageError::VersionConflict`] when the row has moved — there are no
//! blind writes and no locks held across external calls.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::idempotency::IdempotencyRecord;
use crate::outbox::{DeadLetterRecord, OutboxEvent};
use crate::payment::Payment;
use crate::reservation::{PaymentState, Reservation, ReservationCode, ReservationStatus};
use crate::supplier::SupplierRequestRecord;

/// Error types for storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// A conditional update matched zero rows: the caller's version is stale.
    #[error("Version conflict on reservation {code}: expected version {expected}")]
    VersionConflict {
        /// The reservation whose update was rejected.
        code: ReservationCode,
        /// The version the caller supplied.
        expected: i32,
    },

    /// Deadlock or serialization failure; the whole unit of work may be
    /// retried.
    #[error("Storage contention: {0}")]
    Contention(String),

    /// Any other database failure.
    #[error("Database error: {0}")]
    Database(String),

    /// Failed to (de)serialize a stored value.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Whether retrying the whole unit of work may succeed.
    #[must_use]
    pub const fn is_contention(&self) -> bool {
        matches!(self, Self::Contention(_))
    }
}

/// Cached command responses keyed by (scope, client key).
#[async_trait]
pub trait IdempotencyStore: Send {
    /// Looks up the cached record for (scope, `client_key`).
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    async fn get(
        &mut self,
        scope: &str,
        client_key: &str,
    ) -> Result<Option<IdempotencyRecord>, StorageError>;

    /// Saves a record. Must be called inside the same transaction as the work
    /// the record caches.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails, including when a
    /// record for the same (scope, `client_key`) already exists.
    async fn save(&mut self, record: &IdempotencyRecord) -> Result<(), StorageError>;
}

/// The reservation aggregate rows, mutated only through version-checked
/// conditional updates.
#[async_trait]
pub trait ReservationStore: Send {
    /// Loads a reservation by code.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    async fn get_reservation(
        &mut self,
        code: &ReservationCode,
    ) -> Result<Option<Reservation>, StorageError>;

    /// Persists a brand-new reservation (version 0).
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails or the code already
    /// exists.
    async fn insert_reservation(&mut self, reservation: &Reservation) -> Result<(), StorageError>;

    /// Conditionally sets the payment state, returning the new version.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::VersionConflict`] if `expected_version` is
    /// stale, or another error if the underlying storage fails.
    async fn update_payment_state(
        &mut self,
        code: &ReservationCode,
        state: PaymentState,
        expected_version: i32,
    ) -> Result<i32, StorageError>;

    /// Conditionally sets the lifecycle status, returning the new version.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::VersionConflict`] if `expected_version` is
    /// stale, or another error if the underlying storage fails.
    async fn update_status(
        &mut self,
        code: &ReservationCode,
        status: ReservationStatus,
        expected_version: i32,
    ) -> Result<i32, StorageError>;

    /// Conditionally records the supplier confirmation: status CONFIRMED plus
    /// the supplier's confirmation code and timestamp. Returns the new
    /// version.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::VersionConflict`] if `expected_version` is
    /// stale, or another error if the underlying storage fails.
    async fn mark_confirmed(
        &mut self,
        code: &ReservationCode,
        confirmation_code: &str,
        confirmed_at: DateTime<Utc>,
        expected_version: i32,
    ) -> Result<i32, StorageError>;
}

/// Payment ledger rows.
#[async_trait]
pub trait PaymentStore: Send {
    /// Persists a payment row.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    async fn insert_payment(&mut self, payment: &Payment) -> Result<(), StorageError>;

    /// Finds the payment correlated with a provider transaction id.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    async fn find_payment_by_transaction(
        &mut self,
        provider: &str,
        provider_transaction_id: &str,
    ) -> Result<Option<Payment>, StorageError>;

    /// Finds the payment that already consumed a provider webhook event id.
    /// This is the webhook deduplication axis.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    async fn find_payment_by_provider_event(
        &mut self,
        provider: &str,
        provider_event_id: &str,
    ) -> Result<Option<Payment>, StorageError>;

    /// Finds the captured payment for a reservation, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    async fn find_captured_payment(
        &mut self,
        code: &ReservationCode,
    ) -> Result<Option<Payment>, StorageError>;

    /// Settles a payment row as captured, recording the provider's webhook
    /// event id and charge id when known.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails or the payment does
    /// not exist.
    async fn mark_payment_captured(
        &mut self,
        payment_id: Uuid,
        provider_event_id: Option<&str>,
        charge_id: Option<&str>,
    ) -> Result<(), StorageError>;

    /// Settles a payment row as failed.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails or the payment does
    /// not exist.
    async fn mark_payment_failed(
        &mut self,
        payment_id: Uuid,
        provider_event_id: Option<&str>,
    ) -> Result<(), StorageError>;
}

/// The transactional outbox. Enqueue happens inside command transactions;
/// claim/release drives delivery.
#[async_trait]
pub trait OutboxStore: Send {
    /// Enqueues an event unless a live (non-terminal) event already exists
    /// for the same (`aggregate_code`, `event_type`). Returns whether a row
    /// was inserted.
    ///
    /// This is what lets a pay call and a duplicated webhook compose to
    /// exactly one BOOK_SUPPLIER event without a read-then-write race.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    async fn enqueue(&mut self, event: &OutboxEvent) -> Result<bool, StorageError>;

    /// Atomically claims the live event for one aggregate: matches status
    /// NEW, RETRY, or IN_PROGRESS whose lock has expired, with
    /// `next_attempt_at` unset or `<= now`, and flips it to IN_PROGRESS
    /// locked by `worker_id` until `now + lock_ttl`. Returns the claimed row,
    /// or `None` if there was nothing claimable. Accepting expired
    /// IN_PROGRESS rows is what recovers events from crashed workers.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    async fn claim(
        &mut self,
        aggregate_code: &ReservationCode,
        event_type: &str,
        worker_id: &str,
        now: DateTime<Utc>,
        lock_ttl: Duration,
    ) -> Result<Option<OutboxEvent>, StorageError>;

    /// Batch form of [`OutboxStore::claim`]: claims up to `limit` ready
    /// events of one type across all aggregates, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    async fn claim_ready(
        &mut self,
        event_type: &str,
        limit: usize,
        worker_id: &str,
        now: DateTime<Utc>,
        lock_ttl: Duration,
    ) -> Result<Vec<OutboxEvent>, StorageError>;

    /// Marks a claimed event DONE and clears its lock fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    async fn mark_done(&mut self, event_id: Uuid) -> Result<(), StorageError>;

    /// Marks a claimed event RETRY: records the attempt count, the earliest
    /// next attempt time and the failure, and clears the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    async fn mark_retry(
        &mut self,
        event_id: Uuid,
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
        error_code: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<(), StorageError>;

    /// Marks a claimed event FAILED (terminal) and clears the lock. The
    /// caller archives it to the dead-letter store in the same transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    async fn mark_failed(
        &mut self,
        event_id: Uuid,
        attempts: i32,
        error_code: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<(), StorageError>;

    /// Reads the most recent event for (`aggregate_code`, `event_type`),
    /// regardless of status.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    async fn find_event(
        &mut self,
        aggregate_code: &ReservationCode,
        event_type: &str,
    ) -> Result<Option<OutboxEvent>, StorageError>;
}

/// Append-only archive of events that exhausted their retries.
#[async_trait]
pub trait DeadLetterStore: Send {
    /// Archives a dead-lettered event verbatim.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    async fn archive(&mut self, record: &DeadLetterRecord) -> Result<(), StorageError>;

    /// Lists dead-letter records for one aggregate, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    async fn list_for_aggregate(
        &mut self,
        aggregate_code: &ReservationCode,
    ) -> Result<Vec<DeadLetterRecord>, StorageError>;
}

/// Audit trail of outbound supplier requests.
#[async_trait]
pub trait SupplierRequestStore: Send {
    /// Opens an audit row (written before the gateway call goes out).
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    async fn insert_supplier_request(
        &mut self,
        record: &SupplierRequestRecord,
    ) -> Result<(), StorageError>;

    /// Finalizes an audit row with its outcome fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails or the row does not
    /// exist.
    async fn finalize_supplier_request(
        &mut self,
        record: &SupplierRequestRecord,
    ) -> Result<(), StorageError>;

    /// All audit rows for one reservation, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    async fn list_supplier_requests(
        &mut self,
        aggregate_code: &ReservationCode,
    ) -> Result<Vec<SupplierRequestRecord>, StorageError>;
}

/// One open unit of work across every store.
///
/// All operations observe each other's uncommitted writes. Dropping the
/// transaction without calling [`StorageTx::commit`] rolls everything back.
#[async_trait]
pub trait StorageTx:
    IdempotencyStore
    + ReservationStore
    + PaymentStore
    + OutboxStore
    + DeadLetterStore
    + SupplierRequestStore
    + Send
{
    /// Commits the unit of work.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit fails; the transaction is rolled back.
    async fn commit(self: Box<Self>) -> Result<(), StorageError>;
}

/// Handle that opens units of work.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Begins a transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if a connection or transaction cannot be obtained.
    async fn begin(&self) -> Result<Box<dyn StorageTx>, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_contention_is_retryable() {
        assert!(StorageError::Contention("deadlock detected".to_owned()).is_contention());
        assert!(!StorageError::Database("boom".to_owned()).is_contention());
        assert!(
            !StorageError::VersionConflict {
                code: ReservationCode::new("R1"),
                expected: 3,
            }
            .is_contention()
        );
    }
}
