//! In-memory [`Storage`] implementation.
//!
//! Backed by one dataset behind an async mutex. A transaction takes the lock
//! for its whole lifetime and works on a private copy: reads observe the
//! transaction's own writes, [`StorageTx::commit`] publishes the copy
//! atomically, and dropping the transaction discards it. Serializing
//! transactions this way keeps the conditional-update and claim contracts
//! honest — exactly one concurrent claimer wins, stale versions conflict —
//! without imitating row locks.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use surebook_core::store::{
    DeadLetterStore, IdempotencyStore, OutboxStore, PaymentStore, ReservationStore, Storage,
    StorageError, StorageTx, SupplierRequestStore,
};
use surebook_core::{
    DeadLetterRecord, IdempotencyRecord, OutboxEvent, OutboxStatus, Payment, PaymentState,
    PaymentStatus, Reservation, ReservationCode, ReservationStatus, SupplierRequestRecord,
};

#[derive(Clone, Debug, Default)]
struct DataSet {
    reservations: HashMap<ReservationCode, Reservation>,
    payments: Vec<Payment>,
    outbox: Vec<OutboxEvent>,
    dead_letters: Vec<DeadLetterRecord>,
    idempotency: HashMap<(String, String), IdempotencyRecord>,
    supplier_requests: Vec<SupplierRequestRecord>,
}

/// In-memory storage with serialized, rollback-capable transactions.
#[derive(Clone, Debug, Default)]
pub struct MemoryStorage {
    data: Arc<Mutex<DataSet>>,
}

impl MemoryStorage {
    /// Creates empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates empty storage behind an `Arc`, ready to hand to handlers.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn begin(&self) -> Result<Box<dyn StorageTx>, StorageError> {
        let guard = Arc::clone(&self.data).lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTx { guard, working }))
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<DataSet>,
    working: DataSet,
}

fn claimable(event: &OutboxEvent, now: DateTime<Utc>) -> bool {
    let status_ok = matches!(
        event.status,
        OutboxStatus::New | OutboxStatus::Retry | OutboxStatus::InProgress
    );
    let ready = event.next_attempt_at.is_none_or(|t| t <= now);
    let unlocked = event.lock_expires_at.is_none_or(|t| t <= now);
    status_ok && ready && unlocked
}

fn apply_claim(event: &mut OutboxEvent, worker_id: &str, now: DateTime<Utc>, lock_ttl: Duration) {
    event.status = OutboxStatus::InProgress;
    event.locked_by = Some(worker_id.to_owned());
    event.lock_expires_at = Some(now + lock_ttl);
}

impl MemoryTx {
    fn outbox_by_id(&mut self, event_id: Uuid) -> Result<&mut OutboxEvent, StorageError> {
        self.working
            .outbox
            .iter_mut()
            .find(|e| e.id == event_id)
            .ok_or_else(|| StorageError::Database(format!("Unknown outbox event: {event_id}")))
    }

    fn payment_by_id(&mut self, payment_id: Uuid) -> Result<&mut Payment, StorageError> {
        self.working
            .payments
            .iter_mut()
            .find(|p| p.id == payment_id)
            .ok_or_else(|| StorageError::Database(format!("Unknown payment: {payment_id}")))
    }

    /// A conditional update's target row. Missing and stale both surface as
    /// a version conflict, matching what a zero-row `UPDATE` can observe.
    fn reservation_for_update(
        &mut self,
        code: &ReservationCode,
        expected_version: i32,
    ) -> Result<&mut Reservation, StorageError> {
        match self.working.reservations.get_mut(code) {
            Some(r) if r.version == expected_version => Ok(r),
            _ => Err(StorageError::VersionConflict {
                code: code.clone(),
                expected: expected_version,
            }),
        }
    }
}

#[async_trait]
impl IdempotencyStore for MemoryTx {
    async fn get(
        &mut self,
        scope: &str,
        client_key: &str,
    ) -> Result<Option<IdempotencyRecord>, StorageError> {
        Ok(self
            .working
            .idempotency
            .get(&(scope.to_owned(), client_key.to_owned()))
            .cloned())
    }

    async fn save(&mut self, record: &IdempotencyRecord) -> Result<(), StorageError> {
        let key = (record.scope.clone(), record.client_key.clone());
        if self.working.idempotency.contains_key(&key) {
            return Err(StorageError::Database(format!(
                "Idempotency record already exists: {}/{}",
                record.scope, record.client_key
            )));
        }
        self.working.idempotency.insert(key, record.clone());
        Ok(())
    }
}

#[async_trait]
impl ReservationStore for MemoryTx {
    async fn get_reservation(
        &mut self,
        code: &ReservationCode,
    ) -> Result<Option<Reservation>, StorageError> {
        Ok(self.working.reservations.get(code).cloned())
    }

    async fn insert_reservation(&mut self, reservation: &Reservation) -> Result<(), StorageError> {
        if self.working.reservations.contains_key(&reservation.code) {
            return Err(StorageError::Database(format!(
                "Reservation already exists: {}",
                reservation.code
            )));
        }
        self.working
            .reservations
            .insert(reservation.code.clone(), reservation.clone());
        Ok(())
    }

    async fn update_payment_state(
        &mut self,
        code: &ReservationCode,
        state: PaymentState,
        expected_version: i32,
    ) -> Result<i32, StorageError> {
        let reservation = self.reservation_for_update(code, expected_version)?;
        reservation.payment_status = state;
        reservation.version += 1;
        Ok(reservation.version)
    }

    async fn update_status(
        &mut self,
        code: &ReservationCode,
        status: ReservationStatus,
        expected_version: i32,
    ) -> Result<i32, StorageError> {
        let reservation = self.reservation_for_update(code, expected_version)?;
        reservation.status = status;
        reservation.version += 1;
        Ok(reservation.version)
    }

    async fn mark_confirmed(
        &mut self,
        code: &ReservationCode,
        confirmation_code: &str,
        confirmed_at: DateTime<Utc>,
        expected_version: i32,
    ) -> Result<i32, StorageError> {
        let reservation = self.reservation_for_update(code, expected_version)?;
        reservation.status = ReservationStatus::Confirmed;
        reservation.supplier_confirmation_code = Some(confirmation_code.to_owned());
        reservation.supplier_confirmed_at = Some(confirmed_at);
        reservation.version += 1;
        Ok(reservation.version)
    }
}

#[async_trait]
impl PaymentStore for MemoryTx {
    async fn insert_payment(&mut self, payment: &Payment) -> Result<(), StorageError> {
        self.working.payments.push(payment.clone());
        Ok(())
    }

    async fn find_payment_by_transaction(
        &mut self,
        provider: &str,
        provider_transaction_id: &str,
    ) -> Result<Option<Payment>, StorageError> {
        Ok(self
            .working
            .payments
            .iter()
            .rev()
            .find(|p| {
                p.provider == provider
                    && p.provider_transaction_id.as_deref() == Some(provider_transaction_id)
            })
            .cloned())
    }

    async fn find_payment_by_provider_event(
        &mut self,
        provider: &str,
        provider_event_id: &str,
    ) -> Result<Option<Payment>, StorageError> {
        Ok(self
            .working
            .payments
            .iter()
            .rev()
            .find(|p| {
                p.provider == provider
                    && p.provider_event_id.as_deref() == Some(provider_event_id)
            })
            .cloned())
    }

    async fn find_captured_payment(
        &mut self,
        code: &ReservationCode,
    ) -> Result<Option<Payment>, StorageError> {
        Ok(self
            .working
            .payments
            .iter()
            .rev()
            .find(|p| p.reservation_code == *code && p.status == PaymentStatus::Captured)
            .cloned())
    }

    async fn mark_payment_captured(
        &mut self,
        payment_id: Uuid,
        provider_event_id: Option<&str>,
        charge_id: Option<&str>,
    ) -> Result<(), StorageError> {
        let payment = self.payment_by_id(payment_id)?;
        payment.mark_captured(
            provider_event_id.map(ToOwned::to_owned),
            charge_id.map(ToOwned::to_owned),
        );
        Ok(())
    }

    async fn mark_payment_failed(
        &mut self,
        payment_id: Uuid,
        provider_event_id: Option<&str>,
    ) -> Result<(), StorageError> {
        let payment = self.payment_by_id(payment_id)?;
        payment.mark_failed(provider_event_id.map(ToOwned::to_owned));
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for MemoryTx {
    async fn enqueue(&mut self, event: &OutboxEvent) -> Result<bool, StorageError> {
        let live_exists = self.working.outbox.iter().any(|e| {
            e.aggregate_code == event.aggregate_code
                && e.event_type == event.event_type
                && !e.status.is_terminal()
        });
        if live_exists {
            return Ok(false);
        }
        self.working.outbox.push(event.clone());
        Ok(true)
    }

    async fn claim(
        &mut self,
        aggregate_code: &ReservationCode,
        event_type: &str,
        worker_id: &str,
        now: DateTime<Utc>,
        lock_ttl: Duration,
    ) -> Result<Option<OutboxEvent>, StorageError> {
        let Some(event) = self.working.outbox.iter_mut().find(|e| {
            e.aggregate_code == *aggregate_code
                && e.event_type == event_type
                && claimable(e, now)
        }) else {
            return Ok(None);
        };
        apply_claim(event, worker_id, now, lock_ttl);
        Ok(Some(event.clone()))
    }

    async fn claim_ready(
        &mut self,
        event_type: &str,
        limit: usize,
        worker_id: &str,
        now: DateTime<Utc>,
        lock_ttl: Duration,
    ) -> Result<Vec<OutboxEvent>, StorageError> {
        let mut ready: Vec<usize> = self
            .working
            .outbox
            .iter()
            .enumerate()
            .filter(|(_, e)| e.event_type == event_type && claimable(e, now))
            .map(|(i, _)| i)
            .collect();
        ready.sort_by_key(|&i| {
            let e = &self.working.outbox[i];
            (e.next_attempt_at, e.created_at)
        });
        ready.truncate(limit);

        let mut claimed = Vec::with_capacity(ready.len());
        for i in ready {
            let event = &mut self.working.outbox[i];
            apply_claim(event, worker_id, now, lock_ttl);
            claimed.push(event.clone());
        }
        Ok(claimed)
    }

    async fn mark_done(&mut self, event_id: Uuid) -> Result<(), StorageError> {
        let event = self.outbox_by_id(event_id)?;
        event.status = OutboxStatus::Done;
        event.locked_by = None;
        event.lock_expires_at = None;
        Ok(())
    }

    async fn mark_retry(
        &mut self,
        event_id: Uuid,
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
        error_code: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<(), StorageError> {
        let event = self.outbox_by_id(event_id)?;
        event.status = OutboxStatus::Retry;
        event.attempts = attempts;
        event.next_attempt_at = Some(next_attempt_at);
        event.last_error_code = error_code.map(ToOwned::to_owned);
        event.last_error_message = error_message.map(ToOwned::to_owned);
        event.locked_by = None;
        event.lock_expires_at = None;
        Ok(())
    }

    async fn mark_failed(
        &mut self,
        event_id: Uuid,
        attempts: i32,
        error_code: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<(), StorageError> {
        let event = self.outbox_by_id(event_id)?;
        event.status = OutboxStatus::Failed;
        event.attempts = attempts;
        event.next_attempt_at = None;
        event.last_error_code = error_code.map(ToOwned::to_owned);
        event.last_error_message = error_message.map(ToOwned::to_owned);
        event.locked_by = None;
        event.lock_expires_at = None;
        Ok(())
    }

    async fn find_event(
        &mut self,
        aggregate_code: &ReservationCode,
        event_type: &str,
    ) -> Result<Option<OutboxEvent>, StorageError> {
        Ok(self
            .working
            .outbox
            .iter()
            .rev()
            .find(|e| e.aggregate_code == *aggregate_code && e.event_type == event_type)
            .cloned())
    }
}

#[async_trait]
impl DeadLetterStore for MemoryTx {
    async fn archive(&mut self, record: &DeadLetterRecord) -> Result<(), StorageError> {
        self.working.dead_letters.push(record.clone());
        Ok(())
    }

    async fn list_for_aggregate(
        &mut self,
        aggregate_code: &ReservationCode,
    ) -> Result<Vec<DeadLetterRecord>, StorageError> {
        Ok(self
            .working
            .dead_letters
            .iter()
            .filter(|d| d.aggregate_code == *aggregate_code)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SupplierRequestStore for MemoryTx {
    async fn insert_supplier_request(
        &mut self,
        record: &SupplierRequestRecord,
    ) -> Result<(), StorageError> {
        self.working.supplier_requests.push(record.clone());
        Ok(())
    }

    async fn finalize_supplier_request(
        &mut self,
        record: &SupplierRequestRecord,
    ) -> Result<(), StorageError> {
        let slot = self
            .working
            .supplier_requests
            .iter_mut()
            .find(|r| r.id == record.id)
            .ok_or_else(|| {
                StorageError::Database(format!("Unknown supplier request: {}", record.id))
            })?;
        *slot = record.clone();
        Ok(())
    }

    async fn list_supplier_requests(
        &mut self,
        aggregate_code: &ReservationCode,
    ) -> Result<Vec<SupplierRequestRecord>, StorageError> {
        let mut rows: Vec<SupplierRequestRecord> = self
            .working
            .supplier_requests
            .iter()
            .filter(|r| r.reservation_code == *aggregate_code)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.created_at);
        Ok(rows)
    }
}

#[async_trait]
impl StorageTx for MemoryTx {
    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let mut guard = self.guard;
        *guard = self.working;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use surebook_core::{Money, event_types};

    fn reservation(code: &str) -> Reservation {
        Reservation::new(
            ReservationCode::new(code),
            "hertz",
            "PT",
            Money::from_cents(10_000),
            "EUR",
            Utc::now(),
        )
    }

    fn book_event(code: &str, now: DateTime<Utc>) -> OutboxEvent {
        OutboxEvent::new(
            ReservationCode::new(code),
            event_types::BOOK_SUPPLIER,
            serde_json::json!({"reservation_code": code}),
            now,
        )
    }

    #[tokio::test]
    async fn commit_publishes_and_drop_rolls_back() {
        let storage = MemoryStorage::new();

        let mut tx = storage.begin().await.unwrap();
        tx.insert_reservation(&reservation("R1")).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = storage.begin().await.unwrap();
        tx.insert_reservation(&reservation("R2")).await.unwrap();
        assert!(
            tx.get_reservation(&ReservationCode::new("R2"))
                .await
                .unwrap()
                .is_some(),
            "uncommitted writes must be visible inside the transaction"
        );
        drop(tx);

        let mut tx = storage.begin().await.unwrap();
        assert!(
            tx.get_reservation(&ReservationCode::new("R1"))
                .await
                .unwrap()
                .is_some()
        );
        assert!(
            tx.get_reservation(&ReservationCode::new("R2"))
                .await
                .unwrap()
                .is_none(),
            "dropped transaction must roll back"
        );
    }

    #[tokio::test]
    async fn stale_version_conflicts() {
        let storage = MemoryStorage::new();
        let code = ReservationCode::new("R1");

        let mut tx = storage.begin().await.unwrap();
        tx.insert_reservation(&reservation("R1")).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = storage.begin().await.unwrap();
        let v1 = tx
            .update_payment_state(&code, PaymentState::Paid, 0)
            .await
            .unwrap();
        assert_eq!(v1, 1);
        tx.commit().await.unwrap();

        let mut tx = storage.begin().await.unwrap();
        let err = tx
            .update_status(&code, ReservationStatus::OnRequest, 0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::VersionConflict { expected: 0, .. }
        ));
    }

    #[tokio::test]
    async fn exactly_one_claim_wins() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        let code = ReservationCode::new("R1");

        let mut tx = storage.begin().await.unwrap();
        tx.enqueue(&book_event("R1", now)).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = storage.begin().await.unwrap();
        let first = tx
            .claim(&code, event_types::BOOK_SUPPLIER, "worker-a", now, Duration::seconds(30))
            .await
            .unwrap();
        assert!(first.is_some());
        tx.commit().await.unwrap();

        let mut tx = storage.begin().await.unwrap();
        let second = tx
            .claim(&code, event_types::BOOK_SUPPLIER, "worker-b", now, Duration::seconds(30))
            .await
            .unwrap();
        assert!(second.is_none(), "claimed event must not be claimable again");
    }

    #[tokio::test]
    async fn expired_lock_becomes_claimable() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        let code = ReservationCode::new("R1");

        let mut tx = storage.begin().await.unwrap();
        tx.enqueue(&book_event("R1", now)).await.unwrap();
        let claimed = tx
            .claim(&code, event_types::BOOK_SUPPLIER, "worker-a", now, Duration::seconds(30))
            .await
            .unwrap();
        assert!(claimed.is_some());
        tx.commit().await.unwrap();

        let later = now + Duration::seconds(31);
        let mut tx = storage.begin().await.unwrap();
        let reclaimed = tx
            .claim(&code, event_types::BOOK_SUPPLIER, "worker-b", later, Duration::seconds(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.locked_by.as_deref(), Some("worker-b"));
    }

    #[tokio::test]
    async fn enqueue_is_insert_if_absent_over_live_events() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        let code = ReservationCode::new("R1");

        let mut tx = storage.begin().await.unwrap();
        assert!(tx.enqueue(&book_event("R1", now)).await.unwrap());
        assert!(
            !tx.enqueue(&book_event("R1", now)).await.unwrap(),
            "live event must suppress a duplicate"
        );
        let claimed = tx
            .claim(&code, event_types::BOOK_SUPPLIER, "w", now, Duration::seconds(30))
            .await
            .unwrap()
            .unwrap();
        tx.mark_done(claimed.id).await.unwrap();
        assert!(
            tx.enqueue(&book_event("R1", now)).await.unwrap(),
            "terminal event must not suppress a new one"
        );
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn claim_ready_respects_limit_and_readiness() {
        let storage = MemoryStorage::new();
        let now = Utc::now();

        let mut tx = storage.begin().await.unwrap();
        tx.enqueue(&book_event("R1", now)).await.unwrap();
        tx.enqueue(&book_event("R2", now)).await.unwrap();
        let mut not_ready = book_event("R3", now);
        not_ready.next_attempt_at = Some(now + Duration::seconds(60));
        tx.enqueue(&not_ready).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = storage.begin().await.unwrap();
        let claimed = tx
            .claim_ready(event_types::BOOK_SUPPLIER, 10, "w", now, Duration::seconds(30))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 2, "future next_attempt_at must not be claimed");
    }

    #[tokio::test]
    async fn duplicate_idempotency_save_is_rejected() {
        let storage = MemoryStorage::new();
        let record = IdempotencyRecord::new(
            "RESERVATION_CREATE",
            "key-1",
            "fp".to_owned(),
            serde_json::json!({"ok": true}),
            201,
            None,
            Utc::now(),
        );

        let mut tx = storage.begin().await.unwrap();
        tx.save(&record).await.unwrap();
        assert!(tx.save(&record).await.is_err());
    }
}
