//! Settling captures from provider webhooks.
//!
//! Webhooks are delivered at-least-once and out of order. Deduplication rides
//! on the provider event id recorded on the payment row; the aggregate
//! transition re-reads and retries on version conflicts, so a webhook racing
//! a synchronous capture (or another delivery of itself) converges instead of
//! failing.

use std::sync::Arc;

use serde_json::json;
use surebook_core::{
    Clock, OutboxEvent, OutboxStore, PaymentGateway, PaymentState, PaymentStatus, PaymentStore,
    ReservationCode, ReservationStatus, ReservationStore, Storage, StorageError, StorageTx,
    WebhookEvent, WebhookKind, event_types,
};

use super::HandlerError;

/// Conflict retries inside one delivery before surfacing contention.
const MAX_TRANSITION_RETRIES: usize = 3;

/// What a webhook delivery amounted to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// The event was new and its effects were applied.
    Applied,
    /// The event id was already consumed; nothing changed.
    Duplicate,
    /// The event was valid but contradicted settled state (e.g. a failure
    /// arriving after the capture already succeeded); nothing changed.
    Ignored,
}

/// Applies verified provider webhooks to the payment ledger and aggregate.
pub struct HandleProviderWebhook {
    storage: Arc<dyn Storage>,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
}

impl HandleProviderWebhook {
    /// A handler over the given storage and payment gateway.
    #[must_use]
    pub fn new(
        storage: Arc<dyn Storage>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            gateway,
            clock,
        }
    }

    /// Verifies, parses, and applies one webhook delivery.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::Validation`] for bad signatures, unparseable
    /// payloads, and unhandled event types (never silently ignored), and
    /// [`HandlerError::NotFound`] when the referenced transaction is unknown.
    pub async fn execute(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> Result<WebhookOutcome, HandlerError> {
        let event = self
            .gateway
            .parse_webhook(payload, signature)
            .map_err(|err| HandlerError::Validation(err.to_string()))?;
        let provider = self.gateway.provider();

        match &event.kind {
            WebhookKind::PaymentSucceeded => self.apply_succeeded(provider, &event).await,
            WebhookKind::PaymentFailed => self.apply_failed(provider, &event).await,
            WebhookKind::Other(kind) => Err(HandlerError::Validation(format!(
                "unhandled webhook type: {kind}"
            ))),
        }
    }

    async fn apply_succeeded(
        &self,
        provider: &str,
        event: &WebhookEvent,
    ) -> Result<WebhookOutcome, HandlerError> {
        let now = self.clock.now();
        let mut tx = self.storage.begin().await?;
        if tx
            .find_payment_by_provider_event(provider, &event.event_id)
            .await?
            .is_some()
        {
            tracing::info!(event_id = %event.event_id, "Duplicate provider webhook ignored");
            return Ok(WebhookOutcome::Duplicate);
        }
        let payment = tx
            .find_payment_by_transaction(provider, &event.provider_transaction_id)
            .await?
            .ok_or_else(|| HandlerError::NotFound {
                what: "payment",
                key: event.provider_transaction_id.clone(),
            })?;

        tx.mark_payment_captured(payment.id, Some(&event.event_id), None)
            .await?;
        apply_paid_transition(tx.as_mut(), &payment.reservation_code).await?;
        let enqueued = tx
            .enqueue(&OutboxEvent::new(
                payment.reservation_code.clone(),
                event_types::BOOK_SUPPLIER,
                json!({ "reservation_code": payment.reservation_code }),
                now,
            ))
            .await?;
        tx.commit().await?;

        tracing::info!(
            reservation_code = %payment.reservation_code,
            event_id = %event.event_id,
            enqueued,
            "Provider webhook settled capture"
        );
        Ok(WebhookOutcome::Applied)
    }

    async fn apply_failed(
        &self,
        provider: &str,
        event: &WebhookEvent,
    ) -> Result<WebhookOutcome, HandlerError> {
        let mut tx = self.storage.begin().await?;
        if tx
            .find_payment_by_provider_event(provider, &event.event_id)
            .await?
            .is_some()
        {
            tracing::info!(event_id = %event.event_id, "Duplicate provider webhook ignored");
            return Ok(WebhookOutcome::Duplicate);
        }
        let payment = tx
            .find_payment_by_transaction(provider, &event.provider_transaction_id)
            .await?
            .ok_or_else(|| HandlerError::NotFound {
                what: "payment",
                key: event.provider_transaction_id.clone(),
            })?;

        if payment.status == PaymentStatus::Captured {
            tracing::warn!(
                reservation_code = %payment.reservation_code,
                event_id = %event.event_id,
                "Ignoring failure webhook for an already captured payment"
            );
            return Ok(WebhookOutcome::Ignored);
        }

        tx.mark_payment_failed(payment.id, Some(&event.event_id))
            .await?;
        apply_failed_transition(tx.as_mut(), &payment.reservation_code).await?;
        tx.commit().await?;

        tracing::warn!(
            reservation_code = %payment.reservation_code,
            event_id = %event.event_id,
            "Provider webhook reported capture failure"
        );
        Ok(WebhookOutcome::Applied)
    }
}

/// Flips the aggregate to PAID (and PENDING reservations to ON_REQUEST),
/// re-reading on version conflicts. A no-op when already paid.
async fn apply_paid_transition(
    tx: &mut dyn StorageTx,
    code: &ReservationCode,
) -> Result<(), HandlerError> {
    for _ in 0..MAX_TRANSITION_RETRIES {
        let Some(reservation) = tx.get_reservation(code).await? else {
            return Err(HandlerError::NotFound {
                what: "reservation",
                key: code.to_string(),
            });
        };
        if reservation.is_paid() {
            return Ok(());
        }
        match tx
            .update_payment_state(code, PaymentState::Paid, reservation.version)
            .await
        {
            Ok(version) => {
                if reservation.status == ReservationStatus::Pending {
                    tx.update_status(code, ReservationStatus::OnRequest, version)
                        .await?;
                }
                return Ok(());
            }
            Err(StorageError::VersionConflict { .. }) => {
                metrics::counter!("surebook_version_conflicts_total").increment(1);
            }
            Err(err) => return Err(err.into()),
        }
    }
    Err(HandlerError::Storage(StorageError::Contention(format!(
        "could not settle paid state for {code}"
    ))))
}

/// Flips the aggregate's payment state to FAILED unless the capture already
/// settled successfully, in which case the success stands.
async fn apply_failed_transition(
    tx: &mut dyn StorageTx,
    code: &ReservationCode,
) -> Result<(), HandlerError> {
    for _ in 0..MAX_TRANSITION_RETRIES {
        let Some(reservation) = tx.get_reservation(code).await? else {
            return Err(HandlerError::NotFound {
                what: "reservation",
                key: code.to_string(),
            });
        };
        if reservation.is_paid() {
            tracing::warn!(reservation_code = %code, "Capture failure lost to an earlier success");
            return Ok(());
        }
        if reservation.payment_status == PaymentState::Failed {
            return Ok(());
        }
        match tx
            .update_payment_state(code, PaymentState::Failed, reservation.version)
            .await
        {
            Ok(_) => return Ok(()),
            Err(StorageError::VersionConflict { .. }) => {
                metrics::counter!("surebook_version_conflicts_total").increment(1);
            }
            Err(err) => return Err(err.into()),
        }
    }
    Err(HandlerError::Storage(StorageError::Contention(format!(
        "could not settle failed state for {code}"
    ))))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
    use crate::handlers::pay::{PayReservation, PayReservationRequest};
    use std::time::Duration;
    use surebook_core::{Money, Payment, Reservation};
    use surebook_testing::{MemoryStorage, MockPaymentGateway, mocks::webhook_payload, test_clock};

    const SIGNATURE: &str = "test-signature";

    fn handler(
        storage: Arc<MemoryStorage>,
        gateway: Arc<MockPaymentGateway>,
    ) -> HandleProviderWebhook {
        HandleProviderWebhook::new(storage, gateway, Arc::new(test_clock()))
    }

    async fn seed_reservation(storage: &MemoryStorage) -> ReservationCode {
        let code = ReservationCode::generate();
        let mut tx = storage.begin().await.unwrap();
        tx.insert_reservation(&Reservation::new(
            code.clone(),
            "hertz",
            "PT",
            Money::from_cents(12_900),
            "EUR",
            test_clock().now(),
        ))
        .await
        .unwrap();
        tx.commit().await.unwrap();
        code
    }

    /// A reservation whose capture is awaiting provider settlement.
    async fn seed_pending_capture(storage: &MemoryStorage, txid: &str) -> ReservationCode {
        let code = seed_reservation(storage).await;
        let mut tx = storage.begin().await.unwrap();
        tx.insert_payment(&Payment::pending(
            code.clone(),
            "mock",
            Some(txid.to_owned()),
            Money::from_cents(12_900),
            "EUR",
            test_clock().now(),
        ))
        .await
        .unwrap();
        tx.update_payment_state(&code, PaymentState::Pending, 0)
            .await
            .unwrap();
        tx.commit().await.unwrap();
        code
    }

    #[tokio::test]
    async fn succeeded_webhook_settles_a_pending_capture() {
        let storage = MemoryStorage::shared();
        let gateway = MockPaymentGateway::shared();
        let code = seed_pending_capture(&storage, "pi_async_1").await;
        let webhook = handler(Arc::clone(&storage), gateway);

        let outcome = webhook
            .execute(
                &webhook_payload("evt_1", "payment_intent.succeeded", "pi_async_1"),
                SIGNATURE,
            )
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Applied);

        let mut tx = storage.begin().await.unwrap();
        let reservation = tx.get_reservation(&code).await.unwrap().unwrap();
        assert!(reservation.is_paid());
        assert_eq!(reservation.status, ReservationStatus::OnRequest);

        let payment = tx.find_captured_payment(&code).await.unwrap().unwrap();
        assert_eq!(payment.provider_event_id.as_deref(), Some("evt_1"));

        assert!(
            tx.find_event(&code, event_types::BOOK_SUPPLIER)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn redelivered_webhook_is_deduplicated_on_event_id() {
        let storage = MemoryStorage::shared();
        let gateway = MockPaymentGateway::shared();
        let code = seed_pending_capture(&storage, "pi_async_1").await;
        let webhook = handler(Arc::clone(&storage), gateway);
        let payload = webhook_payload("evt_1", "payment_intent.succeeded", "pi_async_1");

        let first = webhook.execute(&payload, SIGNATURE).await.unwrap();
        let version_after_first = {
            let mut tx = storage.begin().await.unwrap();
            tx.get_reservation(&code).await.unwrap().unwrap().version
        };
        let second = webhook.execute(&payload, SIGNATURE).await.unwrap();

        assert_eq!(first, WebhookOutcome::Applied);
        assert_eq!(second, WebhookOutcome::Duplicate);
        let mut tx = storage.begin().await.unwrap();
        let reservation = tx.get_reservation(&code).await.unwrap().unwrap();
        assert_eq!(reservation.version, version_after_first);
    }

    #[tokio::test]
    async fn failure_webhook_marks_the_capture_failed() {
        let storage = MemoryStorage::shared();
        let gateway = MockPaymentGateway::shared();
        let code = seed_pending_capture(&storage, "pi_async_1").await;
        let webhook = handler(Arc::clone(&storage), gateway);

        let outcome = webhook
            .execute(
                &webhook_payload("evt_9", "payment_intent.payment_failed", "pi_async_1"),
                SIGNATURE,
            )
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Applied);

        let mut tx = storage.begin().await.unwrap();
        let reservation = tx.get_reservation(&code).await.unwrap().unwrap();
        assert_eq!(reservation.payment_status, PaymentState::Failed);
        assert_eq!(reservation.status, ReservationStatus::Pending);
        assert!(
            tx.find_event(&code, event_types::BOOK_SUPPLIER)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn late_failure_after_success_is_ignored() {
        let storage = MemoryStorage::shared();
        let gateway = MockPaymentGateway::shared();
        let code = seed_pending_capture(&storage, "pi_async_1").await;
        let webhook = handler(Arc::clone(&storage), gateway);

        webhook
            .execute(
                &webhook_payload("evt_1", "payment_intent.succeeded", "pi_async_1"),
                SIGNATURE,
            )
            .await
            .unwrap();
        let outcome = webhook
            .execute(
                &webhook_payload("evt_2", "payment_intent.payment_failed", "pi_async_1"),
                SIGNATURE,
            )
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Ignored);

        let mut tx = storage.begin().await.unwrap();
        let reservation = tx.get_reservation(&code).await.unwrap().unwrap();
        assert!(reservation.is_paid());
        let payment = tx.find_captured_payment(&code).await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Captured);
    }

    #[tokio::test]
    async fn webhook_after_synchronous_capture_does_not_double_book() {
        let storage = MemoryStorage::shared();
        let gateway = MockPaymentGateway::shared();
        let code = seed_reservation(&storage).await;

        // Synchronous capture books and enqueues; default mock txid is pi_1.
        let pay = PayReservation::new(
            Arc::clone(&storage),
            Arc::clone(&gateway),
            CircuitBreaker::new(CircuitBreakerConfig::default()),
            Duration::from_secs(5),
            Arc::new(test_clock()),
        );
        pay.execute(
            &code,
            &PayReservationRequest {
                payment_method: "pm_tok_visa".to_owned(),
            },
            "pay-1",
        )
        .await
        .unwrap();

        let webhook = handler(Arc::clone(&storage), gateway);
        let outcome = webhook
            .execute(
                &webhook_payload("evt_1", "payment_intent.succeeded", "pi_1"),
                SIGNATURE,
            )
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Applied);

        // Aggregate untouched (already paid) and no second outbox event.
        let mut tx = storage.begin().await.unwrap();
        let reservation = tx.get_reservation(&code).await.unwrap().unwrap();
        assert_eq!(reservation.version, 2);
        let event = tx
            .find_event(&code, event_types::BOOK_SUPPLIER)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.status, surebook_core::OutboxStatus::New);
    }

    #[tokio::test]
    async fn unknown_transaction_is_not_found() {
        let storage = MemoryStorage::shared();
        let gateway = MockPaymentGateway::shared();
        seed_pending_capture(&storage, "pi_async_1").await;
        let webhook = handler(storage, gateway);

        let err = webhook
            .execute(
                &webhook_payload("evt_1", "payment_intent.succeeded", "pi_other"),
                SIGNATURE,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::NotFound { .. }));
    }

    #[tokio::test]
    async fn bad_signature_is_rejected() {
        let storage = MemoryStorage::shared();
        let gateway = MockPaymentGateway::shared();
        let webhook = handler(storage, gateway);

        let err = webhook
            .execute(
                &webhook_payload("evt_1", "payment_intent.succeeded", "pi_async_1"),
                "forged",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Validation(_)));
    }

    #[tokio::test]
    async fn unhandled_event_type_is_rejected_not_swallowed() {
        let storage = MemoryStorage::shared();
        let gateway = MockPaymentGateway::shared();
        seed_pending_capture(&storage, "pi_async_1").await;
        let webhook = handler(storage, gateway);

        let err = webhook
            .execute(
                &webhook_payload("evt_1", "charge.refunded", "pi_async_1"),
                SIGNATURE,
            )
            .await
            .unwrap_err();
        assert!(
            matches!(&err, HandlerError::Validation(message) if message.contains("charge.refunded")),
            "expected validation error, got {err:?}"
        );
    }
}
