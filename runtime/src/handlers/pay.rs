//! Paying for a reservation.
//!
//! The capture call to the payment provider runs outside any storage
//! transaction; its result is settled afterwards through a version-checked
//! update. A provider-side idempotency key derived from the client key makes
//! retries safe even across a crash between the capture and the commit: the
//! re-run re-issues the capture and the provider replays its decision.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use surebook_core::{
    CaptureOutcome, CaptureStatus, Clock, IdempotencyStore, Money, OutboxEvent, OutboxStore,
    Payment, PaymentGateway, PaymentState, PaymentStore, Reservation, ReservationCode,
    ReservationStatus, ReservationStore, Storage, StorageError, StorageTx, event_types,
    request_fingerprint,
};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use crate::protected::protected_call;

use super::{HandlerError, Reply, cache_record, idempotency_gate};

/// Idempotency scope for payment capture.
pub(crate) const SCOPE: &str = "RESERVATION_PAY";

/// Request payload for [`PayReservation`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PayReservationRequest {
    /// Opaque provider payment-method token.
    pub payment_method: String,
}

/// What phase one of the command observed, carried across the gateway call.
struct CaptureContext {
    version: i32,
    amount: Money,
    currency: String,
}

/// Captures payment for a reservation and, on success, atomically flips the
/// aggregate to PAID / ON_REQUEST and enqueues the supplier booking.
pub struct PayReservation {
    storage: Arc<dyn Storage>,
    gateway: Arc<dyn PaymentGateway>,
    breaker: CircuitBreaker,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl PayReservation {
    /// A handler over the given storage, payment gateway, and breaker.
    #[must_use]
    pub fn new(
        storage: Arc<dyn Storage>,
        gateway: Arc<dyn PaymentGateway>,
        breaker: CircuitBreaker,
        timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            gateway,
            breaker,
            timeout,
            clock,
        }
    }

    /// Runs the command.
    ///
    /// # Errors
    ///
    /// - [`HandlerError::PaymentDeclined`]: the provider rejected the capture;
    ///   the reservation's payment state is FAILED and the command may be
    ///   retried.
    /// - [`HandlerError::PaymentUnavailable`]: the provider could not be
    ///   reached (or the circuit is open); nothing changed.
    /// - [`HandlerError::CaptureInProgress`]: an earlier capture is awaiting
    ///   provider settlement.
    /// - Plus validation, idempotency-conflict, not-found, and storage errors.
    pub async fn execute(
        &self,
        code: &ReservationCode,
        request: &PayReservationRequest,
        client_key: &str,
    ) -> Result<Reply, HandlerError> {
        if client_key.is_empty() {
            return Err(HandlerError::Validation(
                "idempotency key is required".to_owned(),
            ));
        }
        if request.payment_method.is_empty() {
            return Err(HandlerError::Validation(
                "payment_method is required".to_owned(),
            ));
        }

        let fingerprint = request_fingerprint(&json!({
            "reservation_code": code,
            "payment_method": &request.payment_method,
        }));
        let now = self.clock.now();

        // Phase one: idempotency gate and aggregate guards. Read-only unless
        // it short-circuits.
        let ctx = {
            let mut tx = self.storage.begin().await?;
            if let Some(reply) =
                idempotency_gate(tx.as_mut(), SCOPE, client_key, &fingerprint).await?
            {
                return Ok(reply);
            }
            let reservation =
                tx.get_reservation(code)
                    .await?
                    .ok_or_else(|| HandlerError::NotFound {
                        what: "reservation",
                        key: code.to_string(),
                    })?;
            if matches!(
                reservation.status,
                ReservationStatus::Cancelled | ReservationStatus::CancelledRefund
            ) {
                return Err(HandlerError::Validation(
                    "cannot pay a cancelled reservation".to_owned(),
                ));
            }
            match reservation.payment_status {
                PaymentState::Paid => {
                    // Already paid: answer with the current summary, and cache
                    // it so replays of this key stay byte-identical.
                    let payment = tx.find_captured_payment(code).await?;
                    let reply = Reply::new(200, summary(&reservation, payment.as_ref()));
                    tx.save(&cache_record(
                        SCOPE,
                        client_key,
                        fingerprint,
                        &reply,
                        Some(code.clone()),
                        now,
                    ))
                    .await?;
                    tx.commit().await?;
                    return Ok(reply);
                }
                PaymentState::Pending => {
                    return Err(HandlerError::CaptureInProgress { code: code.clone() });
                }
                PaymentState::Refunded => {
                    return Err(HandlerError::Validation(
                        "reservation payment was refunded".to_owned(),
                    ));
                }
                PaymentState::Unpaid | PaymentState::Failed => {}
            }
            CaptureContext {
                version: reservation.version,
                amount: reservation.total,
                currency: reservation.currency.clone(),
            }
        };

        // Phase two: the capture, outside any transaction. The provider-side
        // key is stable across retries of this client key and distinct across
        // keys, so the provider deduplicates exactly the retries we want it to.
        let provider_key = format!("pay:{code}:{client_key}");
        let outcome = protected_call(&self.breaker, self.timeout, || {
            self.gateway.confirm_payment(
                ctx.amount,
                &ctx.currency,
                &request.payment_method,
                &provider_key,
            )
        })
        .await;

        let capture = match outcome {
            Ok(capture) => capture,
            Err(CircuitBreakerError::Open) => {
                tracing::warn!(reservation_code = %code, "Payment capture rejected: circuit open");
                return Err(HandlerError::PaymentUnavailable {
                    code: code.clone(),
                    reason: "payment provider circuit is open".to_owned(),
                });
            }
            Err(CircuitBreakerError::Inner(err)) => {
                tracing::warn!(
                    reservation_code = %code,
                    error = %err,
                    "Payment capture failed before reaching a decision"
                );
                return Err(HandlerError::PaymentUnavailable {
                    code: code.clone(),
                    reason: err.to_string(),
                });
            }
        };

        // Phase three: settle what the provider decided.
        match capture.status {
            CaptureStatus::Captured => {
                self.settle_captured(code, &capture, &ctx, client_key, fingerprint)
                    .await
            }
            CaptureStatus::Pending => {
                self.settle_pending(code, &capture, &ctx, client_key, fingerprint)
                    .await
            }
            CaptureStatus::Failed => self.settle_declined(code, &capture, &ctx).await,
        }
    }

    /// Funds captured synchronously: PAID, ON_REQUEST, booking enqueued and
    /// response cached, all in one transaction.
    async fn settle_captured(
        &self,
        code: &ReservationCode,
        capture: &CaptureOutcome,
        ctx: &CaptureContext,
        client_key: &str,
        fingerprint: String,
    ) -> Result<Reply, HandlerError> {
        let now = self.clock.now();
        let mut payment = Payment::pending(
            code.clone(),
            self.gateway.provider(),
            capture.provider_transaction_id.clone(),
            ctx.amount,
            &ctx.currency,
            now,
        );
        payment.mark_captured(capture.event_id.clone(), capture.charge_id.clone());

        let mut tx = self.storage.begin().await?;
        match tx
            .update_payment_state(code, PaymentState::Paid, ctx.version)
            .await
        {
            Ok(version) => {
                tx.insert_payment(&payment).await?;
                tx.update_status(code, ReservationStatus::OnRequest, version)
                    .await?;
                tx.enqueue(&OutboxEvent::new(
                    code.clone(),
                    event_types::BOOK_SUPPLIER,
                    json!({ "reservation_code": code }),
                    now,
                ))
                .await?;
                let reservation = tx
                    .get_reservation(code)
                    .await?
                    .ok_or_else(|| reservation_not_found(code))?;
                let reply = Reply::new(200, summary(&reservation, Some(&payment)));
                tx.save(&cache_record(
                    SCOPE,
                    client_key,
                    fingerprint,
                    &reply,
                    Some(code.clone()),
                    now,
                ))
                .await?;
                tx.commit().await?;
                tracing::info!(
                    reservation_code = %code,
                    provider_transaction_id = ?payment.provider_transaction_id,
                    "Payment captured, supplier booking scheduled"
                );
                Ok(reply)
            }
            Err(StorageError::VersionConflict { .. }) => {
                metrics::counter!("surebook_version_conflicts_total").increment(1);
                drop(tx);
                self.reconcile_lost_race(code, capture).await
            }
            Err(err) => Err(err.into()),
        }
    }

    /// The provider accepted the capture and will settle it by webhook.
    async fn settle_pending(
        &self,
        code: &ReservationCode,
        capture: &CaptureOutcome,
        ctx: &CaptureContext,
        client_key: &str,
        fingerprint: String,
    ) -> Result<Reply, HandlerError> {
        let now = self.clock.now();
        let payment = Payment::pending(
            code.clone(),
            self.gateway.provider(),
            capture.provider_transaction_id.clone(),
            ctx.amount,
            &ctx.currency,
            now,
        );

        let mut tx = self.storage.begin().await?;
        match tx
            .update_payment_state(code, PaymentState::Pending, ctx.version)
            .await
        {
            Ok(_) => {
                tx.insert_payment(&payment).await?;
                let reservation = tx
                    .get_reservation(code)
                    .await?
                    .ok_or_else(|| reservation_not_found(code))?;
                let reply = Reply::new(200, summary(&reservation, Some(&payment)));
                tx.save(&cache_record(
                    SCOPE,
                    client_key,
                    fingerprint,
                    &reply,
                    Some(code.clone()),
                    now,
                ))
                .await?;
                tx.commit().await?;
                tracing::info!(
                    reservation_code = %code,
                    provider_transaction_id = ?payment.provider_transaction_id,
                    "Capture initiated, awaiting provider confirmation"
                );
                Ok(reply)
            }
            Err(StorageError::VersionConflict { .. }) => {
                metrics::counter!("surebook_version_conflicts_total").increment(1);
                drop(tx);
                self.reconcile_lost_race(code, capture).await
            }
            Err(err) => Err(err.into()),
        }
    }

    /// The provider declined. The declined row is recorded for the audit
    /// trail and the aggregate moves to FAILED so a later attempt may pay
    /// again. No response is cached: a retry with the same key re-attempts
    /// the capture, and the provider-side key replays the same decision.
    async fn settle_declined(
        &self,
        code: &ReservationCode,
        capture: &CaptureOutcome,
        ctx: &CaptureContext,
    ) -> Result<Reply, HandlerError> {
        let now = self.clock.now();
        let mut payment = Payment::pending(
            code.clone(),
            self.gateway.provider(),
            capture.provider_transaction_id.clone(),
            ctx.amount,
            &ctx.currency,
            now,
        );
        payment.mark_failed(capture.event_id.clone());
        let reason = capture
            .error_message
            .clone()
            .or_else(|| capture.error_code.clone())
            .unwrap_or_else(|| "declined".to_owned());

        let mut tx = self.storage.begin().await?;
        tx.insert_payment(&payment).await?;
        match tx
            .update_payment_state(code, PaymentState::Failed, ctx.version)
            .await
        {
            Ok(_) => {}
            // Another writer advanced the aggregate; its state wins. The
            // declined row above still lands for the audit trail.
            Err(StorageError::VersionConflict { .. }) => {
                metrics::counter!("surebook_version_conflicts_total").increment(1);
            }
            Err(err) => return Err(err.into()),
        }
        tx.commit().await?;
        tracing::warn!(
            reservation_code = %code,
            error_code = ?capture.error_code,
            "Payment declined"
        );
        Err(HandlerError::PaymentDeclined {
            code: code.clone(),
            reason,
        })
    }

    /// Another writer advanced the aggregate while our capture was in flight.
    /// Report the current state; the winning writer recorded its own payment
    /// row, and ours never lands.
    async fn reconcile_lost_race(
        &self,
        code: &ReservationCode,
        capture: &CaptureOutcome,
    ) -> Result<Reply, HandlerError> {
        let mut tx = self.storage.begin().await?;
        let reservation = tx
            .get_reservation(code)
            .await?
            .ok_or_else(|| reservation_not_found(code))?;
        if reservation.is_paid() {
            let payment = tx.find_captured_payment(code).await?;
            tracing::warn!(
                reservation_code = %code,
                provider_transaction_id = ?capture.provider_transaction_id,
                "Lost pay race after capture; provider transaction left for reconciliation"
            );
            Ok(Reply::new(200, summary(&reservation, payment.as_ref())))
        } else {
            Err(HandlerError::Validation(format!(
                "reservation {code} changed state during capture (now {})",
                reservation.status
            )))
        }
    }
}

fn reservation_not_found(code: &ReservationCode) -> HandlerError {
    HandlerError::NotFound {
        what: "reservation",
        key: code.to_string(),
    }
}

fn summary(reservation: &Reservation, payment: Option<&Payment>) -> Value {
    json!({
        "code": reservation.code.as_str(),
        "status": reservation.status.as_str(),
        "payment_status": reservation.payment_status.as_str(),
        "payment": payment.map(|p| json!({
            "provider": &p.provider,
            "provider_transaction_id": &p.provider_transaction_id,
            "charge_id": &p.charge_id,
            "amount_cents": p.amount.cents(),
            "currency": &p.currency,
        })),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use surebook_core::{GatewayError, OutboxStatus, PaymentStatus};
    use surebook_testing::{MemoryStorage, MockPaymentGateway, test_clock};

    fn request() -> PayReservationRequest {
        PayReservationRequest {
            payment_method: "pm_tok_visa".to_owned(),
        }
    }

    fn handler(storage: Arc<MemoryStorage>, gateway: Arc<MockPaymentGateway>) -> PayReservation {
        PayReservation::new(
            storage,
            gateway,
            CircuitBreaker::new(CircuitBreakerConfig::default()),
            Duration::from_secs(5),
            Arc::new(test_clock()),
        )
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

    #[tokio::test]
    async fn capture_flips_to_paid_and_enqueues_the_booking() {
        let storage = MemoryStorage::shared();
        let gateway = MockPaymentGateway::shared();
        let code = seed_reservation(&storage).await;
        let pay = handler(Arc::clone(&storage), Arc::clone(&gateway));

        let reply = pay.execute(&code, &request(), "pay-1").await.unwrap();
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body["status"], "ON_REQUEST");
        assert_eq!(reply.body["payment_status"], "PAID");

        let mut tx = storage.begin().await.unwrap();
        let reservation = tx.get_reservation(&code).await.unwrap().unwrap();
        assert!(reservation.is_paid());
        assert_eq!(reservation.status, ReservationStatus::OnRequest);
        assert_eq!(reservation.version, 2);

        let payment = tx.find_captured_payment(&code).await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Captured);
        assert_eq!(payment.amount, Money::from_cents(12_900));

        let event = tx
            .find_event(&code, event_types::BOOK_SUPPLIER)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.status, OutboxStatus::New);
        assert_eq!(event.payload["reservation_code"], code.as_str());
    }

    #[tokio::test]
    async fn replaying_the_same_key_does_not_capture_twice() {
        let storage = MemoryStorage::shared();
        let gateway = MockPaymentGateway::shared();
        let code = seed_reservation(&storage).await;
        let pay = handler(storage, Arc::clone(&gateway));

        let first = pay.execute(&code, &request(), "pay-1").await.unwrap();
        let second = pay.execute(&code, &request(), "pay-1").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(gateway.call_count(), 1);
    }

    #[tokio::test]
    async fn paying_an_already_paid_reservation_short_circuits() {
        let storage = MemoryStorage::shared();
        let gateway = MockPaymentGateway::shared();
        let code = seed_reservation(&storage).await;
        let pay = handler(Arc::clone(&storage), Arc::clone(&gateway));

        pay.execute(&code, &request(), "pay-1").await.unwrap();
        let reply = pay.execute(&code, &request(), "pay-2").await.unwrap();

        assert_eq!(reply.status, 200);
        assert_eq!(reply.body["payment_status"], "PAID");
        // No second capture, no second mutation.
        assert_eq!(gateway.call_count(), 1);
        let mut tx = storage.begin().await.unwrap();
        let reservation = tx.get_reservation(&code).await.unwrap().unwrap();
        assert_eq!(reservation.version, 2);
    }

    #[tokio::test]
    async fn declined_capture_marks_failed_and_leaves_the_key_reusable() {
        let storage = MemoryStorage::shared();
        let gateway = MockPaymentGateway::shared();
        gateway.respond_with(CaptureOutcome::declined("card_declined", "insufficient funds"));
        let code = seed_reservation(&storage).await;
        let pay = handler(Arc::clone(&storage), Arc::clone(&gateway));

        let err = pay.execute(&code, &request(), "pay-1").await.unwrap_err();
        assert!(matches!(err, HandlerError::PaymentDeclined { .. }));

        let mut tx = storage.begin().await.unwrap();
        let reservation = tx.get_reservation(&code).await.unwrap().unwrap();
        assert_eq!(reservation.payment_status, PaymentState::Failed);
        assert_eq!(reservation.status, ReservationStatus::Pending);
        assert_eq!(reservation.version, 1);
        assert!(
            tx.find_event(&code, event_types::BOOK_SUPPLIER)
                .await
                .unwrap()
                .is_none()
        );
        drop(tx);

        // No cached response for a decline: the same key may try again, and
        // this time the (default-scripted) capture succeeds.
        let reply = pay.execute(&code, &request(), "pay-1").await.unwrap();
        assert_eq!(reply.body["payment_status"], "PAID");
        assert_eq!(gateway.call_count(), 2);
    }

    #[tokio::test]
    async fn pending_capture_waits_for_the_webhook() {
        let storage = MemoryStorage::shared();
        let gateway = MockPaymentGateway::shared();
        gateway.respond_with(CaptureOutcome::pending("pi_async_1"));
        let code = seed_reservation(&storage).await;
        let pay = handler(Arc::clone(&storage), Arc::clone(&gateway));

        let reply = pay.execute(&code, &request(), "pay-1").await.unwrap();
        assert_eq!(reply.body["payment_status"], "PENDING");

        let mut tx = storage.begin().await.unwrap();
        let reservation = tx.get_reservation(&code).await.unwrap().unwrap();
        assert_eq!(reservation.payment_status, PaymentState::Pending);
        assert_eq!(reservation.status, ReservationStatus::Pending);
        // The booking is only enqueued once the webhook settles the capture.
        assert!(
            tx.find_event(&code, event_types::BOOK_SUPPLIER)
                .await
                .unwrap()
                .is_none()
        );
        drop(tx);

        let err = pay.execute(&code, &request(), "pay-2").await.unwrap_err();
        assert!(matches!(err, HandlerError::CaptureInProgress { .. }));
    }

    #[tokio::test]
    async fn provider_outage_changes_nothing() {
        let storage = MemoryStorage::shared();
        let gateway = MockPaymentGateway::shared();
        // Two scripted failures: the immediate transient retry burns one too.
        gateway.fail_with(GatewayError::Transport("connection reset".to_owned()));
        gateway.fail_with(GatewayError::Transport("connection reset".to_owned()));
        let code = seed_reservation(&storage).await;
        let pay = handler(Arc::clone(&storage), Arc::clone(&gateway));

        let err = pay.execute(&code, &request(), "pay-1").await.unwrap_err();
        assert!(matches!(err, HandlerError::PaymentUnavailable { .. }));
        assert_eq!(gateway.call_count(), 2);

        let mut tx = storage.begin().await.unwrap();
        let reservation = tx.get_reservation(&code).await.unwrap().unwrap();
        assert_eq!(reservation.payment_status, PaymentState::Unpaid);
        assert_eq!(reservation.version, 0);
        assert!(tx.find_captured_payment(&code).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transient_blip_is_absorbed_by_the_immediate_retry() {
        let storage = MemoryStorage::shared();
        let gateway = MockPaymentGateway::shared();
        gateway.fail_with(GatewayError::Transport("connection reset".to_owned()));
        let code = seed_reservation(&storage).await;
        let pay = handler(Arc::clone(&storage), Arc::clone(&gateway));

        let reply = pay.execute(&code, &request(), "pay-1").await.unwrap();
        assert_eq!(reply.body["payment_status"], "PAID");
        assert_eq!(gateway.call_count(), 2);
    }

    #[tokio::test]
    async fn open_breaker_fails_fast_without_calling_the_provider() {
        let storage = MemoryStorage::shared();
        let gateway = MockPaymentGateway::shared();
        gateway.fail_with(GatewayError::Transport("connection reset".to_owned()));
        let code = seed_reservation(&storage).await;
        let pay = PayReservation::new(
            Arc::clone(&storage),
            Arc::clone(&gateway),
            CircuitBreaker::new(
                CircuitBreakerConfig::builder()
                    .failure_threshold(1)
                    .cooldown(Duration::from_secs(60))
                    .build(),
            ),
            Duration::from_secs(5),
            Arc::new(test_clock()),
        );

        // First call: one failure trips the breaker, the in-flight retry is
        // already rejected.
        let err = pay.execute(&code, &request(), "pay-1").await.unwrap_err();
        assert!(matches!(err, HandlerError::PaymentUnavailable { .. }));
        assert_eq!(gateway.call_count(), 1);

        // Second call: rejected without touching the provider.
        let err = pay.execute(&code, &request(), "pay-2").await.unwrap_err();
        assert!(matches!(err, HandlerError::PaymentUnavailable { .. }));
        assert_eq!(gateway.call_count(), 1);

        let mut tx = storage.begin().await.unwrap();
        assert_eq!(tx.get_reservation(&code).await.unwrap().unwrap().version, 0);
    }

    #[tokio::test]
    async fn concurrent_pays_settle_exactly_one_capture() {
        let storage = MemoryStorage::shared();
        let gateway = MockPaymentGateway::shared();
        let code = seed_reservation(&storage).await;
        let pay = handler(Arc::clone(&storage), gateway);

        let (a, b) = tokio::join!(
            pay.execute(&code, &request(), "pay-a"),
            pay.execute(&code, &request(), "pay-b"),
        );
        let a = a.unwrap();
        let b = b.unwrap();
        assert_eq!(a.body["payment_status"], "PAID");
        assert_eq!(b.body["payment_status"], "PAID");

        // Exactly two accepted mutations: UNPAID -> PAID and
        // PENDING -> ON_REQUEST. A doubled capture would have produced more.
        let mut tx = storage.begin().await.unwrap();
        let reservation = tx.get_reservation(&code).await.unwrap().unwrap();
        assert!(reservation.is_paid());
        assert_eq!(reservation.version, 2);
        assert!(
            tx.find_event(&code, event_types::BOOK_SUPPLIER)
                .await
                .unwrap()
                .is_some()
        );
    }
}
