//! Delivering BOOK_SUPPLIER outbox events to supplier gateways.
//!
//! An event is claimed (flipped to IN_PROGRESS under a worker lock), the
//! booking call goes out through the circuit breaker with the event's stable
//! idempotency key, and the outcome settles the event: DONE on confirmation,
//! RETRY with exponential backoff on any failed attempt, FAILED plus a
//! dead-letter row once attempts are exhausted. Claiming, calling, and
//! settling are three separate transactions so the supplier call never runs
//! inside one and a crash at any point leaves a recoverable row behind.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use surebook_core::{
    BookingOutcome, BookingStatus, Clock, DeadLetterRecord, DeadLetterStore, GatewayError,
    OutboxEvent, OutboxStore, ReservationCode, ReservationStore, Storage, StorageError, StorageTx,
    SupplierRequestRecord, SupplierRequestStore, event_types, request_types, retry_backoff,
};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use crate::config::OutboxConfig;
use crate::protected::protected_call;
use crate::registry::SupplierRegistry;

use super::HandlerError;

/// Conflict retries while recording the confirmation.
const MAX_CONFIRM_RETRIES: usize = 3;

/// How one claimed event was settled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The supplier confirmed; the reservation is CONFIRMED and the event is
    /// DONE.
    Confirmed {
        /// Confirmation code assigned by the supplier.
        confirmation_code: String,
    },
    /// The attempt failed; the event is RETRY and claimable again at
    /// `next_attempt_at`.
    Scheduled {
        /// Attempts completed so far, this one included.
        attempts: i32,
        /// Earliest time the next attempt may run.
        next_attempt_at: DateTime<Utc>,
    },
    /// Attempts are exhausted; the event is FAILED and archived for triage.
    DeadLettered {
        /// Total attempts made.
        attempts: i32,
    },
}

/// Claims and delivers one aggregate's BOOK_SUPPLIER event.
pub struct ProcessOutboxBookSupplier {
    storage: Arc<dyn Storage>,
    registry: Arc<SupplierRegistry>,
    breaker: CircuitBreaker,
    timeout: Duration,
    clock: Arc<dyn Clock>,
    outbox: OutboxConfig,
}

impl ProcessOutboxBookSupplier {
    /// A processor over the given storage, registry, and breaker.
    #[must_use]
    pub fn new(
        storage: Arc<dyn Storage>,
        registry: Arc<SupplierRegistry>,
        breaker: CircuitBreaker,
        timeout: Duration,
        clock: Arc<dyn Clock>,
        outbox: OutboxConfig,
    ) -> Self {
        Self {
            storage,
            registry,
            breaker,
            timeout,
            clock,
            outbox,
        }
    }

    /// Claims the aggregate's live event and processes it.
    ///
    /// `idem_key` is forwarded to the supplier so that redeliveries of the
    /// same event deduplicate on their side; callers must keep it stable per
    /// event (the background worker uses the event id).
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::NoEventReady`] when nothing was claimable —
    /// no live event, not yet due, or locked by another worker. Failed
    /// supplier attempts are NOT errors; they settle the event and report
    /// [`ProcessOutcome::Scheduled`] or [`ProcessOutcome::DeadLettered`].
    pub async fn execute(
        &self,
        code: &ReservationCode,
        idem_key: &str,
        worker_id: &str,
    ) -> Result<ProcessOutcome, HandlerError> {
        if idem_key.is_empty() {
            return Err(HandlerError::Validation(
                "idempotency key is required".to_owned(),
            ));
        }
        if worker_id.is_empty() {
            return Err(HandlerError::Validation("worker id is required".to_owned()));
        }

        let now = self.clock.now();
        let mut tx = self.storage.begin().await?;
        let Some(event) = tx
            .claim(
                code,
                event_types::BOOK_SUPPLIER,
                worker_id,
                now,
                self.outbox.lock_ttl(),
            )
            .await?
        else {
            return Err(HandlerError::NoEventReady { code: code.clone() });
        };
        tx.commit().await?;
        metrics::counter!("surebook_outbox_claims_total").increment(1);
        tracing::debug!(
            reservation_code = %code,
            event_id = %event.id,
            worker_id,
            attempt = event.attempts + 1,
            "Claimed outbox event"
        );

        self.process_claimed(&event, idem_key).await
    }

    /// Processes an event the caller already claimed (and still holds the
    /// lock for).
    ///
    /// # Errors
    ///
    /// Storage errors only; supplier failures settle the event instead.
    pub async fn process_claimed(
        &self,
        event: &OutboxEvent,
        idem_key: &str,
    ) -> Result<ProcessOutcome, HandlerError> {
        let code = &event.aggregate_code;
        let attempt_number = event.attempts + 1;
        let now = self.clock.now();

        // Aggregate snapshot, routing, and the audit row — before any I/O.
        // Unresolvable events go through the same retry/dead-letter path as
        // failed calls; nothing is left wedged IN_PROGRESS.
        let mut tx = self.storage.begin().await?;
        let Some(reservation) = tx.get_reservation(code).await? else {
            drop(tx);
            return self
                .settle_failure(
                    event,
                    attempt_number,
                    None,
                    "RESERVATION_NOT_FOUND",
                    "aggregate row missing",
                )
                .await;
        };
        if reservation.country_code.is_empty() {
            drop(tx);
            return self
                .settle_failure(
                    event,
                    attempt_number,
                    None,
                    "MISSING_COUNTRY",
                    "reservation has no pickup country",
                )
                .await;
        }
        let Some(gateway) = self
            .registry
            .resolve(&reservation.supplier_id, &reservation.country_code)
        else {
            drop(tx);
            return self
                .settle_failure(
                    event,
                    attempt_number,
                    None,
                    "NO_GATEWAY",
                    &format!(
                        "no supplier gateway for ({}, {})",
                        reservation.supplier_id, reservation.country_code
                    ),
                )
                .await;
        };

        let mut audit = SupplierRequestRecord::in_progress(
            code.clone(),
            &reservation.supplier_id,
            request_types::BOOK_CREATE,
            idem_key,
            attempt_number,
            now,
        );
        tx.insert_supplier_request(&audit).await?;
        tx.commit().await?;

        // The booking call, outside any transaction.
        let mut outcome =
            protected_call(&self.breaker, self.timeout, || {
                gateway.book(code, idem_key, None)
            })
            .await;

        // A supplier that lost the context of an earlier attempt asks for the
        // full snapshot; re-send once within the same attempt.
        let resend = matches!(
            &outcome,
            Ok(result) if result.status == BookingStatus::Failed && wants_snapshot(result)
        );
        if resend {
            tracing::info!(reservation_code = %code, "Supplier requested full snapshot, re-sending enriched");
            let snapshot = reservation.booking_snapshot();
            outcome = protected_call(&self.breaker, self.timeout, || {
                gateway.book(code, idem_key, Some(&snapshot))
            })
            .await;
        }

        match outcome {
            Ok(result) if result.status == BookingStatus::Success => {
                if let Some(confirmation) = result.confirmation_code.clone() {
                    audit.finish_success(result.response_payload.clone(), result.http_status);
                    self.settle_success(
                        event,
                        &audit,
                        attempt_number,
                        reservation.version,
                        &confirmation,
                    )
                    .await
                } else {
                    let message = "success response without confirmation code";
                    audit.finish_failed(
                        Some("MISSING_CONFIRMATION".to_owned()),
                        Some(message.to_owned()),
                        result.http_status,
                    );
                    self.settle_failure(
                        event,
                        attempt_number,
                        Some(&audit),
                        "MISSING_CONFIRMATION",
                        message,
                    )
                    .await
                }
            }
            Ok(result) => {
                let error_code = result
                    .error_code
                    .clone()
                    .unwrap_or_else(|| "SUPPLIER_REJECTED".to_owned());
                let error_message = result
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "supplier rejected the booking".to_owned());
                audit.finish_failed(
                    Some(error_code.clone()),
                    Some(error_message.clone()),
                    result.http_status,
                );
                self.settle_failure(event, attempt_number, Some(&audit), &error_code, &error_message)
                    .await
            }
            Err(CircuitBreakerError::Open) => {
                let message = "supplier circuit is open";
                audit.finish_failed(Some("CIRCUIT_OPEN".to_owned()), Some(message.to_owned()), None);
                self.settle_failure(event, attempt_number, Some(&audit), "CIRCUIT_OPEN", message)
                    .await
            }
            Err(CircuitBreakerError::Inner(err)) => {
                let (error_code, error_message) = classify_gateway_error(&err);
                audit.finish_failed(
                    Some(error_code.to_owned()),
                    Some(error_message.clone()),
                    None,
                );
                self.settle_failure(event, attempt_number, Some(&audit), error_code, &error_message)
                    .await
            }
        }
    }

    /// Records the confirmation, finalizes the audit row, and completes the
    /// event, reconciling version conflicts against concurrent writers.
    async fn settle_success(
        &self,
        event: &OutboxEvent,
        audit: &SupplierRequestRecord,
        attempt_number: i32,
        version: i32,
        confirmation_code: &str,
    ) -> Result<ProcessOutcome, HandlerError> {
        let code = &event.aggregate_code;
        let now = self.clock.now();
        let mut tx = self.storage.begin().await?;
        tx.finalize_supplier_request(audit).await?;

        let mut expected = version;
        let mut settled = false;
        for _ in 0..MAX_CONFIRM_RETRIES {
            match tx
                .mark_confirmed(code, confirmation_code, now, expected)
                .await
            {
                Ok(_) => {
                    settled = true;
                    break;
                }
                Err(StorageError::VersionConflict { .. }) => {
                    metrics::counter!("surebook_version_conflicts_total").increment(1);
                    let Some(current) = tx.get_reservation(code).await? else {
                        return Err(HandlerError::NotFound {
                            what: "reservation",
                            key: code.to_string(),
                        });
                    };
                    if current.is_confirmed() {
                        // Another worker already recorded the confirmation.
                        settled = true;
                        break;
                    }
                    expected = current.version;
                }
                Err(err) => return Err(err.into()),
            }
        }

        if !settled {
            // Pathological churn on the aggregate. The supplier call stood,
            // so release the event for another attempt instead of wedging it.
            let next_attempt_at = now
                + retry_backoff(
                    attempt_number,
                    self.outbox.backoff_base_secs,
                    self.outbox.backoff_cap_secs,
                );
            tx.mark_retry(
                event.id,
                attempt_number,
                next_attempt_at,
                Some("CONFIRM_CONFLICT"),
                Some("aggregate version churned while recording the confirmation"),
            )
            .await?;
            tx.commit().await?;
            metrics::counter!("surebook_outbox_retries_total").increment(1);
            tracing::warn!(
                reservation_code = %code,
                attempt = attempt_number,
                "Confirmation kept conflicting, retry scheduled"
            );
            return Ok(ProcessOutcome::Scheduled {
                attempts: attempt_number,
                next_attempt_at,
            });
        }

        tx.mark_done(event.id).await?;
        tx.commit().await?;
        metrics::counter!("surebook_outbox_done_total").increment(1);
        tracing::info!(
            reservation_code = %code,
            confirmation_code,
            attempt = attempt_number,
            "Reservation confirmed by supplier"
        );
        Ok(ProcessOutcome::Confirmed {
            confirmation_code: confirmation_code.to_owned(),
        })
    }

    /// Settles a failed attempt: finalize the audit row (when a call was
    /// made), then either schedule a retry or dead-letter the event.
    async fn settle_failure(
        &self,
        event: &OutboxEvent,
        attempt_number: i32,
        audit: Option<&SupplierRequestRecord>,
        error_code: &str,
        error_message: &str,
    ) -> Result<ProcessOutcome, HandlerError> {
        let now = self.clock.now();
        let mut tx = self.storage.begin().await?;
        if let Some(audit) = audit {
            tx.finalize_supplier_request(audit).await?;
        }

        if attempt_number >= self.outbox.max_attempts {
            tx.archive(&DeadLetterRecord::from_event(
                event,
                attempt_number,
                Some(error_code.to_owned()),
                Some(error_message.to_owned()),
                now,
            ))
            .await?;
            tx.mark_failed(
                event.id,
                attempt_number,
                Some(error_code),
                Some(error_message),
            )
            .await?;
            tx.commit().await?;
            metrics::counter!("surebook_outbox_dead_letters_total").increment(1);
            tracing::error!(
                reservation_code = %event.aggregate_code,
                event_id = %event.id,
                attempts = attempt_number,
                error_code,
                "Outbox event dead-lettered"
            );
            Ok(ProcessOutcome::DeadLettered {
                attempts: attempt_number,
            })
        } else {
            let next_attempt_at = now
                + retry_backoff(
                    attempt_number,
                    self.outbox.backoff_base_secs,
                    self.outbox.backoff_cap_secs,
                );
            tx.mark_retry(
                event.id,
                attempt_number,
                next_attempt_at,
                Some(error_code),
                Some(error_message),
            )
            .await?;
            tx.commit().await?;
            metrics::counter!("surebook_outbox_retries_total").increment(1);
            tracing::warn!(
                reservation_code = %event.aggregate_code,
                attempt = attempt_number,
                error_code,
                next_attempt_at = %next_attempt_at,
                "Supplier booking attempt failed, retry scheduled"
            );
            Ok(ProcessOutcome::Scheduled {
                attempts: attempt_number,
                next_attempt_at,
            })
        }
    }
}

/// Whether a supplier rejection is really a request for the full snapshot.
fn wants_snapshot(outcome: &BookingOutcome) -> bool {
    matches!(
        outcome.error_code.as_deref(),
        Some("MISSING_SNAPSHOT" | "MISSING_OFFICE_CODES")
    )
}

fn classify_gateway_error(err: &GatewayError) -> (&'static str, String) {
    match err {
        GatewayError::Timeout(timeout) => (
            "TIMEOUT",
            format!("supplier call timed out after {timeout:?}"),
        ),
        GatewayError::Transport(message) => ("HTTP_ERROR", message.clone()),
        GatewayError::InvalidResponse(message) | GatewayError::InvalidWebhook(message) => {
            ("INVALID_RESPONSE", message.clone())
        }
    }
}
