//! Command handlers: the state-machine glue of the booking engine.
//!
//! Each handler runs one externally triggered command (create, pay, provider
//! webhook, outbox delivery) as one or more short storage transactions with
//! every external call kept outside them. They share an error taxonomy and
//! the [`Reply`] shape the boundary layer serializes and replays.

pub mod book_supplier;
pub mod create;
pub mod pay;
pub mod webhook;

pub use book_supplier::{ProcessOutboxBookSupplier, ProcessOutcome};
pub use create::{CreateReservation, CreateReservationRequest};
pub use pay::{PayReservation, PayReservationRequest};
pub use webhook::{HandleProviderWebhook, WebhookOutcome};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use surebook_core::{
    DateTime, IdempotencyRecord, IdempotencyStore, ReservationCode, StorageError, StorageTx, Utc,
};
use thiserror::Error;

/// Errors surfaced by command handlers.
///
/// The boundary layer maps these onto transport responses; nothing here is a
/// panic or an exception. Only [`HandlerError::Storage`] with a contention
/// cause is worth re-running the whole unit of work for.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Malformed or missing input; rejected before any state change.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The idempotency key was already used with a different request.
    #[error("Idempotency key {client_key} already used with a different request in scope {scope}")]
    IdempotencyConflict {
        /// Command scope the key was used in.
        scope: String,
        /// The reused client key.
        client_key: String,
    },

    /// A referenced entity does not exist.
    #[error("{what} not found: {key}")]
    NotFound {
        /// What kind of entity was looked up.
        what: &'static str,
        /// The key that found nothing.
        key: String,
    },

    /// A capture for this reservation is awaiting provider settlement.
    #[error("A payment capture is already in progress for reservation {code}")]
    CaptureInProgress {
        /// The reservation being paid.
        code: ReservationCode,
    },

    /// The provider declined the capture.
    #[error("Payment declined for reservation {code}: {reason}")]
    PaymentDeclined {
        /// The reservation being paid.
        code: ReservationCode,
        /// Provider-reported reason.
        reason: String,
    },

    /// The provider could not be reached (timeout, transport, open breaker).
    /// The caller may retry with the same idempotency key.
    #[error("Payment provider unavailable for reservation {code}: {reason}")]
    PaymentUnavailable {
        /// The reservation being paid.
        code: ReservationCode,
        /// What went wrong.
        reason: String,
    },

    /// No outbox event was claimable for the aggregate.
    #[error("No claimable outbox event for reservation {code}")]
    NoEventReady {
        /// The aggregate whose outbox was polled.
        code: ReservationCode,
    },

    /// Storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl HandlerError {
    /// Whether re-running the whole unit of work may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(e) if e.is_contention())
    }
}

/// A command response ready for the boundary layer: an opaque status numeral
/// plus the body to serialize. Cached replies replay both byte-for-byte.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// HTTP status numeral, opaque to the engine.
    pub status: u16,
    /// Response body.
    pub body: Value,
}

impl Reply {
    /// A reply with the given status numeral and body.
    #[must_use]
    pub const fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }
}

/// Consult the idempotency cache for (scope, `client_key`) inside an open
/// transaction.
///
/// Returns the cached reply to replay, `Ok(None)` for a fresh key, or an
/// [`HandlerError::IdempotencyConflict`] when the key was already used with a
/// different fingerprint.
pub(crate) async fn idempotency_gate(
    tx: &mut dyn StorageTx,
    scope: &str,
    client_key: &str,
    fingerprint: &str,
) -> Result<Option<Reply>, HandlerError> {
    match tx.get(scope, client_key).await? {
        None => Ok(None),
        Some(record) if record.matches_fingerprint(fingerprint) => {
            metrics::counter!("surebook_idempotency_replays_total").increment(1);
            tracing::info!(scope, client_key, "Replaying cached command response");
            Ok(Some(Reply::new(record.cached_status, record.cached_response)))
        }
        Some(_) => {
            metrics::counter!("surebook_idempotency_conflicts_total").increment(1);
            tracing::warn!(scope, client_key, "Idempotency key reused with different payload");
            Err(HandlerError::IdempotencyConflict {
                scope: scope.to_owned(),
                client_key: client_key.to_owned(),
            })
        }
    }
}

/// Build the record that caches a freshly executed command's reply.
pub(crate) fn cache_record(
    scope: &str,
    client_key: &str,
    fingerprint: String,
    reply: &Reply,
    reference_id: Option<ReservationCode>,
    now: DateTime<Utc>,
) -> IdempotencyRecord {
    IdempotencyRecord::new(
        scope,
        client_key,
        fingerprint,
        reply.body.clone(),
        reply.status,
        reference_id,
        now,
    )
}
