//! Contracts for the unreliable outside world.
//!
//! Gateways separate business outcomes from infrastructure failures: a
//! supplier declining a booking is an `Ok` outcome with FAILED status, while
//! a timeout or broken connection is an `Err(GatewayError)`. The circuit
//! breaker in `surebook-runtime` counts only the latter — a supplier that
//! answers quickly with rejections is available, not broken.
//!
//! Every call must be safe to repeat with the same `idem_key`; the engine
//! leans on that whenever a crash leaves an outcome unrecorded.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::reservation::{Money, ReservationCode};

/// Error types for gateway calls that never produced a usable response.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The call did not complete within its deadline.
    #[error("Gateway call timed out after {0:?}")]
    Timeout(Duration),

    /// Connection-level failure (DNS, TLS, reset, ...).
    #[error("Gateway transport error: {0}")]
    Transport(String),

    /// The webhook payload or signature did not verify.
    #[error("Invalid webhook: {0}")]
    InvalidWebhook(String),

    /// The gateway answered with something structurally unusable.
    #[error("Invalid gateway response: {0}")]
    InvalidResponse(String),
}

impl GatewayError {
    /// Whether an immediate in-window retry of the same call is reasonable.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Transport(_))
    }
}

/// Business result of a supplier booking call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    /// The supplier accepted the booking.
    Success,
    /// The supplier rejected it, or the response was not acceptable.
    Failed,
}

/// Everything a supplier booking call produced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BookingOutcome {
    /// Accept/reject.
    pub status: BookingStatus,
    /// The supplier's confirmation code, on success.
    pub confirmation_code: Option<String>,
    /// Raw response body, kept for the audit trail.
    pub response_payload: Option<serde_json::Value>,
    /// Machine-readable failure code (e.g. `NON_2XX`, `MISSING_SNAPSHOT`).
    pub error_code: Option<String>,
    /// Human-readable failure message.
    pub error_message: Option<String>,
    /// HTTP status, if the call got that far.
    pub http_status: Option<u16>,
}

impl BookingOutcome {
    /// A successful booking.
    #[must_use]
    pub fn success(
        confirmation_code: impl Into<String>,
        response_payload: Option<serde_json::Value>,
        http_status: Option<u16>,
    ) -> Self {
        Self {
            status: BookingStatus::Success,
            confirmation_code: Some(confirmation_code.into()),
            response_payload,
            error_code: None,
            error_message: None,
            http_status,
        }
    }

    /// A rejected booking.
    #[must_use]
    pub fn failed(
        error_code: impl Into<String>,
        error_message: impl Into<String>,
        http_status: Option<u16>,
    ) -> Self {
        Self {
            status: BookingStatus::Failed,
            confirmation_code: None,
            response_payload: None,
            error_code: Some(error_code.into()),
            error_message: Some(error_message.into()),
            http_status,
        }
    }
}

/// One booking call against one external supplier system.
///
/// Implementations are thin protocol adapters (HTTP, SOAP, ...) selected at
/// runtime by the supplier registry. They must be safe to invoke repeatedly
/// with the same `idem_key`.
#[async_trait]
pub trait SupplierGateway: Send + Sync {
    /// Books the reservation with the supplier.
    ///
    /// `snapshot` is the full reservation snapshot, sent when a supplier
    /// reports earlier snapshot data missing; the first attempt usually
    /// passes `None`.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure failures (timeout,
    /// transport); supplier rejections are `Ok` outcomes with FAILED status.
    async fn book(
        &self,
        reservation_code: &ReservationCode,
        idem_key: &str,
        snapshot: Option<&serde_json::Value>,
    ) -> Result<BookingOutcome, GatewayError>;
}

/// Business result of a payment capture call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaptureStatus {
    /// Funds captured synchronously.
    Captured,
    /// The provider accepted the capture and will confirm by webhook.
    Pending,
    /// The provider declined.
    Failed,
}

/// Everything a capture call produced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaptureOutcome {
    /// Capture result.
    pub status: CaptureStatus,
    /// Provider transaction id, used to correlate webhooks.
    pub provider_transaction_id: Option<String>,
    /// Provider charge id, when already known.
    pub charge_id: Option<String>,
    /// Provider event id, when the provider reports one synchronously.
    pub event_id: Option<String>,
    /// Machine-readable decline code.
    pub error_code: Option<String>,
    /// Human-readable decline message.
    pub error_message: Option<String>,
}

impl CaptureOutcome {
    /// A synchronous capture.
    #[must_use]
    pub fn captured(provider_transaction_id: impl Into<String>, charge_id: Option<String>) -> Self {
        Self {
            status: CaptureStatus::Captured,
            provider_transaction_id: Some(provider_transaction_id.into()),
            charge_id,
            event_id: None,
            error_code: None,
            error_message: None,
        }
    }

    /// A capture the provider will confirm by webhook.
    #[must_use]
    pub fn pending(provider_transaction_id: impl Into<String>) -> Self {
        Self {
            status: CaptureStatus::Pending,
            provider_transaction_id: Some(provider_transaction_id.into()),
            charge_id: None,
            event_id: None,
            error_code: None,
            error_message: None,
        }
    }

    /// A declined capture.
    #[must_use]
    pub fn declined(error_code: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            status: CaptureStatus::Failed,
            provider_transaction_id: None,
            charge_id: None,
            event_id: None,
            error_code: Some(error_code.into()),
            error_message: Some(error_message.into()),
        }
    }
}

/// What kind of webhook the payment provider delivered.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookKind {
    /// The capture succeeded.
    PaymentSucceeded,
    /// The capture failed.
    PaymentFailed,
    /// Anything else; rejected by the handler, never silently ignored.
    Other(String),
}

/// A verified, parsed provider webhook.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// Provider-assigned event id — the webhook deduplication axis.
    pub event_id: String,
    /// Parsed event kind.
    pub kind: WebhookKind,
    /// The transaction the event is about.
    pub provider_transaction_id: String,
}

/// The payment provider.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Provider name stored on payment rows ("stripe", "adyen", ...). Webhook
    /// and transaction lookups are scoped by it.
    fn provider(&self) -> &str;

    /// Captures payment for a reservation.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure failures; declines are `Ok`
    /// outcomes with FAILED status.
    async fn confirm_payment(
        &self,
        amount: Money,
        currency: &str,
        payment_method: &str,
        idem_key: &str,
    ) -> Result<CaptureOutcome, GatewayError>;

    /// Verifies a webhook signature and parses the event.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidWebhook`] for a bad signature or a
    /// structurally malformed payload.
    fn parse_webhook(&self, payload: &[u8], signature: &str)
    -> Result<WebhookEvent, GatewayError>;
}
