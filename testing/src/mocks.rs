//! Scripted gateways and a controllable clock.
//!
//! Each mock pops the next scripted response on every call and falls back to
//! a generic success when the script runs dry, so happy-path tests need no
//! setup at all. Calls are recorded for assertions about what reached the
//! provider (or, with a tripped circuit breaker, what never did).

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{Value, json};
use surebook_core::{
    BookingOutcome, CaptureOutcome, Clock, GatewayError, Money, PaymentGateway, ReservationCode,
    SupplierGateway, WebhookEvent, WebhookKind,
};

/// A clock that only moves when a test tells it to.
///
/// Clones share the underlying instant, so a clock handed to a worker can be
/// advanced from the test body to expire locks or make retries due.
#[derive(Clone, Debug)]
pub struct FixedClock {
    time: Arc<Mutex<DateTime<Utc>>>,
}

impl FixedClock {
    /// A clock pinned to `time`.
    #[must_use]
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            time: Arc::new(Mutex::new(time)),
        }
    }

    /// Moves the clock forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        let mut guard = self.time.lock().unwrap();
        *guard += delta;
    }

    /// Jumps the clock to an absolute instant.
    pub fn set(&self, time: DateTime<Utc>) {
        *self.time.lock().unwrap() = time;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.time.lock().unwrap()
    }
}

/// A [`FixedClock`] pinned to 2025-01-01T00:00:00Z.
#[must_use]
pub fn test_clock() -> FixedClock {
    FixedClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap())
}

/// One booking call as the supplier mock saw it.
#[derive(Clone, Debug)]
pub struct RecordedBooking {
    /// Reservation the call was for.
    pub reservation_code: ReservationCode,
    /// Idempotency key sent with the call.
    pub idem_key: String,
    /// Whether a full snapshot accompanied the call.
    pub snapshot_sent: bool,
}

/// A supplier gateway that replays scripted outcomes.
#[derive(Debug, Default)]
pub struct MockSupplierGateway {
    script: Mutex<VecDeque<Result<BookingOutcome, GatewayError>>>,
    calls: Mutex<Vec<RecordedBooking>>,
}

impl MockSupplierGateway {
    /// A gateway with an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh gateway behind an `Arc`, ready to hand to a registry.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Queues a business outcome for the next unscripted call.
    pub fn respond_with(&self, outcome: BookingOutcome) {
        self.script.lock().unwrap().push_back(Ok(outcome));
    }

    /// Queues an infrastructure failure for the next unscripted call.
    pub fn fail_with(&self, error: GatewayError) {
        self.script.lock().unwrap().push_back(Err(error));
    }

    /// Everything `book` has been asked for so far.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedBooking> {
        self.calls.lock().unwrap().clone()
    }

    /// How many times `book` was invoked.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl SupplierGateway for MockSupplierGateway {
    async fn book(
        &self,
        reservation_code: &ReservationCode,
        idem_key: &str,
        snapshot: Option<&Value>,
    ) -> Result<BookingOutcome, GatewayError> {
        self.calls.lock().unwrap().push(RecordedBooking {
            reservation_code: reservation_code.clone(),
            idem_key: idem_key.to_owned(),
            snapshot_sent: snapshot.is_some(),
        });
        match self.script.lock().unwrap().pop_front() {
            Some(scripted) => scripted,
            None => Ok(BookingOutcome::success(
                format!("CONF-{reservation_code}"),
                Some(json!({ "reservation_code": reservation_code })),
                Some(200),
            )),
        }
    }
}

/// One capture call as the payment mock saw it.
#[derive(Clone, Debug)]
pub struct RecordedCapture {
    /// Amount requested, in minor units.
    pub amount: Money,
    /// Currency of the capture.
    pub currency: String,
    /// Payment method token the caller supplied.
    pub payment_method: String,
    /// Idempotency key sent with the call.
    pub idem_key: String,
}

/// A payment gateway with scripted captures and signature-checked webhooks.
///
/// Unscripted captures succeed with `pi_<n>` / `ch_<n>` identifiers from a
/// shared counter. `parse_webhook` accepts any payload of the shape
/// `{"id": .., "type": .., "data": {"object": {"id": ..}}}` as long as the
/// signature matches the configured secret.
#[derive(Debug)]
pub struct MockPaymentGateway {
    script: Mutex<VecDeque<Result<CaptureOutcome, GatewayError>>>,
    calls: Mutex<Vec<RecordedCapture>>,
    valid_signature: String,
    counter: AtomicU64,
}

impl Default for MockPaymentGateway {
    fn default() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            valid_signature: "test-signature".to_owned(),
            counter: AtomicU64::new(0),
        }
    }
}

impl MockPaymentGateway {
    /// A gateway with an empty script and the default test signature.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh gateway behind an `Arc`.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Replaces the signature `parse_webhook` accepts.
    #[must_use]
    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.valid_signature = signature.into();
        self
    }

    /// Queues a capture outcome for the next unscripted call.
    pub fn respond_with(&self, outcome: CaptureOutcome) {
        self.script.lock().unwrap().push_back(Ok(outcome));
    }

    /// Queues an infrastructure failure for the next unscripted call.
    pub fn fail_with(&self, error: GatewayError) {
        self.script.lock().unwrap().push_back(Err(error));
    }

    /// Everything `confirm_payment` has been asked for so far.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCapture> {
        self.calls.lock().unwrap().clone()
    }

    /// How many times `confirm_payment` was invoked.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    fn provider(&self) -> &str {
        "mock"
    }

    async fn confirm_payment(
        &self,
        amount: Money,
        currency: &str,
        payment_method: &str,
        idem_key: &str,
    ) -> Result<CaptureOutcome, GatewayError> {
        self.calls.lock().unwrap().push(RecordedCapture {
            amount,
            currency: currency.to_owned(),
            payment_method: payment_method.to_owned(),
            idem_key: idem_key.to_owned(),
        });
        match self.script.lock().unwrap().pop_front() {
            Some(scripted) => scripted,
            None => {
                let n = self.counter.fetch_add(1, Ordering::Relaxed);
                Ok(CaptureOutcome::captured(
                    format!("pi_{n}"),
                    Some(format!("ch_{n}")),
                ))
            }
        }
    }

    fn parse_webhook(&self, payload: &[u8], signature: &str) -> Result<WebhookEvent, GatewayError> {
        if signature != self.valid_signature {
            return Err(GatewayError::InvalidWebhook(
                "signature mismatch".to_owned(),
            ));
        }
        let body: Value = serde_json::from_slice(payload)
            .map_err(|e| GatewayError::InvalidWebhook(format!("malformed payload: {e}")))?;
        let event_id = body
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::InvalidWebhook("missing event id".to_owned()))?
            .to_owned();
        let event_type = body
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::InvalidWebhook("missing event type".to_owned()))?;
        let kind = match event_type {
            "payment_intent.succeeded" => WebhookKind::PaymentSucceeded,
            "payment_intent.payment_failed" => WebhookKind::PaymentFailed,
            other => WebhookKind::Other(other.to_owned()),
        };
        let provider_transaction_id = body
            .pointer("/data/object/id")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::InvalidWebhook("missing transaction id".to_owned()))?
            .to_owned();
        Ok(WebhookEvent {
            event_id,
            kind,
            provider_transaction_id,
        })
    }
}

/// Builds a provider-shaped webhook payload for tests.
#[must_use]
pub fn webhook_payload(event_id: &str, event_type: &str, transaction_id: &str) -> Vec<u8> {
    json!({
        "id": event_id,
        "type": event_type,
        "data": { "object": { "id": transaction_id } },
    })
    .to_string()
    .into_bytes()
}
