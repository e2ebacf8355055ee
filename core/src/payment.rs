//! Payment ledger rows.
//!
//! A reservation may accumulate more than one payment row across retries, but
//! only one row may ever reach CAPTURED — concurrent pay attempts race on the
//! aggregate's version-checked update, and only the winner records a capture.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::reservation::{Money, ReservationCode};
use crate::store::StorageError;

/// Status of one payment row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    /// Capture initiated; awaiting the provider's confirmation.
    Pending,
    /// Funds captured.
    Captured,
    /// Capture failed.
    Failed,
}

impl PaymentStatus {
    /// Storage string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Captured => "CAPTURED",
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
            "PENDING" => Ok(Self::Pending),
            "CAPTURED" => Ok(Self::Captured),
            "FAILED" => Ok(Self::Failed),
            _ => Err(StorageError::Database(format!(
                "Invalid payment status: {s}"
            ))),
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One capture attempt against the payment provider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    /// Unique payment row id.
    pub id: Uuid,
    /// The reservation this payment belongs to.
    pub reservation_code: ReservationCode,
    /// Payment provider identifier (e.g. `"stripe"`).
    pub provider: String,
    /// The provider's transaction id, used to correlate webhooks.
    pub provider_transaction_id: Option<String>,
    /// The provider's charge id, known once captured.
    pub charge_id: Option<String>,
    /// Id of the provider webhook event that settled this payment. Webhook
    /// deliveries are deduplicated on this.
    pub provider_event_id: Option<String>,
    /// Captured amount in minor units.
    pub amount: Money,
    /// ISO 4217 currency code for `amount`.
    pub currency: String,
    /// Row status.
    pub status: PaymentStatus,
    /// When the capture was initiated.
    pub created_at: DateTime<Utc>,
}

impl Payment {
    /// A capture that has been initiated but not yet settled.
    #[must_use]
    pub fn pending(
        reservation_code: ReservationCode,
        provider: impl Into<String>,
        provider_transaction_id: Option<String>,
        amount: Money,
        currency: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            reservation_code,
            provider: provider.into(),
            provider_transaction_id,
            charge_id: None,
            provider_event_id: None,
            amount,
            currency: currency.into(),
            status: PaymentStatus::Pending,
            created_at: now,
        }
    }

    /// Settles this row as captured.
    pub fn mark_captured(&mut self, provider_event_id: Option<String>, charge_id: Option<String>) {
        self.status = PaymentStatus::Captured;
        if provider_event_id.is_some() {
            self.provider_event_id = provider_event_id;
        }
        if charge_id.is_some() {
            self.charge_id = charge_id;
        }
    }

    /// Settles this row as failed.
    pub fn mark_failed(&mut self, provider_event_id: Option<String>) {
        self.status = PaymentStatus::Failed;
        if provider_event_id.is_some() {
            self.provider_event_id = provider_event_id;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_storage_strings() {
        for status in [
            PaymentStatus::Pending,
            PaymentStatus::Captured,
            PaymentStatus::Failed,
        ] {
            assert_eq!(PaymentStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(PaymentStatus::parse("captured").is_err());
    }

    #[test]
    fn capture_keeps_earlier_provider_ids_when_webhook_omits_them() {
        let mut payment = Payment::pending(
            ReservationCode::new("R1"),
            "stripe",
            Some("pi_123".to_owned()),
            Money::from_cents(5000),
            "EUR",
            Utc::now(),
        );
        payment.charge_id = Some("ch_1".to_owned());
        payment.mark_captured(Some("evt_9".to_owned()), None);
        assert_eq!(payment.status, PaymentStatus::Captured);
        assert_eq!(payment.charge_id.as_deref(), Some("ch_1"));
        assert_eq!(payment.provider_event_id.as_deref(), Some("evt_9"));
    }
}
