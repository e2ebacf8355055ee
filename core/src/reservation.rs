//! The reservation aggregate and its state machines.
//!
//! A reservation is created once (PENDING / UNPAID) and then advanced by
//! payment capture and supplier confirmation. It is never deleted. Every
//! mutation goes through a version-checked conditional update: callers supply
//! the version they last observed, the store increments it by exactly one, and
//! a zero-row update means the caller lost a race and must reload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::store::StorageError;

/// Externally visible reservation identifier.
///
/// Short, human-quotable, and unique; generated once at creation and used as
/// the aggregate key everywhere (storage, outbox, supplier calls, logs).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationCode(String);

/// Unambiguous alphabet for generated codes (no 0/O, 1/I).
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_LEN: usize = 8;

impl ReservationCode {
    /// Wraps an existing code (e.g. read back from storage).
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    /// Generates a fresh random code, `R` followed by eight characters from
    /// an unambiguous alphabet.
    #[must_use]
    pub fn generate() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let mut code = String::with_capacity(CODE_LEN + 1);
        code.push('R');
        for _ in 0..CODE_LEN {
            let idx = rng.gen_range(0..CODE_ALPHABET.len());
            code.push(CODE_ALPHABET[idx] as char);
        }
        Self(code)
    }

    /// The code as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReservationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a reservation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    /// Created, awaiting payment.
    Pending,
    /// Paid; supplier booking scheduled or in flight.
    OnRequest,
    /// Supplier confirmed the booking.
    Confirmed,
    /// Cancelled without refund.
    Cancelled,
    /// Cancelled with refund issued.
    CancelledRefund,
}

impl ReservationStatus {
    /// Storage string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::OnRequest => "ON_REQUEST",
            Self::Confirmed => "CONFIRMED",
            Self::Cancelled => "CANCELLED",
            Self::CancelledRefund => "CANCELLED_REFUND",
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
            "ON_REQUEST" => Ok(Self::OnRequest),
            "CONFIRMED" => Ok(Self::Confirmed),
            "CANCELLED" => Ok(Self::Cancelled),
            "CANCELLED_REFUND" => Ok(Self::CancelledRefund),
            _ => Err(StorageError::Database(format!(
                "Invalid reservation status: {s}"
            ))),
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payment progress of a reservation, tracked separately from the lifecycle
/// status because a paid reservation can still be awaiting its supplier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentState {
    /// No capture attempted yet.
    Unpaid,
    /// Capture initiated; awaiting the provider's asynchronous confirmation.
    Pending,
    /// Capture confirmed.
    Paid,
    /// Capture failed.
    Failed,
    /// Captured amount was refunded.
    Refunded,
}

impl PaymentState {
    /// Storage string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unpaid => "UNPAID",
            Self::Pending => "PENDING",
            Self::Paid => "PAID",
            Self::Failed => "FAILED",
            Self::Refunded => "REFUNDED",
        }
    }

    /// Parse from the storage string representation.
    ///
    /// # Errors
    ///
    /// Returns an error if the string doesn't match a known state.
    pub fn parse(s: &str) -> Result<Self, StorageError> {
        match s {
            "UNPAID" => Ok(Self::Unpaid),
            "PENDING" => Ok(Self::Pending),
            "PAID" => Ok(Self::Paid),
            "FAILED" => Ok(Self::Failed),
            "REFUNDED" => Ok(Self::Refunded),
            _ => Err(StorageError::Database(format!(
                "Invalid payment state: {s}"
            ))),
        }
    }
}

impl fmt::Display for PaymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monetary amount in minor units (cents), to avoid floating point errors.
/// The currency rides alongside on the owning record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Money(u64);

impl Money {
    /// Creates a `Money` value from minor units.
    #[must_use]
    pub const fn from_cents(cents: u64) -> Self {
        Self(cents)
    }

    /// Returns the amount in minor units.
    #[must_use]
    pub const fn cents(&self) -> u64 {
        self.0
    }

    /// Whether the amount is zero.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

/// Contact details attached to a reservation. Starts empty at creation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactDetails {
    /// Contact email address.
    pub email: Option<String>,
    /// Contact phone number.
    pub phone: Option<String>,
}

/// One driver attached to a reservation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverDetails {
    /// Driver full name.
    pub full_name: String,
    /// Driver age, if collected.
    pub age: Option<u8>,
}

/// The reservation aggregate root.
///
/// `version` is the optimistic-concurrency counter: it starts at 0 and every
/// accepted mutation increments it by exactly one. Conditional store methods
/// take the expected version and return the new one, so handlers thread
/// versions explicitly rather than inferring them from call order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    /// Externally visible unique code.
    pub code: ReservationCode,
    /// Lifecycle status.
    pub status: ReservationStatus,
    /// Payment progress.
    pub payment_status: PaymentState,
    /// Which external booking system fulfils this reservation.
    pub supplier_id: String,
    /// Pickup country, ISO 3166-1 alpha-2 upper case.
    pub country_code: String,
    /// Confirmation code assigned by the supplier, once confirmed.
    pub supplier_confirmation_code: Option<String>,
    /// When the supplier confirmed.
    pub supplier_confirmed_at: Option<DateTime<Utc>>,
    /// Total price in minor units.
    pub total: Money,
    /// ISO 4217 currency code for `total`.
    pub currency: String,
    /// Contact details; empty until provided.
    pub contact: ContactDetails,
    /// Drivers; empty until provided.
    pub drivers: Vec<DriverDetails>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Optimistic concurrency counter.
    pub version: i32,
}

impl Reservation {
    /// Constructs a brand-new reservation in PENDING / UNPAID at version 0.
    #[must_use]
    pub fn new(
        code: ReservationCode,
        supplier_id: impl Into<String>,
        country_code: impl Into<String>,
        total: Money,
        currency: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            code,
            status: ReservationStatus::Pending,
            payment_status: PaymentState::Unpaid,
            supplier_id: supplier_id.into(),
            country_code: country_code.into().to_uppercase(),
            supplier_confirmation_code: None,
            supplier_confirmed_at: None,
            total,
            currency: currency.into(),
            contact: ContactDetails::default(),
            drivers: Vec::new(),
            created_at: now,
            version: 0,
        }
    }

    /// Whether payment has been captured.
    #[must_use]
    pub fn is_paid(&self) -> bool {
        self.payment_status == PaymentState::Paid
    }

    /// Whether the supplier has confirmed the booking.
    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        self.status == ReservationStatus::Confirmed
    }

    /// Snapshot of the data a supplier needs to book this reservation.
    ///
    /// Sent on the booking call (and re-sent in full when a supplier reports
    /// it is missing snapshot data from an earlier attempt).
    #[must_use]
    pub fn booking_snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "reservation_code": self.code.as_str(),
            "supplier_id": self.supplier_id,
            "country_code": self.country_code,
            "total_cents": self.total.cents(),
            "currency": self.currency,
            "created_at": self.created_at.to_rfc3339(),
        })
    }
}
