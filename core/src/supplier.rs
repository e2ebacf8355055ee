//! Supplier call audit trail.
//!
//! One row per outbound supplier request: written IN_PROGRESS before the
//! gateway call and finalized after, so an operator can reconstruct exactly
//! what was sent to which supplier on which attempt — including calls whose
//! outcome was lost to a crash.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::reservation::ReservationCode;
use crate::store::StorageError;

/// Well-known supplier request types.
pub mod request_types {
    /// Create a booking with the supplier.
    pub const BOOK_CREATE: &str = "BOOK_CREATE";
}

/// Outcome of one supplier request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SupplierRequestStatus {
    /// Request written before the gateway call; outcome not yet known.
    InProgress,
    /// Supplier accepted the request.
    Success,
    /// Supplier rejected the request or the call failed.
    Failed,
}

impl SupplierRequestStatus {
    /// Storage string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "IN_PROGRESS",
            Self::Success => "SUCCESS",
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
            "IN_PROGRESS" => Ok(Self::InProgress),
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            _ => Err(StorageError::Database(format!(
                "Invalid supplier request status: {s}"
            ))),
        }
    }
}

impl fmt::Display for SupplierRequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit record for one outbound supplier request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SupplierRequestRecord {
    /// Unique row id.
    pub id: Uuid,
    /// The reservation the request was for.
    pub reservation_code: ReservationCode,
    /// The supplier the request went to.
    pub supplier_id: String,
    /// What kind of request this was (see [`request_types`]).
    pub request_type: String,
    /// Idempotency key sent to the supplier.
    pub idem_key: String,
    /// Which delivery attempt this was (1-based).
    pub attempt: i32,
    /// Outcome.
    pub status: SupplierRequestStatus,
    /// Response body from the supplier, if one was received.
    pub response_payload: Option<serde_json::Value>,
    /// Error code, if the request failed.
    pub error_code: Option<String>,
    /// Error message, if the request failed.
    pub error_message: Option<String>,
    /// HTTP status from the supplier, if the call got that far.
    pub http_status: Option<u16>,
    /// When the request was initiated.
    pub created_at: DateTime<Utc>,
}

impl SupplierRequestRecord {
    /// Opens an audit row before the gateway call goes out.
    #[must_use]
    pub fn in_progress(
        reservation_code: ReservationCode,
        supplier_id: impl Into<String>,
        request_type: impl Into<String>,
        idem_key: impl Into<String>,
        attempt: i32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            reservation_code,
            supplier_id: supplier_id.into(),
            request_type: request_type.into(),
            idem_key: idem_key.into(),
            attempt,
            status: SupplierRequestStatus::InProgress,
            response_payload: None,
            error_code: None,
            error_message: None,
            http_status: None,
            created_at: now,
        }
    }

    /// Finalizes the row after a successful supplier response.
    pub fn finish_success(
        &mut self,
        response_payload: Option<serde_json::Value>,
        http_status: Option<u16>,
    ) {
        self.status = SupplierRequestStatus::Success;
        self.response_payload = response_payload;
        self.http_status = http_status;
    }

    /// Finalizes the row after a failed supplier call.
    pub fn finish_failed(
        &mut self,
        error_code: Option<String>,
        error_message: Option<String>,
        http_status: Option<u16>,
    ) {
        self.status = SupplierRequestStatus::Failed;
        self.error_code = error_code;
        self.error_message = error_message;
        self.http_status = http_status;
    }
}
