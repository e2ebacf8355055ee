//! # Surebook Core
//!
//! Domain types and contracts for the Surebook consistency engine.
//!
//! Surebook drives a rental-car reservation through a multi-party workflow —
//! create, pay, provider webhook, supplier confirmation — and makes it behave
//! like a single atomic operation even though every step can retry, duplicate,
//! race, or fail. This crate holds the pieces that definition rests on:
//!
//! - **Reservation**: the aggregate root, mutated only through version-checked
//!   conditional updates (optimistic concurrency)
//! - **`OutboxEvent`**: pending side effects enqueued in the same transaction
//!   as the state change that requires them
//! - **`IdempotencyRecord`**: cached responses keyed by (scope, client key),
//!   fingerprinted so key reuse with a different payload is rejected
//! - **Payment** / **`SupplierRequestRecord`**: the money and supplier-call
//!   ledgers
//! - **Storage** / **`StorageTx`**: the transactional seam every handler runs
//!   against
//! - **`SupplierGateway`** / **`PaymentGateway`**: the unreliable outside
//!   world, always invoked through a circuit breaker (see `surebook-runtime`)
//!
//! Nothing in this crate performs I/O. Implementations live in
//! `surebook-postgres` (durable) and `surebook-testing` (in-memory).

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod clock;
pub mod gateway;
pub mod idempotency;
pub mod outbox;
pub mod payment;
pub mod reservation;
pub mod store;
pub mod supplier;

pub use clock::{Clock, SystemClock};
pub use gateway::{
    BookingOutcome, BookingStatus, CaptureOutcome, CaptureStatus, GatewayError, PaymentGateway,
    SupplierGateway, WebhookEvent, WebhookKind,
};
pub use idempotency::{IdempotencyRecord, request_fingerprint};
pub use outbox::{DeadLetterRecord, OutboxEvent, OutboxStatus, event_types, retry_backoff};
pub use payment::{Payment, PaymentStatus};
pub use reservation::{
    ContactDetails, DriverDetails, Money, PaymentState, Reservation, ReservationCode,
    ReservationStatus,
};
pub use store::{
    DeadLetterStore, IdempotencyStore, OutboxStore, PaymentStore, ReservationStore, Storage,
    StorageError, StorageTx, SupplierRequestStore,
};
pub use supplier::{SupplierRequestRecord, SupplierRequestStatus, request_types};
