//! # Surebook Testing
//!
//! Test doubles for the Surebook consistency engine:
//!
//! - [`MemoryStorage`]: an in-memory [`surebook_core::Storage`] with real
//!   transaction semantics — uncommitted writes are visible inside the
//!   transaction, commit publishes them atomically, and dropping the
//!   transaction rolls back. Transactions are fully serialized, so the
//!   conditional-update and claim contracts behave exactly as they do on a
//!   row-locking database.
//! - [`mocks::FixedClock`]: a pinned, manually advanced clock.
//! - [`mocks::MockSupplierGateway`] / [`mocks::MockPaymentGateway`]:
//!   scriptable gateways that record every call they receive.
//!
//! ## Example
//!
//! ```
//! use surebook_core::{
//!     Money, Reservation, ReservationCode, ReservationStore, Storage, StorageTx,
//! };
//! use surebook_testing::MemoryStorage;
//!
//! # async fn example() -> Result<(), surebook_core::StorageError> {
//! let storage = MemoryStorage::new();
//! let mut tx = storage.begin().await?;
//! let code = ReservationCode::generate();
//! tx.insert_reservation(&Reservation::new(
//!     code.clone(),
//!     "hertz",
//!     "PT",
//!     Money::from_cents(12_900),
//!     "EUR",
//!     chrono::Utc::now(),
//! ))
//! .await?;
//! tx.commit().await?;
//!
//! let mut tx = storage.begin().await?;
//! assert!(tx.get_reservation(&code).await?.is_some());
//! # Ok(())
//! # }
//! ```

pub mod memory;
pub mod mocks;

pub use memory::MemoryStorage;
pub use mocks::{FixedClock, MockPaymentGateway, MockSupplierGateway, test_clock};
