//! `PostgreSQL` storage backend for the Surebook consistency engine.
//!
//! [`PgStorage`] implements the [`surebook_core::Storage`] contract on top of
//! a sqlx connection pool. Every unit of work runs on one database
//! transaction, so the idempotency, outbox and aggregate writes of a command
//! commit or roll back together. The implementation leans on the database for
//! the two contested paths:
//!
//! - Aggregate mutations are conditional `UPDATE ... WHERE version = $n`
//!   statements; zero rows affected surfaces as a version conflict.
//! - Outbox claims are `FOR UPDATE SKIP LOCKED` queue pops, so concurrent
//!   workers never double-claim and a crashed worker's lock simply expires.
//!
//! # Example
//!
//! ```ignore
//! use surebook_postgres::PgStorage;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let storage = PgStorage::connect("postgres://localhost/surebook").await?;
//!     storage.migrate().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod storage;

pub use storage::PgStorage;
