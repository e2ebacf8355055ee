//! # Surebook Runtime
//!
//! The booking engine: command handlers, outbox delivery, and the failure
//! containment around external providers.
//!
//! ## Core Components
//!
//! - **`BookingEngine`**: the assembled facade — create, pay, webhook, and
//!   outbox processing over one storage backend
//! - **Handlers**: one struct per command, each an idempotent unit of work
//! - **`OutboxWorker`**: polls for due `BOOK_SUPPLIER` events and delivers
//!   them with retry, backoff, and dead-lettering
//! - **Circuit breakers**: independent per provider class, composed with
//!   timeouts and a single in-window retry via [`protected::protected_call`]
//!
//! ## Example
//!
//! ```ignore
//! use surebook_runtime::{BookingEngine, RuntimeConfig};
//!
//! let engine = BookingEngine::new(storage, payments, suppliers, clock, RuntimeConfig::from_env());
//!
//! let reply = engine.create_reservation(&request, idempotency_key).await?;
//! let reply = engine.pay_reservation(&code, &pay, idempotency_key).await?;
//!
//! // Background delivery:
//! let worker = engine.worker();
//! tokio::spawn(async move { worker.run(shutdown_rx).await });
//! ```

/// Circuit breaker with a single half-open probe
pub mod circuit_breaker;

/// Environment-driven runtime configuration
pub mod config;

/// The assembled engine facade
pub mod engine;

/// Command handlers and the outbox processor
pub mod handlers;

/// HTTP-backed supplier gateway
pub mod http_gateway;

/// Metric registration and descriptions
pub mod metrics;

/// Timeout + retry + breaker composition for gateway calls
pub mod protected;

/// Routing from (supplier, country) to a gateway
pub mod registry;

/// Unit-of-work retry for storage contention
pub mod uow;

/// Background outbox polling
pub mod worker;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
pub use config::RuntimeConfig;
pub use engine::BookingEngine;
pub use handlers::{
    CreateReservationRequest, HandlerError, PayReservationRequest, ProcessOutcome, Reply,
    WebhookOutcome,
};
pub use registry::SupplierRegistry;
pub use worker::OutboxWorker;
