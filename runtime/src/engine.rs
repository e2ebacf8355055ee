//! The assembled booking engine.
//!
//! [`BookingEngine`] wires the command handlers, the outbox processor, and
//! the background worker onto one storage backend and one configuration. The
//! foreground commands run inside a unit-of-work retry loop so storage
//! contention is absorbed here rather than surfaced to callers; payment and
//! supplier calls each get their own circuit breaker so one failing provider
//! cannot block the other.

use std::sync::Arc;

use surebook_core::{Clock, PaymentGateway, ReservationCode, Storage};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::config::RuntimeConfig;
use crate::handlers::{
    CreateReservation, CreateReservationRequest, HandleProviderWebhook, HandlerError,
    PayReservation, PayReservationRequest, ProcessOutboxBookSupplier, ProcessOutcome, Reply,
    WebhookOutcome,
};
use crate::registry::SupplierRegistry;
use crate::uow::{RetryPolicy, run_unit_of_work};
use crate::worker::OutboxWorker;

/// Front door for reservation booking: commands in, outbox out.
pub struct BookingEngine {
    create: CreateReservation,
    pay: PayReservation,
    webhook: HandleProviderWebhook,
    process: Arc<ProcessOutboxBookSupplier>,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    config: RuntimeConfig,
    policy: RetryPolicy,
}

impl BookingEngine {
    /// Assembles an engine over one storage backend and one set of gateways.
    #[must_use]
    pub fn new(
        storage: Arc<dyn Storage>,
        payments: Arc<dyn PaymentGateway>,
        suppliers: Arc<SupplierRegistry>,
        clock: Arc<dyn Clock>,
        config: RuntimeConfig,
    ) -> Self {
        let breaker_config = CircuitBreakerConfig::builder()
            .failure_threshold(config.breaker.failure_threshold)
            .cooldown(config.breaker.cooldown())
            .build();
        let process = Arc::new(ProcessOutboxBookSupplier::new(
            Arc::clone(&storage),
            suppliers,
            CircuitBreaker::new(breaker_config.clone()),
            config.gateway.supplier_timeout(),
            Arc::clone(&clock),
            config.outbox.clone(),
        ));
        Self {
            create: CreateReservation::new(Arc::clone(&storage), Arc::clone(&clock)),
            pay: PayReservation::new(
                Arc::clone(&storage),
                Arc::clone(&payments),
                CircuitBreaker::new(breaker_config),
                config.gateway.payment_timeout(),
                Arc::clone(&clock),
            ),
            webhook: HandleProviderWebhook::new(
                Arc::clone(&storage),
                payments,
                Arc::clone(&clock),
            ),
            process,
            storage,
            clock,
            policy: RetryPolicy::new(config.uow.max_attempts, config.uow.base_delay()),
            config,
        }
    }

    /// Creates a PENDING/UNPAID reservation, idempotent per `client_key`.
    ///
    /// # Errors
    ///
    /// Validation, idempotency-conflict, or storage errors from the handler;
    /// contention has already been retried away by the time an error escapes.
    pub async fn create_reservation(
        &self,
        request: &CreateReservationRequest,
        client_key: &str,
    ) -> Result<Reply, HandlerError> {
        run_unit_of_work(
            self.policy,
            || self.create.execute(request, client_key),
            HandlerError::is_retryable,
        )
        .await
    }

    /// Captures payment for a reservation and enqueues the supplier booking.
    ///
    /// Safe to re-run: the capture carries a provider-side idempotency key
    /// derived from `client_key`, so a retried unit of work replays the
    /// provider's earlier decision instead of charging twice.
    ///
    /// # Errors
    ///
    /// Validation, not-found, capture-in-progress, declined, or
    /// provider-unavailable errors from the handler.
    pub async fn pay_reservation(
        &self,
        code: &ReservationCode,
        request: &PayReservationRequest,
        client_key: &str,
    ) -> Result<Reply, HandlerError> {
        run_unit_of_work(
            self.policy,
            || self.pay.execute(code, request, client_key),
            HandlerError::is_retryable,
        )
        .await
    }

    /// Applies a payment provider webhook, deduplicated by provider event id.
    ///
    /// # Errors
    ///
    /// Validation errors for unverifiable or unhandled payloads, not-found
    /// for unknown transactions, or storage errors.
    pub async fn handle_webhook(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> Result<WebhookOutcome, HandlerError> {
        run_unit_of_work(
            self.policy,
            || self.webhook.execute(payload, signature),
            HandlerError::is_retryable,
        )
        .await
    }

    /// Claims and delivers one aggregate's pending supplier booking.
    ///
    /// Not wrapped in the unit-of-work retry: a processing failure leaves the
    /// event IN_PROGRESS under its claim lock, and lock expiry hands it to
    /// the next claimer.
    ///
    /// # Errors
    ///
    /// [`HandlerError::NoEventReady`] when nothing was claimable, or storage
    /// errors from mid-flight transactions.
    pub async fn process_outbox(
        &self,
        code: &ReservationCode,
        idem_key: &str,
        worker_id: &str,
    ) -> Result<ProcessOutcome, HandlerError> {
        self.process.execute(code, idem_key, worker_id).await
    }

    /// A background worker sharing this engine's processor and storage.
    #[must_use]
    pub fn worker(&self) -> OutboxWorker {
        OutboxWorker::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.process),
            self.config.worker.clone(),
            self.config.outbox.clone(),
            Arc::clone(&self.clock),
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use surebook_core::{ReservationStatus, ReservationStore};
    use surebook_testing::{
        MemoryStorage, MockPaymentGateway, MockSupplierGateway, test_clock,
    };

    fn engine(
        storage: Arc<MemoryStorage>,
        payments: Arc<MockPaymentGateway>,
        supplier: Arc<MockSupplierGateway>,
        config: RuntimeConfig,
    ) -> BookingEngine {
        BookingEngine::new(
            storage,
            payments,
            Arc::new(SupplierRegistry::default().with_default(supplier)),
            Arc::new(test_clock()),
            config,
        )
    }

    fn create_request() -> CreateReservationRequest {
        serde_json::from_value(json!({
            "supplier_id": "hertz",
            "country_code": "PT",
            "total_cents": 12_900,
            "currency": "EUR",
        }))
        .unwrap()
    }

    fn pay_request() -> PayReservationRequest {
        serde_json::from_value(json!({ "payment_method": "pm_card" })).unwrap()
    }

    #[tokio::test]
    async fn the_full_flow_confirms_through_the_facade() {
        let storage = MemoryStorage::shared();
        let engine = engine(
            Arc::clone(&storage),
            MockPaymentGateway::shared(),
            MockSupplierGateway::shared(),
            RuntimeConfig::default(),
        );

        let created = engine
            .create_reservation(&create_request(), "create-1")
            .await
            .unwrap();
        assert_eq!(created.status, 201);
        let code = ReservationCode::new(created.body["code"].as_str().unwrap());

        let paid = engine
            .pay_reservation(&code, &pay_request(), "pay-1")
            .await
            .unwrap();
        assert_eq!(paid.status, 200);

        let outcome = engine
            .process_outbox(&code, "evt-1", "worker-1")
            .await
            .unwrap();
        assert!(matches!(outcome, ProcessOutcome::Confirmed { .. }));

        let mut tx = storage.begin().await.unwrap();
        let reservation = tx.get_reservation(&code).await.unwrap().unwrap();
        assert_eq!(reservation.status, ReservationStatus::Confirmed);
        assert!(reservation.supplier_confirmation_code.is_some());
    }

    #[tokio::test]
    async fn the_worker_drains_what_the_handlers_enqueue() {
        let storage = MemoryStorage::shared();
        let engine = engine(
            Arc::clone(&storage),
            MockPaymentGateway::shared(),
            MockSupplierGateway::shared(),
            RuntimeConfig::default(),
        );

        for key in ["a", "b"] {
            let mut request = create_request();
            request.country_code = "ES".to_owned();
            let created = engine
                .create_reservation(&request, &format!("create-{key}"))
                .await
                .unwrap();
            let code = ReservationCode::new(created.body["code"].as_str().unwrap());
            engine
                .pay_reservation(&code, &pay_request(), &format!("pay-{key}"))
                .await
                .unwrap();
        }

        let worker = engine.worker();
        assert_eq!(worker.tick().await.unwrap(), 2);
        assert_eq!(worker.tick().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn supplier_failures_leave_the_payment_circuit_closed() {
        let storage = MemoryStorage::shared();
        let payments = MockPaymentGateway::shared();
        let supplier = MockSupplierGateway::shared();
        let mut config = RuntimeConfig::default();
        config.breaker.failure_threshold = 1;
        let engine = engine(
            Arc::clone(&storage),
            Arc::clone(&payments),
            Arc::clone(&supplier),
            config,
        );

        // Trip the supplier breaker.
        let created = engine
            .create_reservation(&create_request(), "create-1")
            .await
            .unwrap();
        let code = ReservationCode::new(created.body["code"].as_str().unwrap());
        engine
            .pay_reservation(&code, &pay_request(), "pay-1")
            .await
            .unwrap();
        supplier.fail_with(surebook_core::GatewayError::Transport(
            "connection refused".to_owned(),
        ));
        let outcome = engine
            .process_outbox(&code, "evt-1", "worker-1")
            .await
            .unwrap();
        assert!(matches!(outcome, ProcessOutcome::Scheduled { .. }));

        // Payment still works: the breakers are independent.
        let second = engine
            .create_reservation(&create_request(), "create-2")
            .await
            .unwrap();
        let second_code = ReservationCode::new(second.body["code"].as_str().unwrap());
        let paid = engine
            .pay_reservation(&second_code, &pay_request(), "pay-2")
            .await
            .unwrap();
        assert_eq!(paid.status, 200);
    }

    #[tokio::test]
    async fn validation_errors_surface_unchanged() {
        let storage = MemoryStorage::shared();
        let engine = engine(
            storage,
            MockPaymentGateway::shared(),
            MockSupplierGateway::shared(),
            RuntimeConfig::default(),
        );

        let mut request = create_request();
        request.supplier_id = String::new();
        let err = engine
            .create_reservation(&request, "create-1")
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Validation(_)));
    }
}
