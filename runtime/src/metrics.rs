//! Metric names for the engine's consistency seams.
//!
//! The engine emits counters through the `metrics` facade and leaves exporter
//! wiring to the embedding service. Call [`register_metrics`] once at startup
//! so scrapes see described series from the first increment.

use metrics::describe_counter;

/// Register descriptions for every counter the engine emits.
pub fn register_metrics() {
    describe_counter!(
        "surebook_outbox_claims_total",
        "Outbox events claimed for processing"
    );
    describe_counter!(
        "surebook_outbox_done_total",
        "Outbox events delivered successfully"
    );
    describe_counter!(
        "surebook_outbox_retries_total",
        "Outbox events scheduled for another attempt"
    );
    describe_counter!(
        "surebook_outbox_dead_letters_total",
        "Outbox events archived to the dead-letter store"
    );
    describe_counter!(
        "surebook_breaker_rejections_total",
        "Calls rejected by an open circuit breaker"
    );
    describe_counter!(
        "surebook_breaker_transitions_total",
        "Circuit breaker state transitions, labeled by target state"
    );
    describe_counter!(
        "surebook_idempotency_replays_total",
        "Commands answered from the idempotency cache"
    );
    describe_counter!(
        "surebook_idempotency_conflicts_total",
        "Idempotency keys reused with a different payload"
    );
    describe_counter!(
        "surebook_version_conflicts_total",
        "Lost optimistic-concurrency races, whether reconciled or retried"
    );
    describe_counter!(
        "surebook_uow_retries_total",
        "Units of work re-run after storage contention"
    );
    describe_counter!(
        "surebook_storage_contention_total",
        "Serialization failures and deadlocks reported by the database"
    );
}
