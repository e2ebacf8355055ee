//! Background delivery of claimable outbox events.
//!
//! The worker polls on a fixed interval, claims a batch of due BOOK_SUPPLIER
//! events under its own lock, and hands each to the booking processor. A
//! worker that dies mid-batch leaves IN_PROGRESS rows whose locks expire
//! after the configured TTL, at which point any other worker claims them.

use std::sync::Arc;

use tokio::sync::watch;

use surebook_core::{Clock, OutboxStore, Storage, StorageTx, event_types};

use crate::config::{OutboxConfig, WorkerConfig};
use crate::handlers::{HandlerError, ProcessOutboxBookSupplier};

/// Polls the outbox and delivers due booking events.
pub struct OutboxWorker {
    storage: Arc<dyn Storage>,
    handler: Arc<ProcessOutboxBookSupplier>,
    config: WorkerConfig,
    outbox: OutboxConfig,
    clock: Arc<dyn Clock>,
    worker_id: String,
}

impl OutboxWorker {
    /// Builds a worker with a fresh random identity.
    ///
    /// The identity is what claim locks are held under; two workers sharing
    /// one id would steal each other's claims.
    #[must_use]
    pub fn new(
        storage: Arc<dyn Storage>,
        handler: Arc<ProcessOutboxBookSupplier>,
        config: WorkerConfig,
        outbox: OutboxConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            handler,
            config,
            outbox,
            clock,
            worker_id: format!("worker-{:08x}", rand::random::<u32>()),
        }
    }

    /// The identity this worker claims events under.
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Polls until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker_id = %self.worker_id, "Outbox worker started");
        let poll_interval = self.config.poll_interval();
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                () = tokio::time::sleep(poll_interval) => {
                    match self.tick().await {
                        Ok(0) => {}
                        Ok(processed) => {
                            tracing::debug!(
                                worker_id = %self.worker_id,
                                processed,
                                "Outbox poll settled events"
                            );
                        }
                        Err(error) => {
                            tracing::error!(
                                worker_id = %self.worker_id,
                                %error,
                                "Outbox poll failed"
                            );
                        }
                    }
                }
            }
        }
        tracing::info!(worker_id = %self.worker_id, "Outbox worker stopped");
    }

    /// Claims one batch of due events and processes each in turn.
    ///
    /// Returns how many events were settled. An event whose processing fails
    /// is logged and skipped, not retried here: it stays IN_PROGRESS under
    /// this worker's lock and becomes claimable again once the lock expires.
    ///
    /// # Errors
    ///
    /// Returns an error when the claim itself fails; per-event failures do
    /// not abort the batch.
    pub async fn tick(&self) -> Result<usize, HandlerError> {
        let now = self.clock.now();
        let mut tx = self.storage.begin().await?;
        let events = tx
            .claim_ready(
                event_types::BOOK_SUPPLIER,
                self.config.batch_size,
                &self.worker_id,
                now,
                self.outbox.lock_ttl(),
            )
            .await?;
        tx.commit().await?;
        if events.is_empty() {
            return Ok(0);
        }
        metrics::counter!("surebook_outbox_claims_total").increment(events.len() as u64);

        let mut processed = 0;
        for event in events {
            // The event id doubles as the supplier idempotency key: stable
            // across redeliveries of the same event, distinct across events.
            let idem_key = event.id.to_string();
            match self.handler.process_claimed(&event, &idem_key).await {
                Ok(outcome) => {
                    processed += 1;
                    tracing::debug!(
                        event_id = %event.id,
                        reservation_code = %event.aggregate_code,
                        ?outcome,
                        "Outbox event settled"
                    );
                }
                Err(error) => {
                    tracing::error!(
                        event_id = %event.id,
                        reservation_code = %event.aggregate_code,
                        %error,
                        "Outbox event left for lock-expiry recovery"
                    );
                }
            }
        }
        Ok(processed)
    }
}
