//! [`Storage`] implementation over a `PostgreSQL` pool.
//!
//! One [`StorageTx`] is one database transaction. Conditional aggregate
//! updates compile to `UPDATE ... WHERE code = $1 AND version = $2` with a
//! `RETURNING version` clause, so a stale caller is told so by the row count
//! rather than by a read-then-write race. Outbox claims use
//! `FOR UPDATE SKIP LOCKED`, which makes concurrent workers skip each other
//! instead of blocking, and the partial unique index on live events backs the
//! insert-if-absent enqueue.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use surebook_core::store::{
    DeadLetterStore, IdempotencyStore, OutboxStore, PaymentStore, ReservationStore, Storage,
    StorageError, StorageTx, SupplierRequestStore,
};
use surebook_core::{
    DeadLetterRecord, IdempotencyRecord, Money, OutboxEvent, OutboxStatus, Payment, PaymentState,
    PaymentStatus, Reservation, ReservationCode, ReservationStatus, SupplierRequestRecord,
    SupplierRequestStatus,
};

/// Schema statements, applied in order. Each is idempotent.
const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS reservations (
        code TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        payment_status TEXT NOT NULL,
        supplier_id TEXT NOT NULL,
        country_code TEXT NOT NULL,
        supplier_confirmation_code TEXT,
        supplier_confirmed_at TIMESTAMPTZ,
        total_cents BIGINT NOT NULL,
        currency TEXT NOT NULL,
        contact JSONB NOT NULL,
        drivers JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        version INTEGER NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS payments (
        id UUID PRIMARY KEY,
        reservation_code TEXT NOT NULL,
        provider TEXT NOT NULL,
        provider_transaction_id TEXT,
        charge_id TEXT,
        provider_event_id TEXT,
        amount_cents BIGINT NOT NULL,
        currency TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )
    ",
    r"CREATE INDEX IF NOT EXISTS idx_payments_reservation
        ON payments (reservation_code)",
    r"CREATE INDEX IF NOT EXISTS idx_payments_transaction
        ON payments (provider, provider_transaction_id)",
    r"CREATE INDEX IF NOT EXISTS idx_payments_provider_event
        ON payments (provider, provider_event_id)",
    r"
    CREATE TABLE IF NOT EXISTS outbox_events (
        id UUID PRIMARY KEY,
        event_type TEXT NOT NULL,
        aggregate_code TEXT NOT NULL,
        payload JSONB NOT NULL,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL,
        next_attempt_at TIMESTAMPTZ,
        locked_by TEXT,
        lock_expires_at TIMESTAMPTZ,
        last_error_code TEXT,
        last_error_message TEXT,
        created_at TIMESTAMPTZ NOT NULL
    )
    ",
    r"CREATE UNIQUE INDEX IF NOT EXISTS uq_outbox_live
        ON outbox_events (aggregate_code, event_type)
        WHERE status IN ('NEW', 'RETRY', 'IN_PROGRESS')",
    r"CREATE INDEX IF NOT EXISTS idx_outbox_ready
        ON outbox_events (event_type, next_attempt_at)
        WHERE status IN ('NEW', 'RETRY', 'IN_PROGRESS')",
    r"
    CREATE TABLE IF NOT EXISTS dead_letters (
        id UUID PRIMARY KEY,
        original_event_id UUID NOT NULL,
        event_type TEXT NOT NULL,
        aggregate_code TEXT NOT NULL,
        payload JSONB NOT NULL,
        error_code TEXT,
        error_message TEXT,
        attempts INTEGER NOT NULL,
        moved_at TIMESTAMPTZ NOT NULL
    )
    ",
    r"CREATE INDEX IF NOT EXISTS idx_dead_letters_aggregate
        ON dead_letters (aggregate_code, moved_at)",
    r"
    CREATE TABLE IF NOT EXISTS idempotency_records (
        scope TEXT NOT NULL,
        client_key TEXT NOT NULL,
        request_fingerprint TEXT NOT NULL,
        cached_response JSONB NOT NULL,
        cached_status INTEGER NOT NULL,
        reference_id TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (scope, client_key)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS supplier_requests (
        id UUID PRIMARY KEY,
        reservation_code TEXT NOT NULL,
        supplier_id TEXT NOT NULL,
        request_type TEXT NOT NULL,
        idem_key TEXT NOT NULL,
        attempt INTEGER NOT NULL,
        status TEXT NOT NULL,
        response_payload JSONB,
        error_code TEXT,
        error_message TEXT,
        http_status INTEGER,
        created_at TIMESTAMPTZ NOT NULL
    )
    ",
    r"CREATE INDEX IF NOT EXISTS idx_supplier_requests_reservation
        ON supplier_requests (reservation_code, created_at)",
];

/// `PostgreSQL`-backed [`Storage`].
///
/// Cheap to clone; clones share the connection pool.
#[derive(Clone, Debug)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    /// Connects a new pool to `database_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPool::connect(database_url).await.map_err(map_db_error)?;
        Ok(Self { pool })
    }

    /// Wraps an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates every table and index the engine needs. Idempotent; safe to
    /// run on every startup.
    ///
    /// # Errors
    ///
    /// Returns an error if a schema statement fails.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(map_db_error)?;
        }
        tracing::info!("Storage schema ensured");
        Ok(())
    }
}

#[async_trait]
impl Storage for PgStorage {
    async fn begin(&self) -> Result<Box<dyn StorageTx>, StorageError> {
        let tx = self.pool.begin().await.map_err(map_db_error)?;
        Ok(Box::new(PgTx { tx }))
    }
}

struct PgTx {
    tx: Transaction<'static, Postgres>,
}

/// Maps a sqlx error onto the storage contract. Serialization failures and
/// deadlocks become [`StorageError::Contention`] so the unit-of-work layer
/// retries them.
fn map_db_error(error: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db) = &error {
        if matches!(db.code().as_deref(), Some("40001" | "40P01")) {
            metrics::counter!("surebook_storage_contention_total").increment(1);
            tracing::warn!(code = ?db.code(), "Database contention, unit of work may retry");
            return StorageError::Contention(db.to_string());
        }
    }
    StorageError::Database(error.to_string())
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn cents_to_db(amount: Money) -> Result<i64, StorageError> {
    i64::try_from(amount.cents())
        .map_err(|_| StorageError::Serialization(format!("amount out of range: {amount}")))
}

fn cents_from_db(raw: i64) -> Result<Money, StorageError> {
    u64::try_from(raw)
        .map(Money::from_cents)
        .map_err(|_| StorageError::Serialization(format!("negative stored amount: {raw}")))
}

fn http_status_from_db(raw: Option<i32>) -> Result<Option<u16>, StorageError> {
    raw.map(|v| {
        u16::try_from(v)
            .map_err(|_| StorageError::Serialization(format!("http status out of range: {v}")))
    })
    .transpose()
}

fn json_to_db<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, StorageError> {
    serde_json::to_value(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn json_from_db<T: serde::de::DeserializeOwned>(
    value: serde_json::Value,
) -> Result<T, StorageError> {
    serde_json::from_value(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn row_to_reservation(row: &PgRow) -> Result<Reservation, StorageError> {
    let status: String = row.get("status");
    let payment_status: String = row.get("payment_status");
    Ok(Reservation {
        code: ReservationCode::new(row.get::<String, _>("code")),
        status: ReservationStatus::parse(&status)?,
        payment_status: PaymentState::parse(&payment_status)?,
        supplier_id: row.get("supplier_id"),
        country_code: row.get("country_code"),
        supplier_confirmation_code: row.get("supplier_confirmation_code"),
        supplier_confirmed_at: row.get("supplier_confirmed_at"),
        total: cents_from_db(row.get("total_cents"))?,
        currency: row.get("currency"),
        contact: json_from_db(row.get("contact"))?,
        drivers: json_from_db(row.get("drivers"))?,
        created_at: row.get("created_at"),
        version: row.get("version"),
    })
}

fn row_to_payment(row: &PgRow) -> Result<Payment, StorageError> {
    let status: String = row.get("status");
    Ok(Payment {
        id: row.get("id"),
        reservation_code: ReservationCode::new(row.get::<String, _>("reservation_code")),
        provider: row.get("provider"),
        provider_transaction_id: row.get("provider_transaction_id"),
        charge_id: row.get("charge_id"),
        provider_event_id: row.get("provider_event_id"),
        amount: cents_from_db(row.get("amount_cents"))?,
        currency: row.get("currency"),
        status: PaymentStatus::parse(&status)?,
        created_at: row.get("created_at"),
    })
}

fn row_to_event(row: &PgRow) -> Result<OutboxEvent, StorageError> {
    let status: String = row.get("status");
    Ok(OutboxEvent {
        id: row.get("id"),
        event_type: row.get("event_type"),
        aggregate_code: ReservationCode::new(row.get::<String, _>("aggregate_code")),
        payload: row.get("payload"),
        status: OutboxStatus::parse(&status)?,
        attempts: row.get("attempts"),
        next_attempt_at: row.get("next_attempt_at"),
        locked_by: row.get("locked_by"),
        lock_expires_at: row.get("lock_expires_at"),
        last_error_code: row.get("last_error_code"),
        last_error_message: row.get("last_error_message"),
        created_at: row.get("created_at"),
    })
}

fn row_to_dead_letter(row: &PgRow) -> Result<DeadLetterRecord, StorageError> {
    Ok(DeadLetterRecord {
        id: row.get("id"),
        original_event_id: row.get("original_event_id"),
        event_type: row.get("event_type"),
        aggregate_code: ReservationCode::new(row.get::<String, _>("aggregate_code")),
        payload: row.get("payload"),
        error_code: row.get("error_code"),
        error_message: row.get("error_message"),
        attempts: row.get("attempts"),
        moved_at: row.get("moved_at"),
    })
}

fn row_to_idempotency(row: &PgRow) -> Result<IdempotencyRecord, StorageError> {
    let cached_status: i32 = row.get("cached_status");
    Ok(IdempotencyRecord {
        scope: row.get("scope"),
        client_key: row.get("client_key"),
        request_fingerprint: row.get("request_fingerprint"),
        cached_response: row.get("cached_response"),
        cached_status: u16::try_from(cached_status).map_err(|_| {
            StorageError::Serialization(format!("cached status out of range: {cached_status}"))
        })?,
        reference_id: row
            .get::<Option<String>, _>("reference_id")
            .map(ReservationCode::new),
        created_at: row.get("created_at"),
    })
}

fn row_to_supplier_request(row: &PgRow) -> Result<SupplierRequestRecord, StorageError> {
    let status: String = row.get("status");
    Ok(SupplierRequestRecord {
        id: row.get("id"),
        reservation_code: ReservationCode::new(row.get::<String, _>("reservation_code")),
        supplier_id: row.get("supplier_id"),
        request_type: row.get("request_type"),
        idem_key: row.get("idem_key"),
        attempt: row.get("attempt"),
        status: SupplierRequestStatus::parse(&status)?,
        response_payload: row.get("response_payload"),
        error_code: row.get("error_code"),
        error_message: row.get("error_message"),
        http_status: http_status_from_db(row.get("http_status"))?,
        created_at: row.get("created_at"),
    })
}

/// A zero-row conditional update means the caller's version was stale (or the
/// row is gone, which a zero-row `UPDATE` cannot distinguish).
fn version_or_conflict(
    row: Option<PgRow>,
    code: &ReservationCode,
    expected: i32,
) -> Result<i32, StorageError> {
    row.map_or_else(
        || {
            Err(StorageError::VersionConflict {
                code: code.clone(),
                expected,
            })
        },
        |row| Ok(row.get("version")),
    )
}

#[async_trait]
impl IdempotencyStore for PgTx {
    async fn get(
        &mut self,
        scope: &str,
        client_key: &str,
    ) -> Result<Option<IdempotencyRecord>, StorageError> {
        let row = sqlx::query(
            r"
            SELECT scope, client_key, request_fingerprint, cached_response,
                   cached_status, reference_id, created_at
            FROM idempotency_records
            WHERE scope = $1 AND client_key = $2
            ",
        )
        .bind(scope)
        .bind(client_key)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        row.as_ref().map(row_to_idempotency).transpose()
    }

    async fn save(&mut self, record: &IdempotencyRecord) -> Result<(), StorageError> {
        sqlx::query(
            r"
            INSERT INTO idempotency_records (
                scope, client_key, request_fingerprint, cached_response,
                cached_status, reference_id, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ",
        )
        .bind(&record.scope)
        .bind(&record.client_key)
        .bind(&record.request_fingerprint)
        .bind(&record.cached_response)
        .bind(i32::from(record.cached_status))
        .bind(record.reference_id.as_ref().map(ReservationCode::as_str))
        .bind(record.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StorageError::Database(format!(
                    "Idempotency record already exists: {}/{}",
                    record.scope, record.client_key
                ))
            } else {
                map_db_error(e)
            }
        })?;
        Ok(())
    }
}

#[async_trait]
impl ReservationStore for PgTx {
    async fn get_reservation(
        &mut self,
        code: &ReservationCode,
    ) -> Result<Option<Reservation>, StorageError> {
        let row = sqlx::query(
            r"
            SELECT code, status, payment_status, supplier_id, country_code,
                   supplier_confirmation_code, supplier_confirmed_at,
                   total_cents, currency, contact, drivers, created_at, version
            FROM reservations
            WHERE code = $1
            ",
        )
        .bind(code.as_str())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        row.as_ref().map(row_to_reservation).transpose()
    }

    async fn insert_reservation(&mut self, reservation: &Reservation) -> Result<(), StorageError> {
        sqlx::query(
            r"
            INSERT INTO reservations (
                code, status, payment_status, supplier_id, country_code,
                supplier_confirmation_code, supplier_confirmed_at,
                total_cents, currency, contact, drivers, created_at, version
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ",
        )
        .bind(reservation.code.as_str())
        .bind(reservation.status.as_str())
        .bind(reservation.payment_status.as_str())
        .bind(&reservation.supplier_id)
        .bind(&reservation.country_code)
        .bind(reservation.supplier_confirmation_code.as_deref())
        .bind(reservation.supplier_confirmed_at)
        .bind(cents_to_db(reservation.total)?)
        .bind(&reservation.currency)
        .bind(json_to_db(&reservation.contact)?)
        .bind(json_to_db(&reservation.drivers)?)
        .bind(reservation.created_at)
        .bind(reservation.version)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StorageError::Database(format!(
                    "Reservation already exists: {}",
                    reservation.code
                ))
            } else {
                map_db_error(e)
            }
        })?;
        Ok(())
    }

    async fn update_payment_state(
        &mut self,
        code: &ReservationCode,
        state: PaymentState,
        expected_version: i32,
    ) -> Result<i32, StorageError> {
        let row = sqlx::query(
            r"
            UPDATE reservations
            SET payment_status = $1, version = version + 1
            WHERE code = $2 AND version = $3
            RETURNING version
            ",
        )
        .bind(state.as_str())
        .bind(code.as_str())
        .bind(expected_version)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        version_or_conflict(row, code, expected_version)
    }

    async fn update_status(
        &mut self,
        code: &ReservationCode,
        status: ReservationStatus,
        expected_version: i32,
    ) -> Result<i32, StorageError> {
        let row = sqlx::query(
            r"
            UPDATE reservations
            SET status = $1, version = version + 1
            WHERE code = $2 AND version = $3
            RETURNING version
            ",
        )
        .bind(status.as_str())
        .bind(code.as_str())
        .bind(expected_version)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        version_or_conflict(row, code, expected_version)
    }

    async fn mark_confirmed(
        &mut self,
        code: &ReservationCode,
        confirmation_code: &str,
        confirmed_at: DateTime<Utc>,
        expected_version: i32,
    ) -> Result<i32, StorageError> {
        let row = sqlx::query(
            r"
            UPDATE reservations
            SET status = 'CONFIRMED',
                supplier_confirmation_code = $1,
                supplier_confirmed_at = $2,
                version = version + 1
            WHERE code = $3 AND version = $4
            RETURNING version
            ",
        )
        .bind(confirmation_code)
        .bind(confirmed_at)
        .bind(code.as_str())
        .bind(expected_version)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        version_or_conflict(row, code, expected_version)
    }
}

#[async_trait]
impl PaymentStore for PgTx {
    async fn insert_payment(&mut self, payment: &Payment) -> Result<(), StorageError> {
        sqlx::query(
            r"
            INSERT INTO payments (
                id, reservation_code, provider, provider_transaction_id,
                charge_id, provider_event_id, amount_cents, currency,
                status, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ",
        )
        .bind(payment.id)
        .bind(payment.reservation_code.as_str())
        .bind(&payment.provider)
        .bind(payment.provider_transaction_id.as_deref())
        .bind(payment.charge_id.as_deref())
        .bind(payment.provider_event_id.as_deref())
        .bind(cents_to_db(payment.amount)?)
        .bind(&payment.currency)
        .bind(payment.status.as_str())
        .bind(payment.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        Ok(())
    }

    async fn find_payment_by_transaction(
        &mut self,
        provider: &str,
        provider_transaction_id: &str,
    ) -> Result<Option<Payment>, StorageError> {
        let row = sqlx::query(
            r"
            SELECT id, reservation_code, provider, provider_transaction_id,
                   charge_id, provider_event_id, amount_cents, currency,
                   status, created_at
            FROM payments
            WHERE provider = $1 AND provider_transaction_id = $2
            ORDER BY created_at DESC
            LIMIT 1
            ",
        )
        .bind(provider)
        .bind(provider_transaction_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        row.as_ref().map(row_to_payment).transpose()
    }

    async fn find_payment_by_provider_event(
        &mut self,
        provider: &str,
        provider_event_id: &str,
    ) -> Result<Option<Payment>, StorageError> {
        let row = sqlx::query(
            r"
            SELECT id, reservation_code, provider, provider_transaction_id,
                   charge_id, provider_event_id, amount_cents, currency,
                   status, created_at
            FROM payments
            WHERE provider = $1 AND provider_event_id = $2
            ORDER BY created_at DESC
            LIMIT 1
            ",
        )
        .bind(provider)
        .bind(provider_event_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        row.as_ref().map(row_to_payment).transpose()
    }

    async fn find_captured_payment(
        &mut self,
        code: &ReservationCode,
    ) -> Result<Option<Payment>, StorageError> {
        let row = sqlx::query(
            r"
            SELECT id, reservation_code, provider, provider_transaction_id,
                   charge_id, provider_event_id, amount_cents, currency,
                   status, created_at
            FROM payments
            WHERE reservation_code = $1 AND status = 'CAPTURED'
            ORDER BY created_at DESC
            LIMIT 1
            ",
        )
        .bind(code.as_str())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        row.as_ref().map(row_to_payment).transpose()
    }

    async fn mark_payment_captured(
        &mut self,
        payment_id: Uuid,
        provider_event_id: Option<&str>,
        charge_id: Option<&str>,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            r"
            UPDATE payments
            SET status = 'CAPTURED',
                provider_event_id = COALESCE($2, provider_event_id),
                charge_id = COALESCE($3, charge_id)
            WHERE id = $1
            ",
        )
        .bind(payment_id)
        .bind(provider_event_id)
        .bind(charge_id)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::Database(format!(
                "Unknown payment: {payment_id}"
            )));
        }
        Ok(())
    }

    async fn mark_payment_failed(
        &mut self,
        payment_id: Uuid,
        provider_event_id: Option<&str>,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            r"
            UPDATE payments
            SET status = 'FAILED',
                provider_event_id = COALESCE($2, provider_event_id)
            WHERE id = $1
            ",
        )
        .bind(payment_id)
        .bind(provider_event_id)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::Database(format!(
                "Unknown payment: {payment_id}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PgTx {
    async fn enqueue(&mut self, event: &OutboxEvent) -> Result<bool, StorageError> {
        // The partial unique index on live (aggregate, type) pairs arbitrates:
        // a live duplicate makes this a no-op, terminal rows do not.
        let result = sqlx::query(
            r"
            INSERT INTO outbox_events (
                id, event_type, aggregate_code, payload, status, attempts,
                next_attempt_at, locked_by, lock_expires_at,
                last_error_code, last_error_message, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (aggregate_code, event_type)
                WHERE status IN ('NEW', 'RETRY', 'IN_PROGRESS')
                DO NOTHING
            ",
        )
        .bind(event.id)
        .bind(&event.event_type)
        .bind(event.aggregate_code.as_str())
        .bind(&event.payload)
        .bind(event.status.as_str())
        .bind(event.attempts)
        .bind(event.next_attempt_at)
        .bind(event.locked_by.as_deref())
        .bind(event.lock_expires_at)
        .bind(event.last_error_code.as_deref())
        .bind(event.last_error_message.as_deref())
        .bind(event.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        Ok(result.rows_affected() == 1)
    }

    async fn claim(
        &mut self,
        aggregate_code: &ReservationCode,
        event_type: &str,
        worker_id: &str,
        now: DateTime<Utc>,
        lock_ttl: Duration,
    ) -> Result<Option<OutboxEvent>, StorageError> {
        let row = sqlx::query(
            r"
            UPDATE outbox_events
            SET status = 'IN_PROGRESS', locked_by = $1, lock_expires_at = $2
            WHERE id = (
                SELECT id FROM outbox_events
                WHERE aggregate_code = $3
                  AND event_type = $4
                  AND status IN ('NEW', 'RETRY', 'IN_PROGRESS')
                  AND (next_attempt_at IS NULL OR next_attempt_at <= $5)
                  AND (lock_expires_at IS NULL OR lock_expires_at <= $5)
                ORDER BY created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, event_type, aggregate_code, payload, status, attempts,
                      next_attempt_at, locked_by, lock_expires_at,
                      last_error_code, last_error_message, created_at
            ",
        )
        .bind(worker_id)
        .bind(now + lock_ttl)
        .bind(aggregate_code.as_str())
        .bind(event_type)
        .bind(now)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        row.as_ref().map(row_to_event).transpose()
    }

    async fn claim_ready(
        &mut self,
        event_type: &str,
        limit: usize,
        worker_id: &str,
        now: DateTime<Utc>,
        lock_ttl: Duration,
    ) -> Result<Vec<OutboxEvent>, StorageError> {
        let rows = sqlx::query(
            r"
            UPDATE outbox_events
            SET status = 'IN_PROGRESS', locked_by = $1, lock_expires_at = $2
            WHERE id IN (
                SELECT id FROM outbox_events
                WHERE event_type = $3
                  AND status IN ('NEW', 'RETRY', 'IN_PROGRESS')
                  AND (next_attempt_at IS NULL OR next_attempt_at <= $4)
                  AND (lock_expires_at IS NULL OR lock_expires_at <= $4)
                ORDER BY next_attempt_at NULLS FIRST, created_at
                LIMIT $5
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, event_type, aggregate_code, payload, status, attempts,
                      next_attempt_at, locked_by, lock_expires_at,
                      last_error_code, last_error_message, created_at
            ",
        )
        .bind(worker_id)
        .bind(now + lock_ttl)
        .bind(event_type)
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        let mut claimed = rows
            .iter()
            .map(row_to_event)
            .collect::<Result<Vec<_>, _>>()?;
        // RETURNING order is unspecified; hand events out oldest first.
        claimed.sort_by(|a, b| {
            (a.next_attempt_at, a.created_at).cmp(&(b.next_attempt_at, b.created_at))
        });
        Ok(claimed)
    }

    async fn mark_done(&mut self, event_id: Uuid) -> Result<(), StorageError> {
        let result = sqlx::query(
            r"
            UPDATE outbox_events
            SET status = 'DONE', locked_by = NULL, lock_expires_at = NULL
            WHERE id = $1
            ",
        )
        .bind(event_id)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::Database(format!(
                "Unknown outbox event: {event_id}"
            )));
        }
        Ok(())
    }

    async fn mark_retry(
        &mut self,
        event_id: Uuid,
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
        error_code: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            r"
            UPDATE outbox_events
            SET status = 'RETRY', attempts = $2, next_attempt_at = $3,
                last_error_code = $4, last_error_message = $5,
                locked_by = NULL, lock_expires_at = NULL
            WHERE id = $1
            ",
        )
        .bind(event_id)
        .bind(attempts)
        .bind(next_attempt_at)
        .bind(error_code)
        .bind(error_message)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::Database(format!(
                "Unknown outbox event: {event_id}"
            )));
        }
        Ok(())
    }

    async fn mark_failed(
        &mut self,
        event_id: Uuid,
        attempts: i32,
        error_code: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            r"
            UPDATE outbox_events
            SET status = 'FAILED', attempts = $2, next_attempt_at = NULL,
                last_error_code = $3, last_error_message = $4,
                locked_by = NULL, lock_expires_at = NULL
            WHERE id = $1
            ",
        )
        .bind(event_id)
        .bind(attempts)
        .bind(error_code)
        .bind(error_message)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::Database(format!(
                "Unknown outbox event: {event_id}"
            )));
        }
        Ok(())
    }

    async fn find_event(
        &mut self,
        aggregate_code: &ReservationCode,
        event_type: &str,
    ) -> Result<Option<OutboxEvent>, StorageError> {
        let row = sqlx::query(
            r"
            SELECT id, event_type, aggregate_code, payload, status, attempts,
                   next_attempt_at, locked_by, lock_expires_at,
                   last_error_code, last_error_message, created_at
            FROM outbox_events
            WHERE aggregate_code = $1 AND event_type = $2
            ORDER BY created_at DESC
            LIMIT 1
            ",
        )
        .bind(aggregate_code.as_str())
        .bind(event_type)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        row.as_ref().map(row_to_event).transpose()
    }
}

#[async_trait]
impl DeadLetterStore for PgTx {
    async fn archive(&mut self, record: &DeadLetterRecord) -> Result<(), StorageError> {
        sqlx::query(
            r"
            INSERT INTO dead_letters (
                id, original_event_id, event_type, aggregate_code, payload,
                error_code, error_message, attempts, moved_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ",
        )
        .bind(record.id)
        .bind(record.original_event_id)
        .bind(&record.event_type)
        .bind(record.aggregate_code.as_str())
        .bind(&record.payload)
        .bind(record.error_code.as_deref())
        .bind(record.error_message.as_deref())
        .bind(record.attempts)
        .bind(record.moved_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        tracing::debug!(
            original_event_id = %record.original_event_id,
            aggregate_code = %record.aggregate_code,
            "Dead letter archived"
        );
        Ok(())
    }

    async fn list_for_aggregate(
        &mut self,
        aggregate_code: &ReservationCode,
    ) -> Result<Vec<DeadLetterRecord>, StorageError> {
        let rows = sqlx::query(
            r"
            SELECT id, original_event_id, event_type, aggregate_code, payload,
                   error_code, error_message, attempts, moved_at
            FROM dead_letters
            WHERE aggregate_code = $1
            ORDER BY moved_at
            ",
        )
        .bind(aggregate_code.as_str())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        rows.iter().map(row_to_dead_letter).collect()
    }
}

#[async_trait]
impl SupplierRequestStore for PgTx {
    async fn insert_supplier_request(
        &mut self,
        record: &SupplierRequestRecord,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r"
            INSERT INTO supplier_requests (
                id, reservation_code, supplier_id, request_type, idem_key,
                attempt, status, response_payload, error_code, error_message,
                http_status, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ",
        )
        .bind(record.id)
        .bind(record.reservation_code.as_str())
        .bind(&record.supplier_id)
        .bind(&record.request_type)
        .bind(&record.idem_key)
        .bind(record.attempt)
        .bind(record.status.as_str())
        .bind(record.response_payload.as_ref())
        .bind(record.error_code.as_deref())
        .bind(record.error_message.as_deref())
        .bind(record.http_status.map(i32::from))
        .bind(record.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        Ok(())
    }

    async fn finalize_supplier_request(
        &mut self,
        record: &SupplierRequestRecord,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            r"
            UPDATE supplier_requests
            SET status = $2, response_payload = $3, error_code = $4,
                error_message = $5, http_status = $6
            WHERE id = $1
            ",
        )
        .bind(record.id)
        .bind(record.status.as_str())
        .bind(record.response_payload.as_ref())
        .bind(record.error_code.as_deref())
        .bind(record.error_message.as_deref())
        .bind(record.http_status.map(i32::from))
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::Database(format!(
                "Unknown supplier request: {}",
                record.id
            )));
        }
        Ok(())
    }

    async fn list_supplier_requests(
        &mut self,
        aggregate_code: &ReservationCode,
    ) -> Result<Vec<SupplierRequestRecord>, StorageError> {
        let rows = sqlx::query(
            r"
            SELECT id, reservation_code, supplier_id, request_type, idem_key,
                   attempt, status, response_payload, error_code, error_message,
                   http_status, created_at
            FROM supplier_requests
            WHERE reservation_code = $1
            ORDER BY created_at
            ",
        )
        .bind(aggregate_code.as_str())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        rows.iter().map(row_to_supplier_request).collect()
    }
}

#[async_trait]
impl StorageTx for PgTx {
    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.tx.commit().await.map_err(map_db_error)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn money_round_trips_through_bigint() {
        let amount = Money::from_cents(12_900);
        let raw = cents_to_db(amount).unwrap();
        assert_eq!(raw, 12_900);
        assert_eq!(cents_from_db(raw).unwrap(), amount);
    }

    #[test]
    fn negative_stored_amount_is_a_serialization_error() {
        assert!(matches!(
            cents_from_db(-1),
            Err(StorageError::Serialization(_))
        ));
    }

    #[test]
    fn http_status_survives_the_integer_column() {
        assert_eq!(http_status_from_db(None).unwrap(), None);
        assert_eq!(http_status_from_db(Some(422)).unwrap(), Some(422));
        assert!(http_status_from_db(Some(-7)).is_err());
        assert!(http_status_from_db(Some(70_000)).is_err());
    }
}
