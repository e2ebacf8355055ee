//! Creating a reservation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use surebook_core::{
    Clock, ContactDetails, DriverDetails, IdempotencyStore, Money, Reservation, ReservationCode,
    ReservationStore, Storage, StorageTx, request_fingerprint,
};

use super::{HandlerError, Reply, cache_record, idempotency_gate};

/// Idempotency scope for reservation creation.
pub(crate) const SCOPE: &str = "RESERVATION_CREATE";

/// Request payload for [`CreateReservation`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateReservationRequest {
    /// Which external booking system fulfils this reservation.
    pub supplier_id: String,
    /// Pickup country, ISO 3166-1 alpha-2.
    pub country_code: String,
    /// Total price in minor units.
    pub total_cents: u64,
    /// ISO 4217 currency code.
    pub currency: String,
    /// Contact details, if collected up front.
    #[serde(default)]
    pub contact: Option<ContactDetails>,
    /// Drivers, if collected up front.
    #[serde(default)]
    pub drivers: Vec<DriverDetails>,
}

impl CreateReservationRequest {
    /// Canonical JSON used for idempotency fingerprinting.
    fn canonical(&self) -> Value {
        json!({
            "supplier_id": &self.supplier_id,
            "country_code": &self.country_code,
            "total_cents": self.total_cents,
            "currency": &self.currency,
            "contact": &self.contact,
            "drivers": &self.drivers,
        })
    }
}

/// Creates a reservation in PENDING / UNPAID, caching the response under the
/// caller's idempotency key in the same transaction as the insert.
pub struct CreateReservation {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
}

impl CreateReservation {
    /// A handler over the given storage and clock.
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    /// Runs the command.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::Validation`] for malformed input,
    /// [`HandlerError::IdempotencyConflict`] for key reuse with a different
    /// payload, or a storage error.
    pub async fn execute(
        &self,
        request: &CreateReservationRequest,
        client_key: &str,
    ) -> Result<Reply, HandlerError> {
        if client_key.is_empty() {
            return Err(HandlerError::Validation(
                "idempotency key is required".to_owned(),
            ));
        }
        if request.supplier_id.is_empty() {
            return Err(HandlerError::Validation("supplier_id is required".to_owned()));
        }
        if request.country_code.is_empty() {
            return Err(HandlerError::Validation(
                "country_code is required".to_owned(),
            ));
        }
        if request.currency.is_empty() {
            return Err(HandlerError::Validation("currency is required".to_owned()));
        }
        if request.total_cents == 0 {
            return Err(HandlerError::Validation("total must be positive".to_owned()));
        }

        let fingerprint = request_fingerprint(&request.canonical());
        let now = self.clock.now();

        let mut tx = self.storage.begin().await?;
        if let Some(reply) = idempotency_gate(tx.as_mut(), SCOPE, client_key, &fingerprint).await? {
            return Ok(reply);
        }

        let code = ReservationCode::generate();
        let mut reservation = Reservation::new(
            code.clone(),
            &request.supplier_id,
            &request.country_code,
            Money::from_cents(request.total_cents),
            &request.currency,
            now,
        );
        if let Some(contact) = &request.contact {
            reservation.contact = contact.clone();
        }
        reservation.drivers = request.drivers.clone();

        tx.insert_reservation(&reservation).await?;
        let reply = Reply::new(201, summary(&reservation));
        tx.save(&cache_record(
            SCOPE,
            client_key,
            fingerprint,
            &reply,
            Some(code.clone()),
            now,
        ))
        .await?;
        tx.commit().await?;

        tracing::info!(
            reservation_code = %code,
            supplier_id = %reservation.supplier_id,
            country_code = %reservation.country_code,
            "Reservation created"
        );
        Ok(reply)
    }
}

fn summary(reservation: &Reservation) -> Value {
    json!({
        "code": reservation.code.as_str(),
        "status": reservation.status.as_str(),
        "payment_status": reservation.payment_status.as_str(),
        "total_cents": reservation.total.cents(),
        "currency": reservation.currency,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use surebook_core::{PaymentState, ReservationStatus};
    use surebook_testing::{MemoryStorage, test_clock};

    fn request() -> CreateReservationRequest {
        CreateReservationRequest {
            supplier_id: "hertz".to_owned(),
            country_code: "PT".to_owned(),
            total_cents: 12_900,
            currency: "EUR".to_owned(),
            contact: Some(ContactDetails {
                email: Some("ana@example.com".to_owned()),
                phone: None,
            }),
            drivers: vec![DriverDetails {
                full_name: "Ana Silva".to_owned(),
                age: Some(34),
            }],
        }
    }

    fn handler(storage: Arc<MemoryStorage>) -> CreateReservation {
        CreateReservation::new(storage, Arc::new(test_clock()))
    }

    #[tokio::test]
    async fn creates_pending_unpaid_reservation() {
        let storage = MemoryStorage::shared();
        let reply = handler(Arc::clone(&storage))
            .execute(&request(), "key-1")
            .await
            .unwrap();

        assert_eq!(reply.status, 201);
        assert_eq!(reply.body["status"], "PENDING");
        assert_eq!(reply.body["payment_status"], "UNPAID");
        assert_eq!(reply.body["total_cents"], 12_900);

        let code = ReservationCode::new(reply.body["code"].as_str().unwrap());
        let mut tx = storage.begin().await.unwrap();
        let stored = tx.get_reservation(&code).await.unwrap().unwrap();
        assert_eq!(stored.status, ReservationStatus::Pending);
        assert_eq!(stored.payment_status, PaymentState::Unpaid);
        assert_eq!(stored.version, 0);
        assert_eq!(stored.contact.email.as_deref(), Some("ana@example.com"));
        assert_eq!(stored.drivers.len(), 1);
    }

    #[tokio::test]
    async fn replaying_the_same_key_returns_the_cached_reply() {
        let storage = MemoryStorage::shared();
        let create = handler(storage);

        let first = create.execute(&request(), "key-1").await.unwrap();
        let second = create.execute(&request(), "key-1").await.unwrap();

        // Byte-for-byte the same response; in particular the same code, so no
        // second reservation was created.
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first.body).unwrap(),
            serde_json::to_string(&second.body).unwrap()
        );
    }

    #[tokio::test]
    async fn reusing_a_key_with_a_different_payload_is_rejected() {
        let storage = MemoryStorage::shared();
        let create = handler(storage);

        create.execute(&request(), "key-1").await.unwrap();
        let mut altered = request();
        altered.total_cents = 99_900;

        let err = create.execute(&altered, "key-1").await.unwrap_err();
        assert!(matches!(err, HandlerError::IdempotencyConflict { .. }));
    }

    #[tokio::test]
    async fn missing_idempotency_key_is_rejected() {
        let storage = MemoryStorage::shared();
        let err = handler(storage).execute(&request(), "").await.unwrap_err();
        assert!(matches!(err, HandlerError::Validation(_)));
    }

    #[tokio::test]
    async fn zero_total_is_rejected() {
        let storage = MemoryStorage::shared();
        let mut bad = request();
        bad.total_cents = 0;
        let err = handler(storage).execute(&bad, "key-1").await.unwrap_err();
        assert!(matches!(err, HandlerError::Validation(_)));
    }
}
