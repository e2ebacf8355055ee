//! HTTP supplier gateway.
//!
//! Books against suppliers that expose a plain JSON-over-HTTP booking
//! endpoint: `POST {base}/book` with an `Idempotency-Key` header. Most of the
//! supplier fleet speaks some dialect of this; protocol oddballs get their
//! own [`SupplierGateway`] implementations registered alongside this one.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use surebook_core::{BookingOutcome, GatewayError, ReservationCode, SupplierGateway};

/// Gateway speaking the common JSON booking dialect.
#[derive(Clone, Debug)]
pub struct HttpSupplierGateway {
    client: Client,
    base_url: String,
}

impl HttpSupplierGateway {
    /// Create a gateway for the given supplier base URL.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Replace the HTTP client, e.g. to configure connect timeouts or TLS.
    #[must_use]
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    fn request_body(reservation_code: &ReservationCode, snapshot: Option<&Value>) -> Value {
        match snapshot {
            Some(snapshot) => json!({
                "reservation_code": reservation_code,
                "snapshot": snapshot,
            }),
            None => json!({ "reservation_code": reservation_code }),
        }
    }
}

#[async_trait]
impl SupplierGateway for HttpSupplierGateway {
    /// # Errors
    ///
    /// Transport-level failures surface as `GatewayError::Transport`; a 2xx
    /// response without a parseable confirmation code surfaces as
    /// `GatewayError::InvalidResponse`. A non-2xx response is a business
    /// outcome (`NON_2XX`), not an error: the supplier system answered.
    async fn book(
        &self,
        reservation_code: &ReservationCode,
        idem_key: &str,
        snapshot: Option<&Value>,
    ) -> Result<BookingOutcome, GatewayError> {
        let response = self
            .client
            .post(format!("{}/book", self.base_url))
            .header("Idempotency-Key", idem_key)
            .json(&Self::request_body(reservation_code, snapshot))
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                reservation_code = %reservation_code,
                status = status.as_u16(),
                "Supplier rejected booking"
            );
            return Ok(BookingOutcome::failed(
                "NON_2XX",
                body,
                Some(status.as_u16()),
            ));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
        let confirmation_code = payload
            .get("confirmation_code")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                GatewayError::InvalidResponse("response missing confirmation_code".to_owned())
            })?
            .to_owned();

        Ok(BookingOutcome::success(
            confirmation_code,
            Some(payload),
            Some(status.as_u16()),
        ))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn gateway_construction() {
        let gateway = HttpSupplierGateway::new("https://supplier.example.com/api");
        assert_eq!(gateway.base_url, "https://supplier.example.com/api");
    }

    #[test]
    fn request_body_omits_absent_snapshot() {
        let code = ReservationCode::new("R1AAAA22");

        let bare = HttpSupplierGateway::request_body(&code, None);
        assert_eq!(bare.get("reservation_code").unwrap(), "R1AAAA22");
        assert!(bare.get("snapshot").is_none());

        let snapshot = json!({ "total_cents": 12500 });
        let full = HttpSupplierGateway::request_body(&code, Some(&snapshot));
        assert_eq!(full.get("snapshot").unwrap(), &snapshot);
    }
}
