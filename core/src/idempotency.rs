//! Client-facing idempotency records.
//!
//! Every mutating command carries a client-supplied idempotency key. The
//! first successful execution saves its response here, inside the same
//! transaction as the work itself; replays of the same (scope, key) return
//! the cached response verbatim. A replay whose request fingerprint differs
//! is a client error (key reuse) and is rejected before any state change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::reservation::ReservationCode;

/// Fingerprint of a normalized request body.
///
/// SHA-256 over the canonical JSON serialization (object keys sorted,
/// which `serde_json`'s default map representation guarantees), hex-encoded.
/// Two requests fingerprint equal iff they are semantically the same JSON.
#[must_use]
pub fn request_fingerprint(request: &serde_json::Value) -> String {
    // Serializing a Value cannot fail.
    let canonical = serde_json::to_string(request).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// A cached command response, unique per (scope, `client_key`).
///
/// Created on first successful execution, never mutated afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Command scope the key applies to (e.g. `"RESERVATION_PAY"`).
    pub scope: String,
    /// Client-supplied idempotency key.
    pub client_key: String,
    /// Fingerprint of the request that produced the cached response.
    pub request_fingerprint: String,
    /// The response body to replay, byte-for-byte.
    pub cached_response: serde_json::Value,
    /// The response status to replay (HTTP numeral, opaque to the engine).
    pub cached_status: u16,
    /// The reservation this command touched, for triage.
    pub reference_id: Option<ReservationCode>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Builds a record for a freshly executed command.
    #[must_use]
    pub fn new(
        scope: impl Into<String>,
        client_key: impl Into<String>,
        request_fingerprint: String,
        cached_response: serde_json::Value,
        cached_status: u16,
        reference_id: Option<ReservationCode>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            scope: scope.into(),
            client_key: client_key.into(),
            request_fingerprint,
            cached_response,
            cached_status,
            reference_id,
            created_at: now,
        }
    }

    /// Whether a replayed request matches the one that was cached.
    #[must_use]
    pub fn matches_fingerprint(&self, fingerprint: &str) -> bool {
        self.request_fingerprint == fingerprint
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fingerprint_ignores_key_order() {
        let a: serde_json::Value =
            serde_json::from_str(r#"{"car": "compact", "days": 3, "extras": ["gps"]}"#).unwrap();
        let b: serde_json::Value =
            serde_json::from_str(r#"{"extras": ["gps"], "days": 3, "car": "compact"}"#).unwrap();
        assert_eq!(request_fingerprint(&a), request_fingerprint(&b));
    }

    #[test]
    fn fingerprint_distinguishes_different_payloads() {
        let a = serde_json::json!({"days": 3});
        let b = serde_json::json!({"days": 4});
        assert_ne!(request_fingerprint(&a), request_fingerprint(&b));
    }

    #[test]
    fn fingerprint_keeps_array_order_significant() {
        let a = serde_json::json!({"drivers": ["ana", "bruno"]});
        let b = serde_json::json!({"drivers": ["bruno", "ana"]});
        assert_ne!(request_fingerprint(&a), request_fingerprint(&b));
    }

    proptest! {
        #[test]
        fn fingerprint_is_deterministic_hex(days in 0u32..10_000, name in "[a-z]{0,12}") {
            let value = serde_json::json!({"days": days, "name": name});
            let first = request_fingerprint(&value);
            let second = request_fingerprint(&value);
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(first.len(), 64);
            prop_assert!(first.bytes().all(|b| b.is_ascii_hexdigit()));
        }
    }
}
