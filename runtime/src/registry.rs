//! Routing from a reservation's supplier and country to a gateway.
//!
//! Dispatch tries the exact `(supplier_id, country)` route first, then the
//! supplier's `"*"` wildcard, then the registry-wide default. Country codes
//! are matched case-insensitively.

use std::collections::HashMap;
use std::sync::Arc;

use surebook_core::SupplierGateway;

/// Country wildcard accepted by [`SupplierRegistry::register`].
pub const ANY_COUNTRY: &str = "*";

/// Maps `(supplier_id, country)` to a booking gateway.
#[derive(Default)]
pub struct SupplierRegistry {
    routes: HashMap<(String, String), Arc<dyn SupplierGateway>>,
    fallback: Option<Arc<dyn SupplierGateway>>,
}

impl SupplierRegistry {
    /// An empty registry with no routes and no default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route a supplier/country pair to `gateway`.
    ///
    /// Use [`ANY_COUNTRY`] as the country to catch every country for the
    /// supplier that has no more specific route.
    #[must_use]
    pub fn register(
        mut self,
        supplier_id: impl Into<String>,
        country: impl Into<String>,
        gateway: Arc<dyn SupplierGateway>,
    ) -> Self {
        let key = (supplier_id.into(), country.into().to_uppercase());
        self.routes.insert(key, gateway);
        self
    }

    /// Gateway used when no route matches at all.
    #[must_use]
    pub fn with_default(mut self, gateway: Arc<dyn SupplierGateway>) -> Self {
        self.fallback = Some(gateway);
        self
    }

    /// Resolve the gateway for a reservation's supplier and country.
    #[must_use]
    pub fn resolve(&self, supplier_id: &str, country: &str) -> Option<Arc<dyn SupplierGateway>> {
        let exact = (supplier_id.to_owned(), country.to_uppercase());
        if let Some(gateway) = self.routes.get(&exact) {
            return Some(Arc::clone(gateway));
        }
        let wildcard = (supplier_id.to_owned(), ANY_COUNTRY.to_owned());
        if let Some(gateway) = self.routes.get(&wildcard) {
            return Some(Arc::clone(gateway));
        }
        self.fallback.as_ref().map(Arc::clone)
    }
}

impl std::fmt::Debug for SupplierRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupplierRegistry")
            .field("routes", &self.routes.keys().collect::<Vec<_>>())
            .field("has_default", &self.fallback.is_some())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use surebook_testing::MockSupplierGateway;

    #[test]
    fn exact_route_beats_wildcard_and_default() {
        let exact: Arc<dyn SupplierGateway> = MockSupplierGateway::shared();
        let registry = SupplierRegistry::new()
            .register("hertz", "FR", Arc::clone(&exact))
            .register("hertz", ANY_COUNTRY, MockSupplierGateway::shared())
            .with_default(MockSupplierGateway::shared());

        let resolved = registry.resolve("hertz", "FR").unwrap();

        assert!(Arc::ptr_eq(&resolved, &exact));
    }

    #[test]
    fn wildcard_catches_unrouted_countries() {
        let wildcard: Arc<dyn SupplierGateway> = MockSupplierGateway::shared();
        let registry = SupplierRegistry::new()
            .register("hertz", "FR", MockSupplierGateway::shared())
            .register("hertz", ANY_COUNTRY, Arc::clone(&wildcard));

        let resolved = registry.resolve("hertz", "JP").unwrap();

        assert!(Arc::ptr_eq(&resolved, &wildcard));
    }

    #[test]
    fn default_catches_unknown_suppliers() {
        let fallback: Arc<dyn SupplierGateway> = MockSupplierGateway::shared();
        let registry = SupplierRegistry::new().with_default(Arc::clone(&fallback));

        assert!(registry.resolve("unknown", "US").is_some());
    }

    #[test]
    fn no_route_resolves_to_none() {
        let registry = SupplierRegistry::new().register("hertz", "FR", MockSupplierGateway::shared());

        assert!(registry.resolve("avis", "FR").is_none());
    }

    #[test]
    fn country_lookup_is_case_insensitive() {
        let registry = SupplierRegistry::new().register("hertz", "fr", MockSupplierGateway::shared());

        assert!(registry.resolve("hertz", "Fr").is_some());
        assert!(registry.resolve("hertz", "FR").is_some());
    }
}
