//! Operation model catalog: the read-only registry of service models.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::model::{CatalogError, ServiceModel};

/// Read-only lookup of service models.
///
/// Implementations are built once at startup and shared behind `Arc`; the
/// gateway never mutates them.
pub trait Catalog: Send + Sync {
    /// Returns the model of the named service.
    fn service(&self, name: &str) -> Option<Arc<ServiceModel>>;

    /// Returns every service model, ordered by service name.
    fn services(&self) -> Vec<Arc<ServiceModel>>;

    /// Returns the services whose signing name matches.
    fn services_by_signing_name(&self, signing_name: &str) -> Vec<Arc<ServiceModel>> {
        self.services()
            .into_iter()
            .filter(|s| s.metadata.signing_name == signing_name)
            .collect()
    }

    /// Returns the service whose `targetPrefix` matches.
    fn service_by_target_prefix(&self, prefix: &str) -> Option<Arc<ServiceModel>> {
        self.services()
            .into_iter()
            .find(|s| s.metadata.target_prefix.as_deref() == Some(prefix))
    }

    /// Returns the services whose endpoint prefix matches (virtual-host addressing).
    fn services_by_endpoint_prefix(&self, prefix: &str) -> Vec<Arc<ServiceModel>> {
        self.services()
            .into_iter()
            .filter(|s| s.metadata.endpoint_prefix == prefix || s.name == prefix)
            .collect()
    }
}

/// In-memory catalog assembled from model documents.
#[derive(Debug, Default, Clone)]
pub struct StaticCatalog {
    services: BTreeMap<String, Arc<ServiceModel>>,
}

impl StaticCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads `(service name, JSON document)` pairs.
    ///
    /// # Errors
    ///
    /// Returns the first document that fails to load, or
    /// [`CatalogError::DuplicateService`] when a name repeats.
    pub fn from_documents<'a>(
        documents: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self, CatalogError> {
        let mut catalog = Self::new();
        for (name, document) in documents {
            catalog.insert(ServiceModel::from_json(name, document)?)?;
        }
        Ok(catalog)
    }

    /// Adds a model.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::DuplicateService`] if the name is taken.
    pub fn insert(&mut self, model: ServiceModel) -> Result<(), CatalogError> {
        if self.services.contains_key(&model.name) {
            return Err(CatalogError::DuplicateService(model.name));
        }
        tracing::debug!(
            service = %model.name,
            protocol = %model.protocol,
            operations = model.operations.len(),
            "loaded service model"
        );
        self.services.insert(model.name.clone(), Arc::new(model));
        Ok(())
    }

    /// Number of loaded services.
    #[must_use]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl Catalog for StaticCatalog {
    fn service(&self, name: &str) -> Option<Arc<ServiceModel>> {
        self.services.get(name).cloned()
    }

    fn services(&self) -> Vec<Arc<ServiceModel>> {
        self.services.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(name: &str, signing: &str, target: Option<&str>) -> ServiceModel {
        let mut metadata = serde_json::json!({
            "protocol": "json",
            "apiVersion": "2020-01-01",
            "endpointPrefix": name,
            "signingName": signing,
        });
        if let Some(t) = target {
            metadata["targetPrefix"] = serde_json::json!(t);
        }
        ServiceModel::from_value(
            name,
            serde_json::json!({"metadata": metadata, "operations": {}, "shapes": {}}),
        )
        .unwrap()
    }

    #[test]
    fn lookups_by_signing_name_and_target_prefix() {
        let mut catalog = StaticCatalog::new();
        catalog.insert(model("a", "shared", Some("A_1"))).unwrap();
        catalog.insert(model("b", "shared", Some("B_1"))).unwrap();
        catalog.insert(model("c", "c", None)).unwrap();

        assert_eq!(catalog.services_by_signing_name("shared").len(), 2);
        assert_eq!(catalog.service_by_target_prefix("B_1").unwrap().name, "b");
        assert!(catalog.service_by_target_prefix("Z_1").is_none());
        assert_eq!(catalog.services_by_endpoint_prefix("c").len(), 1);
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut catalog = StaticCatalog::new();
        catalog.insert(model("a", "a", None)).unwrap();
        let err = catalog.insert(model("a", "a", None)).unwrap_err();
        assert!(matches!(err, CatalogError::DuplicateService(n) if n == "a"));
    }
}
