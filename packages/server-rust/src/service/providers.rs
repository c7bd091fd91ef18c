//! Static provider declarations: `(service, variant) -> factory`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::traits::ProviderFactory;

/// Every provider the binary knows about, declared at startup.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    factories: BTreeMap<String, BTreeMap<String, Arc<dyn ProviderFactory>>>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares `variant` of `service`. A repeated declaration replaces the
    /// earlier one.
    pub fn register(
        &mut self,
        service: impl Into<String>,
        variant: impl Into<String>,
        factory: impl ProviderFactory + 'static,
    ) -> &mut Self {
        self.factories
            .entry(service.into())
            .or_default()
            .insert(variant.into(), Arc::new(factory));
        self
    }

    /// Factory of `variant` of `service`.
    #[must_use]
    pub fn resolve(&self, service: &str, variant: &str) -> Option<Arc<dyn ProviderFactory>> {
        self.factories.get(service)?.get(variant).cloned()
    }

    /// Declared service names in order.
    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Declared variants of `service`.
    #[must_use]
    pub fn variants(&self, service: &str) -> Vec<&str> {
        self.factories
            .get(service)
            .map(|v| v.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.factories.iter().map(|(s, v)| (s, v.keys().collect::<Vec<_>>())))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::dispatch::DispatchTable;
    use crate::traits::{ServiceContext, ServiceProvider};

    struct Nothing;

    impl ServiceProvider for Nothing {
        fn dispatch_table(self: Arc<Self>) -> DispatchTable {
            DispatchTable::builder("nothing").build()
        }
    }

    fn factory(_ctx: &ServiceContext) -> anyhow::Result<Arc<dyn ServiceProvider>> {
        Ok(Arc::new(Nothing))
    }

    #[test]
    fn resolves_declared_variants() {
        let mut providers = ProviderRegistry::new();
        providers
            .register("sqs", "default", factory)
            .register("sqs", "legacy", factory)
            .register("dynamodb", "default", factory);

        assert!(providers.resolve("sqs", "legacy").is_some());
        assert!(providers.resolve("sqs", "v3").is_none());
        assert!(providers.resolve("s3", "default").is_none());
        assert_eq!(providers.services().collect::<Vec<_>>(), vec!["dynamodb", "sqs"]);
        assert_eq!(providers.variants("sqs"), vec!["default", "legacy"]);
    }
}
