use std::sync::Arc;

use async_trait::async_trait;
use stratus_core::ServiceModel;

use crate::service::config::ServerConfig;
use crate::service::dispatch::DispatchTable;
use crate::storage::{AccountRegionStore, TenantValidator};

/// Context handed to a factory when its provider is created.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    /// Model of the service being activated.
    pub service: Arc<ServiceModel>,
    pub config: Arc<ServerConfig>,
}

impl ServiceContext {
    /// A fresh tenant store for this service, validating identifiers the way
    /// the configuration asks.
    #[must_use]
    pub fn new_store(&self) -> AccountRegionStore {
        AccountRegionStore::new(
            self.service.name.clone(),
            TenantValidator::new(self.config.permissive_regions),
        )
    }
}

/// Implementation of one emulated service.
///
/// Providers expose their operations through an explicit dispatch table and
/// may hook into the activation and shutdown lifecycle.
#[async_trait]
pub trait ServiceProvider: Send + Sync {
    /// Binds the operations this provider implements.
    fn dispatch_table(self: Arc<Self>) -> DispatchTable;

    /// Runs before the service is marked running.
    async fn on_before_start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Fails when the provider cannot serve requests yet.
    async fn check_ready(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs when the gateway stops the service.
    async fn on_before_stop(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Drops all emulated state.
    async fn reset_state(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Creates providers on activation.
#[async_trait]
pub trait ProviderFactory: Send + Sync {
    /// # Errors
    ///
    /// Any failure marks the service as errored.
    async fn create(&self, ctx: &ServiceContext) -> anyhow::Result<Arc<dyn ServiceProvider>>;
}

#[async_trait]
impl<F> ProviderFactory for F
where
    F: Fn(&ServiceContext) -> anyhow::Result<Arc<dyn ServiceProvider>> + Send + Sync,
{
    async fn create(&self, ctx: &ServiceContext) -> anyhow::Result<Arc<dyn ServiceProvider>> {
        self(ctx)
    }
}
