//! Bundled service models and provider declarations.
//!
//! - `sqs`: native provider
//! - `dynamodb`: no native operations; served entirely by
//!   [`ConventionalFallback`] when listed as a fallback service

use std::sync::Arc;

use async_trait::async_trait;
use stratus_core::{CatalogError, StaticCatalog};

pub mod fallback;
pub mod sqs;

pub use fallback::{ConventionalFallback, Verb};
pub use sqs::SqsProvider;

use crate::service::dispatch::DispatchTable;
use crate::service::{ProviderRegistry, DEFAULT_VARIANT};
use crate::traits::{ServiceContext, ServiceProvider};

/// `(service name, model document)` pairs shipped with the binary.
pub const BUNDLED_MODELS: [(&str, &str); 2] = [
    ("dynamodb", include_str!("../../models/dynamodb.json")),
    ("sqs", include_str!("../../models/sqs.json")),
];

/// Catalog of the bundled models.
///
/// # Errors
///
/// Fails only if a bundled document is malformed.
pub fn builtin_catalog() -> Result<StaticCatalog, CatalogError> {
    StaticCatalog::from_documents(BUNDLED_MODELS)
}

/// Provider declarations for the bundled services.
#[must_use]
pub fn builtin_providers(fallback: &Arc<ConventionalFallback>) -> ProviderRegistry {
    let mut providers = ProviderRegistry::new();
    providers.register("sqs", DEFAULT_VARIANT, sqs::factory);

    let fallback = Arc::clone(fallback);
    providers.register(
        "dynamodb",
        DEFAULT_VARIANT,
        move |ctx: &ServiceContext| -> anyhow::Result<Arc<dyn ServiceProvider>> {
            Ok(Arc::new(FallbackOnly {
                service: ctx.service.name.clone(),
                fallback: Arc::clone(&fallback),
            }))
        },
    );
    providers
}

/// Provider with no bindings of its own.
struct FallbackOnly {
    service: String,
    fallback: Arc<ConventionalFallback>,
}

#[async_trait]
impl ServiceProvider for FallbackOnly {
    fn dispatch_table(self: Arc<Self>) -> DispatchTable {
        DispatchTable::builder(self.service.clone()).build()
    }

    async fn reset_state(&self) -> anyhow::Result<()> {
        self.fallback.reset(&self.service);
        Ok(())
    }
}
