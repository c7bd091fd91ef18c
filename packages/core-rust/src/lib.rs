//! `Stratus` Core: service models, shapes, parameter values, and service errors.

pub mod catalog;
pub mod context;
pub mod error;
pub mod model;
pub mod shape;
pub mod types;

pub use catalog::{Catalog, StaticCatalog};
pub use context::TenantContext;
pub use error::ServiceError;
pub use model::{CatalogError, HttpBinding, OperationModel, Protocol, ServiceMetadata, ServiceModel};
pub use shape::{ErrorTrait, Location, Member, Shape, ShapeKind, TimestampFormat};
pub use types::{Params, Value};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
