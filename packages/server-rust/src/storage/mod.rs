//! Multi-tenant state storage for service providers.
//!
//! - [`tenant`]: account/region identifier grammar ([`TenantValidator`])
//! - [`attribute`]: scoped attribute declarations ([`Attribute`], [`AttributeScope`])
//! - [`store`]: the per-service arena ([`AccountRegionStore`]) and its
//!   per-tenant view ([`TenantState`])

pub mod attribute;
pub mod store;
pub mod tenant;

pub use attribute::{Attribute, AttributeScope, AttributeSlots};
pub use store::{AccountRegionStore, TenantState};
pub use tenant::{IdentifierKind, StoreError, TenantValidator, KNOWN_REGIONS};
