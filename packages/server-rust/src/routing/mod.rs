//! Request identification: which service, which operation, which tenant.
//!
//! - [`service`]: ordered service-identification signals and tenant extraction
//! - [`operation`]: per-protocol operation resolution
//! - [`template`]: REST request URI templates and their ranking
//!
//! Identification only reads the request and the catalog; it never touches
//! tenant state.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use stratus_core::Catalog;

pub mod operation;
pub mod service;
pub mod template;

pub use operation::{ResolvedOperation, RestRoute};
pub use service::{CredentialScope, Identified, Tenant};
pub use template::{TemplateError, UriTemplate};

/// Name of the header carrying internal cross-call data.
pub const INTERNAL_DATA_HEADER: &str = "x-stratus-data";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// The request could not be attributed to a service or operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentificationError {
    #[error("unable to determine the target service of {method} {path}")]
    UnknownService { method: String, path: String },
    #[error("operation {operation} is not defined by service {service}")]
    UnknownOperation { service: String, operation: String },
    #[error("request to {service} does not name an operation ({detail})")]
    MissingOperation { service: String, detail: &'static str },
    #[error("request to {service} is ambiguous between operations {candidates:?}")]
    Ambiguous { service: String, candidates: Vec<String> },
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// Evidence used to identify the target service, in configurable priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// The internal data header naming a service.
    InternalMarker,
    /// `<service>[.<region>].<base-domain>` host names.
    VirtualHost,
    /// Signing name in the SigV4 credential scope.
    CredentialScope,
    /// `X-Amz-Target` prefix.
    TargetHeader,
    /// RPC v2 paths, REST templates and query `Action`s.
    PathHeuristics,
}

impl Signal {
    /// Default priority order.
    pub const DEFAULT_ORDER: [Signal; 5] = [
        Signal::InternalMarker,
        Signal::VirtualHost,
        Signal::CredentialScope,
        Signal::TargetHeader,
        Signal::PathHeuristics,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InternalMarker => "internal-marker",
            Self::VirtualHost => "virtual-host",
            Self::CredentialScope => "credential-scope",
            Self::TargetHeader => "target-header",
            Self::PathHeuristics => "path-heuristics",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown signal name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown identification signal {0:?}")]
pub struct UnknownSignal(pub String);

impl FromStr for Signal {
    type Err = UnknownSignal;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::DEFAULT_ORDER
            .into_iter()
            .find(|signal| signal.as_str() == s)
            .ok_or_else(|| UnknownSignal(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Settings that steer identification.
#[derive(Debug, Clone)]
pub struct IdentificationConfig {
    /// Signals in the order they are consulted.
    pub order: Vec<Signal>,
    /// Domains under which `<service>.<domain>` virtual hosts are recognized.
    pub base_domains: Vec<String>,
    /// Region used when the request carries none.
    pub default_region: String,
    /// Account used when the access key is not an account id.
    pub default_account: String,
}

impl Default for IdentificationConfig {
    fn default() -> Self {
        Self {
            order: Signal::DEFAULT_ORDER.to_vec(),
            base_domains: vec!["localhost.stratus.cloud".to_string(), "localhost".to_string()],
            default_region: "us-east-1".to_string(),
            default_account: "000000000000".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// RequestRouter
// ---------------------------------------------------------------------------

/// Identifies service, operation and tenant of incoming requests.
///
/// Built once from the catalog; REST templates of every REST service are
/// compiled up front.
pub struct RequestRouter {
    catalog: Arc<dyn Catalog>,
    config: IdentificationConfig,
    routes: BTreeMap<String, Vec<RestRoute>>,
}

impl RequestRouter {
    /// Builds a router over the catalog. Templates that fail to parse are
    /// logged and skipped.
    #[must_use]
    pub fn new(catalog: Arc<dyn Catalog>, mut config: IdentificationConfig) -> Self {
        // Longer base domains first so `a.localhost.stratus.cloud` is never
        // read as a label of `localhost`.
        config.base_domains.sort_by_key(|d| std::cmp::Reverse(d.len()));
        let routes = operation::compile_routes(catalog.as_ref());
        Self { catalog, config, routes }
    }

    /// The catalog this router reads.
    #[must_use]
    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &IdentificationConfig {
        &self.config
    }
}

impl fmt::Debug for RequestRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestRouter")
            .field("services", &self.catalog.services().len())
            .field("config", &self.config)
            .field("rest_services", &self.routes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_names_round_trip() {
        for signal in Signal::DEFAULT_ORDER {
            assert_eq!(signal.as_str().parse::<Signal>().unwrap(), signal);
        }
        assert!("dns".parse::<Signal>().is_err());
    }
}
