use std::collections::{BTreeMap, BTreeSet};

use stratus_core::Protocol;

use crate::routing::IdentificationConfig;

/// Variant picked for services without an explicit provider choice.
pub const DEFAULT_VARIANT: &str = "default";

/// Gateway-level configuration.
///
/// Controls which services exist and how they activate, how requests are
/// identified and validated, and the bounds on activation, invocation and
/// shutdown.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Services allowed to activate. `None` enables every declared service.
    pub enabled_services: Option<BTreeSet<String>>,
    /// Activate every enabled service at startup instead of on first request.
    pub eager_activation: bool,
    /// Accept any well-formed region name, not only the known list.
    pub permissive_regions: bool,
    /// Provider variant per service; missing entries use [`DEFAULT_VARIANT`].
    pub provider_variants: BTreeMap<String, String>,
    /// Reject unknown request members instead of ignoring them.
    pub strict_validation: bool,
    /// Services whose unimplemented operations are served by the fallback.
    pub fallback_services: BTreeSet<String>,
    /// Service identification settings.
    pub identification: IdentificationConfig,
    /// Protocol used to render faults for requests whose service is unknown.
    pub default_protocol: Protocol,
    /// `Access-Control-Allow-Origin` value for CORS responses.
    pub cors_allow_origin: String,
    /// Base URL clients reach the gateway at, used in resource URLs.
    pub endpoint_url: String,
    /// Upper bound on waiting for a provider to become ready.
    pub activation_timeout_ms: u64,
    /// Upper bound on a single operation invocation.
    pub invocation_timeout_ms: u64,
    /// Upper bound on stopping all providers at shutdown.
    pub shutdown_timeout_ms: u64,
}

impl ServerConfig {
    /// Whether `service` may activate.
    #[must_use]
    pub fn is_enabled(&self, service: &str) -> bool {
        self.enabled_services
            .as_ref()
            .map_or(true, |enabled| enabled.contains(service))
    }

    /// Provider variant configured for `service`.
    #[must_use]
    pub fn variant(&self, service: &str) -> &str {
        self.provider_variants
            .get(service)
            .map_or(DEFAULT_VARIANT, String::as_str)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled_services: None,
            eager_activation: false,
            permissive_regions: false,
            provider_variants: BTreeMap::new(),
            strict_validation: false,
            fallback_services: BTreeSet::new(),
            identification: IdentificationConfig::default(),
            default_protocol: Protocol::Json,
            cors_allow_origin: "*".to_string(),
            endpoint_url: "http://localhost.stratus.cloud:4566".to_string(),
            activation_timeout_ms: 30_000,
            invocation_timeout_ms: 30_000,
            shutdown_timeout_ms: 10_000,
        }
    }
}
