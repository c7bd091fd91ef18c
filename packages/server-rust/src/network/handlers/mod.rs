//! Axum handlers and the state they share.
//!
//! Internal endpoints live under `/_stratus`; every other path is handed to
//! the gateway.

pub mod gateway;
pub mod health;
pub mod state;

pub use gateway::gateway_handler;
pub use health::{health_handler, liveness_handler, readiness_handler};
pub use state::reset_handler;

use std::sync::Arc;
use std::time::Instant;

use super::{NetworkConfig, ShutdownController};
use crate::gateway::Gateway;

/// Shared state behind every handler. Cloning copies `Arc`s only.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub shutdown: Arc<ShutdownController>,
    pub config: Arc<NetworkConfig>,
    /// Process start, for uptime.
    pub start_time: Instant,
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::service::{Fallback, ServerConfig};
    use crate::services::{builtin_catalog, builtin_providers, ConventionalFallback};

    pub(crate) const SQS_AUTH: &str = "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20240101/us-east-1/sqs/aws4_request, \
                                       SignedHeaders=host, Signature=0000";

    /// Bundled services, with dynamodb served by the conventional fallback.
    pub(crate) fn app_state() -> AppState {
        let config = ServerConfig {
            fallback_services: BTreeSet::from(["dynamodb".to_string()]),
            ..ServerConfig::default()
        };
        let fallback = Arc::new(ConventionalFallback::new(&config));
        let providers = builtin_providers(&fallback);
        let fallback: Arc<dyn Fallback> = fallback;
        let gateway = Gateway::new(Arc::new(builtin_catalog().unwrap()), &providers, config, Some(fallback)).unwrap();
        AppState {
            gateway: Arc::new(gateway),
            shutdown: Arc::new(ShutdownController::new()),
            config: Arc::new(NetworkConfig::default()),
            start_time: Instant::now(),
        }
    }
}
