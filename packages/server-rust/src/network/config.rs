//! Listener configuration.

use std::path::PathBuf;
use std::time::Duration;

/// HTTP listener settings.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Bind address.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    /// Serve HTTPS instead of plain HTTP.
    pub tls: Option<TlsConfig>,
    /// Upper bound on one HTTP exchange, answered with 408 when exceeded.
    pub request_timeout: Duration,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
    /// How long to wait for in-flight requests after the listener stops.
    pub drain_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4566,
            tls: None,
            request_timeout: Duration::from_secs(60),
            max_body_bytes: 64 * 1024 * 1024,
            drain_timeout: Duration::from_secs(15),
        }
    }
}

/// PEM certificate and key for HTTPS.
///
/// No `Default`: there is no sensible default location for key material.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_listen_locally_on_the_gateway_port() {
        let config = NetworkConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 4566);
        assert!(config.tls.is_none());
        assert_eq!(config.max_body_bytes, 64 * 1024 * 1024);
    }
}
