//! `stratus`: local multi-protocol cloud API gateway.
//!
//! Every flag has a `STRATUS_*` environment fallback. Log filtering follows
//! `RUST_LOG` (default `info`).

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, ValueEnum};
use stratus_server::gateway::Gateway;
use stratus_server::network::{NetworkConfig, NetworkModule, TlsConfig};
use stratus_server::routing::{IdentificationConfig, Signal};
use stratus_server::service::{Fallback, ServerConfig};
use stratus_server::services::{builtin_catalog, builtin_providers, ConventionalFallback};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "stratus", version, about = "Local multi-protocol cloud API gateway")]
struct Cli {
    /// Address to bind.
    #[arg(long, env = "STRATUS_HOST", default_value = "127.0.0.1")]
    host: String,
    /// Port to listen on; 0 picks a free one.
    #[arg(long, env = "STRATUS_PORT", default_value_t = 4566)]
    port: u16,
    /// PEM certificate; enables HTTPS together with `--tls-key`.
    #[arg(long, env = "STRATUS_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,
    /// PEM private key.
    #[arg(long, env = "STRATUS_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,
    /// URL clients use to reach the gateway. Defaults to the bound port
    /// under `localhost.stratus.cloud`.
    #[arg(long, env = "STRATUS_ENDPOINT_URL")]
    endpoint_url: Option<String>,
    /// Services allowed to activate; all declared services when omitted.
    #[arg(long, env = "STRATUS_SERVICES", value_delimiter = ',')]
    services: Option<Vec<String>>,
    /// Services whose unimplemented operations use the conventional fallback.
    #[arg(long, env = "STRATUS_FALLBACK_SERVICES", value_delimiter = ',', default_value = "dynamodb")]
    fallback_services: Vec<String>,
    /// Provider variants as `service=variant`.
    #[arg(long = "provider", env = "STRATUS_PROVIDERS", value_delimiter = ',', value_parser = parse_variant)]
    providers: Vec<(String, String)>,
    /// Activate every enabled service at startup.
    #[arg(long, env = "STRATUS_EAGER")]
    eager: bool,
    /// Accept any well-formed region name.
    #[arg(long, env = "STRATUS_PERMISSIVE_REGIONS")]
    permissive_regions: bool,
    /// Reject unknown request members.
    #[arg(long, env = "STRATUS_STRICT_VALIDATION")]
    strict_validation: bool,
    /// Service identification signals, highest priority first.
    #[arg(long, env = "STRATUS_IDENTIFICATION_ORDER", value_delimiter = ',')]
    identification_order: Option<Vec<Signal>>,
    /// Region for requests that carry none.
    #[arg(long, env = "STRATUS_DEFAULT_REGION", default_value = "us-east-1")]
    default_region: String,
    /// Account for access keys that are not account ids.
    #[arg(long, env = "STRATUS_DEFAULT_ACCOUNT", default_value = "000000000000")]
    default_account: String,
    /// Per-request HTTP timeout in seconds.
    #[arg(long, env = "STRATUS_REQUEST_TIMEOUT_SECS", default_value_t = 60)]
    request_timeout_secs: u64,
    /// Largest accepted request body in bytes.
    #[arg(long, env = "STRATUS_MAX_BODY_BYTES", default_value_t = 64 * 1024 * 1024)]
    max_body_bytes: usize,
    #[arg(long, env = "STRATUS_LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,
}

fn parse_variant(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((service, variant)) if !service.is_empty() && !variant.is_empty() => {
            Ok((service.to_string(), variant.to_string()))
        }
        _ => Err(format!("expected service=variant, got {raw:?}")),
    }
}

impl Cli {
    fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            host: self.host.clone(),
            port: self.port,
            tls: self.tls_cert.clone().zip(self.tls_key.clone()).map(|(cert_path, key_path)| TlsConfig {
                cert_path,
                key_path,
            }),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            max_body_bytes: self.max_body_bytes,
            ..NetworkConfig::default()
        }
    }

    fn server_config(&self, port: u16) -> ServerConfig {
        let scheme = if self.tls_cert.is_some() { "https" } else { "http" };
        let defaults = IdentificationConfig::default();
        ServerConfig {
            enabled_services: self.services.clone().map(BTreeSet::from_iter),
            eager_activation: self.eager,
            permissive_regions: self.permissive_regions,
            provider_variants: self.providers.iter().cloned().collect::<BTreeMap<_, _>>(),
            strict_validation: self.strict_validation,
            fallback_services: self.fallback_services.iter().cloned().collect(),
            identification: IdentificationConfig {
                order: self.identification_order.clone().unwrap_or(defaults.order),
                default_region: self.default_region.clone(),
                default_account: self.default_account.clone(),
                ..defaults
            },
            endpoint_url: self
                .endpoint_url
                .clone()
                .unwrap_or_else(|| format!("{scheme}://localhost.stratus.cloud:{port}")),
            ..ServerConfig::default()
        }
    }
}

fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).try_init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer().with_target(true)).try_init(),
    }
    .context("failed to initialise tracing subscriber")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format)?;

    let mut network = NetworkModule::new(cli.network_config());
    let port = network.start().await?;

    let config = cli.server_config(port);
    let eager = config.eager_activation;
    let fallback = Arc::new(ConventionalFallback::new(&config));
    let providers = builtin_providers(&fallback);
    let fallback: Arc<dyn Fallback> = fallback;
    let catalog = builtin_catalog().context("bundled service models are invalid")?;
    let gateway = Arc::new(Gateway::new(Arc::new(catalog), &providers, config, Some(fallback))?);

    if eager {
        for (service, error) in gateway.registry().start_eager().await {
            tracing::error!(service = %service, error = %error, "eager activation failed");
        }
    }

    tracing::info!(port, endpoint = %gateway.config().endpoint_url, "stratus ready");

    network
        .serve(gateway, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutdown requested");
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_map_onto_configs() {
        let cli = Cli::try_parse_from(["stratus"]).unwrap();
        let config = cli.server_config(4566);
        assert_eq!(config.endpoint_url, "http://localhost.stratus.cloud:4566");
        assert!(config.fallback_services.contains("dynamodb"));
        assert!(config.enabled_services.is_none());
        assert_eq!(config.identification.order, Signal::DEFAULT_ORDER.to_vec());
        assert!(cli.network_config().tls.is_none());
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "stratus",
            "--services",
            "sqs,dynamodb",
            "--provider",
            "sqs=legacy",
            "--identification-order",
            "credential-scope,path-heuristics",
            "--endpoint-url",
            "http://gateway:9000",
        ])
        .unwrap();
        let config = cli.server_config(0);
        assert_eq!(config.enabled_services.unwrap().len(), 2);
        assert_eq!(config.provider_variants["sqs"], "legacy");
        assert_eq!(config.identification.order, vec![Signal::CredentialScope, Signal::PathHeuristics]);
        assert_eq!(config.endpoint_url, "http://gateway:9000");
    }

    #[test]
    fn malformed_variant_is_rejected() {
        assert!(Cli::try_parse_from(["stratus", "--provider", "sqs"]).is_err());
        assert!(parse_variant("sqs=").is_err());
    }
}
