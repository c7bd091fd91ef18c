//! Service registry and lazy activator.
//!
//! Each declared service has one record whose activation state lives in a
//! `watch` channel. The first request for an `Available` service claims it,
//! spawns the activation as a detached task and, like every concurrent
//! caller, waits on the channel for the outcome. Dropping a waiting caller
//! never cancels the activation.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use stratus_core::{Catalog, ServiceModel};
use tokio::sync::watch;

use super::config::ServerConfig;
use super::dispatch::{DispatchTable, Fallback};
use super::operation::GatewayError;
use super::providers::ProviderRegistry;
use crate::traits::{ProviderFactory, ServiceContext, ServiceProvider};

// ---------------------------------------------------------------------------
// States and errors
// ---------------------------------------------------------------------------

/// Activation state of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Available,
    Starting,
    Running,
    Disabled,
    Error,
    Stopping,
    Stopped,
}

impl ServiceState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Disabled => "disabled",
            Self::Error => "error",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A service cannot serve requests.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActivationError {
    #[error("no provider is declared for service {0}")]
    Unknown(String),
    #[error("service {0} is disabled")]
    Disabled(String),
    #[error("service {service} failed to start: {message}")]
    Failed { service: String, message: String },
    #[error("service {0} has been stopped")]
    Stopped(String),
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A running provider and its frozen dispatch table.
pub struct ActiveService {
    pub provider: Arc<dyn ServiceProvider>,
    pub dispatch: Arc<DispatchTable>,
}

impl fmt::Debug for ActiveService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveService")
            .field("dispatch", &self.dispatch)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
enum Phase {
    Available,
    Starting,
    Running(Arc<ActiveService>),
    Disabled,
    Error(String),
    Stopping,
    Stopped,
}

impl Phase {
    fn state(&self) -> ServiceState {
        match self {
            Self::Available => ServiceState::Available,
            Self::Starting => ServiceState::Starting,
            Self::Running(_) => ServiceState::Running,
            Self::Disabled => ServiceState::Disabled,
            Self::Error(_) => ServiceState::Error,
            Self::Stopping => ServiceState::Stopping,
            Self::Stopped => ServiceState::Stopped,
        }
    }
}

struct Record {
    service: Arc<ServiceModel>,
    provider: String,
    factory: Arc<dyn ProviderFactory>,
    fallback: RwLock<Option<Arc<dyn Fallback>>>,
    phase: watch::Sender<Phase>,
}

/// Snapshot of one record, as reported by the health endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub service: String,
    pub provider: String,
    pub state: ServiceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of [`ServiceRegistry::shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub stopped: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub timed_out: Vec<String>,
}

// ---------------------------------------------------------------------------
// ServiceRegistry
// ---------------------------------------------------------------------------

/// Activation order, handed to [`ServiceRegistry::shutdown`] exactly once.
/// `None` once shutdown has collected it.
type ActivationLog = Arc<Mutex<Option<Vec<String>>>>;

/// Lifecycle owner of every declared service.
///
/// Records are created once from the static declarations; only the activator
/// mutates their state. Services are stopped in reverse activation order.
pub struct ServiceRegistry {
    records: BTreeMap<String, Arc<Record>>,
    config: Arc<ServerConfig>,
    activated: ActivationLog,
    closing: AtomicBool,
}

impl ServiceRegistry {
    /// Creates one record per declared service, picking the configured
    /// variant. Services outside the enabled set start `Disabled`; services
    /// listed as fallback services get `fallback` attached on activation.
    ///
    /// # Errors
    ///
    /// Fails when a declared service has no catalog model or the configured
    /// variant is not declared.
    pub fn new(
        providers: &ProviderRegistry,
        catalog: &dyn Catalog,
        config: Arc<ServerConfig>,
        fallback: Option<Arc<dyn Fallback>>,
    ) -> anyhow::Result<Self> {
        let mut records = BTreeMap::new();
        for name in providers.services() {
            let service = catalog
                .service(name)
                .with_context(|| format!("provider declared for {name}, but the catalog has no model for it"))?;
            let variant = config.variant(name);
            let factory = providers.resolve(name, variant).with_context(|| {
                format!(
                    "service {name} has no provider variant {variant:?} (declared: {:?})",
                    providers.variants(name)
                )
            })?;
            let phase = if config.is_enabled(name) {
                Phase::Available
            } else {
                Phase::Disabled
            };
            let fallback = config
                .fallback_services
                .contains(name)
                .then(|| fallback.clone())
                .flatten();
            records.insert(
                name.to_string(),
                Arc::new(Record {
                    service,
                    provider: variant.to_string(),
                    factory,
                    fallback: RwLock::new(fallback),
                    phase: watch::Sender::new(phase),
                }),
            );
        }

        if let Some(enabled) = &config.enabled_services {
            for name in enabled.iter().filter(|n| !records.contains_key(*n)) {
                tracing::warn!(service = %name, "enabled service has no provider declaration");
            }
        }

        Ok(Self {
            records,
            config,
            activated: Arc::new(Mutex::new(Some(Vec::new()))),
            closing: AtomicBool::new(false),
        })
    }

    /// Current state of `name`.
    #[must_use]
    pub fn state(&self, name: &str) -> Option<ServiceState> {
        self.records.get(name).map(|r| r.phase.borrow().state())
    }

    /// State of every declared service, ordered by name.
    #[must_use]
    pub fn statuses(&self) -> Vec<ServiceStatus> {
        self.records
            .iter()
            .map(|(name, record)| {
                let phase = record.phase.borrow();
                ServiceStatus {
                    service: name.clone(),
                    provider: record.provider.clone(),
                    state: phase.state(),
                    error: match &*phase {
                        Phase::Error(message) => Some(message.clone()),
                        _ => None,
                    },
                }
            })
            .collect()
    }

    /// Returns the running service, activating it first if needed.
    ///
    /// Concurrent callers for an `Available` service trigger exactly one
    /// activation and all observe its outcome. An `Error` service fails fast
    /// with the recorded failure until [`reset`](Self::reset) is called.
    ///
    /// # Errors
    ///
    /// [`ActivationError`] for unknown, disabled, failed or stopped services;
    /// [`GatewayError::Timeout`] when activation outlasts the configured bound.
    pub async fn require(&self, name: &str) -> Result<Arc<ActiveService>, GatewayError> {
        let record = self
            .records
            .get(name)
            .ok_or_else(|| ActivationError::Unknown(name.to_string()))?;
        if self.closing.load(Ordering::Acquire) {
            return Err(ActivationError::Stopped(name.to_string()).into());
        }

        let claimed = record.phase.send_if_modified(|phase| {
            if matches!(phase, Phase::Available) {
                *phase = Phase::Starting;
                true
            } else {
                false
            }
        });
        if claimed {
            self.spawn_activation(Arc::clone(record));
        }

        let mut rx = record.phase.subscribe();
        let timeout_ms = self.config.activation_timeout_ms;
        let settled = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            rx.wait_for(|phase| !matches!(phase, Phase::Starting)),
        )
        .await;

        let phase = match settled {
            Err(_elapsed) => {
                return Err(GatewayError::Timeout {
                    what: format!("activation of {name}"),
                    timeout_ms,
                })
            }
            Ok(Err(closed)) => return Err(anyhow::Error::new(closed).context("activation state channel closed").into()),
            Ok(Ok(phase)) => phase.clone(),
        };

        match phase {
            Phase::Running(active) => Ok(active),
            Phase::Disabled => Err(ActivationError::Disabled(name.to_string()).into()),
            Phase::Error(message) => Err(ActivationError::Failed {
                service: name.to_string(),
                message,
            }
            .into()),
            Phase::Stopping | Phase::Stopped => Err(ActivationError::Stopped(name.to_string()).into()),
            Phase::Available | Phase::Starting => Err(ActivationError::Failed {
                service: name.to_string(),
                message: "activation was reset while waiting".to_string(),
            }
            .into()),
        }
    }

    fn spawn_activation(&self, record: Arc<Record>) {
        let config = Arc::clone(&self.config);
        let activated = Arc::clone(&self.activated);
        tokio::spawn(async move {
            let name = record.service.name.clone();
            let started = Instant::now();
            tracing::info!(service = %name, provider = %record.provider, "activating service");

            let outcome = match AssertUnwindSafe(activate(&record, config)).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_panic) => Err(anyhow::anyhow!("provider panicked during activation")),
            };
            let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

            match outcome {
                Ok(active) => {
                    {
                        let mut order = activated.lock();
                        if let Some(order) = order.as_mut() {
                            order.push(name.clone());
                            record.phase.send_replace(Phase::Running(active));
                            tracing::info!(service = %name, duration_ms, "service running");
                            return;
                        }
                    }
                    // Shutdown already collected the activation order.
                    tracing::info!(service = %name, duration_ms, "service activated during shutdown, stopping");
                    record.phase.send_replace(Phase::Stopping);
                    if let Err(e) = active.provider.on_before_stop().await {
                        tracing::warn!(service = %name, error = %format!("{e:#}"), "service stop hook failed");
                    }
                    record.phase.send_replace(Phase::Stopped);
                }
                Err(e) => {
                    let message = format!("{e:#}");
                    tracing::error!(service = %name, duration_ms, error = %message, "service activation failed");
                    record.phase.send_replace(Phase::Error(message));
                }
            }
        });
    }

    /// Moves an `Error` service back to `Available` so the next request
    /// retries activation. Other states, and every state once shutdown has
    /// begun, are left alone.
    ///
    /// # Errors
    ///
    /// [`ActivationError::Unknown`] for undeclared services.
    pub fn reset(&self, name: &str) -> Result<ServiceState, ActivationError> {
        let record = self
            .records
            .get(name)
            .ok_or_else(|| ActivationError::Unknown(name.to_string()))?;
        let closing = self.closing.load(Ordering::Acquire);
        record.phase.send_if_modified(|phase| {
            if !closing && matches!(phase, Phase::Error(_)) {
                *phase = Phase::Available;
                true
            } else {
                false
            }
        });
        Ok(record.phase.borrow().state())
    }

    /// Replaces the fallback of `name`, including the table of a running
    /// provider.
    ///
    /// # Errors
    ///
    /// [`ActivationError::Unknown`] for undeclared services.
    pub fn set_fallback(&self, name: &str, fallback: Option<Arc<dyn Fallback>>) -> Result<(), ActivationError> {
        let record = self
            .records
            .get(name)
            .ok_or_else(|| ActivationError::Unknown(name.to_string()))?;
        record.fallback.write().clone_from(&fallback);
        if let Phase::Running(active) = &*record.phase.borrow() {
            active.dispatch.set_fallback(fallback);
        }
        Ok(())
    }

    /// Drops the emulated state of a running service. Returns `false` when
    /// the service is not running and so holds no state.
    ///
    /// # Errors
    ///
    /// Unknown services, or the provider's reset failing.
    pub async fn reset_state(&self, name: &str) -> Result<bool, GatewayError> {
        let record = self
            .records
            .get(name)
            .ok_or_else(|| ActivationError::Unknown(name.to_string()))?;
        let active = match &*record.phase.borrow() {
            Phase::Running(active) => Arc::clone(active),
            _ => return Ok(false),
        };
        active
            .provider
            .reset_state()
            .await
            .with_context(|| format!("resetting state of {name}"))?;
        tracing::info!(service = %name, "service state reset");
        Ok(true)
    }

    /// Activates every enabled service. Returns the services that failed.
    pub async fn start_eager(&self) -> Vec<(String, GatewayError)> {
        let names: Vec<&String> = self
            .records
            .iter()
            .filter(|(_, r)| !matches!(*r.phase.borrow(), Phase::Disabled))
            .map(|(name, _)| name)
            .collect();
        let outcomes =
            futures_util::future::join_all(names.iter().map(|name| self.require(name))).await;
        names
            .into_iter()
            .zip(outcomes)
            .filter_map(|(name, outcome)| outcome.err().map(|e| (name.clone(), e)))
            .collect()
    }

    /// Stops every running service in reverse activation order under one
    /// deadline. Activations already in flight are waited for within the same
    /// deadline and then stopped; services never activated become `Stopped`
    /// and later requires fail. Calling it again stops nothing further.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        let deadline = tokio::time::Instant::now() + timeout;
        self.closing.store(true, Ordering::Release);
        let mut report = ShutdownReport::default();

        let mut starting = Vec::new();
        for (name, record) in &self.records {
            record.phase.send_if_modified(|phase| match phase {
                Phase::Available => {
                    *phase = Phase::Stopped;
                    true
                }
                _ => false,
            });
            if matches!(*record.phase.borrow(), Phase::Starting) {
                starting.push((name, record.phase.subscribe()));
            }
        }
        let waits = starting.iter_mut().map(|(name, rx)| async move {
            let settled = tokio::time::timeout_at(deadline, rx.wait_for(|p| !matches!(p, Phase::Starting)))
                .await
                .is_ok();
            (*name, settled)
        });
        for (name, settled) in futures_util::future::join_all(waits).await {
            if !settled {
                tracing::warn!(service = %name, "activation still in progress at shutdown deadline");
                report.timed_out.push(name.clone());
            }
        }

        let order = self.activated.lock().take().unwrap_or_default();

        for name in order.iter().rev() {
            let Some(record) = self.records.get(name) else {
                continue;
            };
            let mut active = None;
            record.phase.send_if_modified(|phase| {
                if let Phase::Running(running) = phase {
                    active = Some(Arc::clone(running));
                    *phase = Phase::Stopping;
                    true
                } else {
                    false
                }
            });
            let Some(active) = active else {
                continue;
            };

            match tokio::time::timeout_at(deadline, active.provider.on_before_stop()).await {
                Ok(Ok(())) => report.stopped.push(name.clone()),
                Ok(Err(e)) => {
                    tracing::warn!(service = %name, error = %format!("{e:#}"), "service stop hook failed");
                    report.failed.push((name.clone(), format!("{e:#}")));
                }
                Err(_elapsed) => {
                    tracing::warn!(service = %name, "service stop hook timed out");
                    report.timed_out.push(name.clone());
                }
            }
            record.phase.send_replace(Phase::Stopped);
        }
        report
    }
}

async fn activate(record: &Record, config: Arc<ServerConfig>) -> anyhow::Result<Arc<ActiveService>> {
    let ctx = ServiceContext {
        service: Arc::clone(&record.service),
        config,
    };
    let provider = record
        .factory
        .create(&ctx)
        .await
        .with_context(|| format!("creating provider {:?}", record.provider))?;
    let dispatch = Arc::new(Arc::clone(&provider).dispatch_table());
    dispatch.set_fallback(record.fallback.read().clone());
    provider.on_before_start().await.context("on_before_start hook")?;
    provider.check_ready().await.context("readiness check")?;
    Ok(Arc::new(ActiveService { provider, dispatch }))
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.statuses())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;
    use stratus_core::{Params, StaticCatalog, TenantContext};

    use super::*;
    use crate::service::dispatch::HandlerError;

    struct TestProvider {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        stop_delay: Duration,
    }

    #[async_trait]
    impl ServiceProvider for TestProvider {
        fn dispatch_table(self: Arc<Self>) -> DispatchTable {
            DispatchTable::builder(self.name.clone()).build()
        }

        async fn on_before_stop(&self) -> anyhow::Result<()> {
            tokio::time::sleep(self.stop_delay).await;
            self.log.lock().push(format!("stop:{}", self.name));
            Ok(())
        }
    }

    struct TestFactory {
        calls: AtomicUsize,
        delay: Duration,
        fail: AtomicBool,
        stop_delay: Duration,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl TestFactory {
        fn new(log: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Duration::from_millis(20),
                fail: AtomicBool::new(false),
                stop_delay: Duration::ZERO,
                log,
            }
        }
    }

    struct Handle(Arc<TestFactory>);

    #[async_trait]
    impl ProviderFactory for Handle {
        async fn create(&self, ctx: &ServiceContext) -> anyhow::Result<Arc<dyn ServiceProvider>> {
            let this = &self.0;
            this.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(this.delay).await;
            if this.fail.load(Ordering::SeqCst) {
                anyhow::bail!("backing emulator unavailable");
            }
            Ok(Arc::new(TestProvider {
                name: ctx.service.name.clone(),
                log: Arc::clone(&this.log),
                stop_delay: this.stop_delay,
            }))
        }
    }

    fn catalog(names: &[&str]) -> StaticCatalog {
        let mut catalog = StaticCatalog::new();
        for name in names {
            catalog
                .insert(
                    ServiceModel::from_value(
                        name,
                        json!({
                            "metadata": {"protocol": "json", "apiVersion": "2020-01-01", "endpointPrefix": name},
                            "operations": {},
                            "shapes": {}
                        }),
                    )
                    .unwrap(),
                )
                .unwrap();
        }
        catalog
    }

    fn registry(factories: &[(&str, Arc<TestFactory>)], config: ServerConfig) -> ServiceRegistry {
        let names: Vec<&str> = factories.iter().map(|(n, _)| *n).collect();
        let mut providers = ProviderRegistry::new();
        for (name, factory) in factories {
            providers.register(*name, "default", Handle(Arc::clone(factory)));
        }
        ServiceRegistry::new(&providers, &catalog(&names), Arc::new(config), None).unwrap()
    }

    fn log() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requires_activate_once() {
        let factory = Arc::new(TestFactory::new(log()));
        let registry = Arc::new(registry(&[("sqs", Arc::clone(&factory))], ServerConfig::default()));

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.require("sqs").await })
            })
            .collect();
        let mut actives = Vec::new();
        for handle in handles {
            actives.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(factory.calls.load(Ordering::SeqCst), 1);
        assert!(actives.iter().all(|a| Arc::ptr_eq(a, &actives[0])));
        assert_eq!(registry.state("sqs"), Some(ServiceState::Running));
    }

    #[tokio::test]
    async fn failed_activation_fails_fast_until_reset() {
        let factory = Arc::new(TestFactory::new(log()));
        factory.fail.store(true, Ordering::SeqCst);
        let registry = registry(&[("sqs", Arc::clone(&factory))], ServerConfig::default());

        let first = registry.require("sqs").await.unwrap_err();
        assert!(matches!(first, GatewayError::Activation(ActivationError::Failed { ref message, .. }) if message.contains("unavailable")));
        assert_eq!(registry.state("sqs"), Some(ServiceState::Error));

        let second = registry.require("sqs").await.unwrap_err();
        assert!(matches!(second, GatewayError::Activation(ActivationError::Failed { .. })));
        assert_eq!(factory.calls.load(Ordering::SeqCst), 1);

        factory.fail.store(false, Ordering::SeqCst);
        assert_eq!(registry.reset("sqs").unwrap(), ServiceState::Available);
        registry.require("sqs").await.unwrap();
        assert_eq!(factory.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn disabled_services_never_activate() {
        let factory = Arc::new(TestFactory::new(log()));
        let config = ServerConfig {
            enabled_services: Some(BTreeSet::new()),
            ..ServerConfig::default()
        };
        let registry = registry(&[("sqs", Arc::clone(&factory))], config);

        let err = registry.require("sqs").await.unwrap_err();
        assert!(matches!(err, GatewayError::Activation(ActivationError::Disabled(_))));
        assert_eq!(factory.calls.load(Ordering::SeqCst), 0);
        assert!(registry.start_eager().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_service_is_rejected() {
        let registry = registry(&[], ServerConfig::default());
        let err = registry.require("s3").await.unwrap_err();
        assert!(matches!(err, GatewayError::Activation(ActivationError::Unknown(_))));
    }

    #[tokio::test]
    async fn timed_out_wait_does_not_cancel_activation() {
        let mut factory = TestFactory::new(log());
        factory.delay = Duration::from_millis(200);
        let factory = Arc::new(factory);
        let config = ServerConfig {
            activation_timeout_ms: 20,
            ..ServerConfig::default()
        };
        let registry = registry(&[("sqs", Arc::clone(&factory))], config);

        let err = registry.require("sqs").await.unwrap_err();
        assert!(matches!(err, GatewayError::Timeout { .. }));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(registry.state("sqs"), Some(ServiceState::Running));
        assert_eq!(factory.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_stops_in_reverse_activation_order_once() {
        let log = log();
        let a = Arc::new(TestFactory::new(Arc::clone(&log)));
        let b = Arc::new(TestFactory::new(Arc::clone(&log)));
        let registry = registry(&[("alpha", a), ("beta", b)], ServerConfig::default());

        registry.require("beta").await.unwrap();
        registry.require("alpha").await.unwrap();

        let report = registry.shutdown(Duration::from_secs(1)).await;
        assert_eq!(report.stopped, vec!["alpha", "beta"]);
        assert_eq!(*log.lock(), vec!["stop:alpha", "stop:beta"]);
        assert_eq!(registry.state("alpha"), Some(ServiceState::Stopped));

        let again = registry.shutdown(Duration::from_secs(1)).await;
        assert_eq!(again, ShutdownReport::default());

        let err = registry.require("alpha").await.unwrap_err();
        assert!(matches!(err, GatewayError::Activation(ActivationError::Stopped(_))));
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_activation_and_refuses_new_ones() {
        let log = log();
        let mut slow = TestFactory::new(Arc::clone(&log));
        slow.delay = Duration::from_millis(200);
        let slow = Arc::new(slow);
        let idle = Arc::new(TestFactory::new(Arc::clone(&log)));
        let config = ServerConfig {
            activation_timeout_ms: 20,
            ..ServerConfig::default()
        };
        let registry = registry(&[("alpha", slow), ("beta", Arc::clone(&idle))], config);

        let err = registry.require("alpha").await.unwrap_err();
        assert!(matches!(err, GatewayError::Timeout { .. }));
        assert_eq!(registry.state("alpha"), Some(ServiceState::Starting));

        let report = registry.shutdown(Duration::from_secs(1)).await;
        assert_eq!(report.stopped, vec!["alpha"]);
        assert!(report.timed_out.is_empty());
        assert_eq!(*log.lock(), vec!["stop:alpha"]);
        assert_eq!(registry.state("alpha"), Some(ServiceState::Stopped));

        let err = registry.require("beta").await.unwrap_err();
        assert!(matches!(err, GatewayError::Activation(ActivationError::Stopped(_))));
        assert_eq!(registry.state("beta"), Some(ServiceState::Stopped));
        assert_eq!(idle.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn activation_finishing_after_the_deadline_stops_itself() {
        let log = log();
        let mut slow = TestFactory::new(Arc::clone(&log));
        slow.delay = Duration::from_millis(150);
        let config = ServerConfig {
            activation_timeout_ms: 10,
            ..ServerConfig::default()
        };
        let registry = registry(&[("alpha", Arc::new(slow))], config);
        assert!(registry.require("alpha").await.is_err());

        let report = registry.shutdown(Duration::from_millis(10)).await;
        assert_eq!(report.timed_out, vec!["alpha"]);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(registry.state("alpha"), Some(ServiceState::Stopped));
        assert_eq!(*log.lock(), vec!["stop:alpha"]);
    }

    #[tokio::test]
    async fn slow_stop_hooks_are_reported() {
        let mut factory = TestFactory::new(log());
        factory.stop_delay = Duration::from_millis(500);
        let registry = registry(&[("sqs", Arc::new(factory))], ServerConfig::default());
        registry.require("sqs").await.unwrap();

        let report = registry.shutdown(Duration::from_millis(20)).await;
        assert_eq!(report.timed_out, vec!["sqs"]);
        assert_eq!(registry.state("sqs"), Some(ServiceState::Stopped));
    }

    struct Echo;

    #[async_trait]
    impl Fallback for Echo {
        async fn invoke(&self, _ctx: &TenantContext, _op: &str, params: Params) -> Result<Params, HandlerError> {
            Ok(params)
        }
    }

    #[tokio::test]
    async fn fallback_services_get_the_fallback_attached() {
        let factory = Arc::new(TestFactory::new(log()));
        let mut providers = ProviderRegistry::new();
        providers.register("dynamodb", "default", Handle(Arc::clone(&factory)));
        providers.register("sqs", "default", Handle(Arc::clone(&factory)));
        let config = ServerConfig {
            fallback_services: BTreeSet::from(["dynamodb".to_string()]),
            ..ServerConfig::default()
        };
        let registry = ServiceRegistry::new(
            &providers,
            &catalog(&["dynamodb", "sqs"]),
            Arc::new(config),
            Some(Arc::new(Echo)),
        )
        .unwrap();

        assert!(registry.require("dynamodb").await.unwrap().dispatch.has_fallback());
        let sqs = registry.require("sqs").await.unwrap();
        assert!(!sqs.dispatch.has_fallback());

        registry.set_fallback("sqs", Some(Arc::new(Echo))).unwrap();
        assert!(sqs.dispatch.has_fallback());
    }

    #[test]
    fn missing_variant_fails_construction() {
        let factory = Arc::new(TestFactory::new(log()));
        let mut providers = ProviderRegistry::new();
        providers.register("sqs", "default", Handle(factory));
        let config = ServerConfig {
            provider_variants: BTreeMap::from([("sqs".to_string(), "v9".to_string())]),
            ..ServerConfig::default()
        };
        let err = ServiceRegistry::new(&providers, &catalog(&["sqs"]), Arc::new(config), None).unwrap_err();
        assert!(err.to_string().contains("v9"));
    }
}
