//! HTTP listener lifecycle.
//!
//! `new()` allocates shared state, `start()` binds the listener and reports
//! the real port, `serve()` accepts requests until the shutdown future
//! resolves. The gateway is handed to `serve()` so it can be configured
//! with the port `start()` actually bound.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::{NetworkConfig, TlsConfig};
use super::handlers::{
    gateway_handler, health_handler, liveness_handler, readiness_handler, reset_handler, AppState,
};
use super::middleware::build_http_layers;
use super::shutdown::ShutdownController;
use crate::gateway::Gateway;

/// Assembles internal routes, the gateway catch-all and the middleware.
///
/// - `GET /_stratus/health` -- listener and service lifecycle JSON
/// - `GET /_stratus/health/live`, `GET /_stratus/health/ready` -- probes
/// - `POST /_stratus/state/{service}/reset` -- state and error reset
/// - anything else -- the gateway
pub fn build_router(state: AppState) -> Router {
    let layers = build_http_layers(&state.config);

    Router::new()
        .route("/_stratus/health", get(health_handler))
        .route("/_stratus/health/live", get(liveness_handler))
        .route("/_stratus/health/ready", get(readiness_handler))
        .route("/_stratus/state/{service}/reset", post(reset_handler))
        .fallback(gateway_handler)
        .layer(layers)
        .with_state(state)
}

/// Owns the listener and serves the gateway over HTTP or HTTPS.
pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    shutdown: Arc<ShutdownController>,
}

impl NetworkModule {
    #[must_use]
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            listener: None,
            shutdown: Arc::new(ShutdownController::new()),
        }
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Binds the configured address and returns the bound port.
    ///
    /// # Errors
    ///
    /// The address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!(host = %self.config.host, port, "listener bound");

        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves until `shutdown` resolves, then drains in-flight requests and
    /// stops every running service.
    ///
    /// # Errors
    ///
    /// `start()` was not called, TLS material cannot be loaded, or the
    /// server hits a fatal I/O error.
    pub async fn serve(
        self,
        gateway: Arc<Gateway>,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let Some(listener) = self.listener else {
            anyhow::bail!("start() must be called before serve()");
        };
        let config = Arc::new(self.config);
        let router = build_router(AppState {
            gateway: Arc::clone(&gateway),
            shutdown: Arc::clone(&self.shutdown),
            config: Arc::clone(&config),
            start_time: Instant::now(),
        });

        self.shutdown.set_ready();

        match &config.tls {
            Some(tls) => serve_tls(listener, router, tls, shutdown).await?,
            None => {
                info!("serving plain HTTP");
                axum::serve(listener, router).with_graceful_shutdown(shutdown).await?;
            }
        }

        self.shutdown.begin_drain();
        if self.shutdown.wait_for_drain(config.drain_timeout).await {
            info!("in-flight requests drained");
        } else {
            warn!(
                in_flight = self.shutdown.in_flight_count(),
                "drain timeout expired with requests outstanding"
            );
        }

        let timeout = Duration::from_millis(gateway.config().shutdown_timeout_ms);
        let report = gateway.registry().shutdown(timeout).await;
        info!(
            stopped = ?report.stopped,
            failed = ?report.failed,
            timed_out = ?report.timed_out,
            "services shut down"
        );
        Ok(())
    }
}

/// HTTPS via `axum-server` on the already-bound listener.
async fn serve_tls(
    listener: TcpListener,
    router: Router,
    tls: &TlsConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    use axum_server::tls_rustls::RustlsConfig;

    let rustls = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
        .await
        .map_err(|e| anyhow::anyhow!("failed to load TLS certificate or key: {e}"))?;

    let addr = listener.local_addr()?;
    let handle = axum_server::Handle::new();
    let on_shutdown = handle.clone();
    tokio::spawn(async move {
        shutdown.await;
        on_shutdown.graceful_shutdown(None);
    });

    info!(%addr, "serving HTTPS");
    axum_server::from_tcp_rustls(listener.into_std()?, rustls)
        .handle(handle)
        .serve(router.into_make_service())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::network::handlers::tests::{app_state, SQS_AUTH};

    fn sqs(body: &'static str) -> Request<Body> {
        Request::post("/")
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(AUTHORIZATION, SQS_AUTH)
            .body(Body::from(body))
            .unwrap()
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn start_binds_an_os_assigned_port() {
        let config = NetworkConfig {
            port: 0,
            ..NetworkConfig::default()
        };
        let mut module = NetworkModule::new(config);
        let port = module.start().await.unwrap();
        assert!(port > 0);
        assert!(module.listener.is_some());
    }

    #[tokio::test]
    async fn serve_without_start_is_an_error() {
        let module = NetworkModule::new(NetworkConfig::default());
        let err = module
            .serve(Arc::clone(&app_state().gateway), std::future::pending::<()>())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("start()"));
    }

    #[tokio::test]
    async fn gateway_requests_echo_the_edge_request_id() {
        let router = build_router(app_state());
        let mut request = sqs("Action=CreateQueue&QueueName=edge&Version=2012-11-05");
        request.headers_mut().insert("x-request-id", "edge-1".parse().unwrap());

        let response = router.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-request-id"], "edge-1");
        assert_eq!(response.headers()["x-amzn-requestid"], "edge-1");
        assert!(body_text(response).await.contains("<QueueUrl>"));
    }

    #[tokio::test]
    async fn reset_drops_state_of_a_running_service() {
        let state = app_state();
        let router = build_router(state.clone());

        let created = router
            .clone()
            .oneshot(sqs("Action=CreateQueue&QueueName=ephemeral&Version=2012-11-05"))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::OK);

        let reset = router
            .clone()
            .oneshot(Request::post("/_stratus/state/sqs/reset").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(reset.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_text(reset).await).unwrap();
        assert_eq!(json["state"], "running");
        assert_eq!(json["state_reset"], true);

        let lookup = router
            .oneshot(sqs("Action=GetQueueUrl&QueueName=ephemeral&Version=2012-11-05"))
            .await
            .unwrap();
        assert_eq!(lookup.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(lookup).await.contains("NonExistentQueue"));
    }

    #[tokio::test]
    async fn reset_of_an_idle_service_reports_no_state() {
        let router = build_router(app_state());
        let response = router
            .oneshot(Request::post("/_stratus/state/sqs/reset").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(json["state"], "available");
        assert_eq!(json["state_reset"], false);
    }

    #[tokio::test]
    async fn reset_of_an_unknown_service_is_not_found() {
        let router = build_router(app_state());
        let response = router
            .oneshot(Request::post("/_stratus/state/kinesis/reset").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_route_is_not_handed_to_the_gateway() {
        let router = build_router(app_state());
        let response = router
            .oneshot(Request::get("/_stratus/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert!(json["services"].is_array());
    }
}
