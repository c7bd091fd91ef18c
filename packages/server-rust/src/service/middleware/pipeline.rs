//! Pipeline composition: wraps a dispatch table with the middleware layers.

use std::sync::Arc;
use std::time::Duration;

use stratus_core::Params;
use tower::util::BoxCloneService;
use tower::ServiceBuilder;

use super::metrics::MetricsLayer;
use super::timeout::TimeoutLayer;
use crate::service::config::ServerConfig;
use crate::service::dispatch::{DispatchService, DispatchTable, Invocation};
use crate::service::operation::GatewayError;

/// Type-erased invocation pipeline.
pub type InvocationPipeline = BoxCloneService<Invocation, Params, GatewayError>;

/// Builds the invocation pipeline around a provider's dispatch table.
///
/// Layer order (outermost to innermost):
/// 1. `MetricsLayer` -- record timing and outcome, timeouts included
/// 2. `TimeoutLayer` -- bound the invocation
/// 3. `DispatchService` -- primary handler or fallback
#[must_use]
pub fn build_invocation_pipeline(table: Arc<DispatchTable>, config: &ServerConfig) -> InvocationPipeline {
    let service = ServiceBuilder::new()
        .layer(MetricsLayer)
        .layer(TimeoutLayer::new(Duration::from_millis(config.invocation_timeout_ms)))
        .service(DispatchService::new(table));
    BoxCloneService::new(service)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use stratus_core::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::service::dispatch::tests::invocation;
    use crate::service::dispatch::HandlerError;

    #[tokio::test]
    async fn pipeline_routes_through_all_layers() {
        let table = DispatchTable::builder("sqs")
            .operation("ListQueues", |_inv: Invocation| async move {
                Ok::<_, HandlerError>(Params::from([(
                    "QueueUrls".to_string(),
                    Value::List(Vec::new()),
                )]))
            })
            .build();
        let pipeline = build_invocation_pipeline(Arc::new(table), &ServerConfig::default());
        let out = pipeline.oneshot(invocation("ListQueues")).await.unwrap();
        assert_eq!(out["QueueUrls"], Value::List(Vec::new()));
    }

    #[tokio::test]
    async fn slow_handler_times_out() {
        let table = DispatchTable::builder("sqs")
            .operation("ReceiveMessage", |_inv: Invocation| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, HandlerError>(Params::new())
            })
            .build();
        let config = ServerConfig {
            invocation_timeout_ms: 20,
            ..ServerConfig::default()
        };
        let pipeline = build_invocation_pipeline(Arc::new(table), &config);
        let err = pipeline.oneshot(invocation("ReceiveMessage")).await.unwrap_err();
        assert_eq!(err.kind(), "timeout");
    }
}
