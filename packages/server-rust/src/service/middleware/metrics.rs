//! Metrics middleware for operation invocations.
//!
//! Wraps every invocation in a `tracing` span and records its duration and
//! outcome through the `metrics` facade. No exporter is installed by the
//! library; the recorder is whatever the embedding binary sets up.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use stratus_core::Params;
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::service::dispatch::Invocation;
use crate::service::operation::GatewayError;

/// Histogram of invocation durations in seconds.
pub const OPERATION_DURATION: &str = "stratus_operation_duration_seconds";
/// Counter of completed invocations.
pub const OPERATIONS_TOTAL: &str = "stratus_operations_total";

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

/// Tower layer that instruments invocations with timing and counting.
#[derive(Debug, Clone, Copy)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Service wrapper that records invocation duration and outcome.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S> Service<Invocation> for MetricsService<S>
where
    S: Service<Invocation, Response = Params, Error = GatewayError> + Send,
    S::Future: Send + 'static,
{
    type Response = Params;
    type Error = GatewayError;
    type Future = Pin<Box<dyn Future<Output = Result<Params, GatewayError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, invocation: Invocation) -> Self::Future {
        let service = invocation.ctx.service.name.clone();
        let operation = invocation.ctx.operation.clone();

        let span = info_span!(
            "invocation",
            service = %service,
            operation = %operation,
            request_id = %invocation.ctx.request_id,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(invocation);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();

                let outcome = match &result {
                    Ok(_) => "ok",
                    Err(e) => e.kind(),
                };

                let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);

                metrics::histogram!(
                    OPERATION_DURATION,
                    "service" => service.clone(),
                    "operation" => operation.clone()
                )
                .record(elapsed.as_secs_f64());
                metrics::counter!(
                    OPERATIONS_TOTAL,
                    "service" => service.clone(),
                    "operation" => operation.clone(),
                    "outcome" => outcome
                )
                .increment(1);

                tracing::debug!(
                    service = %service,
                    operation = %operation,
                    duration_ms,
                    outcome,
                    "invocation complete"
                );

                result
            }
            .instrument(span),
        )
    }
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

    /// Immediately-completing service echoing the operation name.
    struct EchoService;

    impl Service<Invocation> for EchoService {
        type Response = Params;
        type Error = GatewayError;
        type Future = Pin<Box<dyn Future<Output = Result<Params, GatewayError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, invocation: Invocation) -> Self::Future {
            let op = invocation.ctx.operation;
            Box::pin(async move { Ok(Params::from([("Op".to_string(), Value::String(op))])) })
        }
    }

    #[tokio::test]
    async fn output_passes_through_unchanged() {
        let svc = MetricsLayer.layer(EchoService);
        let out = svc.oneshot(invocation("SendMessage")).await.unwrap();
        assert_eq!(out["Op"], Value::String("SendMessage".into()));
    }
}
