//! Timeout middleware for operation invocations.
//!
//! Rejects invocations that exceed the configured bound with
//! `GatewayError::Timeout`.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use stratus_core::Params;
use tower::{Layer, Service};

use crate::service::dispatch::Invocation;
use crate::service::operation::GatewayError;

// ---------------------------------------------------------------------------
// TimeoutLayer
// ---------------------------------------------------------------------------

/// Tower layer that bounds every invocation by the same duration.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutLayer {
    timeout: Duration,
}

impl TimeoutLayer {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService {
            inner,
            timeout: self.timeout,
        }
    }
}

// ---------------------------------------------------------------------------
// TimeoutService
// ---------------------------------------------------------------------------

/// Service wrapper that enforces the invocation timeout.
#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
    timeout: Duration,
}

impl<S> Service<Invocation> for TimeoutService<S>
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
        let what = format!(
            "{}.{}",
            invocation.ctx.service.name, invocation.ctx.operation
        );
        let timeout = self.timeout;
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let fut = self.inner.call(invocation);
        Box::pin(async move {
            match tokio::time::timeout(timeout, fut).await {
                Ok(result) => result,
                Err(_elapsed) => Err(GatewayError::Timeout { what, timeout_ms }),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tower::ServiceExt;

    use super::*;
    use crate::service::dispatch::tests::invocation;

    /// Service that takes a configurable delay before responding.
    struct SlowService {
        delay_ms: u64,
    }

    impl Service<Invocation> for SlowService {
        type Response = Params;
        type Error = GatewayError;
        type Future = Pin<Box<dyn Future<Output = Result<Params, GatewayError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _invocation: Invocation) -> Self::Future {
            let delay = self.delay_ms;
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(Params::new())
            })
        }
    }

    #[tokio::test]
    async fn completes_within_timeout() {
        let svc = TimeoutLayer::new(Duration::from_millis(1000)).layer(SlowService { delay_ms: 10 });
        let out = svc.oneshot(invocation("ListQueues")).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn exceeds_timeout_returns_error() {
        let svc = TimeoutLayer::new(Duration::from_millis(50)).layer(SlowService { delay_ms: 200 });
        let err = svc.oneshot(invocation("ListQueues")).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Timeout { ref what, timeout_ms: 50 } if what == "sqs.ListQueues"
        ));
    }
}
