//! Operation dispatch: explicit handler bindings plus a swappable fallback.
//!
//! A [`DispatchTable`] is frozen once built. Requests for a bound operation
//! always reach their handler; only unbound operations consult the fallback
//! slot, which can be replaced at any time.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::RwLock;
use stratus_core::{Params, ServiceError, TenantContext};
use tower::Service;

use super::operation::GatewayError;
use crate::storage::StoreError;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure reported by an operation handler or fallback.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Named domain error, encoded for the client as-is.
    #[error(transparent)]
    Service(#[from] ServiceError),
    /// Tenant identifiers rejected by the store.
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// The operation has no binding and no fallback is attached.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("operation {operation} of service {service} is not yet implemented")]
    NotImplemented { service: String, operation: String },
}

// ---------------------------------------------------------------------------
// Invocation, handlers and fallback
// ---------------------------------------------------------------------------

/// One operation call: tenant context plus decoded parameters.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub ctx: TenantContext,
    pub params: Params,
}

/// Boxed handler result.
pub type HandlerFuture = BoxFuture<'static, Result<Params, HandlerError>>;

type BoundHandler = Arc<dyn Fn(Invocation) -> HandlerFuture + Send + Sync>;

/// Generic implementation for operations without a binding.
#[async_trait]
pub trait Fallback: Send + Sync {
    /// Serves `operation` with parameters already decoded against its input
    /// shape.
    async fn invoke(
        &self,
        ctx: &TenantContext,
        operation: &str,
        params: Params,
    ) -> Result<Params, HandlerError>;
}

// ---------------------------------------------------------------------------
// DispatchTable
// ---------------------------------------------------------------------------

/// Operation name to handler map of one service.
pub struct DispatchTable {
    service: String,
    handlers: BTreeMap<String, BoundHandler>,
    fallback: RwLock<Option<Arc<dyn Fallback>>>,
}

impl DispatchTable {
    /// Starts a table for `service`.
    #[must_use]
    pub fn builder(service: impl Into<String>) -> DispatchTableBuilder {
        DispatchTableBuilder {
            service: service.into(),
            handlers: BTreeMap::new(),
        }
    }

    /// Service the table belongs to.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Bound operation names in order.
    pub fn operations(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Whether `operation` has a primary handler.
    #[must_use]
    pub fn contains(&self, operation: &str) -> bool {
        self.handlers.contains_key(operation)
    }

    /// Replaces the fallback, returning the previous one. Bindings are not
    /// affected.
    pub fn set_fallback(&self, fallback: Option<Arc<dyn Fallback>>) -> Option<Arc<dyn Fallback>> {
        std::mem::replace(&mut *self.fallback.write(), fallback)
    }

    #[must_use]
    pub fn has_fallback(&self) -> bool {
        self.fallback.read().is_some()
    }

    /// Runs the handler bound to `invocation.ctx.operation`, else the
    /// fallback.
    ///
    /// # Errors
    ///
    /// [`DispatchError::NotImplemented`] for an unbound operation without a
    /// fallback; otherwise whatever the handler reports. A panicking handler
    /// is reported as an internal failure.
    pub async fn invoke(&self, invocation: Invocation) -> Result<Params, GatewayError> {
        let operation = invocation.ctx.operation.clone();
        if let Some(handler) = self.handlers.get(&operation) {
            let handler = Arc::clone(handler);
            return guarded(&self.service, &operation, move || handler(invocation))
                .await
                .map_err(GatewayError::from);
        }

        // The read guard must not live across the await.
        let fallback = self.fallback.read().clone();
        let Some(fallback) = fallback else {
            return Err(DispatchError::NotImplemented {
                service: self.service.clone(),
                operation,
            }
            .into());
        };
        tracing::debug!(service = %self.service, operation = %operation, "delegating to fallback");
        let name = operation.clone();
        guarded(&self.service, &operation, move || {
            async move {
                fallback
                    .invoke(&invocation.ctx, &name, invocation.params)
                    .await
            }
            .boxed()
        })
        .await
        .map_err(GatewayError::from)
    }
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchTable")
            .field("service", &self.service)
            .field("operations", &self.handlers.keys().collect::<Vec<_>>())
            .field("fallback", &self.has_fallback())
            .finish()
    }
}

async fn guarded(
    service: &str,
    operation: &str,
    call: impl FnOnce() -> HandlerFuture,
) -> Result<Params, HandlerError> {
    let future = match std::panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(future) => future,
        Err(payload) => return Err(panicked(service, operation, payload.as_ref())),
    };
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(panicked(service, operation, payload.as_ref())),
    }
}

fn panicked(service: &str, operation: &str, payload: &(dyn Any + Send)) -> HandlerError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    tracing::error!(service, operation, panic = %message, "handler panicked");
    HandlerError::Internal(anyhow::anyhow!("handler for {service}.{operation} panicked: {message}"))
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Collects bindings for a [`DispatchTable`].
pub struct DispatchTableBuilder {
    service: String,
    handlers: BTreeMap<String, BoundHandler>,
}

impl DispatchTableBuilder {
    /// Binds a stateless handler.
    #[must_use]
    pub fn operation<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Params, HandlerError>> + Send + 'static,
    {
        let name = name.into();
        let bound: BoundHandler = Arc::new(move |invocation: Invocation| handler(invocation).boxed());
        if self.handlers.insert(name.clone(), bound).is_some() {
            tracing::warn!(service = %self.service, operation = %name, "operation bound twice, keeping the last binding");
        }
        self
    }

    /// Binds a handler that receives the provider it belongs to.
    #[must_use]
    pub fn route<P, F, Fut>(self, name: impl Into<String>, provider: &Arc<P>, handler: F) -> Self
    where
        P: ?Sized + Send + Sync + 'static,
        F: Fn(Arc<P>, Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Params, HandlerError>> + Send + 'static,
    {
        let provider = Arc::clone(provider);
        self.operation(name, move |invocation| handler(Arc::clone(&provider), invocation))
    }

    /// Freezes the bindings. The fallback slot starts empty.
    #[must_use]
    pub fn build(self) -> DispatchTable {
        DispatchTable {
            service: self.service,
            handlers: self.handlers,
            fallback: RwLock::new(None),
        }
    }
}

// ---------------------------------------------------------------------------
// DispatchService (tower adapter)
// ---------------------------------------------------------------------------

/// `tower::Service` view of a shared table, the innermost service of the
/// invocation pipeline.
#[derive(Debug, Clone)]
pub struct DispatchService {
    table: Arc<DispatchTable>,
}

impl DispatchService {
    #[must_use]
    pub fn new(table: Arc<DispatchTable>) -> Self {
        Self { table }
    }
}

impl Service<Invocation> for DispatchService {
    type Response = Params;
    type Error = GatewayError;
    type Future = Pin<Box<dyn Future<Output = Result<Params, GatewayError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, invocation: Invocation) -> Self::Future {
        let table = Arc::clone(&self.table);
        Box::pin(async move { table.invoke(invocation).await })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use stratus_core::{ServiceModel, Value};
    use tower::ServiceExt;

    use super::*;

    pub(crate) fn invocation(operation: &str) -> Invocation {
        let model = ServiceModel::from_value(
            "sqs",
            json!({
                "metadata": {"protocol": "query", "apiVersion": "2012-11-05", "endpointPrefix": "sqs"},
                "operations": {},
                "shapes": {}
            }),
        )
        .unwrap();
        Invocation {
            ctx: TenantContext {
                account_id: "000000000000".into(),
                region: "us-east-1".into(),
                request_id: "req-1".into(),
                service: Arc::new(model),
                operation: operation.into(),
                internal_params: None,
            },
            params: Params::new(),
        }
    }

    #[derive(Default)]
    struct CountingFallback {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Fallback for CountingFallback {
        async fn invoke(
            &self,
            _ctx: &TenantContext,
            operation: &str,
            _params: Params,
        ) -> Result<Params, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Params::from([("Fallback".to_string(), Value::String(operation.to_string()))]))
        }
    }

    fn table() -> DispatchTable {
        DispatchTable::builder("sqs")
            .operation("CreateQueue", |inv: Invocation| async move {
                Ok::<_, HandlerError>(Params::from([(
                    "Handled".to_string(),
                    Value::String(inv.ctx.operation),
                )]))
            })
            .build()
    }

    #[tokio::test]
    async fn bound_operation_never_reaches_fallback() {
        let table = table();
        let fallback = Arc::new(CountingFallback::default());
        table.set_fallback(Some(fallback.clone()));

        let out = table.invoke(invocation("CreateQueue")).await.unwrap();
        assert_eq!(out["Handled"], Value::String("CreateQueue".into()));
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);

        let out = table.invoke(invocation("PurgeQueue")).await.unwrap();
        assert_eq!(out["Fallback"], Value::String("PurgeQueue".into()));
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn miss_without_fallback_is_not_implemented() {
        let err = table().invoke(invocation("PurgeQueue")).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Dispatch(DispatchError::NotImplemented { ref operation, .. }) if operation == "PurgeQueue"
        ));
    }

    #[tokio::test]
    async fn fallback_can_be_swapped_and_removed() {
        let table = table();
        let first = Arc::new(CountingFallback::default());
        let second = Arc::new(CountingFallback::default());

        assert!(table.set_fallback(Some(first.clone())).is_none());
        assert!(table.set_fallback(Some(second.clone())).is_some());
        table.invoke(invocation("PurgeQueue")).await.unwrap();
        assert_eq!(first.calls.load(Ordering::SeqCst), 0);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);

        table.set_fallback(None);
        assert!(table.invoke(invocation("PurgeQueue")).await.is_err());
        assert!(table.contains("CreateQueue"));
    }

    #[tokio::test]
    async fn panicking_handler_becomes_internal_error() {
        let table = DispatchTable::builder("sqs")
            .operation("Boom", |inv: Invocation| async move {
                if inv.ctx.operation == "Boom" {
                    panic!("handler failure");
                }
                Ok::<_, HandlerError>(Params::new())
            })
            .build();
        let err = table.invoke(invocation("Boom")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Internal(_)));
    }

    #[tokio::test]
    async fn service_errors_pass_through_handlers() {
        let table = DispatchTable::builder("sqs")
            .operation("GetQueueUrl", |_inv: Invocation| async move {
                Err::<Params, _>(HandlerError::from(ServiceError::new(
                    "QueueDoesNotExist",
                    "no such queue",
                )))
            })
            .build();
        let err = table.invoke(invocation("GetQueueUrl")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Service(e) if e.code == "QueueDoesNotExist"));
    }

    struct Counter {
        hits: AtomicUsize,
    }

    #[tokio::test]
    async fn route_hands_the_provider_to_the_handler() {
        let provider = Arc::new(Counter { hits: AtomicUsize::new(0) });
        let table = DispatchTable::builder("sqs")
            .route("ListQueues", &provider, |p: Arc<Counter>, _inv| async move {
                p.hits.fetch_add(1, Ordering::SeqCst);
                Ok::<_, HandlerError>(Params::new())
            })
            .build();
        let service = DispatchService::new(Arc::new(table));
        service.clone().oneshot(invocation("ListQueues")).await.unwrap();
        service.oneshot(invocation("ListQueues")).await.unwrap();
        assert_eq!(provider.hits.load(Ordering::SeqCst), 2);
    }
}
