//! Request pipeline: one [`HandlerChain`] run per request over a mutable
//! [`RequestContext`].
//!
//! - [`context`]: per-request state with set-once resolution fields
//! - [`chain`]: the four-phase chain and its event stream
//! - [`handlers`]: the default handlers

use std::sync::Arc;

use stratus_core::Catalog;

pub mod chain;
pub mod context;
pub mod handlers;

pub use chain::{ChainControl, ChainEvent, Handler, HandlerChain, HandlerChainBuilder, Phase, Stage};
pub use context::RequestContext;

use crate::codec::{CodecSet, EncodedResponse};
use crate::routing::RequestRouter;
use crate::service::{Fallback, ProviderRegistry, ServerConfig, ServiceRegistry};

/// Everything needed to serve gateway requests, wired together.
pub struct Gateway {
    chain: HandlerChain,
    router: Arc<RequestRouter>,
    registry: Arc<ServiceRegistry>,
    config: Arc<ServerConfig>,
}

impl Gateway {
    /// Builds router, codecs, registry and the default chain.
    ///
    /// `fallback` is attached to the services listed in
    /// [`ServerConfig::fallback_services`].
    ///
    /// # Errors
    ///
    /// Fails when a provider declaration does not match the catalog or the
    /// configured variant is missing.
    pub fn new(
        catalog: Arc<dyn Catalog>,
        providers: &ProviderRegistry,
        config: ServerConfig,
        fallback: Option<Arc<dyn Fallback>>,
    ) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let router = Arc::new(RequestRouter::new(Arc::clone(&catalog), config.identification.clone()));
        let registry = Arc::new(ServiceRegistry::new(
            providers,
            catalog.as_ref(),
            Arc::clone(&config),
            fallback,
        )?);
        let codecs = Arc::new(CodecSet::new(config.strict_validation));
        let chain = HandlerChain::default_chain(
            Arc::clone(&router),
            Arc::clone(&registry),
            codecs,
            Arc::clone(&config),
        );
        tracing::debug!(chain = ?chain, "gateway chain assembled");
        Ok(Self {
            chain,
            router,
            registry,
            config,
        })
    }

    /// Runs the chain for one request.
    pub async fn handle(&self, ctx: &mut RequestContext) -> EncodedResponse {
        self.chain.run(ctx).await
    }

    #[must_use]
    pub fn chain(&self) -> &HandlerChain {
        &self.chain
    }

    #[must_use]
    pub fn router(&self) -> &Arc<RequestRouter> {
        &self.router
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::header::{AUTHORIZATION, CONTENT_TYPE};
    use http::{HeaderMap, HeaderValue, Method, StatusCode};
    use stratus_core::{Params, ServiceError, StaticCatalog, Value};

    use super::*;
    use crate::codec::xml;
    use crate::service::dispatch::{DispatchTable, HandlerError, Invocation};
    use crate::traits::{ServiceContext, ServiceProvider};

    const SQS_AUTH: &str = "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20240101/us-east-1/sqs/aws4_request, \
                            SignedHeaders=host, Signature=0000";

    /// Queue provider whose `CreateQueue` binding can be switched off.
    struct Queues {
        create: bool,
    }

    impl ServiceProvider for Queues {
        fn dispatch_table(self: Arc<Self>) -> DispatchTable {
            let mut builder = DispatchTable::builder("sqs");
            if self.create {
                builder = builder.operation("CreateQueue", |inv: Invocation| async move {
                    let name = inv.params["QueueName"].as_str().unwrap_or_default().to_string();
                    if name == "taken" {
                        return Err(HandlerError::from(ServiceError::from_model(
                            &inv.ctx.service,
                            "QueueNameExists",
                            "queue already exists",
                        )));
                    }
                    let url = format!("http://localhost:4566/{}/{name}", inv.ctx.account_id);
                    Ok(Params::from([("QueueUrl".to_string(), Value::String(url))]))
                });
            }
            builder.build()
        }
    }

    fn without_create(_ctx: &ServiceContext) -> anyhow::Result<Arc<dyn ServiceProvider>> {
        Ok(Arc::new(Queues { create: false }))
    }

    fn with_create(_ctx: &ServiceContext) -> anyhow::Result<Arc<dyn ServiceProvider>> {
        Ok(Arc::new(Queues { create: true }))
    }

    fn gateway(implemented: bool) -> Gateway {
        let catalog = StaticCatalog::from_documents([("sqs", include_str!("../../models/sqs.json"))]).unwrap();
        let mut providers = ProviderRegistry::new();
        if implemented {
            providers.register("sqs", "default", with_create);
        } else {
            providers.register("sqs", "default", without_create);
        }
        Gateway::new(Arc::new(catalog), &providers, ServerConfig::default(), None).unwrap()
    }

    fn sqs_request(body: &'static str, auth: &str) -> RequestContext {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/x-www-form-urlencoded"));
        headers.insert(AUTHORIZATION, HeaderValue::from_str(auth).unwrap());
        RequestContext::new("req-42", Method::POST, "/", "", headers, Bytes::from_static(body.as_bytes()))
    }

    fn error_code(response: &EncodedResponse) -> String {
        let root = xml::parse(&response.body).unwrap();
        root.child("Error").unwrap().child("Code").unwrap().text.clone()
    }

    #[tokio::test]
    async fn create_queue_unimplemented_then_implemented() {
        let body = "Action=CreateQueue&QueueName=test-queue&Version=2012-11-05";

        let missing = gateway(false);
        let response = missing.handle(&mut sqs_request(body, SQS_AUTH)).await;
        assert_eq!(response.status, StatusCode::NOT_IMPLEMENTED);
        assert_eq!(error_code(&response), "NotImplemented");

        let present = gateway(true);
        let mut ctx = sqs_request(body, SQS_AUTH);
        let response = present.handle(&mut ctx).await;
        assert_eq!(response.status, StatusCode::OK);
        let root = xml::parse(&response.body).unwrap();
        assert_eq!(root.name, "CreateQueueResponse");
        let url = &root.child("CreateQueueResult").unwrap().child("QueueUrl").unwrap().text;
        assert!(url.ends_with("/000000000000/test-queue"));
        assert_eq!(response.headers["x-amzn-requestid"], "req-42");
        assert_eq!(ctx.operation_name(), Some("CreateQueue"));
    }

    #[tokio::test]
    async fn missing_required_member_is_validation_error() {
        let response = gateway(true)
            .handle(&mut sqs_request("Action=CreateQueue&Version=2012-11-05", SQS_AUTH))
            .await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(error_code(&response), "ValidationError");
    }

    #[tokio::test]
    async fn service_errors_use_model_codes_and_are_captured() {
        let gateway = gateway(true);
        let mut ctx = sqs_request("Action=CreateQueue&QueueName=taken", SQS_AUTH);
        let response = gateway.handle(&mut ctx).await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(error_code(&response), "QueueAlreadyExists");
        assert_eq!(ctx.service_error().unwrap().code, "QueueAlreadyExists");
    }

    #[tokio::test]
    async fn unknown_action_is_invalid_action() {
        let response = gateway(true)
            .handle(&mut sqs_request("Action=ExplodeQueue", SQS_AUTH))
            .await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(error_code(&response), "InvalidAction");
    }

    #[tokio::test]
    async fn unknown_service_uses_default_protocol() {
        let mut ctx = RequestContext::new("r", Method::GET, "/nothing/here", "", HeaderMap::new(), Bytes::new());
        let response = gateway(true).handle(&mut ctx).await;
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert!(body.to_string().contains("UnknownService"));
    }

    #[tokio::test]
    async fn unknown_region_is_rejected_before_dispatch() {
        let auth = "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20240101/mars-north-1/sqs/aws4_request, \
                    SignedHeaders=host, Signature=0000";
        let gateway = gateway(true);
        let response = gateway
            .handle(&mut sqs_request("Action=CreateQueue&QueueName=q", auth))
            .await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(error_code(&response), "InvalidRegion");
        assert_eq!(
            gateway.registry().state("sqs"),
            Some(crate::service::ServiceState::Available)
        );
    }

    #[tokio::test]
    async fn cors_preflight_short_circuits() {
        let mut headers = HeaderMap::new();
        headers.insert("access-control-request-method", HeaderValue::from_static("POST"));
        headers.insert("access-control-request-headers", HeaderValue::from_static("authorization"));
        let mut ctx = RequestContext::new("r", Method::OPTIONS, "/", "", headers, Bytes::new());

        let gateway = gateway(true);
        let response = gateway.handle(&mut ctx).await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.headers["access-control-allow-origin"], "*");
        assert_eq!(response.headers["access-control-allow-headers"], "authorization");
        assert!(ctx.service().is_none());
        assert_eq!(
            gateway.registry().state("sqs"),
            Some(crate::service::ServiceState::Available)
        );
    }
}
