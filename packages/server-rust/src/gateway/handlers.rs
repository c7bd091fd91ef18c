//! Handlers of the default chain, in execution order.

use std::sync::Arc;

use async_trait::async_trait;
use http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_EXPOSE_HEADERS, ACCESS_CONTROL_MAX_AGE, ACCESS_CONTROL_REQUEST_HEADERS,
    ACCESS_CONTROL_REQUEST_METHOD,
};
use http::{HeaderName, Method, StatusCode};
use stratus_core::{Params, Protocol};
use tower::ServiceExt;

use super::chain::{ChainControl, Handler, HandlerChain};
use super::context::RequestContext;
use crate::codec::{CodecSet, EncodedResponse};
use crate::routing::{IdentificationError, RequestRouter};
use crate::service::{build_invocation_pipeline, GatewayError, Invocation, ServerConfig, ServiceRegistry};
use crate::storage::TenantValidator;

const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-amzn-requestid");
const S3_REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-amz-request-id");

const CORS_ALLOWED_METHODS: &str = "HEAD,GET,PUT,POST,DELETE,OPTIONS,PATCH";
const CORS_EXPOSED_HEADERS: &str = "etag,x-amz-version-id,x-amzn-requestid,x-amz-request-id";
const CORS_MAX_AGE_SECS: &str = "86400";

fn unresolved(what: &str) -> GatewayError {
    GatewayError::Internal(anyhow::anyhow!("{what} is not resolved"))
}

// ---------------------------------------------------------------------------
// Request phase
// ---------------------------------------------------------------------------

/// Answers CORS preflight requests without touching any service.
#[derive(Debug, Default)]
pub struct CorsPreflight;

#[async_trait]
impl Handler for CorsPreflight {
    fn name(&self) -> &'static str {
        "cors_preflight"
    }

    async fn handle(&self, ctx: &mut RequestContext, control: &mut ChainControl) -> Result<(), GatewayError> {
        if ctx.method() != Method::OPTIONS || !ctx.headers().contains_key(ACCESS_CONTROL_REQUEST_METHOD) {
            return Ok(());
        }
        let allow_headers = ctx
            .headers()
            .get(ACCESS_CONTROL_REQUEST_HEADERS)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("*")
            .to_string();
        let response = EncodedResponse::new(StatusCode::OK, "text/plain; charset=utf-8", "")
            .with_header(ACCESS_CONTROL_ALLOW_METHODS, CORS_ALLOWED_METHODS)
            .with_header(ACCESS_CONTROL_ALLOW_HEADERS, &allow_headers)
            .with_header(ACCESS_CONTROL_MAX_AGE, CORS_MAX_AGE_SECS);
        ctx.annotate("cors", "preflight");
        control.respond(response);
        Ok(())
    }
}

/// Attributes the request to a service.
#[derive(Debug)]
pub struct ServiceNameParser {
    router: Arc<RequestRouter>,
}

impl ServiceNameParser {
    #[must_use]
    pub fn new(router: Arc<RequestRouter>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl Handler for ServiceNameParser {
    fn name(&self) -> &'static str {
        "service_name_parser"
    }

    async fn handle(&self, ctx: &mut RequestContext, _control: &mut ChainControl) -> Result<(), GatewayError> {
        let identified = self.router.identify(&ctx.wire())?;
        tracing::trace!(
            request_id = %ctx.request_id(),
            service = %identified.service.name,
            signal = %identified.signal,
            "service identified"
        );
        ctx.set_service(identified.service, identified.signal)?;
        ctx.set_internal_params(identified.internal_params);
        Ok(())
    }
}

/// Extracts and validates account and region.
#[derive(Debug)]
pub struct TenantResolver {
    router: Arc<RequestRouter>,
    validator: TenantValidator,
}

impl TenantResolver {
    #[must_use]
    pub fn new(router: Arc<RequestRouter>, config: &ServerConfig) -> Self {
        Self {
            router,
            validator: TenantValidator::new(config.permissive_regions),
        }
    }
}

#[async_trait]
impl Handler for TenantResolver {
    fn name(&self) -> &'static str {
        "tenant_resolver"
    }

    async fn handle(&self, ctx: &mut RequestContext, _control: &mut ChainControl) -> Result<(), GatewayError> {
        let tenant = self.router.tenant(&ctx.wire());
        self.validator.validate(&tenant.account_id, &tenant.region)?;
        ctx.set_tenant(tenant)
    }
}

/// Resolves the operation and decodes its parameters.
#[derive(Debug)]
pub struct ServiceRequestParser {
    router: Arc<RequestRouter>,
    codecs: Arc<CodecSet>,
}

impl ServiceRequestParser {
    #[must_use]
    pub fn new(router: Arc<RequestRouter>, codecs: Arc<CodecSet>) -> Self {
        Self { router, codecs }
    }
}

#[async_trait]
impl Handler for ServiceRequestParser {
    fn name(&self) -> &'static str {
        "service_request_parser"
    }

    async fn handle(&self, ctx: &mut RequestContext, _control: &mut ChainControl) -> Result<(), GatewayError> {
        let service = Arc::clone(ctx.service().ok_or_else(|| unresolved("service"))?);
        let resolved = self.router.resolve_operation(&service, &ctx.wire())?;
        ctx.set_operation(resolved.name, resolved.path_params)?;

        let operation = ctx.operation().ok_or_else(|| {
            GatewayError::from(IdentificationError::UnknownOperation {
                service: service.name.clone(),
                operation: ctx.operation_name().unwrap_or_default().to_string(),
            })
        })?;
        let params = self.codecs.decode(&service, operation, &ctx.wire())?;
        ctx.set_params(params)
    }
}

/// Ensures the provider is running and invokes the operation.
pub struct ServiceDispatcher {
    registry: Arc<ServiceRegistry>,
    config: Arc<ServerConfig>,
}

impl ServiceDispatcher {
    #[must_use]
    pub fn new(registry: Arc<ServiceRegistry>, config: Arc<ServerConfig>) -> Self {
        Self { registry, config }
    }
}

#[async_trait]
impl Handler for ServiceDispatcher {
    fn name(&self) -> &'static str {
        "service_dispatcher"
    }

    async fn handle(&self, ctx: &mut RequestContext, _control: &mut ChainControl) -> Result<(), GatewayError> {
        let name = ctx.service().ok_or_else(|| unresolved("service"))?.name.clone();
        let active = self.registry.require(&name).await?;

        let invocation = Invocation {
            ctx: ctx.tenant_context()?,
            params: ctx.params().cloned().unwrap_or_default(),
        };
        let pipeline = build_invocation_pipeline(Arc::clone(&active.dispatch), &self.config);
        match pipeline.oneshot(invocation).await {
            Ok(output) => ctx.set_output(output),
            Err(GatewayError::Service(error)) => {
                ctx.capture_service_error(error.clone());
                Err(GatewayError::Service(error))
            }
            Err(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Response phase
// ---------------------------------------------------------------------------

/// Renders the operation output with the service's codec.
#[derive(Debug)]
pub struct ServiceResponseEncoder {
    codecs: Arc<CodecSet>,
}

impl ServiceResponseEncoder {
    #[must_use]
    pub fn new(codecs: Arc<CodecSet>) -> Self {
        Self { codecs }
    }
}

#[async_trait]
impl Handler for ServiceResponseEncoder {
    fn name(&self) -> &'static str {
        "service_response_encoder"
    }

    async fn handle(&self, ctx: &mut RequestContext, _control: &mut ChainControl) -> Result<(), GatewayError> {
        if ctx.response().is_some() {
            return Ok(());
        }
        let service = Arc::clone(ctx.service().ok_or_else(|| unresolved("service"))?);
        let operation = ctx.operation().ok_or_else(|| unresolved("operation"))?;
        let empty = Params::new();
        let output = ctx.output().unwrap_or(&empty);
        let response = self
            .codecs
            .get(service.protocol)
            .encode(&service, operation, output, ctx.request_id())?;
        ctx.set_response(response);
        Ok(())
    }
}

/// Request id and CORS headers on every response.
#[derive(Debug)]
pub struct CommonResponseHeaders {
    allow_origin: String,
}

impl CommonResponseHeaders {
    #[must_use]
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            allow_origin: config.cors_allow_origin.clone(),
        }
    }
}

#[async_trait]
impl Handler for CommonResponseHeaders {
    fn name(&self) -> &'static str {
        "common_response_headers"
    }

    async fn handle(&self, ctx: &mut RequestContext, _control: &mut ChainControl) -> Result<(), GatewayError> {
        let request_id = ctx.request_id().to_string();
        let rest_xml = ctx.protocol() == Some(Protocol::RestXml);
        let Some(response) = ctx.response_mut() else {
            return Ok(());
        };
        response.insert_header(REQUEST_ID_HEADER, &request_id);
        if rest_xml {
            response.insert_header(S3_REQUEST_ID_HEADER, &request_id);
        }
        if !self.allow_origin.is_empty() {
            response.insert_header(ACCESS_CONTROL_ALLOW_ORIGIN, &self.allow_origin);
            response.insert_header(ACCESS_CONTROL_EXPOSE_HEADERS, CORS_EXPOSED_HEADERS);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Exception phase
// ---------------------------------------------------------------------------

/// Logs the failure at a level matching its class.
#[derive(Debug, Default)]
pub struct ErrorLogger;

#[async_trait]
impl Handler for ErrorLogger {
    fn name(&self) -> &'static str {
        "error_logger"
    }

    async fn handle(&self, ctx: &mut RequestContext, control: &mut ChainControl) -> Result<(), GatewayError> {
        let Some(error) = control.error() else {
            return Ok(());
        };
        let request_id = ctx.request_id();
        let service = ctx.service().map_or("-", |s| s.name.as_str());
        let operation = ctx.operation_name().unwrap_or("-");
        match error {
            GatewayError::Internal(e) => {
                tracing::error!(request_id, service, operation, error = %format!("{e:#}"), "internal error");
            }
            GatewayError::Activation(_) | GatewayError::Timeout { .. } => {
                tracing::warn!(request_id, service, operation, error = %error, "request failed");
            }
            GatewayError::Service(e) => {
                tracing::debug!(request_id, service, operation, code = %e.code, "service error");
            }
            _ => {
                tracing::info!(request_id, service, operation, kind = error.kind(), error = %error, "request rejected");
            }
        }
        Ok(())
    }
}

/// Renders the failure as the protocol's fault representation.
///
/// Requests whose service was never identified use the configured default
/// protocol.
#[derive(Debug)]
pub struct ExceptionSerializer {
    codecs: Arc<CodecSet>,
    default_protocol: Protocol,
}

impl ExceptionSerializer {
    #[must_use]
    pub fn new(codecs: Arc<CodecSet>, config: &ServerConfig) -> Self {
        Self {
            codecs,
            default_protocol: config.default_protocol,
        }
    }
}

#[async_trait]
impl Handler for ExceptionSerializer {
    fn name(&self) -> &'static str {
        "exception_serializer"
    }

    async fn handle(&self, ctx: &mut RequestContext, control: &mut ChainControl) -> Result<(), GatewayError> {
        let Some(error) = control.error() else {
            return Ok(());
        };
        let protocol = ctx.protocol().unwrap_or(self.default_protocol);
        let fault = error.to_fault(protocol);
        let response = self
            .codecs
            .get(protocol)
            .encode_error(ctx.service().map(|s| &**s), &fault, ctx.request_id());
        ctx.annotate("error_code", fault.code);
        ctx.set_response(response);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Finalizers
// ---------------------------------------------------------------------------

/// One line per request.
#[derive(Debug, Default)]
pub struct RequestLogger;

#[async_trait]
impl Handler for RequestLogger {
    fn name(&self) -> &'static str {
        "request_logger"
    }

    async fn handle(&self, ctx: &mut RequestContext, _control: &mut ChainControl) -> Result<(), GatewayError> {
        let status = ctx.response().map_or(0, |r| r.status.as_u16());
        let duration_ms = u64::try_from(ctx.elapsed().as_millis()).unwrap_or(u64::MAX);
        let tenant = ctx.tenant();
        tracing::info!(
            request_id = %ctx.request_id(),
            method = %ctx.method(),
            path = %ctx.path(),
            service = ctx.service().map_or("-", |s| s.name.as_str()),
            operation = ctx.operation_name().unwrap_or("-"),
            account_id = tenant.map_or("-", |t| t.account_id.as_str()),
            region = tenant.map_or("-", |t| t.region.as_str()),
            error_code = ctx.trace().get("error_code").map_or("-", String::as_str),
            status,
            duration_ms,
            "request"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Default chain
// ---------------------------------------------------------------------------

impl HandlerChain {
    /// The gateway's standard chain.
    ///
    /// - request: CORS preflight, service, tenant, operation and params,
    ///   dispatch
    /// - response: encode output, common headers
    /// - exception: log, serialize fault, common headers
    /// - finalizers: request log
    #[must_use]
    pub fn default_chain(
        router: Arc<RequestRouter>,
        registry: Arc<ServiceRegistry>,
        codecs: Arc<CodecSet>,
        config: Arc<ServerConfig>,
    ) -> Self {
        let headers: Arc<dyn Handler> = Arc::new(CommonResponseHeaders::new(&config));
        HandlerChain::builder()
            .request(CorsPreflight)
            .request(ServiceNameParser::new(Arc::clone(&router)))
            .request(TenantResolver::new(Arc::clone(&router), &config))
            .request(ServiceRequestParser::new(router, Arc::clone(&codecs)))
            .request(ServiceDispatcher::new(registry, Arc::clone(&config)))
            .response(ServiceResponseEncoder::new(Arc::clone(&codecs)))
            .response_shared(Arc::clone(&headers))
            .exception(ErrorLogger)
            .exception(ExceptionSerializer::new(codecs, &config))
            .exception_shared(headers)
            .finalizer(RequestLogger)
            .build()
    }
}
