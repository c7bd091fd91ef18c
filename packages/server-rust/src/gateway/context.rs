//! Per-request state threaded through the handler chain.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderMap, Method};
use stratus_core::{OperationModel, Params, Protocol, ServiceError, ServiceModel, TenantContext};

use crate::codec::{EncodedResponse, WireRequest};
use crate::routing::{Signal, Tenant};
use crate::service::GatewayError;

/// Mutable state of one request.
///
/// Resolved fields are set at most once: a setter given a value different
/// from the one already recorded fails with an internal error instead of
/// silently replacing it.
#[derive(Debug)]
pub struct RequestContext {
    request_id: String,
    method: Method,
    path: String,
    query: String,
    headers: HeaderMap,
    body: Bytes,
    started: Instant,

    service: Option<Arc<ServiceModel>>,
    signal: Option<Signal>,
    operation: Option<String>,
    path_params: BTreeMap<String, String>,
    tenant: Option<Tenant>,
    params: Option<Params>,
    internal_params: Option<Params>,
    output: Option<Params>,
    service_error: Option<ServiceError>,
    response: Option<EncodedResponse>,
    trace: BTreeMap<&'static str, String>,
}

impl RequestContext {
    /// Wraps the raw request parts. `query` excludes the leading `?`.
    #[must_use]
    pub fn new(
        request_id: impl Into<String>,
        method: Method,
        path: impl Into<String>,
        query: impl Into<String>,
        headers: HeaderMap,
        body: Bytes,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            method,
            path: path.into(),
            query: query.into(),
            headers,
            body,
            started: Instant::now(),
            service: None,
            signal: None,
            operation: None,
            path_params: BTreeMap::new(),
            tenant: None,
            params: None,
            internal_params: None,
            output: None,
            service_error: None,
            response: None,
            trace: BTreeMap::new(),
        }
    }

    // -- raw request --------------------------------------------------------

    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn query(&self) -> &str {
        &self.query
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// `Host` header, if present and valid text.
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        self.headers.get(http::header::HOST).and_then(|v| v.to_str().ok())
    }

    /// Time since the context was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Codec view of the request, including resolved path parameters.
    #[must_use]
    pub fn wire(&self) -> WireRequest<'_> {
        WireRequest {
            method: &self.method,
            path: &self.path,
            query: &self.query,
            headers: &self.headers,
            body: &self.body,
            path_params: &self.path_params,
        }
    }

    // -- resolution ---------------------------------------------------------

    #[must_use]
    pub fn service(&self) -> Option<&Arc<ServiceModel>> {
        self.service.as_ref()
    }

    /// Protocol of the resolved service.
    #[must_use]
    pub fn protocol(&self) -> Option<Protocol> {
        self.service.as_ref().map(|s| s.protocol)
    }

    /// Signal that identified the service.
    #[must_use]
    pub fn signal(&self) -> Option<Signal> {
        self.signal
    }

    /// Records the target service.
    ///
    /// # Errors
    ///
    /// Internal error when a different service was already resolved.
    pub fn set_service(&mut self, service: Arc<ServiceModel>, signal: Signal) -> Result<(), GatewayError> {
        if let Some(existing) = &self.service {
            if existing.name != service.name {
                return Err(conflict("service", &existing.name, &service.name));
            }
            return Ok(());
        }
        self.trace.insert("service", service.name.clone());
        self.service = Some(service);
        self.signal = Some(signal);
        Ok(())
    }

    /// Name of the resolved operation.
    #[must_use]
    pub fn operation_name(&self) -> Option<&str> {
        self.operation.as_deref()
    }

    /// Model of the resolved operation.
    #[must_use]
    pub fn operation(&self) -> Option<&OperationModel> {
        let name = self.operation.as_deref()?;
        self.service.as_ref()?.operation(name)
    }

    /// Records the operation and its path parameters. The operation cannot
    /// change once set.
    ///
    /// # Errors
    ///
    /// Internal error when a different operation was already resolved, or
    /// no service is resolved yet.
    pub fn set_operation(
        &mut self,
        operation: impl Into<String>,
        path_params: BTreeMap<String, String>,
    ) -> Result<(), GatewayError> {
        let operation = operation.into();
        if let Some(existing) = &self.operation {
            if *existing != operation {
                return Err(conflict("operation", existing, &operation));
            }
            return Ok(());
        }
        if self.service.is_none() {
            return Err(GatewayError::Internal(anyhow::anyhow!(
                "operation {operation} resolved before its service"
            )));
        }
        self.trace.insert("operation", operation.clone());
        self.operation = Some(operation);
        self.path_params = path_params;
        Ok(())
    }

    #[must_use]
    pub fn path_params(&self) -> &BTreeMap<String, String> {
        &self.path_params
    }

    #[must_use]
    pub fn tenant(&self) -> Option<&Tenant> {
        self.tenant.as_ref()
    }

    /// # Errors
    ///
    /// Internal error when a different tenant was already resolved.
    pub fn set_tenant(&mut self, tenant: Tenant) -> Result<(), GatewayError> {
        set_once("tenant", &mut self.tenant, tenant, |t| format!("{}/{}", t.account_id, t.region))?;
        Ok(())
    }

    #[must_use]
    pub fn params(&self) -> Option<&Params> {
        self.params.as_ref()
    }

    /// # Errors
    ///
    /// Internal error when different parameters were already decoded.
    pub fn set_params(&mut self, params: Params) -> Result<(), GatewayError> {
        set_once("params", &mut self.params, params, |p| format!("{} members", p.len()))
    }

    #[must_use]
    pub fn internal_params(&self) -> Option<&Params> {
        self.internal_params.as_ref()
    }

    /// Parameters forwarded by an internal cross-service call.
    pub fn set_internal_params(&mut self, params: Option<Params>) {
        if params.is_some() {
            self.internal_params = params;
        }
    }

    // -- outcome ------------------------------------------------------------

    /// Operation output.
    #[must_use]
    pub fn output(&self) -> Option<&Params> {
        self.output.as_ref()
    }

    /// # Errors
    ///
    /// Internal error when a different output was already recorded.
    pub fn set_output(&mut self, output: Params) -> Result<(), GatewayError> {
        set_once("response", &mut self.output, output, |p| format!("{} members", p.len()))
    }

    /// Domain error raised by the provider.
    #[must_use]
    pub fn service_error(&self) -> Option<&ServiceError> {
        self.service_error.as_ref()
    }

    pub fn capture_service_error(&mut self, error: ServiceError) {
        self.service_error = Some(error);
    }

    /// HTTP response rendered so far.
    #[must_use]
    pub fn response(&self) -> Option<&EncodedResponse> {
        self.response.as_ref()
    }

    pub fn response_mut(&mut self) -> Option<&mut EncodedResponse> {
        self.response.as_mut()
    }

    /// Installs the HTTP response, replacing any earlier rendering.
    pub fn set_response(&mut self, response: EncodedResponse) {
        self.response = Some(response);
    }

    pub fn take_response(&mut self) -> Option<EncodedResponse> {
        self.response.take()
    }

    // -- trace metadata -----------------------------------------------------

    pub fn annotate(&mut self, key: &'static str, value: impl Into<String>) {
        self.trace.insert(key, value.into());
    }

    #[must_use]
    pub fn trace(&self) -> &BTreeMap<&'static str, String> {
        &self.trace
    }

    /// Context handed to providers.
    ///
    /// # Errors
    ///
    /// Internal error when service, operation or tenant are unresolved.
    pub fn tenant_context(&self) -> Result<TenantContext, GatewayError> {
        let (Some(service), Some(operation), Some(tenant)) = (&self.service, &self.operation, &self.tenant) else {
            return Err(GatewayError::Internal(anyhow::anyhow!(
                "request {} is not fully resolved",
                self.request_id
            )));
        };
        Ok(TenantContext {
            account_id: tenant.account_id.clone(),
            region: tenant.region.clone(),
            request_id: self.request_id.clone(),
            service: Arc::clone(service),
            operation: operation.clone(),
            internal_params: self.internal_params.clone(),
        })
    }
}

fn conflict(field: &str, existing: &str, new: &str) -> GatewayError {
    GatewayError::Internal(anyhow::anyhow!(
        "refusing to change resolved {field} from {existing} to {new}"
    ))
}

fn set_once<T: PartialEq>(
    field: &str,
    slot: &mut Option<T>,
    value: T,
    describe: impl Fn(&T) -> String,
) -> Result<(), GatewayError> {
    match slot {
        Some(existing) if *existing != value => Err(conflict(field, &describe(existing), &describe(&value))),
        Some(_) => Ok(()),
        None => {
            *slot = Some(value);
            Ok(())
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use serde_json::json;
    use stratus_core::Value;

    use super::*;

    pub(crate) fn model(name: &str) -> Arc<ServiceModel> {
        Arc::new(
            ServiceModel::from_value(
                name,
                json!({
                    "metadata": {"protocol": "query", "apiVersion": "2012-11-05", "endpointPrefix": name},
                    "operations": {"CreateQueue": {"name": "CreateQueue"}},
                    "shapes": {}
                }),
            )
            .unwrap(),
        )
    }

    fn ctx() -> RequestContext {
        RequestContext::new("req-1", Method::POST, "/", "", HeaderMap::new(), Bytes::new())
    }

    #[test]
    fn service_cannot_change_once_resolved() {
        let mut ctx = ctx();
        ctx.set_service(model("sqs"), Signal::TargetHeader).unwrap();
        ctx.set_service(model("sqs"), Signal::VirtualHost).unwrap();
        assert_eq!(ctx.signal(), Some(Signal::TargetHeader));
        let err = ctx.set_service(model("sns"), Signal::TargetHeader).unwrap_err();
        assert!(matches!(err, GatewayError::Internal(_)));
        assert_eq!(ctx.service().unwrap().name, "sqs");
    }

    #[test]
    fn operation_is_immutable_and_needs_a_service() {
        let mut ctx = ctx();
        assert!(ctx.set_operation("CreateQueue", BTreeMap::new()).is_err());
        ctx.set_service(model("sqs"), Signal::TargetHeader).unwrap();
        ctx.set_operation("CreateQueue", BTreeMap::new()).unwrap();
        assert!(ctx.set_operation("DeleteQueue", BTreeMap::new()).is_err());
        assert_eq!(ctx.operation().unwrap().name, "CreateQueue");
    }

    #[test]
    fn params_and_output_are_monotonic() {
        let mut ctx = ctx();
        let params = Params::from([("QueueName".to_string(), Value::String("q".into()))]);
        ctx.set_params(params.clone()).unwrap();
        ctx.set_params(params).unwrap();
        assert!(ctx.set_params(Params::new()).is_err());

        ctx.set_output(Params::new()).unwrap();
        assert!(ctx.set_output(Params::from([("X".to_string(), Value::Bool(true))])).is_err());
    }

    #[test]
    fn tenant_context_requires_full_resolution() {
        let mut ctx = ctx();
        assert!(ctx.tenant_context().is_err());
        ctx.set_service(model("sqs"), Signal::TargetHeader).unwrap();
        ctx.set_operation("CreateQueue", BTreeMap::new()).unwrap();
        ctx.set_tenant(Tenant { account_id: "000000000000".into(), region: "us-east-1".into() })
            .unwrap();
        let tenant = ctx.tenant_context().unwrap();
        assert_eq!(tenant.operation, "CreateQueue");
        assert_eq!(tenant.request_id, "req-1");
        assert!(ctx
            .set_tenant(Tenant { account_id: "111111111111".into(), region: "us-east-1".into() })
            .is_err());
    }
}
