use std::sync::Arc;

use crate::model::ServiceModel;
use crate::types::Params;

/// Per-invocation context handed to service providers.
/// Carries the tenant scope, the resolved service/operation and tracing identity,
/// without exposing the raw HTTP request.
#[derive(Debug, Clone)]
pub struct TenantContext {
    /// Twelve-digit account identifier of the caller.
    pub account_id: String,
    /// Region the request is addressed to.
    pub region: String,
    /// Request identifier echoed in responses and logs.
    pub request_id: String,
    /// Model of the service being invoked.
    pub service: Arc<ServiceModel>,
    /// Name of the operation being invoked.
    pub operation: String,
    /// Parameters forwarded by an internal cross-service call, if any.
    pub internal_params: Option<Params>,
}

impl TenantContext {
    /// Fully qualified resource name for a resource of this service and tenant.
    #[must_use]
    pub fn arn(&self, resource: &str) -> String {
        format!(
            "arn:aws:{}:{}:{}:{}",
            self.service.metadata.signing_name, self.region, self.account_id, resource
        )
    }
}
