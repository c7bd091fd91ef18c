//! Error taxonomy of the request pipeline and its mapping to client faults.

use stratus_core::{Protocol, ServiceError};

use crate::codec::DecodeError;
use crate::routing::IdentificationError;
use crate::service::dispatch::{DispatchError, HandlerError};
use crate::service::registry::ActivationError;
use crate::storage::{IdentifierKind, StoreError};

/// Message returned to clients for internal failures. Details stay in the logs.
pub const INTERNAL_ERROR_MESSAGE: &str = "An internal error occurred";

/// Every failure the gateway can raise while handling a request.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Target service or operation could not be resolved.
    #[error(transparent)]
    Identification(#[from] IdentificationError),
    /// The request body is well-formed but does not satisfy the input shape.
    #[error("validation failed: {0}")]
    Validation(String),
    /// The request body could not be parsed at all.
    #[error("malformed request: {0}")]
    Parse(String),
    /// The operation has no implementation and no fallback.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    /// A provider raised a named domain error.
    #[error(transparent)]
    Service(#[from] ServiceError),
    /// The provider could not be activated.
    #[error(transparent)]
    Activation(#[from] ActivationError),
    /// Account or region identifier rejected by the tenant store.
    #[error(transparent)]
    StoreIdentifier(#[from] StoreError),
    /// Activation wait or invocation exceeded its bound.
    #[error("{what} timed out after {timeout_ms}ms")]
    Timeout { what: String, timeout_ms: u64 },
    /// Anything unexpected.
    #[error("internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl From<DecodeError> for GatewayError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::Parse(msg) => Self::Parse(msg),
            DecodeError::Validation(msg) => Self::Validation(msg),
        }
    }
}

impl From<HandlerError> for GatewayError {
    fn from(err: HandlerError) -> Self {
        match err {
            HandlerError::Service(e) => Self::Service(e),
            HandlerError::Store(e) => Self::StoreIdentifier(e),
            HandlerError::Internal(e) => Self::Internal(e),
        }
    }
}

impl GatewayError {
    /// Short label used in logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Identification(_) => "identification",
            Self::Validation(_) => "validation",
            Self::Parse(_) => "parse",
            Self::Dispatch(_) => "dispatch",
            Self::Service(_) => "service",
            Self::Activation(_) => "activation",
            Self::StoreIdentifier(_) => "store_identifier",
            Self::Timeout { .. } => "timeout",
            Self::Internal(_) => "internal",
        }
    }

    /// Renders the error as the protocol-neutral fault a codec encodes.
    ///
    /// Codes are stable per error class; query-family protocols use the
    /// codes their services historically return. Internal failures never
    /// leak their cause.
    #[must_use]
    pub fn to_fault(&self, protocol: Protocol) -> ServiceError {
        let query = protocol.is_query_family();
        match self {
            Self::Identification(e) => match e {
                IdentificationError::UnknownService { .. } => {
                    ServiceError::new("UnknownService", e.to_string()).with_status(404)
                }
                _ => ServiceError::new(
                    if query { "InvalidAction" } else { "UnknownOperationException" },
                    e.to_string(),
                ),
            },
            Self::Validation(msg) => ServiceError::new(
                if query { "ValidationError" } else { "ValidationException" },
                msg.clone(),
            ),
            Self::Parse(msg) => ServiceError::new(
                match protocol {
                    Protocol::Query | Protocol::Ec2 => "MalformedQueryString",
                    Protocol::RestXml => "MalformedXML",
                    _ => "SerializationException",
                },
                msg.clone(),
            ),
            Self::Dispatch(e) => ServiceError::new("NotImplemented", e.to_string()).with_status(501),
            Self::Service(e) => e.clone(),
            Self::Activation(e) => {
                ServiceError::new("ServiceUnavailable", e.to_string()).with_status(503)
            }
            Self::StoreIdentifier(e) => ServiceError::new(
                match e.kind() {
                    IdentifierKind::Account => "InvalidClientTokenId",
                    IdentifierKind::Region => "InvalidRegion",
                },
                e.to_string(),
            ),
            Self::Timeout { .. } => {
                ServiceError::new("RequestTimeout", self.to_string()).with_status(504)
            }
            Self::Internal(_) => {
                ServiceError::new("InternalError", INTERNAL_ERROR_MESSAGE).with_status(500)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_codes_depend_on_protocol_family() {
        let err = GatewayError::Validation("missing QueueName".into());
        assert_eq!(err.to_fault(Protocol::Query).code, "ValidationError");
        assert_eq!(err.to_fault(Protocol::Json).code, "ValidationException");
        assert_eq!(err.to_fault(Protocol::RestXml).status, 400);
    }

    #[test]
    fn internal_errors_do_not_leak() {
        let err = GatewayError::Internal(anyhow::anyhow!("db password is hunter2"));
        let fault = err.to_fault(Protocol::Json);
        assert_eq!(fault.code, "InternalError");
        assert_eq!(fault.status, 500);
        assert!(!fault.message.contains("hunter2"));
    }

    #[test]
    fn dispatch_miss_is_501() {
        let err = GatewayError::Dispatch(DispatchError::NotImplemented {
            service: "sqs".into(),
            operation: "PurgeQueue".into(),
        });
        let fault = err.to_fault(Protocol::Query);
        assert_eq!(fault.status, 501);
        assert_eq!(fault.code, "NotImplemented");
        assert!(fault.message.contains("PurgeQueue"));
    }

    #[test]
    fn service_errors_pass_through() {
        let err = GatewayError::Service(ServiceError::new("QueueAlreadyExists", "taken"));
        let fault = err.to_fault(Protocol::Query);
        assert_eq!(fault.code, "QueueAlreadyExists");
        assert_eq!(fault.message, "taken");
    }

    #[test]
    fn decode_errors_keep_their_class() {
        let v: GatewayError = DecodeError::Validation("x".into()).into();
        let p: GatewayError = DecodeError::Parse("y".into()).into();
        assert_eq!(v.kind(), "validation");
        assert_eq!(p.kind(), "parse");
    }
}
