use crate::model::ServiceModel;
use crate::types::Params;

/// A named domain error raised by a service provider.
///
/// Carries only protocol-neutral information; each codec renders it into its
/// own canonical fault representation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ServiceError {
    /// Stable error code (`QueueDoesNotExist`, `ResourceNotFoundException`).
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// HTTP status code.
    pub status: u16,
    /// Whether the client is at fault (`Sender`) or the service (`Receiver`).
    pub sender_fault: bool,
    /// Additional members rendered next to code and message.
    pub fields: Params,
}

impl ServiceError {
    /// Client fault with status 400.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            status: 400,
            sender_fault: true,
            fields: Params::new(),
        }
    }

    /// Overrides the HTTP status. Statuses of 500 and above mark a service fault.
    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self.sender_fault = status < 500;
        self
    }

    /// Attaches an extra member to the fault body.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<crate::Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Builds the error declared by an exception shape of the model.
    ///
    /// The code comes from the shape's `error.code` (falling back to the shape
    /// name) and the status from `error.httpStatusCode` (falling back to 400).
    #[must_use]
    pub fn from_model(model: &ServiceModel, shape: &str, message: impl Into<String>) -> Self {
        let trait_ = model.shape(shape).and_then(|s| s.error.clone()).unwrap_or_default();
        let status = trait_.http_status_code.unwrap_or(400);
        Self {
            code: trait_.code.unwrap_or_else(|| shape.to_string()),
            message: message.into(),
            status,
            sender_fault: trait_.sender_fault || status < 500,
            fields: Params::new(),
        }
    }

    /// Fault type label used by XML fault bodies.
    #[must_use]
    pub fn fault_type(&self) -> &'static str {
        if self.sender_fault {
            "Sender"
        } else {
            "Receiver"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_status_flips_fault_side() {
        let err = ServiceError::new("Boom", "exploded").with_status(503);
        assert_eq!(err.fault_type(), "Receiver");
        assert_eq!(err.to_string(), "Boom: exploded");
    }

    #[test]
    fn from_model_reads_error_trait() {
        let model = ServiceModel::from_value(
            "sqs",
            serde_json::json!({
                "metadata": {"protocol": "query", "apiVersion": "2012-11-05", "endpointPrefix": "sqs"},
                "operations": {},
                "shapes": {
                    "QueueDoesNotExist": {
                        "type": "structure",
                        "members": {},
                        "exception": true,
                        "error": {"code": "AWS.SimpleQueueService.NonExistentQueue", "httpStatusCode": 400, "senderFault": true}
                    }
                }
            }),
        )
        .unwrap();

        let err = ServiceError::from_model(&model, "QueueDoesNotExist", "gone");
        assert_eq!(err.code, "AWS.SimpleQueueService.NonExistentQueue");
        assert_eq!(err.status, 400);
        assert!(err.sender_fault);

        let unknown = ServiceError::from_model(&model, "Nope", "x");
        assert_eq!(unknown.code, "Nope");
    }
}
