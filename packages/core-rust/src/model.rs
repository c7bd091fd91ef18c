//! Service and operation models loaded from botocore-style JSON documents.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::shape::{Shape, ShapeKind};

/// Wire-protocol family spoken by a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Form-encoded requests, XML responses (SQS, SNS, IAM, STS).
    Query,
    /// EC2 dialect of `Query`.
    Ec2,
    /// JSON RPC selected by `X-Amz-Target`.
    Json,
    /// REST bindings with JSON bodies.
    RestJson,
    /// REST bindings with XML bodies.
    RestXml,
    /// Smithy RPC v2 with CBOR bodies.
    SmithyRpcV2Cbor,
}

impl Protocol {
    /// Canonical protocol identifier as it appears in model metadata.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Ec2 => "ec2",
            Self::Json => "json",
            Self::RestJson => "rest-json",
            Self::RestXml => "rest-xml",
            Self::SmithyRpcV2Cbor => "smithy-rpc-v2-cbor",
        }
    }

    /// Whether operations are selected by method + URI template.
    #[must_use]
    pub fn is_rest(self) -> bool {
        matches!(self, Self::RestJson | Self::RestXml)
    }

    /// Whether requests are form-encoded with an `Action` field.
    #[must_use]
    pub fn is_query_family(self) -> bool {
        matches!(self, Self::Query | Self::Ec2)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "query" => Ok(Self::Query),
            "ec2" => Ok(Self::Ec2),
            "json" => Ok(Self::Json),
            "rest-json" => Ok(Self::RestJson),
            "rest-xml" => Ok(Self::RestXml),
            "smithy-rpc-v2-cbor" => Ok(Self::SmithyRpcV2Cbor),
            other => Err(CatalogError::UnknownProtocol(other.to_string())),
        }
    }
}

/// Errors raised while loading or validating a model document.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("invalid model document for {service}: {source}")]
    Document {
        service: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),
    #[error("{service}: shape {shape} references undefined shape {target}")]
    UnresolvedShape {
        service: String,
        shape: String,
        target: String,
    },
    #[error("{service}: operation {operation} uses {shape} as {role}, which is not a structure")]
    NotAStructure {
        service: String,
        operation: String,
        shape: String,
        role: &'static str,
    },
    #[error("duplicate service: {0}")]
    DuplicateService(String),
}

/// HTTP binding of an operation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpBinding {
    pub method: String,
    pub request_uri: String,
    pub response_code: Option<u16>,
}

impl Default for HttpBinding {
    fn default() -> Self {
        Self {
            method: "POST".to_string(),
            request_uri: "/".to_string(),
            response_code: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ShapeRef {
    shape: String,
    #[serde(rename = "resultWrapper")]
    result_wrapper: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawOperation {
    name: String,
    #[serde(default)]
    http: HttpBinding,
    input: Option<ShapeRef>,
    output: Option<ShapeRef>,
    #[serde(default)]
    errors: Vec<ShapeRef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMetadata {
    protocol: String,
    api_version: String,
    endpoint_prefix: String,
    signing_name: Option<String>,
    target_prefix: Option<String>,
    json_version: Option<String>,
    xml_namespace: Option<String>,
    service_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawModel {
    metadata: RawMetadata,
    operations: BTreeMap<String, RawOperation>,
    shapes: BTreeMap<String, Shape>,
}

/// Read-only description of one operation.
#[derive(Debug, Clone)]
pub struct OperationModel {
    pub name: String,
    pub http: HttpBinding,
    /// Input structure shape name, if the operation takes input.
    pub input: Option<String>,
    /// Output structure shape name, if the operation returns data.
    pub output: Option<String>,
    /// Query-protocol result element name (`CreateQueueResult`).
    pub result_wrapper: Option<String>,
    /// Exception shapes the operation may raise.
    pub errors: Vec<String>,
}

/// Service-level metadata.
#[derive(Debug, Clone)]
pub struct ServiceMetadata {
    pub api_version: String,
    pub endpoint_prefix: String,
    pub signing_name: String,
    pub target_prefix: Option<String>,
    pub json_version: Option<String>,
    pub xml_namespace: Option<String>,
    pub service_id: Option<String>,
}

/// Read-only description of a service: protocol, operations and shapes.
#[derive(Debug, Clone)]
pub struct ServiceModel {
    pub name: String,
    pub protocol: Protocol,
    pub metadata: ServiceMetadata,
    pub operations: BTreeMap<String, OperationModel>,
    pub shapes: BTreeMap<String, Shape>,
}

impl ServiceModel {
    /// Parses and validates a model document for the named service.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] when the document is malformed, names an
    /// unknown protocol, references undefined shapes, or binds a non-structure
    /// shape as an operation input or output.
    pub fn from_json(name: &str, document: &str) -> Result<Self, CatalogError> {
        let raw: RawModel =
            serde_json::from_str(document).map_err(|source| CatalogError::Document {
                service: name.to_string(),
                source,
            })?;
        Self::from_raw(name, raw)
    }

    /// Same as [`ServiceModel::from_json`] for an already-parsed document.
    ///
    /// # Errors
    ///
    /// See [`ServiceModel::from_json`].
    pub fn from_value(name: &str, document: serde_json::Value) -> Result<Self, CatalogError> {
        let raw: RawModel =
            serde_json::from_value(document).map_err(|source| CatalogError::Document {
                service: name.to_string(),
                source,
            })?;
        Self::from_raw(name, raw)
    }

    fn from_raw(name: &str, raw: RawModel) -> Result<Self, CatalogError> {
        let protocol: Protocol = raw.metadata.protocol.parse()?;
        let metadata = ServiceMetadata {
            signing_name: raw
                .metadata
                .signing_name
                .unwrap_or_else(|| raw.metadata.endpoint_prefix.clone()),
            api_version: raw.metadata.api_version,
            endpoint_prefix: raw.metadata.endpoint_prefix,
            target_prefix: raw.metadata.target_prefix,
            json_version: raw.metadata.json_version,
            xml_namespace: raw.metadata.xml_namespace,
            service_id: raw.metadata.service_id,
        };

        let operations = raw
            .operations
            .into_values()
            .map(|op| {
                let model = OperationModel {
                    result_wrapper: op.output.as_ref().and_then(|o| o.result_wrapper.clone()),
                    input: op.input.map(|i| i.shape),
                    output: op.output.map(|o| o.shape),
                    errors: op.errors.into_iter().map(|e| e.shape).collect(),
                    http: op.http,
                    name: op.name,
                };
                (model.name.clone(), model)
            })
            .collect();

        let model = Self {
            name: name.to_string(),
            protocol,
            metadata,
            operations,
            shapes: raw.shapes,
        };
        model.validate()?;
        Ok(model)
    }

    fn validate(&self) -> Result<(), CatalogError> {
        for (shape_name, shape) in &self.shapes {
            if let Some(target) = shape.references().find(|t| !self.shapes.contains_key(*t)) {
                return Err(CatalogError::UnresolvedShape {
                    service: self.name.clone(),
                    shape: shape_name.clone(),
                    target: target.to_string(),
                });
            }
        }

        for op in self.operations.values() {
            let bindings = [("input", &op.input), ("output", &op.output)];
            for (role, shape_name) in bindings {
                let Some(shape_name) = shape_name else { continue };
                match self.shapes.get(shape_name) {
                    None => {
                        return Err(CatalogError::UnresolvedShape {
                            service: self.name.clone(),
                            shape: op.name.clone(),
                            target: shape_name.clone(),
                        })
                    }
                    Some(s) if s.kind != ShapeKind::Structure => {
                        return Err(CatalogError::NotAStructure {
                            service: self.name.clone(),
                            operation: op.name.clone(),
                            shape: shape_name.clone(),
                            role,
                        })
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }

    /// Looks up an operation by name.
    #[must_use]
    pub fn operation(&self, name: &str) -> Option<&OperationModel> {
        self.operations.get(name)
    }

    /// Looks up a shape by name.
    #[must_use]
    pub fn shape(&self, name: &str) -> Option<&Shape> {
        self.shapes.get(name)
    }

    /// Input structure of the operation, if any.
    #[must_use]
    pub fn input_shape(&self, op: &OperationModel) -> Option<&Shape> {
        op.input.as_deref().and_then(|n| self.shape(n))
    }

    /// Output structure of the operation, if any.
    #[must_use]
    pub fn output_shape(&self, op: &OperationModel) -> Option<&Shape> {
        op.output.as_deref().and_then(|n| self.shape(n))
    }

    /// The `X-Amz-Target`/`Action` API version string.
    #[must_use]
    pub fn api_version(&self) -> &str {
        &self.metadata.api_version
    }
}
