//! `rest-json` protocol.

use http::header::HeaderName;
use stratus_core::{OperationModel, Params, Protocol, ServiceError, ServiceModel, ShapeKind};

use super::coerce::WireNames;
use super::{fault_status, json, rest, Codec, DecodeError, EncodedResponse, WireRequest};

static ERROR_TYPE_HEADER: HeaderName = HeaderName::from_static("x-amzn-errortype");

/// Codec for REST services with JSON bodies.
#[derive(Debug, Clone, Copy)]
pub struct RestJsonCodec {
    strict: bool,
}

impl RestJsonCodec {
    #[must_use]
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }
}

impl Codec for RestJsonCodec {
    fn protocol(&self) -> Protocol {
        Protocol::RestJson
    }

    fn decode(
        &self,
        service: &ServiceModel,
        operation: &OperationModel,
        request: &WireRequest<'_>,
    ) -> Result<Params, DecodeError> {
        rest::decode(service, operation, request, self.strict, WireNames::Json, |_, body| {
            json::parse_document(body)
        })
    }

    fn encode(
        &self,
        service: &ServiceModel,
        operation: &OperationModel,
        output: &Params,
        _request_id: &str,
    ) -> anyhow::Result<EncodedResponse> {
        let status = rest::success_status(operation);
        let Some(shape) = service.output_shape(operation) else {
            return Ok(EncodedResponse::new(status, "application/json", "{}"));
        };

        let mut response = match rest::payload_member(shape) {
            Some((name, member)) => {
                let kind = service.shape(&member.shape).map(|s| s.kind);
                match (kind, output.get(name)) {
                    (Some(ShapeKind::Blob | ShapeKind::String), Some(value)) => EncodedResponse::new(
                        status,
                        "application/octet-stream",
                        rest::raw_payload(value).unwrap_or_default(),
                    ),
                    (_, Some(value)) => EncodedResponse::new(
                        status,
                        "application/json",
                        serde_json::to_vec(&json::member_json(service, member, value))?,
                    ),
                    (_, None) => EncodedResponse::new(status, "application/json", Vec::<u8>::new()),
                }
            }
            None => {
                let body = json::structure_object(service, shape, output, |m| m.in_body());
                EncodedResponse::new(
                    status,
                    "application/json",
                    serde_json::to_vec(&serde_json::Value::Object(body))?,
                )
            }
        };
        rest::encode_bindings(service, shape, output, &mut response);
        Ok(response)
    }

    fn encode_error(
        &self,
        _service: Option<&ServiceModel>,
        fault: &ServiceError,
        _request_id: &str,
    ) -> EncodedResponse {
        EncodedResponse::new(fault_status(fault), "application/json", json::fault_body(fault))
            .with_header(ERROR_TYPE_HEADER.clone(), &fault.code)
    }
}

#[cfg(test)]
mod tests {
    use http::{Method, StatusCode};
    use serde_json::json;
    use stratus_core::Value;

    use super::*;
    use crate::codec::fixtures::{assert_echo_item, echo_model, model, OwnedRequest};

    fn functions() -> ServiceModel {
        model(
            "rest-json",
            json!({
                "CreateFunction": {
                    "name": "CreateFunction",
                    "http": {"method": "POST", "requestUri": "/functions/{Name}", "responseCode": 201},
                    "input": {"shape": "CreateFunctionRequest"},
                    "output": {"shape": "FunctionConfig"}
                }
            }),
            json!({
                "CreateFunctionRequest": {
                    "type": "structure",
                    "required": ["Name", "Runtime"],
                    "members": {
                        "Name": {"shape": "String", "location": "uri", "locationName": "Name"},
                        "Runtime": {"shape": "String"},
                        "MemorySize": {"shape": "Integer"}
                    }
                },
                "FunctionConfig": {
                    "type": "structure",
                    "members": {
                        "FunctionName": {"shape": "String"},
                        "Version": {"shape": "String", "location": "header", "locationName": "x-amz-version"},
                        "Layers": {"shape": "Layers"}
                    }
                },
                "Layers": {"type": "list", "member": {"shape": "String"}},
                "String": {"type": "string"},
                "Integer": {"type": "integer"}
            }),
        )
    }

    #[test]
    fn decode_merges_uri_and_body() {
        let service = functions();
        let op = service.operation("CreateFunction").unwrap();
        let mut req = OwnedRequest::post(r#"{"Runtime":"python3.12","MemorySize":256}"#);
        req.method = Method::POST;
        req.path_params.insert("Name".into(), "fn1".into());
        let params = RestJsonCodec::new(false).decode(&service, op, &req.view()).unwrap();
        assert_eq!(params["Name"], Value::from("fn1"));
        assert_eq!(params["Runtime"], Value::from("python3.12"));
        assert_eq!(params["MemorySize"], Value::Integer(256));
    }

    #[test]
    fn encode_splits_headers_from_body() {
        let service = functions();
        let op = service.operation("CreateFunction").unwrap();
        let mut out = Params::new();
        out.insert("FunctionName".into(), "fn1".into());
        out.insert("Version".into(), "$LATEST".into());
        out.insert("Layers".into(), Value::List(vec![]));

        let resp = RestJsonCodec::new(false).encode(&service, op, &out, "rid").unwrap();
        assert_eq!(resp.status, StatusCode::CREATED);
        assert_eq!(resp.headers["x-amz-version"], "$LATEST");
        let body: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(body, json!({"FunctionName": "fn1", "Layers": []}));
    }

    #[test]
    fn decoded_request_survives_encode_and_decode() {
        let service = echo_model("rest-json");
        let op = service.operation("Echo").unwrap();
        let codec = RestJsonCodec::new(true);
        let mut req = OwnedRequest::post(
            r#"{"Name":"widget","Count":42,"Enabled":true,"Created":1704067200,
                "Tags":["a","b"],"Owner":{"Id":"o-1"}}"#,
        );
        req.headers.insert("x-amz-revision", http::HeaderValue::from_static("r7"));
        let decoded = codec.decode(&service, op, &req.view()).unwrap();
        assert_echo_item(&decoded);
        assert_eq!(decoded["Revision"], Value::from("r7"));

        let resp = codec.encode(&service, op, &decoded, "rid").unwrap();
        assert_eq!(resp.headers["x-amz-revision"], "r7");
        let body: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        assert!(body.get("Revision").is_none());
        assert!(body.get("Note").is_none());
        let again = codec.decode(&service, op, &OwnedRequest::replay(&resp).view()).unwrap();
        assert_eq!(again, decoded);
    }

    #[test]
    fn fault_carries_error_type_header() {
        let fault = ServiceError::new("ResourceNotFoundException", "missing").with_status(404);
        let resp = RestJsonCodec::new(false).encode_error(None, &fault, "rid");
        assert_eq!(resp.status, StatusCode::NOT_FOUND);
        assert_eq!(resp.headers["x-amzn-errortype"], "ResourceNotFoundException");
    }
}
