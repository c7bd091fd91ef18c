//! `rest-xml` protocol.

use stratus_core::{OperationModel, Params, Protocol, ServiceError, ServiceModel, ShapeKind};

use super::coerce::WireNames;
use super::xml::{self, XmlEncoder, XmlWriter};
use super::{fault_status, rest, Codec, DecodeError, EncodedResponse, WireRequest};

/// Codec for REST services with XML bodies.
#[derive(Debug, Clone, Copy)]
pub struct RestXmlCodec {
    strict: bool,
}

impl RestXmlCodec {
    #[must_use]
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }
}

fn namespace_attr(service: &ServiceModel) -> Vec<(String, String)> {
    service
        .metadata
        .xml_namespace
        .iter()
        .map(|ns| ("xmlns".to_string(), ns.clone()))
        .collect()
}

impl Codec for RestXmlCodec {
    fn protocol(&self) -> Protocol {
        Protocol::RestXml
    }

    fn decode(
        &self,
        service: &ServiceModel,
        operation: &OperationModel,
        request: &WireRequest<'_>,
    ) -> Result<Params, DecodeError> {
        let strict = self.strict;
        rest::decode(service, operation, request, strict, WireNames::Member, |shape, body| {
            let root = xml::parse(body)?;
            xml::structure_value(service, shape, &root, strict)
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
            return Ok(EncodedResponse::new(status, "application/xml", ""));
        };
        let encoder = XmlEncoder::new(service, "member");

        let mut response = if let Some((name, member)) = rest::payload_member(shape) {
            let target = service.shape(&member.shape);
            match (target, output.get(name)) {
                (Some(t), Some(value)) if matches!(t.kind, ShapeKind::Blob | ShapeKind::String) => {
                    EncodedResponse::new(
                        status,
                        "application/octet-stream",
                        rest::raw_payload(value).unwrap_or_default(),
                    )
                }
                (Some(t), Some(stratus_core::Value::Map(params))) => {
                    let root = member
                        .location_name
                        .as_deref()
                        .or(t.location_name.as_deref())
                        .unwrap_or(&member.shape);
                    let mut w = XmlWriter::new();
                    w.declaration();
                    encoder.structure(&mut w, root, t, params, &namespace_attr(service));
                    EncodedResponse::new(status, "application/xml", w.finish())
                }
                _ => EncodedResponse::new(status, "application/xml", ""),
            }
        } else if shape.members_at(None).next().is_some() {
            let root = shape
                .location_name
                .as_deref()
                .or(operation.output.as_deref())
                .unwrap_or(&operation.name);
            let mut w = XmlWriter::new();
            w.declaration();
            encoder.structure(&mut w, root, shape, output, &namespace_attr(service));
            EncodedResponse::new(status, "application/xml", w.finish())
        } else {
            EncodedResponse::new(status, "application/xml", "")
        };

        rest::encode_bindings(service, shape, output, &mut response);
        Ok(response)
    }

    fn encode_error(
        &self,
        _service: Option<&ServiceModel>,
        fault: &ServiceError,
        request_id: &str,
    ) -> EncodedResponse {
        EncodedResponse::new(
            fault_status(fault),
            "application/xml",
            xml::error_response(fault, request_id, None),
        )
    }
}

#[cfg(test)]
mod tests {
    use http::{Method, StatusCode};
    use serde_json::json;
    use stratus_core::Value;

    use super::*;
    use crate::codec::fixtures::{assert_echo_item, echo_model, model, OwnedRequest};
    use crate::codec::CodecSet;

    fn buckets() -> ServiceModel {
        model(
            "rest-xml",
            json!({
                "PutBucketTagging": {
                    "name": "PutBucketTagging",
                    "http": {"method": "PUT", "requestUri": "/{Bucket}?tagging"},
                    "input": {"shape": "PutBucketTaggingRequest"}
                },
                "ListBuckets": {
                    "name": "ListBuckets",
                    "http": {"method": "GET", "requestUri": "/"},
                    "output": {"shape": "ListBucketsOutput"}
                }
            }),
            json!({
                "PutBucketTaggingRequest": {
                    "type": "structure",
                    "required": ["Bucket", "Tagging"],
                    "members": {
                        "Bucket": {"shape": "String", "location": "uri", "locationName": "Bucket"},
                        "Tagging": {"shape": "Tagging", "locationName": "Tagging"}
                    },
                    "payload": "Tagging"
                },
                "Tagging": {
                    "type": "structure",
                    "required": ["TagSet"],
                    "members": {"TagSet": {"shape": "TagSet"}}
                },
                "TagSet": {"type": "list", "member": {"shape": "Tag", "locationName": "Tag"}},
                "Tag": {
                    "type": "structure",
                    "required": ["Key", "Value"],
                    "members": {"Key": {"shape": "String"}, "Value": {"shape": "String"}}
                },
                "ListBucketsOutput": {
                    "type": "structure",
                    "members": {
                        "Buckets": {"shape": "Buckets"},
                        "Owner": {"shape": "String"}
                    }
                },
                "Buckets": {"type": "list", "member": {"shape": "String", "locationName": "Bucket"}},
                "String": {"type": "string"}
            }),
        )
    }

    #[test]
    fn decodes_structure_payload() {
        let service = buckets();
        let op = service.operation("PutBucketTagging").unwrap();
        let mut req = OwnedRequest::post(
            "<Tagging><TagSet><Tag><Key>env</Key><Value>dev</Value></Tag></TagSet></Tagging>",
        );
        req.method = Method::PUT;
        req.path_params.insert("Bucket".into(), "b1".into());

        let params = CodecSet::new(false).decode(&service, op, &req.view()).unwrap();
        assert_eq!(params["Bucket"], Value::from("b1"));
        let tags = params["Tagging"].as_map().unwrap()["TagSet"].as_list().unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].as_map().unwrap()["Key"], Value::from("env"));
    }

    #[test]
    fn missing_nested_required_member_is_validation_error() {
        let service = buckets();
        let op = service.operation("PutBucketTagging").unwrap();
        let mut req = OwnedRequest::post("<Tagging><TagSet><Tag><Key>env</Key></Tag></TagSet></Tagging>");
        req.path_params.insert("Bucket".into(), "b1".into());
        let err = CodecSet::new(false).decode(&service, op, &req.view()).unwrap_err();
        assert!(matches!(err, DecodeError::Validation(m) if m.contains("Value")));
    }

    #[test]
    fn malformed_xml_is_parse_error() {
        let service = buckets();
        let op = service.operation("PutBucketTagging").unwrap();
        let mut req = OwnedRequest::post("<Tagging><TagSet>");
        req.path_params.insert("Bucket".into(), "b1".into());
        let err = RestXmlCodec::new(false).decode(&service, op, &req.view()).unwrap_err();
        assert!(matches!(err, DecodeError::Parse(_)));
    }

    #[test]
    fn encodes_output_with_empty_list_and_absent_member() {
        let service = buckets();
        let op = service.operation("ListBuckets").unwrap();
        let mut out = Params::new();
        out.insert("Buckets".into(), Value::List(vec![]));
        let resp = RestXmlCodec::new(false).encode(&service, op, &out, "rid").unwrap();
        assert_eq!(resp.status, StatusCode::OK);

        let root = xml::parse(&resp.body).unwrap();
        assert_eq!(root.name, "ListBucketsOutput");
        assert!(root.child("Buckets").unwrap().children.is_empty());
        assert!(root.child("Owner").is_none());
    }

    #[test]
    fn decoded_request_survives_encode_and_decode() {
        let service = echo_model("rest-xml");
        let op = service.operation("Echo").unwrap();
        let codec = RestXmlCodec::new(true);
        let mut req = OwnedRequest::post(
            "<Item><Name>widget</Name><Count>42</Count><Enabled>true</Enabled>\
             <Created>2024-01-01T00:00:00Z</Created>\
             <Tags><member>a</member><member>b</member></Tags>\
             <Owner><Id>o-1</Id></Owner></Item>",
        );
        req.headers.insert("x-amz-revision", http::HeaderValue::from_static("r7"));
        let decoded = codec.decode(&service, op, &req.view()).unwrap();
        assert_echo_item(&decoded);
        assert_eq!(decoded["Revision"], Value::from("r7"));

        let resp = codec.encode(&service, op, &decoded, "rid").unwrap();
        assert_eq!(resp.headers["x-amz-revision"], "r7");
        let root = xml::parse(&resp.body).unwrap();
        assert!(root.child("Note").is_none());
        assert!(root.child("Revision").is_none());
        let again = codec.decode(&service, op, &OwnedRequest::replay(&resp).view()).unwrap();
        assert_eq!(again, decoded);
    }

    #[test]
    fn fault_is_error_response_document() {
        let fault = ServiceError::new("NoSuchBucket", "The bucket does not exist").with_status(404);
        let resp = RestXmlCodec::new(false).encode_error(None, &fault, "rid-9");
        assert_eq!(resp.status, StatusCode::NOT_FOUND);
        let root = xml::parse(&resp.body).unwrap();
        assert_eq!(root.name, "ErrorResponse");
        assert_eq!(root.child("RequestId").unwrap().text, "rid-9");
    }
}
