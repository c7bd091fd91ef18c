//! `smithy-rpc-v2-cbor` protocol.

use std::collections::BTreeMap;

use ciborium::value::{Integer, Value as Cbor};
use http::header::HeaderName;
use http::StatusCode;
use stratus_core::{Member, OperationModel, Params, Protocol, ServiceError, ServiceModel, Shape, ShapeKind, Value};

use super::coerce::{self, Conformer, WireNames};
use super::{fault_status, Codec, DecodeError, EncodedResponse, WireRequest};

const CONTENT_TYPE: &str = "application/cbor";
static SMITHY_PROTOCOL: HeaderName = HeaderName::from_static("smithy-protocol");

/// CBOR tag for epoch-based date/time.
const EPOCH_TAG: u64 = 1;

/// Codec for Smithy RPC v2 with CBOR bodies.
#[derive(Debug, Clone, Copy)]
pub struct CborCodec {
    strict: bool,
}

impl CborCodec {
    #[must_use]
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }
}

impl Codec for CborCodec {
    fn protocol(&self) -> Protocol {
        Protocol::SmithyRpcV2Cbor
    }

    fn decode(
        &self,
        service: &ServiceModel,
        operation: &OperationModel,
        request: &WireRequest<'_>,
    ) -> Result<Params, DecodeError> {
        let document = if request.body.is_empty() {
            Value::Map(Params::new())
        } else {
            let cbor: Cbor = ciborium::de::from_reader(request.body)
                .map_err(|e| DecodeError::Parse(format!("invalid CBOR body: {e}")))?;
            if !cbor.is_map() {
                return Err(DecodeError::Parse("CBOR body must be a map".to_string()));
            }
            from_cbor(cbor)?
        };
        let Some(input) = operation.input.as_deref() else {
            return Ok(Params::new());
        };
        Conformer::new(service, WireNames::Member, self.strict).structure(input, document, "")
    }

    fn encode(
        &self,
        service: &ServiceModel,
        operation: &OperationModel,
        output: &Params,
        _request_id: &str,
    ) -> anyhow::Result<EncodedResponse> {
        let body = match service.output_shape(operation) {
            Some(shape) => structure_cbor(service, shape, output),
            None => Cbor::Map(Vec::new()),
        };
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&body, &mut bytes)?;
        Ok(EncodedResponse::new(StatusCode::OK, CONTENT_TYPE, bytes)
            .with_header(SMITHY_PROTOCOL.clone(), "rpc-v2-cbor"))
    }

    fn encode_error(
        &self,
        _service: Option<&ServiceModel>,
        fault: &ServiceError,
        _request_id: &str,
    ) -> EncodedResponse {
        let mut entries = vec![
            (Cbor::Text("__type".into()), Cbor::Text(fault.code.clone())),
            (Cbor::Text("message".into()), Cbor::Text(fault.message.clone())),
        ];
        entries.extend(
            fault
                .fields
                .iter()
                .map(|(k, v)| (Cbor::Text(k.clone()), untyped(v))),
        );
        let mut bytes = Vec::new();
        if let Err(e) = ciborium::ser::into_writer(&Cbor::Map(entries), &mut bytes) {
            tracing::error!(error = %e, "failed to encode CBOR fault");
        }
        EncodedResponse::new(fault_status(fault), CONTENT_TYPE, bytes)
            .with_header(SMITHY_PROTOCOL.clone(), "rpc-v2-cbor")
    }
}

// ---------------------------------------------------------------------------
// Conversion
// ---------------------------------------------------------------------------

fn from_cbor(cbor: Cbor) -> Result<Value, DecodeError> {
    Ok(match cbor {
        Cbor::Null => Value::Null,
        Cbor::Bool(b) => Value::Bool(b),
        Cbor::Integer(i) => {
            let wide = i128::from(i);
            Value::Integer(
                i64::try_from(wide)
                    .map_err(|_| DecodeError::Validation(format!("integer {wide} out of range")))?,
            )
        }
        Cbor::Float(f) => Value::Float(f),
        Cbor::Text(s) => Value::String(s),
        Cbor::Bytes(b) => Value::Blob(b),
        Cbor::Tag(EPOCH_TAG, inner) => {
            let secs = match *inner {
                #[allow(clippy::cast_precision_loss)]
                Cbor::Integer(i) => i128::from(i) as f64,
                Cbor::Float(f) => f,
                _ => return Err(DecodeError::Parse("tag 1 must wrap a number".to_string())),
            };
            coerce::epoch_to_datetime(secs)
                .map(Value::Timestamp)
                .ok_or_else(|| DecodeError::Validation(format!("timestamp {secs} out of range")))?
        }
        Cbor::Tag(_, inner) => from_cbor(*inner)?,
        Cbor::Array(items) => Value::List(items.into_iter().map(from_cbor).collect::<Result<_, _>>()?),
        Cbor::Map(entries) => {
            let mut out = BTreeMap::new();
            for (k, v) in entries {
                let Cbor::Text(key) = k else {
                    return Err(DecodeError::Parse("CBOR map keys must be text".to_string()));
                };
                out.insert(key, from_cbor(v)?);
            }
            Value::Map(out)
        }
        _ => return Err(DecodeError::Parse("unsupported CBOR item".to_string())),
    })
}

fn structure_cbor(service: &ServiceModel, shape: &Shape, params: &Params) -> Cbor {
    Cbor::Map(
        shape
            .members
            .iter()
            .filter_map(|(name, member)| {
                let value = params.get(name)?;
                Some((Cbor::Text(name.clone()), member_cbor(service, member, value)))
            })
            .collect(),
    )
}

fn member_cbor(service: &ServiceModel, member: &Member, value: &Value) -> Cbor {
    let Some(shape) = service.shape(&member.shape) else {
        return untyped(value);
    };
    match (shape.kind, value) {
        (ShapeKind::Structure, Value::Map(params)) => structure_cbor(service, shape, params),
        (ShapeKind::List, Value::List(items)) => Cbor::Array(
            items
                .iter()
                .map(|v| match shape.member.as_deref() {
                    Some(m) => member_cbor(service, m, v),
                    None => untyped(v),
                })
                .collect(),
        ),
        (ShapeKind::Map, Value::Map(entries)) => Cbor::Map(
            entries
                .iter()
                .map(|(k, v)| {
                    let rendered = match shape.value.as_deref() {
                        Some(m) => member_cbor(service, m, v),
                        None => untyped(v),
                    };
                    (Cbor::Text(k.clone()), rendered)
                })
                .collect(),
        ),
        _ => untyped(value),
    }
}

fn untyped(value: &Value) -> Cbor {
    match value {
        Value::Null => Cbor::Null,
        Value::Bool(b) => Cbor::Bool(*b),
        Value::Integer(i) => Cbor::Integer(Integer::from(*i)),
        Value::Float(f) => Cbor::Float(*f),
        Value::String(s) => Cbor::Text(s.clone()),
        Value::Blob(b) => Cbor::Bytes(b.clone()),
        Value::Timestamp(ts) => {
            let inner = if ts.timestamp_subsec_millis() == 0 {
                Cbor::Integer(Integer::from(ts.timestamp()))
            } else {
                Cbor::Float(coerce::epoch_seconds(ts))
            };
            Cbor::Tag(EPOCH_TAG, Box::new(inner))
        }
        Value::List(items) => Cbor::Array(items.iter().map(untyped).collect()),
        Value::Map(entries) => Cbor::Map(
            entries
                .iter()
                .map(|(k, v)| (Cbor::Text(k.clone()), untyped(v)))
                .collect(),
        ),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
