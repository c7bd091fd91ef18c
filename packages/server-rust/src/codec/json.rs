//! `json` protocol (`application/x-amz-json-1.0` / `1.1`).
//!
//! The JSON helpers here are shared with `rest-json`, whose bodies use the
//! same member naming and scalar rules.

use base64::Engine;
use http::StatusCode;
use serde_json::{Map, Number};
use stratus_core::{
    Member, OperationModel, Params, Protocol, ServiceError, ServiceModel, Shape, ShapeKind,
    TimestampFormat, Value,
};

use super::coerce::{self, Conformer, WireNames};
use super::{fault_status, Codec, DecodeError, EncodedResponse, WireRequest};

/// Codec for the `json` protocol family.
#[derive(Debug, Clone, Copy)]
pub struct JsonCodec {
    strict: bool,
}

impl JsonCodec {
    #[must_use]
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }
}

fn content_type(service: Option<&ServiceModel>) -> &'static str {
    match service.and_then(|s| s.metadata.json_version.as_deref()) {
        Some("1.1") => "application/x-amz-json-1.1",
        _ => "application/x-amz-json-1.0",
    }
}

impl Codec for JsonCodec {
    fn protocol(&self) -> Protocol {
        Protocol::Json
    }

    fn decode(
        &self,
        service: &ServiceModel,
        operation: &OperationModel,
        request: &WireRequest<'_>,
    ) -> Result<Params, DecodeError> {
        let document = parse_document(request.body)?;
        let Some(input) = operation.input.as_deref() else {
            return Ok(Params::new());
        };
        Conformer::new(service, WireNames::Json, self.strict).structure(input, document, "")
    }

    fn encode(
        &self,
        service: &ServiceModel,
        operation: &OperationModel,
        output: &Params,
        _request_id: &str,
    ) -> anyhow::Result<EncodedResponse> {
        let body = match service.output_shape(operation) {
            Some(shape) => structure_object(service, shape, output, |_| true),
            None => Map::new(),
        };
        let bytes = serde_json::to_vec(&serde_json::Value::Object(body))?;
        Ok(EncodedResponse::new(StatusCode::OK, content_type(Some(service)), bytes))
    }

    fn encode_error(
        &self,
        service: Option<&ServiceModel>,
        fault: &ServiceError,
        _request_id: &str,
    ) -> EncodedResponse {
        EncodedResponse::new(fault_status(fault), content_type(service), fault_body(fault))
    }
}

// ---------------------------------------------------------------------------
// Shared JSON helpers
// ---------------------------------------------------------------------------

/// Parses a JSON request body into an untyped tree. An empty body is `{}`.
///
/// # Errors
///
/// [`DecodeError::Parse`] when the body is not a JSON object.
pub(crate) fn parse_document(body: &[u8]) -> Result<Value, DecodeError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Map(Params::new()));
    }
    let json: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| DecodeError::Parse(format!("invalid JSON body: {e}")))?;
    if !json.is_object() {
        return Err(DecodeError::Parse("JSON body must be an object".to_string()));
    }
    Ok(Value::from_json(json))
}

/// `{"__type": code, "message": message, ...fields}` as bytes.
pub(crate) fn fault_body(fault: &ServiceError) -> Vec<u8> {
    let mut body = Map::new();
    body.insert("__type".into(), fault.code.clone().into());
    body.insert("message".into(), fault.message.clone().into());
    for (name, value) in &fault.fields {
        body.insert(name.clone(), untyped(value));
    }
    serde_json::to_vec(&serde_json::Value::Object(body)).unwrap_or_default()
}

/// Renders the members of a structure accepted by `include`.
pub(crate) fn structure_object(
    service: &ServiceModel,
    shape: &Shape,
    params: &Params,
    include: impl Fn(&Member) -> bool,
) -> Map<String, serde_json::Value> {
    let mut object = Map::new();
    for (name, member) in &shape.members {
        if !include(member) {
            continue;
        }
        let Some(value) = params.get(name) else { continue };
        let key = member.json_name.clone().unwrap_or_else(|| name.clone());
        object.insert(key, member_json(service, member, value));
    }
    object
}

/// Renders a value bound to `member`.
pub(crate) fn member_json(service: &ServiceModel, member: &Member, value: &Value) -> serde_json::Value {
    let Some(shape) = service.shape(&member.shape) else {
        return untyped(value);
    };
    match (shape.kind, value) {
        (ShapeKind::Structure, Value::Map(params)) => {
            serde_json::Value::Object(structure_object(service, shape, params, |_| true))
        }
        (ShapeKind::List, Value::List(items)) => match shape.member.as_deref() {
            Some(item) => items.iter().map(|v| member_json(service, item, v)).collect(),
            None => items.iter().map(untyped).collect(),
        },
        (ShapeKind::Map, Value::Map(entries)) => serde_json::Value::Object(
            entries
                .iter()
                .map(|(k, v)| {
                    let rendered = match shape.value.as_deref() {
                        Some(item) => member_json(service, item, v),
                        None => untyped(v),
                    };
                    (k.clone(), rendered)
                })
                .collect(),
        ),
        (ShapeKind::Timestamp, Value::Timestamp(ts)) => {
            match coerce::timestamp_format(service, member, TimestampFormat::UnixTimestamp) {
                TimestampFormat::UnixTimestamp => epoch_number(ts),
                other => coerce::format_timestamp(ts, other).into(),
            }
        }
        _ => untyped(value),
    }
}

/// Renders a value without shape guidance.
pub(crate) fn untyped(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => (*b).into(),
        Value::Integer(i) => (*i).into(),
        Value::Float(f) => Number::from_f64(*f).map_or_else(
            || coerce::scalar_text(value, TimestampFormat::UnixTimestamp).into(),
            serde_json::Value::Number,
        ),
        Value::String(s) => s.clone().into(),
        Value::Blob(bytes) => base64::engine::general_purpose::STANDARD.encode(bytes).into(),
        Value::Timestamp(ts) => epoch_number(ts),
        Value::List(items) => items.iter().map(untyped).collect(),
        Value::Map(entries) => serde_json::Value::Object(
            entries.iter().map(|(k, v)| (k.clone(), untyped(v))).collect(),
        ),
    }
}

fn epoch_number(ts: &chrono::DateTime<chrono::Utc>) -> serde_json::Value {
    if ts.timestamp_subsec_millis() == 0 {
        ts.timestamp().into()
    } else {
        Number::from_f64(coerce::epoch_seconds(ts)).map_or(serde_json::Value::Null, serde_json::Value::Number)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
