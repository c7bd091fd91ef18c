//! HTTP bindings shared by `rest-json` and `rest-xml`: URI labels, query
//! string, headers, status code and payload members.

use std::collections::{BTreeMap, BTreeSet};

use http::header::HeaderName;
use http::StatusCode;
use stratus_core::{Location, Member, OperationModel, Params, ServiceModel, Shape, ShapeKind, TimestampFormat, Value};

use super::coerce::{self, Conformer, WireNames};
use super::{DecodeError, EncodedResponse, WireRequest};

/// Name and binding of the member carried as the whole HTTP body, if any.
pub(crate) fn payload_member<'a>(shape: &'a Shape) -> Option<(&'a String, &'a Member)> {
    let name = shape.payload.as_deref()?;
    shape.members.get_key_value(name)
}

fn binding_name<'a>(name: &'a str, member: &'a Member) -> &'a str {
    member.location_name.as_deref().unwrap_or(name)
}

/// Decodes a REST request: bound members first, then the body.
///
/// `parse_body` turns a non-empty body into an untyped tree for the given
/// structure shape; `names` selects how body member names appear.
///
/// # Errors
///
/// Propagates body parse failures and coercion failures of any binding.
pub(crate) fn decode(
    service: &ServiceModel,
    operation: &OperationModel,
    request: &WireRequest<'_>,
    strict: bool,
    names: WireNames,
    parse_body: impl Fn(&Shape, &[u8]) -> Result<Value, DecodeError>,
) -> Result<Params, DecodeError> {
    let Some(input_name) = operation.input.as_deref() else {
        return Ok(Params::new());
    };
    let Some(input) = service.shape(input_name) else {
        return Ok(Params::new());
    };

    let bound = Value::Map(bindings(service, input, request));
    let mut params = Conformer::new(service, WireNames::Member, false).structure(input_name, bound, "")?;

    let body_conformer = Conformer::new(service, names, strict);
    let has_body = !request.body.iter().all(u8::is_ascii_whitespace);
    if let Some((name, member)) = payload_member(input) {
        let target = service.shape(&member.shape);
        match target.map(|s| s.kind) {
            Some(ShapeKind::Blob) => {
                params.insert(name.clone(), Value::Blob(request.body.to_vec()));
            }
            Some(ShapeKind::String) => {
                params.insert(
                    name.clone(),
                    Value::String(String::from_utf8_lossy(request.body).into_owned()),
                );
            }
            Some(ShapeKind::Structure) if has_body => {
                let Some(target) = target else { return Ok(params) };
                let doc = parse_body(target, request.body)?;
                let value = body_conformer.structure(&member.shape, doc, name)?;
                params.insert(name.clone(), Value::Map(value));
            }
            _ => {}
        }
    } else if has_body {
        let doc = parse_body(input, request.body)?;
        let body = body_conformer.structure(input_name, doc, "")?;
        for (name, value) in body {
            if input.members.get(&name).is_some_and(Member::in_body) {
                params.insert(name, value);
            }
        }
    }
    Ok(params)
}

/// Collects URI, query string and header bound members as untyped values.
fn bindings(service: &ServiceModel, input: &Shape, request: &WireRequest<'_>) -> Params {
    let mut out = Params::new();
    let query = request.query_pairs();
    let mut claimed_query: BTreeSet<&str> = BTreeSet::new();

    for (name, member) in &input.members {
        let Some(location) = member.location else { continue };
        let wire = binding_name(name, member);
        let kind = service.shape(&member.shape).map(|s| s.kind);
        match location {
            Location::Uri => {
                if let Some(v) = request.path_params.get(wire) {
                    out.insert(name.clone(), Value::String(v.clone()));
                }
            }
            Location::Querystring if kind != Some(ShapeKind::Map) => {
                claimed_query.insert(wire);
                let values: Vec<Value> = query
                    .iter()
                    .filter(|(k, _)| k == wire)
                    .map(|(_, v)| Value::String(v.clone()))
                    .collect();
                if values.is_empty() {
                    continue;
                }
                let value = if kind == Some(ShapeKind::List) {
                    Value::List(values)
                } else {
                    values.into_iter().next().unwrap_or(Value::Null)
                };
                out.insert(name.clone(), value);
            }
            Location::Header => {
                let Some(raw) = request.header(wire) else { continue };
                let value = if kind == Some(ShapeKind::List) {
                    Value::List(
                        raw.split(',')
                            .map(|s| Value::String(s.trim().to_string()))
                            .collect(),
                    )
                } else {
                    Value::String(raw.to_string())
                };
                out.insert(name.clone(), value);
            }
            Location::Headers => {
                let prefix = wire.to_ascii_lowercase();
                let entries: BTreeMap<String, Value> = request
                    .headers
                    .iter()
                    .filter_map(|(k, v)| {
                        let key = k.as_str().strip_prefix(prefix.as_str())?;
                        Some((key.to_string(), Value::String(v.to_str().ok()?.to_string())))
                    })
                    .collect();
                if !entries.is_empty() {
                    out.insert(name.clone(), Value::Map(entries));
                }
            }
            Location::Querystring | Location::StatusCode => {}
        }
    }

    // A map bound to the query string collects every parameter no other
    // member claims.
    if let Some((name, _)) = input.members.iter().find(|(_, m)| {
        m.location == Some(Location::Querystring)
            && service.shape(&m.shape).map(|s| s.kind) == Some(ShapeKind::Map)
    }) {
        let entries: BTreeMap<String, Value> = query
            .iter()
            .filter(|(k, _)| !claimed_query.contains(k.as_str()))
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        if !entries.is_empty() {
            out.insert(name.clone(), Value::Map(entries));
        }
    }
    out
}

/// Applies status-code and header bound output members to `response`.
pub(crate) fn encode_bindings(
    service: &ServiceModel,
    output: &Shape,
    params: &Params,
    response: &mut EncodedResponse,
) {
    for (name, member) in &output.members {
        let (Some(location), Some(value)) = (member.location, params.get(name)) else {
            continue;
        };
        let wire = binding_name(name, member);
        match location {
            Location::StatusCode => {
                if let Some(status) = value
                    .as_i64()
                    .and_then(|s| u16::try_from(s).ok())
                    .and_then(|s| StatusCode::from_u16(s).ok())
                {
                    response.status = status;
                }
            }
            Location::Header => {
                let Ok(header) = HeaderName::try_from(wire) else { continue };
                let format = coerce::timestamp_format(service, member, TimestampFormat::Rfc822);
                let text = match value {
                    Value::List(items) => items
                        .iter()
                        .map(|v| coerce::scalar_text(v, format))
                        .collect::<Vec<_>>()
                        .join(", "),
                    other => coerce::scalar_text(other, format),
                };
                response.insert_header(header, &text);
            }
            Location::Headers => {
                let Some(entries) = value.as_map() else { continue };
                for (key, v) in entries {
                    let Ok(header) = HeaderName::try_from(format!("{wire}{key}")) else {
                        continue;
                    };
                    response.insert_header(header, &coerce::scalar_text(v, TimestampFormat::Rfc822));
                }
            }
            Location::Querystring | Location::Uri => {}
        }
    }
}

/// Success status of an operation.
pub(crate) fn success_status(operation: &OperationModel) -> StatusCode {
    operation
        .http
        .response_code
        .and_then(|c| StatusCode::from_u16(c).ok())
        .unwrap_or(StatusCode::OK)
}

/// Raw body of a blob or string payload value.
pub(crate) fn raw_payload(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::Blob(bytes) => Some(bytes.clone()),
        Value::String(s) => Some(s.clone().into_bytes()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
