//! `query` and `ec2` protocols: form-encoded requests, XML responses.

use std::collections::{BTreeMap, BTreeSet};

use stratus_core::{Member, OperationModel, Params, Protocol, ServiceError, ServiceModel, Shape, ShapeKind, Value};

use super::coerce::{Conformer, WireNames};
use super::xml::{self, XmlEncoder, XmlWriter};
use super::{fault_status, Codec, DecodeError, EncodedResponse, WireRequest};

/// Form keys that are part of the envelope rather than the input shape.
const ENVELOPE_KEYS: &[&str] = &["Action", "Version"];

/// The two dialects of the form-encoded protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryDialect {
    /// `Member.member.N` lists, `<OpResult>` wrapped responses.
    Query,
    /// `Member.N` lists, `queryName` keys, unwrapped responses.
    Ec2,
}

/// Codec for the form-encoded protocol family.
#[derive(Debug, Clone, Copy)]
pub struct QueryCodec {
    dialect: QueryDialect,
    strict: bool,
}

impl QueryCodec {
    #[must_use]
    pub fn new(dialect: QueryDialect, strict: bool) -> Self {
        Self { dialect, strict }
    }
}

/// Form pairs from the query string and a urlencoded body; body keys win.
#[must_use]
pub fn form_pairs(request: &WireRequest<'_>) -> BTreeMap<String, String> {
    let mut pairs: BTreeMap<String, String> = request.query_pairs().into_iter().collect();
    pairs.extend(form_urlencoded::parse(request.body).into_owned());
    pairs
}

impl Codec for QueryCodec {
    fn protocol(&self) -> Protocol {
        match self.dialect {
            QueryDialect::Query => Protocol::Query,
            QueryDialect::Ec2 => Protocol::Ec2,
        }
    }

    fn decode(
        &self,
        service: &ServiceModel,
        operation: &OperationModel,
        request: &WireRequest<'_>,
    ) -> Result<Params, DecodeError> {
        if std::str::from_utf8(request.body).is_err() {
            return Err(DecodeError::Parse("form body is not UTF-8".to_string()));
        }
        let pairs = form_pairs(request);
        let Some(input_name) = operation.input.as_deref() else {
            return Ok(Params::new());
        };
        let Some(input) = service.shape(input_name) else {
            return Ok(Params::new());
        };

        let mut walker = FormWalker {
            service,
            dialect: self.dialect,
            pairs: &pairs,
            used: BTreeSet::new(),
        };
        let tree = walker.structure(input, "");

        if self.strict {
            let unknown = pairs.keys().find(|k| {
                !walker.used.contains(k.as_str())
                    && !ENVELOPE_KEYS.contains(&k.as_str())
                    && !k.starts_with("X-Amz-")
                    && !k.starts_with("AWSAccessKeyId")
            });
            if let Some(key) = unknown {
                return Err(DecodeError::Validation(format!("unknown parameter '{key}'")));
            }
        }

        Conformer::new(service, WireNames::Member, false).structure(input_name, tree, "")
    }

    fn encode(
        &self,
        service: &ServiceModel,
        operation: &OperationModel,
        output: &Params,
        request_id: &str,
    ) -> anyhow::Result<EncodedResponse> {
        let response_name = format!("{}Response", operation.name);
        let namespace: Vec<(String, String)> = service
            .metadata
            .xml_namespace
            .iter()
            .map(|ns| ("xmlns".to_string(), ns.clone()))
            .collect();
        let shape = service.output_shape(operation);

        let mut w = XmlWriter::new();
        w.declaration();
        w.open_with(&response_name, &namespace);
        match self.dialect {
            QueryDialect::Query => {
                if let Some(shape) = shape {
                    let encoder = XmlEncoder::new(service, "member");
                    let wrapper = operation
                        .result_wrapper
                        .clone()
                        .unwrap_or_else(|| format!("{}Result", operation.name));
                    encoder.structure(&mut w, &wrapper, shape, output, &[]);
                }
                w.open("ResponseMetadata")
                    .leaf("RequestId", request_id)
                    .close("ResponseMetadata");
            }
            QueryDialect::Ec2 => {
                w.leaf("requestId", request_id);
                if let Some(shape) = shape {
                    XmlEncoder::new(service, "item").members(&mut w, shape, output);
                }
            }
        }
        w.close(&response_name);
        Ok(EncodedResponse::new(
            http::StatusCode::OK,
            "text/xml",
            w.finish(),
        ))
    }

    fn encode_error(
        &self,
        service: Option<&ServiceModel>,
        fault: &ServiceError,
        request_id: &str,
    ) -> EncodedResponse {
        let body = match self.dialect {
            QueryDialect::Query => xml::error_response(
                fault,
                request_id,
                service.and_then(|s| s.metadata.xml_namespace.as_deref()),
            ),
            QueryDialect::Ec2 => {
                let mut w = XmlWriter::new();
                w.declaration()
                    .open("Response")
                    .open("Errors")
                    .open("Error")
                    .leaf("Code", &fault.code)
                    .leaf("Message", &fault.message)
                    .close("Error")
                    .close("Errors")
                    .leaf("RequestID", request_id)
                    .close("Response");
                w.finish()
            }
        };
        EncodedResponse::new(fault_status(fault), "text/xml", body)
    }
}

// ---------------------------------------------------------------------------
// Form walking
// ---------------------------------------------------------------------------

/// Reassembles a nested tree from flat `A.B.1.C` form keys, guided by shapes.
struct FormWalker<'a> {
    service: &'a ServiceModel,
    dialect: QueryDialect,
    pairs: &'a BTreeMap<String, String>,
    used: BTreeSet<String>,
}

impl FormWalker<'_> {
    fn serialized_name(&self, name: &str, member: &Member) -> String {
        match self.dialect {
            QueryDialect::Query => member.location_name.clone().unwrap_or_else(|| name.to_string()),
            QueryDialect::Ec2 => member
                .query_name
                .clone()
                .or_else(|| member.location_name.as_deref().map(capitalize))
                .unwrap_or_else(|| name.to_string()),
        }
    }

    fn take(&mut self, key: &str) -> Option<String> {
        let value = self.pairs.get(key)?;
        self.used.insert(key.to_string());
        Some(value.clone())
    }

    /// Whether `key` or anything nested below it was sent.
    fn has_prefix(&self, key: &str) -> bool {
        if self.pairs.contains_key(key) {
            return true;
        }
        let dotted = format!("{key}.");
        self.pairs
            .range(dotted.clone()..)
            .next()
            .is_some_and(|(k, _)| k.starts_with(&dotted))
    }

    fn structure(&mut self, shape: &Shape, prefix: &str) -> Value {
        if !prefix.is_empty() {
            self.take(prefix);
        }
        let mut out = BTreeMap::new();
        for (name, member) in &shape.members {
            let serialized = self.serialized_name(name, member);
            let key = if prefix.is_empty() {
                serialized
            } else {
                format!("{prefix}.{serialized}")
            };
            if let Some(value) = self.member(member, &key) {
                out.insert(name.clone(), value);
            }
        }
        Value::Map(out)
    }

    fn member(&mut self, member: &Member, key: &str) -> Option<Value> {
        let Some(shape) = self.service.shape(&member.shape) else {
            return self.take(key).map(Value::String);
        };
        match shape.kind {
            ShapeKind::Structure => {
                if self.has_prefix(key) {
                    Some(self.structure(shape, key))
                } else {
                    None
                }
            }
            ShapeKind::List => self.list(member, shape, key),
            ShapeKind::Map => self.map(member, shape, key),
            _ => self.take(key).map(Value::String),
        }
    }

    fn flattened(&self, member: &Member, shape: &Shape) -> bool {
        self.dialect == QueryDialect::Ec2 || member.flattened || shape.flattened
    }

    fn list(&mut self, member: &Member, shape: &Shape, key: &str) -> Option<Value> {
        let item_member = shape.member.as_deref();
        let base = if self.flattened(member, shape) {
            key.to_string()
        } else {
            let item = item_member
                .and_then(|m| m.location_name.as_deref())
                .unwrap_or("member");
            format!("{key}.{item}")
        };

        let mut items = Vec::new();
        for i in 1.. {
            let item_key = format!("{base}.{i}");
            if !self.has_prefix(&item_key) {
                break;
            }
            let item = match item_member {
                Some(m) => self.member(m, &item_key),
                None => self.take(&item_key).map(Value::String),
            };
            items.extend(item);
        }

        // `Name=` with no indexed entries is an explicitly empty list.
        let explicit_empty = self.take(key).is_some();
        if items.is_empty() && !explicit_empty {
            return None;
        }
        Some(Value::List(items))
    }

    fn map(&mut self, member: &Member, shape: &Shape, key: &str) -> Option<Value> {
        let base = if self.flattened(member, shape) {
            key.to_string()
        } else {
            format!("{key}.entry")
        };
        let key_name = shape
            .key
            .as_deref()
            .and_then(|m| m.location_name.as_deref())
            .unwrap_or("key")
            .to_string();
        let value_name = shape
            .value
            .as_deref()
            .and_then(|m| m.location_name.as_deref())
            .unwrap_or("value")
            .to_string();
        let value_member = shape.value.as_deref();

        let mut entries = BTreeMap::new();
        for i in 1.. {
            let entry = format!("{base}.{i}");
            if !self.has_prefix(&entry) {
                break;
            }
            let Some(k) = self.take(&format!("{entry}.{key_name}")) else { continue };
            let value_key = format!("{entry}.{value_name}");
            let v = match value_member {
                Some(m) => self.member(m, &value_key),
                None => self.take(&value_key).map(Value::String),
            };
            entries.insert(k, v.unwrap_or(Value::Null));
        }

        let explicit_empty = self.take(key).is_some();
        if entries.is_empty() && !explicit_empty {
            return None;
        }
        Some(Value::Map(entries))
    }
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
