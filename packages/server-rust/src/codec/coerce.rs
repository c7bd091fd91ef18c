//! Shape-directed coercion of loosely typed values.
//!
//! Every decoder first produces an untyped [`Value`] tree (JSON and CBOR from
//! the document itself, query and XML with string leaves) and then hands it
//! to a [`Conformer`], which walks the target shape, converts leaves to the
//! declared kind and drops explicit nulls. Required members are checked
//! separately by [`check_required`] once the whole input is assembled.

use std::collections::BTreeMap;

use base64::Engine;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use stratus_core::{Member, Params, ServiceModel, Shape, ShapeKind, TimestampFormat, Value};

use super::DecodeError;

/// How structure member names appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireNames {
    /// The member name itself.
    Member,
    /// `jsonName` when present, else the member name.
    Json,
}

impl WireNames {
    fn of<'a>(self, name: &'a str, member: &'a Member) -> &'a str {
        match self {
            Self::Member => name,
            Self::Json => member.json_name.as_deref().unwrap_or(name),
        }
    }
}

/// Converts untyped trees into shape-typed parameter trees.
#[derive(Debug, Clone, Copy)]
pub struct Conformer<'a> {
    service: &'a ServiceModel,
    names: WireNames,
    strict: bool,
}

impl<'a> Conformer<'a> {
    #[must_use]
    pub fn new(service: &'a ServiceModel, names: WireNames, strict: bool) -> Self {
        Self { service, names, strict }
    }

    /// Conforms a structure value to the named structure shape.
    ///
    /// # Errors
    ///
    /// [`DecodeError::Validation`] when a leaf cannot be converted to its
    /// declared kind, or when strict mode meets an undeclared member.
    pub fn structure(&self, shape_name: &str, value: Value, path: &str) -> Result<Params, DecodeError> {
        match self.shape_value(shape_name, None, value, path)? {
            Value::Map(params) => Ok(params),
            Value::Null => Ok(Params::new()),
            other => Err(DecodeError::Validation(format!(
                "expected structure at '{}', found {}",
                display_path(path),
                other.kind()
            ))),
        }
    }

    /// Conforms a value bound to `member`.
    ///
    /// # Errors
    ///
    /// See [`Conformer::structure`].
    pub fn member(&self, member: &Member, value: Value, path: &str) -> Result<Value, DecodeError> {
        self.shape_value(&member.shape, member.timestamp_format, value, path)
    }

    fn shape_value(
        &self,
        shape_name: &str,
        ts_override: Option<TimestampFormat>,
        value: Value,
        path: &str,
    ) -> Result<Value, DecodeError> {
        let Some(shape) = self.service.shape(shape_name) else {
            return Ok(value);
        };
        match shape.kind {
            ShapeKind::Structure => self.structure_value(shape, value, path),
            ShapeKind::List => {
                let items = match value {
                    Value::List(items) => items,
                    Value::Null => return Ok(Value::Null),
                    // A single occurrence of a flattened element.
                    other => vec![other],
                };
                let Some(member) = shape.member.as_deref() else {
                    return Ok(Value::List(items));
                };
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.into_iter().enumerate() {
                    let item_path = format!("{path}.{}", i + 1);
                    match self.member(member, item, &item_path)? {
                        Value::Null => {}
                        v => out.push(v),
                    }
                }
                Ok(Value::List(out))
            }
            ShapeKind::Map => {
                let entries = match value {
                    Value::Map(entries) => entries,
                    Value::Null => return Ok(Value::Null),
                    other => return Err(type_mismatch("map", &other, path)),
                };
                let mut out = BTreeMap::new();
                for (key, v) in entries {
                    let entry_path = format!("{path}.{key}");
                    let v = match shape.value.as_deref() {
                        Some(member) => self.member(member, v, &entry_path)?,
                        None => v,
                    };
                    if v != Value::Null {
                        out.insert(key, v);
                    }
                }
                Ok(Value::Map(out))
            }
            kind => scalar(kind, ts_override.or(shape.timestamp_format), value, path),
        }
    }

    fn structure_value(&self, shape: &Shape, value: Value, path: &str) -> Result<Value, DecodeError> {
        let mut entries = match value {
            Value::Map(entries) => entries,
            Value::Null => return Ok(Value::Null),
            // Empty XML elements and empty query values stand for empty structures.
            Value::String(s) if s.trim().is_empty() => BTreeMap::new(),
            other => return Err(type_mismatch("structure", &other, path)),
        };

        let mut out = Params::new();
        for (name, member) in &shape.members {
            let wire = self.names.of(name, member);
            let Some(raw) = entries.remove(wire) else { continue };
            let member_path = join_path(path, name);
            match self.member(member, raw, &member_path)? {
                Value::Null => {}
                v => {
                    out.insert(name.clone(), v);
                }
            }
        }

        if self.strict {
            if let Some(unknown) = entries.keys().next() {
                return Err(DecodeError::Validation(format!(
                    "unknown member '{}'",
                    join_path(path, unknown)
                )));
            }
        }
        Ok(Value::Map(out))
    }
}

/// Verifies that every required member is present, recursing into the
/// members that are.
///
/// # Errors
///
/// [`DecodeError::Validation`] naming the first missing member.
pub fn check_required(
    service: &ServiceModel,
    shape_name: &str,
    params: &Params,
    path: &str,
) -> Result<(), DecodeError> {
    let Some(shape) = service.shape(shape_name) else {
        return Ok(());
    };
    for required in &shape.required {
        if !params.contains_key(required) {
            return Err(DecodeError::Validation(format!(
                "Value null at '{}' failed to satisfy constraint: Member must not be null",
                join_path(path, required)
            )));
        }
    }
    for (name, value) in params {
        let Some(member) = shape.members.get(name) else { continue };
        check_nested(service, &member.shape, value, &join_path(path, name))?;
    }
    Ok(())
}

fn check_nested(
    service: &ServiceModel,
    shape_name: &str,
    value: &Value,
    path: &str,
) -> Result<(), DecodeError> {
    let Some(shape) = service.shape(shape_name) else {
        return Ok(());
    };
    match (shape.kind, value) {
        (ShapeKind::Structure, Value::Map(params)) => check_required(service, shape_name, params, path),
        (ShapeKind::List, Value::List(items)) => {
            let Some(member) = shape.member.as_deref() else { return Ok(()) };
            for (i, item) in items.iter().enumerate() {
                check_nested(service, &member.shape, item, &format!("{path}.{}", i + 1))?;
            }
            Ok(())
        }
        (ShapeKind::Map, Value::Map(entries)) => {
            let Some(member) = shape.value.as_deref() else { return Ok(()) };
            for (key, item) in entries {
                check_nested(service, &member.shape, item, &format!("{path}.{key}"))?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Scalars
// ---------------------------------------------------------------------------

/// Converts a scalar to the given kind.
///
/// # Errors
///
/// [`DecodeError::Validation`] when the value cannot represent the kind.
pub fn scalar(
    kind: ShapeKind,
    ts_format: Option<TimestampFormat>,
    value: Value,
    path: &str,
) -> Result<Value, DecodeError> {
    if value == Value::Null {
        return Ok(Value::Null);
    }
    match kind {
        ShapeKind::String => match value {
            Value::String(_) => Ok(value),
            Value::Integer(i) => Ok(Value::String(i.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            other => Err(type_mismatch("string", &other, path)),
        },
        k if k.is_integral() => {
            let n = match value {
                Value::Integer(i) => i,
                Value::Float(f) => whole_float(f).ok_or_else(|| invalid_text("integer", &f.to_string(), path))?,
                Value::String(ref s) => s
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| invalid_text("integer", s, path))?,
                other => return Err(type_mismatch("integer", &other, path)),
            };
            let (min, max) = integral_bounds(k);
            if n < min || n > max {
                return Err(DecodeError::Validation(format!(
                    "value {n} at '{}' is out of range for {k:?} ({min}..={max})",
                    display_path(path)
                )));
            }
            Ok(Value::Integer(n))
        }
        k if k.is_floating() => match value {
            Value::Float(_) => Ok(value),
            #[allow(clippy::cast_precision_loss)]
            Value::Integer(i) => Ok(Value::Float(i as f64)),
            Value::String(ref s) => parse_float(s)
                .map(Value::Float)
                .ok_or_else(|| invalid_text("number", s, path)),
            other => Err(type_mismatch("number", &other, path)),
        },
        ShapeKind::Boolean => match value {
            Value::Bool(_) => Ok(value),
            Value::String(ref s) => match s.trim() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(invalid_text("boolean", s, path)),
            },
            other => Err(type_mismatch("boolean", &other, path)),
        },
        ShapeKind::Timestamp => match value {
            Value::Timestamp(_) => Ok(value),
            // Epoch seconds past 2^53 are far outside any valid date.
            #[allow(clippy::cast_precision_loss)]
            Value::Integer(secs) => epoch_to_datetime(secs as f64)
                .map(Value::Timestamp)
                .ok_or_else(|| invalid_text("timestamp", &secs.to_string(), path)),
            Value::Float(secs) => epoch_to_datetime(secs)
                .map(Value::Timestamp)
                .ok_or_else(|| invalid_text("timestamp", &secs.to_string(), path)),
            Value::String(ref s) => parse_timestamp(s, ts_format)
                .map(Value::Timestamp)
                .ok_or_else(|| invalid_text("timestamp", s, path)),
            other => Err(type_mismatch("timestamp", &other, path)),
        },
        ShapeKind::Blob => match value {
            Value::Blob(_) => Ok(value),
            Value::String(ref s) => base64::engine::general_purpose::STANDARD
                .decode(s.trim())
                .map(Value::Blob)
                .map_err(|_| invalid_text("base64 blob", s, path)),
            other => Err(type_mismatch("blob", &other, path)),
        },
        _ => Ok(value),
    }
}

/// Inclusive bounds of an integral shape kind.
fn integral_bounds(kind: ShapeKind) -> (i64, i64) {
    match kind {
        ShapeKind::Byte => (i8::MIN.into(), i8::MAX.into()),
        ShapeKind::Short => (i16::MIN.into(), i16::MAX.into()),
        ShapeKind::Integer => (i32::MIN.into(), i32::MAX.into()),
        _ => (i64::MIN, i64::MAX),
    }
}

/// The float as an `i64` when it is whole and representable.
#[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
fn whole_float(f: f64) -> Option<i64> {
    // 2^63 is exact as an f64; anything at or past it overflows i64.
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    let whole = f.is_finite() && f.fract() == 0.0;
    (whole && (-LIMIT..LIMIT).contains(&f)).then(|| f as i64)
}

fn parse_float(text: &str) -> Option<f64> {
    match text.trim() {
        "NaN" => Some(f64::NAN),
        "Infinity" => Some(f64::INFINITY),
        "-Infinity" => Some(f64::NEG_INFINITY),
        other => other.parse().ok(),
    }
}

/// Parses a timestamp, trying the preferred format first and then the others.
#[must_use]
pub fn parse_timestamp(text: &str, preferred: Option<TimestampFormat>) -> Option<DateTime<Utc>> {
    let text = text.trim();
    let iso = || {
        DateTime::parse_from_rfc3339(text)
            .map(|d| d.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|n| n.and_utc())
            })
    };
    let epoch = || text.parse::<f64>().ok().and_then(epoch_to_datetime);
    let http_date = || {
        DateTime::parse_from_rfc2822(text)
            .map(|d| d.with_timezone(&Utc))
            .ok()
    };
    match preferred {
        Some(TimestampFormat::UnixTimestamp) => epoch().or_else(iso).or_else(http_date),
        Some(TimestampFormat::Rfc822) => http_date().or_else(iso).or_else(epoch),
        Some(TimestampFormat::Iso8601) | None => iso().or_else(epoch).or_else(http_date),
    }
}

/// Converts fractional epoch seconds to a UTC timestamp.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn epoch_to_datetime(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    // Wire timestamps carry at most millisecond precision.
    let mut whole = secs.floor() as i64;
    let mut millis = ((secs - secs.floor()) * 1000.0).round() as u32;
    if millis >= 1000 {
        whole += 1;
        millis = 0;
    }
    DateTime::from_timestamp(whole, millis * 1_000_000)
}

/// Epoch seconds with millisecond precision.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn epoch_seconds(ts: &DateTime<Utc>) -> f64 {
    ts.timestamp() as f64 + f64::from(ts.timestamp_subsec_millis()) / 1000.0
}

/// Renders a timestamp as text in the given format.
#[must_use]
pub fn format_timestamp(ts: &DateTime<Utc>, format: TimestampFormat) -> String {
    match format {
        TimestampFormat::Iso8601 => ts.to_rfc3339_opts(SecondsFormat::Millis, true),
        TimestampFormat::Rfc822 => ts.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
        TimestampFormat::UnixTimestamp => {
            let millis = ts.timestamp_subsec_millis();
            if millis == 0 {
                ts.timestamp().to_string()
            } else {
                format!("{}.{millis:03}", ts.timestamp())
            }
        }
    }
}

/// Renders a scalar as wire text. Aggregates render as an empty string.
#[must_use]
pub fn scalar_text(value: &Value, ts_format: TimestampFormat) -> String {
    match value {
        Value::Null | Value::List(_) | Value::Map(_) => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Float(f) if f.is_nan() => "NaN".to_string(),
        Value::Float(f) if f.is_infinite() => {
            if f.is_sign_positive() { "Infinity" } else { "-Infinity" }.to_string()
        }
        Value::Float(f) => f.to_string(),
        Value::String(s) => s.clone(),
        Value::Blob(bytes) => base64::engine::general_purpose::STANDARD.encode(bytes),
        Value::Timestamp(ts) => format_timestamp(ts, ts_format),
    }
}

/// Timestamp format for a member: the member's override, then the target
/// shape's, then the protocol default.
#[must_use]
pub fn timestamp_format(
    service: &ServiceModel,
    member: &Member,
    default: TimestampFormat,
) -> TimestampFormat {
    member
        .timestamp_format
        .or_else(|| service.shape(&member.shape).and_then(|s| s.timestamp_format))
        .unwrap_or(default)
}

// ---------------------------------------------------------------------------
// Paths and messages
// ---------------------------------------------------------------------------

pub(crate) fn join_path(parent: &str, child: &str) -> String {
    if parent.is_empty() {
        child.to_string()
    } else {
        format!("{parent}.{child}")
    }
}

fn display_path(path: &str) -> &str {
    if path.is_empty() {
        "<root>"
    } else {
        path
    }
}

fn type_mismatch(expected: &str, found: &Value, path: &str) -> DecodeError {
    DecodeError::Validation(format!(
        "expected {expected} at '{}', found {}",
        display_path(path),
        found.kind()
    ))
}

fn invalid_text(expected: &str, text: &str, path: &str) -> DecodeError {
    DecodeError::Validation(format!(
        "value '{text}' at '{}' is not a valid {expected}",
        display_path(path)
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use proptest::prelude::*;

    use super::*;

    fn model() -> ServiceModel {
        ServiceModel::from_value(
            "t",
            serde_json::json!({
                "metadata": {"protocol": "json", "apiVersion": "2020-01-01", "endpointPrefix": "t"},
                "operations": {},
                "shapes": {
                    "Input": {
                        "type": "structure",
                        "required": ["Name"],
                        "members": {
                            "Name": {"shape": "String"},
                            "Count": {"shape": "Integer", "jsonName": "count"},
                            "When": {"shape": "Timestamp"},
                            "Data": {"shape": "Blob"},
                            "Tags": {"shape": "TagList"},
                            "Nested": {"shape": "Nested"}
                        }
                    },
                    "Nested": {"type": "structure", "required": ["Key"], "members": {"Key": {"shape": "String"}}},
                    "TagList": {"type": "list", "member": {"shape": "String"}},
                    "String": {"type": "string"},
                    "Integer": {"type": "integer"},
                    "Timestamp": {"type": "timestamp"},
                    "Blob": {"type": "blob"}
                }
            }),
        )
        .unwrap()
    }

    fn map(entries: &[(&str, Value)]) -> Value {
        Value::Map(entries.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect())
    }

    #[test]
    fn string_leaves_become_typed() {
        let model = model();
        let c = Conformer::new(&model, WireNames::Member, false);
        let params = c
            .structure(
                "Input",
                map(&[
                    ("Name", "q".into()),
                    ("Count", "42".into()),
                    ("When", "2024-01-02T03:04:05Z".into()),
                    ("Data", "aGk=".into()),
                ]),
                "",
            )
            .unwrap();
        assert_eq!(params["Count"], Value::Integer(42));
        assert_eq!(
            params["When"],
            Value::Timestamp(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap())
        );
        assert_eq!(params["Data"], Value::Blob(b"hi".to_vec()));
    }

    #[test]
    fn json_names_and_nulls() {
        let model = model();
        let c = Conformer::new(&model, WireNames::Json, false);
        let params = c
            .structure(
                "Input",
                map(&[("Name", "q".into()), ("count", Value::Integer(1)), ("When", Value::Null)]),
                "",
            )
            .unwrap();
        assert_eq!(params["Count"], Value::Integer(1));
        assert!(!params.contains_key("When"));
    }

    #[test]
    fn strict_mode_rejects_unknown_members() {
        let model = model();
        let lenient = Conformer::new(&model, WireNames::Member, false);
        let strict = Conformer::new(&model, WireNames::Member, true);
        let input = map(&[("Name", "q".into()), ("Bogus", "x".into())]);
        assert!(lenient.structure("Input", input.clone(), "").is_ok());
        let err = strict.structure("Input", input, "").unwrap_err();
        assert!(matches!(err, DecodeError::Validation(m) if m.contains("Bogus")));
    }

    #[test]
    fn empty_list_stays_present() {
        let model = model();
        let c = Conformer::new(&model, WireNames::Member, false);
        let params = c
            .structure("Input", map(&[("Name", "q".into()), ("Tags", Value::List(vec![]))]), "")
            .unwrap();
        assert_eq!(params["Tags"], Value::List(vec![]));
    }

    #[test]
    fn required_members_checked_recursively() {
        let model = model();
        let mut params = Params::new();
        let err = check_required(&model, "Input", &params, "").unwrap_err();
        assert!(matches!(err, DecodeError::Validation(m) if m.contains("'Name'")));

        params.insert("Name".into(), "q".into());
        params.insert("Nested".into(), Value::Map(BTreeMap::new()));
        let err = check_required(&model, "Input", &params, "").unwrap_err();
        assert!(matches!(err, DecodeError::Validation(m) if m.contains("Nested.Key")));
    }

    #[test]
    fn bad_integer_is_validation_error() {
        let err = scalar(ShapeKind::Integer, None, "ten".into(), "Count").unwrap_err();
        assert!(matches!(err, DecodeError::Validation(_)));
    }

    #[test]
    fn integral_values_are_range_checked() {
        let big = i64::from(i32::MAX) + 1;
        let err = scalar(ShapeKind::Integer, None, Value::Integer(big), "Count").unwrap_err();
        assert!(matches!(err, DecodeError::Validation(m) if m.contains("out of range")));
        assert!(scalar(ShapeKind::Integer, None, big.to_string().into(), "Count").is_err());
        assert!(scalar(ShapeKind::Byte, None, Value::Integer(128), "b").is_err());
        assert!(scalar(ShapeKind::Short, None, Value::Integer(-32_768), "s").is_ok());
        assert_eq!(
            scalar(ShapeKind::Long, None, Value::Integer(big), "n").unwrap(),
            Value::Integer(big)
        );
        assert_eq!(
            scalar(ShapeKind::Integer, None, Value::Integer(i64::from(i32::MIN)), "n").unwrap(),
            Value::Integer(i64::from(i32::MIN))
        );
    }

    #[test]
    fn floats_convert_only_when_whole_and_representable() {
        assert_eq!(
            scalar(ShapeKind::Long, None, Value::Float(12.0), "n").unwrap(),
            Value::Integer(12)
        );
        assert!(scalar(ShapeKind::Long, None, Value::Float(1.5), "n").is_err());
        assert!(scalar(ShapeKind::Long, None, Value::Float(1e19), "n").is_err());
        assert!(scalar(ShapeKind::Long, None, Value::Float(-1e19), "n").is_err());
        assert!(scalar(ShapeKind::Long, None, Value::Float(f64::INFINITY), "n").is_err());
        assert!(scalar(ShapeKind::Integer, None, Value::Float(3e9), "n").is_err());
        assert_eq!(
            scalar(ShapeKind::Long, None, Value::Float(-9_223_372_036_854_775_808.0), "n").unwrap(),
            Value::Integer(i64::MIN)
        );
    }

    #[test]
    fn integer_epoch_seconds_become_timestamps() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let v = scalar(ShapeKind::Timestamp, None, Value::Integer(1_704_067_200), "When").unwrap();
        assert_eq!(v, Value::Timestamp(ts));
        assert!(scalar(ShapeKind::Timestamp, None, Value::Integer(i64::MAX), "When").is_err());
    }

    #[test]
    fn timestamp_text_formats() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(format_timestamp(&ts, TimestampFormat::Iso8601), "2024-01-01T00:00:00.000Z");
        assert_eq!(format_timestamp(&ts, TimestampFormat::Rfc822), "Mon, 01 Jan 2024 00:00:00 GMT");
        assert_eq!(format_timestamp(&ts, TimestampFormat::UnixTimestamp), "1704067200");
        assert_eq!(parse_timestamp("Mon, 01 Jan 2024 00:00:00 GMT", None), Some(ts));
        assert_eq!(parse_timestamp("1704067200", None), Some(ts));
    }

    proptest! {
        #[test]
        fn integer_text_round_trips(n in any::<i64>()) {
            let v = scalar(ShapeKind::Long, None, Value::String(n.to_string()), "n").unwrap();
            prop_assert_eq!(v, Value::Integer(n));
        }

        #[test]
        fn epoch_millis_round_trip(ms in 0_i64..4_102_444_800_000) {
            let ts = DateTime::from_timestamp_millis(ms).unwrap();
            let text = format_timestamp(&ts, TimestampFormat::UnixTimestamp);
            prop_assert_eq!(parse_timestamp(&text, Some(TimestampFormat::UnixTimestamp)), Some(ts));
        }
    }
}
