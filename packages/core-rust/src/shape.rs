//! Structural descriptions of operation inputs and outputs.
//!
//! Shapes follow the botocore document layout: every shape has a `type`,
//! structures list their `members` (each pointing at another shape by name)
//! and a `required` list, lists carry a `member`, maps carry `key`/`value`.
//! Members carry the wire binding (`location`, `locationName`, ...) that the
//! codecs consult.

use std::collections::BTreeMap;

use serde::Deserialize;

/// Primitive or aggregate type of a shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapeKind {
    Structure,
    List,
    Map,
    String,
    Integer,
    Long,
    Short,
    Byte,
    Float,
    Double,
    Boolean,
    Timestamp,
    Blob,
}

impl ShapeKind {
    /// Whether values of this kind decode into `Value::Integer`.
    #[must_use]
    pub fn is_integral(self) -> bool {
        matches!(self, Self::Integer | Self::Long | Self::Short | Self::Byte)
    }

    /// Whether values of this kind decode into `Value::Float`.
    #[must_use]
    pub fn is_floating(self) -> bool {
        matches!(self, Self::Float | Self::Double)
    }

    /// Whether this kind is a scalar (anything other than structure/list/map).
    #[must_use]
    pub fn is_scalar(self) -> bool {
        !matches!(self, Self::Structure | Self::List | Self::Map)
    }
}

/// Where a member travels on the wire. Absent means "in the body".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Location {
    /// A single HTTP header named by `locationName`.
    Header,
    /// Every header starting with the `locationName` prefix (map shapes).
    Headers,
    /// A query string parameter, or all parameters for map shapes.
    Querystring,
    /// A `{label}` in the request URI template.
    Uri,
    /// The HTTP status code of a response.
    StatusCode,
}

/// Serialization format of timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TimestampFormat {
    /// `2024-01-01T00:00:00.000Z`
    Iso8601,
    /// Seconds since the epoch, optionally fractional.
    UnixTimestamp,
    /// `Mon, 01 Jan 2024 00:00:00 GMT`
    Rfc822,
}

/// Error trait attached to exception shapes.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorTrait {
    /// Wire error code when it differs from the shape name.
    pub code: Option<String>,
    /// HTTP status code for the fault.
    pub http_status_code: Option<u16>,
    /// Whether the client is to blame.
    #[serde(default)]
    pub sender_fault: bool,
}

/// A reference from a structure, list or map to a target shape.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    /// Name of the target shape.
    pub shape: String,
    pub location: Option<Location>,
    pub location_name: Option<String>,
    pub json_name: Option<String>,
    pub query_name: Option<String>,
    #[serde(default)]
    pub flattened: bool,
    #[serde(default)]
    pub xml_attribute: bool,
    pub timestamp_format: Option<TimestampFormat>,
}

impl Member {
    /// Whether the member is carried in the message body (no explicit location).
    #[must_use]
    pub fn in_body(&self) -> bool {
        self.location.is_none()
    }
}

/// A named shape definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shape {
    #[serde(rename = "type")]
    pub kind: ShapeKind,
    /// Structure members, keyed by member name.
    #[serde(default)]
    pub members: BTreeMap<String, Member>,
    /// Names of required structure members.
    #[serde(default)]
    pub required: Vec<String>,
    /// Element reference of a list.
    pub member: Option<Box<Member>>,
    /// Key reference of a map.
    pub key: Option<Box<Member>>,
    /// Value reference of a map.
    pub value: Option<Box<Member>>,
    #[serde(default)]
    pub flattened: bool,
    pub location_name: Option<String>,
    pub timestamp_format: Option<TimestampFormat>,
    /// Name of the member bound to the whole HTTP body (REST protocols).
    pub payload: Option<String>,
    #[serde(default)]
    pub exception: bool,
    pub error: Option<ErrorTrait>,
    #[serde(default, rename = "enum")]
    pub enum_values: Vec<String>,
}

impl Shape {
    /// Whether the named structure member is required.
    #[must_use]
    pub fn is_required(&self, member: &str) -> bool {
        self.required.iter().any(|r| r == member)
    }

    /// Iterates over the shape names this shape refers to.
    pub fn references(&self) -> impl Iterator<Item = &str> {
        self.members
            .values()
            .map(|m| m.shape.as_str())
            .chain(self.member.iter().map(|m| m.shape.as_str()))
            .chain(self.key.iter().map(|m| m.shape.as_str()))
            .chain(self.value.iter().map(|m| m.shape.as_str()))
    }

    /// Members bound to the given location (`None` selects body members).
    pub fn members_at(
        &self,
        location: Option<Location>,
    ) -> impl Iterator<Item = (&String, &Member)> {
        self.members
            .iter()
            .filter(move |(_, m)| m.location == location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_structure_with_bindings() {
        let shape: Shape = serde_json::from_value(serde_json::json!({
            "type": "structure",
            "required": ["Bucket"],
            "members": {
                "Bucket": {"shape": "BucketName", "location": "uri", "locationName": "Bucket"},
                "MaxKeys": {"shape": "MaxKeys", "location": "querystring", "locationName": "max-keys"},
                "Meta": {"shape": "Metadata", "location": "headers", "locationName": "x-amz-meta-"},
                "Body": {"shape": "Blob"}
            },
            "payload": "Body"
        }))
        .unwrap();

        assert_eq!(shape.kind, ShapeKind::Structure);
        assert!(shape.is_required("Bucket"));
        assert!(!shape.is_required("MaxKeys"));
        assert_eq!(shape.members["Bucket"].location, Some(Location::Uri));
        assert_eq!(shape.members["Meta"].location, Some(Location::Headers));
        assert_eq!(shape.payload.as_deref(), Some("Body"));
        assert_eq!(shape.members_at(None).count(), 1);
    }

    #[test]
    fn references_cover_aggregates() {
        let shape: Shape = serde_json::from_value(serde_json::json!({
            "type": "map",
            "key": {"shape": "String"},
            "value": {"shape": "Tags"}
        }))
        .unwrap();
        let refs: Vec<&str> = shape.references().collect();
        assert_eq!(refs, vec!["String", "Tags"]);
    }

    #[test]
    fn kind_classification() {
        assert!(ShapeKind::Long.is_integral());
        assert!(ShapeKind::Double.is_floating());
        assert!(!ShapeKind::List.is_scalar());
        assert!(ShapeKind::Timestamp.is_scalar());
    }
}
