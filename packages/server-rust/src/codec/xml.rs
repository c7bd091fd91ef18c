//! XML plumbing shared by `query`, `ec2` and `rest-xml`.
//!
//! Parsing builds a small element tree with `quick-xml`; shape-directed
//! extraction turns it into an untyped [`Value`] tree with string leaves for
//! the [`Conformer`](super::coerce::Conformer). Rendering goes through
//! [`XmlWriter`] and [`XmlEncoder`].

use std::collections::BTreeMap;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use stratus_core::{Member, Params, ServiceError, ServiceModel, Shape, ShapeKind, TimestampFormat, Value};

use super::coerce;
use super::DecodeError;

// ---------------------------------------------------------------------------
// Element tree
// ---------------------------------------------------------------------------

/// A parsed element: local name, attributes, child elements and text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct XmlNode {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlNode>,
    pub text: String,
}

impl XmlNode {
    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlNode> {
        self.children.iter().filter(move |c| c.name == name)
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Deepest element nesting accepted by [`parse`]. The tree is built and
/// dropped recursively, so depth must stay well inside the stack.
pub(crate) const MAX_XML_DEPTH: usize = 256;

/// Parses a document into its root element.
///
/// # Errors
///
/// [`DecodeError::Parse`] for invalid UTF-8, malformed markup, mismatched
/// tags, several roots, nesting deeper than [`MAX_XML_DEPTH`] or an empty
/// document.
pub(crate) fn parse(body: &[u8]) -> Result<XmlNode, DecodeError> {
    let text = std::str::from_utf8(body)
        .map_err(|e| DecodeError::Parse(format!("XML body is not UTF-8: {e}")))?;
    let mut reader = Reader::from_str(text);
    let mut stack: Vec<XmlNode> = Vec::new();
    let mut root: Option<XmlNode> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if stack.len() >= MAX_XML_DEPTH {
                    return Err(DecodeError::Parse(format!(
                        "XML nesting exceeds {MAX_XML_DEPTH} levels"
                    )));
                }
                stack.push(start_node(&e)?);
            }
            Ok(Event::Empty(e)) => {
                let node = start_node(&e)?;
                attach(&mut stack, &mut root, node)?;
            }
            Ok(Event::End(_)) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| DecodeError::Parse("unbalanced closing tag".to_string()))?;
                attach(&mut stack, &mut root, node)?;
            }
            Ok(Event::Text(t)) => {
                let unescaped = t
                    .unescape()
                    .map_err(|e| DecodeError::Parse(format!("invalid XML text: {e}")))?;
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&unescaped);
                }
            }
            Ok(Event::CData(c)) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&c));
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(DecodeError::Parse(format!(
                    "malformed XML at byte {}: {e}",
                    reader.buffer_position()
                )))
            }
        }
    }

    if !stack.is_empty() {
        return Err(DecodeError::Parse("unexpected end of XML document".to_string()));
    }
    root.ok_or_else(|| DecodeError::Parse("empty XML document".to_string()))
}

fn start_node(start: &BytesStart<'_>) -> Result<XmlNode, DecodeError> {
    let mut node = XmlNode {
        name: String::from_utf8_lossy(start.local_name().as_ref()).into_owned(),
        ..XmlNode::default()
    };
    for attr in start.attributes() {
        let attr = attr.map_err(|e| DecodeError::Parse(format!("invalid XML attribute: {e}")))?;
        let key = attr.key.as_ref();
        if key == b"xmlns" || key.starts_with(b"xmlns:") {
            continue;
        }
        let value = attr
            .unescape_value()
            .map_err(|e| DecodeError::Parse(format!("invalid XML attribute: {e}")))?;
        node.attributes.push((
            String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned(),
            value.into_owned(),
        ));
    }
    Ok(node)
}

fn attach(
    stack: &mut [XmlNode],
    root: &mut Option<XmlNode>,
    node: XmlNode,
) -> Result<(), DecodeError> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(node);
        Ok(())
    } else if root.is_none() {
        *root = Some(node);
        Ok(())
    } else {
        Err(DecodeError::Parse("XML document has several root elements".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Shape-directed extraction
// ---------------------------------------------------------------------------

fn wire_name<'a>(name: &'a str, member: &'a Member) -> &'a str {
    member.location_name.as_deref().unwrap_or(name)
}

/// Extracts the body members of `shape` from the children of `node`.
///
/// # Errors
///
/// In strict mode, [`DecodeError::Validation`] for child elements no member
/// claims.
pub(crate) fn structure_value(
    service: &ServiceModel,
    shape: &Shape,
    node: &XmlNode,
    strict: bool,
) -> Result<Value, DecodeError> {
    let mut out = BTreeMap::new();
    for (name, member) in shape.members_at(None) {
        let wire = wire_name(name, member);
        if member.xml_attribute {
            if let Some(v) = node.attribute(wire) {
                out.insert(name.clone(), Value::String(v.to_string()));
            }
            continue;
        }
        let Some(target) = service.shape(&member.shape) else { continue };
        let flattened = member.flattened || target.flattened;
        match target.kind {
            ShapeKind::List if flattened => {
                let items: Vec<&XmlNode> = node.children_named(wire).collect();
                if !items.is_empty() {
                    out.insert(name.clone(), list_items(service, target, items, strict)?);
                }
            }
            ShapeKind::Map if flattened => {
                let entries: Vec<&XmlNode> = node.children_named(wire).collect();
                if !entries.is_empty() {
                    out.insert(name.clone(), map_entries(service, target, entries, strict)?);
                }
            }
            _ => {
                if let Some(child) = node.child(wire) {
                    out.insert(name.clone(), node_value(service, target, child, strict)?);
                }
            }
        }
    }

    if strict {
        let claimed = |child: &str| {
            shape
                .members_at(None)
                .any(|(name, member)| !member.xml_attribute && wire_name(name, member) == child)
        };
        if let Some(unknown) = node.children.iter().find(|c| !claimed(&c.name)) {
            return Err(DecodeError::Validation(format!(
                "unknown element '{}' in '{}'",
                unknown.name, node.name
            )));
        }
    }
    Ok(Value::Map(out))
}

fn node_value(
    service: &ServiceModel,
    shape: &Shape,
    node: &XmlNode,
    strict: bool,
) -> Result<Value, DecodeError> {
    match shape.kind {
        ShapeKind::Structure => structure_value(service, shape, node, strict),
        ShapeKind::List => list_items(service, shape, node.children.iter().collect(), strict),
        ShapeKind::Map => map_entries(service, shape, node.children.iter().collect(), strict),
        _ => Ok(Value::String(node.text.clone())),
    }
}

fn list_items(
    service: &ServiceModel,
    list: &Shape,
    items: Vec<&XmlNode>,
    strict: bool,
) -> Result<Value, DecodeError> {
    let item_shape = list.member.as_deref().and_then(|m| service.shape(&m.shape));
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        out.push(match item_shape {
            Some(shape) => node_value(service, shape, item, strict)?,
            None => Value::String(item.text.clone()),
        });
    }
    Ok(Value::List(out))
}

fn map_entries(
    service: &ServiceModel,
    map: &Shape,
    entries: Vec<&XmlNode>,
    strict: bool,
) -> Result<Value, DecodeError> {
    let key_name = map
        .key
        .as_deref()
        .and_then(|m| m.location_name.as_deref())
        .unwrap_or("key");
    let value_name = map
        .value
        .as_deref()
        .and_then(|m| m.location_name.as_deref())
        .unwrap_or("value");
    let value_shape = map.value.as_deref().and_then(|m| service.shape(&m.shape));

    let mut out = BTreeMap::new();
    for entry in entries {
        let Some(key) = entry.child(key_name) else {
            return Err(DecodeError::Validation(format!(
                "map entry '{}' has no <{key_name}>",
                entry.name
            )));
        };
        let value = match (entry.child(value_name), value_shape) {
            (Some(node), Some(shape)) => node_value(service, shape, node, strict)?,
            (Some(node), None) => Value::String(node.text.clone()),
            (None, _) => Value::Null,
        };
        out.insert(key.text.clone(), value);
    }
    Ok(Value::Map(out))
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Minimal escaping XML builder.
#[derive(Debug, Default)]
pub(crate) struct XmlWriter {
    buf: String,
}

impl XmlWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declaration(&mut self) -> &mut Self {
        self.buf.push_str(r#"<?xml version="1.0" encoding="UTF-8"?>"#);
        self
    }

    pub fn open(&mut self, name: &str) -> &mut Self {
        self.open_with(name, &[])
    }

    pub fn open_with(&mut self, name: &str, attributes: &[(String, String)]) -> &mut Self {
        self.buf.push('<');
        self.buf.push_str(name);
        for (key, value) in attributes {
            self.buf.push(' ');
            self.buf.push_str(key);
            self.buf.push_str("=\"");
            self.buf.push_str(&quick_xml::escape::escape(value.as_str()));
            self.buf.push('"');
        }
        self.buf.push('>');
        self
    }

    pub fn close(&mut self, name: &str) -> &mut Self {
        self.buf.push_str("</");
        self.buf.push_str(name);
        self.buf.push('>');
        self
    }

    pub fn empty(&mut self, name: &str) -> &mut Self {
        self.buf.push('<');
        self.buf.push_str(name);
        self.buf.push_str("/>");
        self
    }

    pub fn leaf(&mut self, name: &str, text: &str) -> &mut Self {
        self.open(name);
        self.buf.push_str(&quick_xml::escape::escape(text));
        self.close(name)
    }

    pub fn finish(self) -> String {
        self.buf
    }
}

/// Renders shape-typed values as XML elements.
#[derive(Debug, Clone, Copy)]
pub(crate) struct XmlEncoder<'a> {
    pub service: &'a ServiceModel,
    /// Element name of non-flattened list items without a `locationName`.
    pub list_item: &'static str,
}

impl<'a> XmlEncoder<'a> {
    pub fn new(service: &'a ServiceModel, list_item: &'static str) -> Self {
        Self { service, list_item }
    }

    /// Writes the present body members of `shape` as child elements.
    pub fn members(&self, w: &mut XmlWriter, shape: &Shape, params: &Params) {
        for (name, member) in shape.members_at(None) {
            if member.xml_attribute {
                continue;
            }
            if let Some(value) = params.get(name) {
                self.member(w, wire_name(name, member), member, value);
            }
        }
    }

    /// Attribute-bound members of `shape` as (name, text) pairs.
    pub fn attributes(&self, shape: &Shape, params: &Params) -> Vec<(String, String)> {
        shape
            .members_at(None)
            .filter(|(_, m)| m.xml_attribute)
            .filter_map(|(name, member)| {
                let value = params.get(name)?;
                let format = coerce::timestamp_format(self.service, member, TimestampFormat::Iso8601);
                Some((wire_name(name, member).to_string(), coerce::scalar_text(value, format)))
            })
            .collect()
    }

    /// Writes `<name attrs>members</name>` for a structure value.
    pub fn structure(
        &self,
        w: &mut XmlWriter,
        name: &str,
        shape: &Shape,
        params: &Params,
        extra: &[(String, String)],
    ) {
        let mut attributes = extra.to_vec();
        attributes.extend(self.attributes(shape, params));
        w.open_with(name, &attributes);
        self.members(w, shape, params);
        w.close(name);
    }

    /// Writes one member value under the element name `name`.
    pub fn member(&self, w: &mut XmlWriter, name: &str, member: &Member, value: &Value) {
        let format = coerce::timestamp_format(self.service, member, TimestampFormat::Iso8601);
        let Some(shape) = self.service.shape(&member.shape) else {
            w.leaf(name, &coerce::scalar_text(value, format));
            return;
        };
        match (shape.kind, value) {
            (ShapeKind::Structure, Value::Map(params)) => self.structure(w, name, shape, params, &[]),
            (ShapeKind::List, Value::List(items)) => self.list(w, name, member, shape, items),
            (ShapeKind::Map, Value::Map(entries)) => self.map(w, name, member, shape, entries),
            _ => {
                w.leaf(name, &coerce::scalar_text(value, format));
            }
        }
    }

    fn list(&self, w: &mut XmlWriter, name: &str, member: &Member, shape: &Shape, items: &[Value]) {
        let item_member = shape.member.as_deref();
        if member.flattened || shape.flattened {
            for item in items {
                self.item(w, name, item_member, item);
            }
            return;
        }
        if items.is_empty() {
            w.empty(name);
            return;
        }
        let item_name = item_member
            .and_then(|m| m.location_name.as_deref())
            .unwrap_or(self.list_item);
        w.open(name);
        for item in items {
            self.item(w, item_name, item_member, item);
        }
        w.close(name);
    }

    fn map(
        &self,
        w: &mut XmlWriter,
        name: &str,
        member: &Member,
        shape: &Shape,
        entries: &BTreeMap<String, Value>,
    ) {
        let key_name = shape
            .key
            .as_deref()
            .and_then(|m| m.location_name.as_deref())
            .unwrap_or("key");
        let value_name = shape
            .value
            .as_deref()
            .and_then(|m| m.location_name.as_deref())
            .unwrap_or("value");
        let value_member = shape.value.as_deref();

        let flattened = member.flattened || shape.flattened;
        if !flattened {
            if entries.is_empty() {
                w.empty(name);
                return;
            }
            w.open(name);
        }
        let entry_name = if flattened { name } else { "entry" };
        for (key, value) in entries {
            w.open(entry_name);
            w.leaf(key_name, key);
            self.item(w, value_name, value_member, value);
            w.close(entry_name);
        }
        if !flattened {
            w.close(name);
        }
    }

    fn item(&self, w: &mut XmlWriter, name: &str, member: Option<&Member>, value: &Value) {
        match member {
            Some(member) => self.member(w, name, member, value),
            None => {
                w.leaf(name, &coerce::scalar_text(value, TimestampFormat::Iso8601));
            }
        }
    }
}

/// `<ErrorResponse><Error><Type/><Code/><Message/></Error><RequestId/></ErrorResponse>`
pub(crate) fn error_response(fault: &ServiceError, request_id: &str, namespace: Option<&str>) -> String {
    let mut w = XmlWriter::new();
    w.declaration();
    match namespace {
        Some(ns) => w.open_with("ErrorResponse", &[("xmlns".to_string(), ns.to_string())]),
        None => w.open("ErrorResponse"),
    };
    w.open("Error")
        .leaf("Type", fault.fault_type())
        .leaf("Code", &fault.code)
        .leaf("Message", &fault.message);
    for (name, value) in &fault.fields {
        w.leaf(name, &coerce::scalar_text(value, TimestampFormat::Iso8601));
    }
    w.close("Error")
        .leaf("RequestId", request_id)
        .close("ErrorResponse");
    w.finish()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
