//! Wire-protocol codecs.
//!
//! One [`Codec`] per protocol family turns an HTTP request into typed
//! [`Params`] for an operation and renders output params or a
//! [`ServiceError`] back into an HTTP response. [`CodecSet`] owns one
//! instance of each and adds the checks every protocol shares.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use http::header::{HeaderName, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use stratus_core::{OperationModel, Params, Protocol, ServiceError, ServiceModel};

pub mod cbor;
pub mod coerce;
pub mod json;
pub mod query;
pub mod rest;
pub mod rest_json;
pub mod rest_xml;
pub mod xml;

pub use cbor::CborCodec;
pub use json::JsonCodec;
pub use query::{QueryCodec, QueryDialect};
pub use rest_json::RestJsonCodec;
pub use rest_xml::RestXmlCodec;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Request decoding failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The body is not a well-formed document of the protocol.
    #[error("{0}")]
    Parse(String),
    /// The document is well-formed but does not fit the input shape.
    #[error("{0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Request / response views
// ---------------------------------------------------------------------------

/// Borrowed view of the parts of an HTTP request a codec reads.
#[derive(Debug, Clone, Copy)]
pub struct WireRequest<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    /// Raw query string without the leading `?`.
    pub query: &'a str,
    pub headers: &'a HeaderMap,
    pub body: &'a [u8],
    /// Decoded `{Label}` values of the matched request URI template.
    pub path_params: &'a BTreeMap<String, String>,
}

impl WireRequest<'_> {
    /// Header value as text, if present and valid UTF-8.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Decoded query string pairs in order of appearance.
    #[must_use]
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        form_urlencoded::parse(self.query.as_bytes())
            .into_owned()
            .collect()
    }
}

/// A fully rendered response.
#[derive(Debug, Clone)]
pub struct EncodedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl EncodedResponse {
    /// Response with a content type and body.
    #[must_use]
    pub fn new(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// Adds a header, skipping values that are not valid header text.
    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
        self.insert_header(name, value);
        self
    }

    /// Inserts a header in place, skipping values that are not valid header text.
    pub fn insert_header(&mut self, name: HeaderName, value: &str) {
        match HeaderValue::from_str(value) {
            Ok(v) => {
                self.headers.insert(name, v);
            }
            Err(_) => tracing::warn!(header = %name, "dropping header with invalid value"),
        }
    }
}

/// Status code of a fault, falling back to 500 for out-of-range values.
pub(crate) fn fault_status(fault: &ServiceError) -> StatusCode {
    StatusCode::from_u16(fault.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

// ---------------------------------------------------------------------------
// Codec trait
// ---------------------------------------------------------------------------

/// Serializer/deserializer for one protocol family.
pub trait Codec: Send + Sync + fmt::Debug {
    /// Protocol this codec speaks.
    fn protocol(&self) -> Protocol;

    /// Decodes the request into params typed by the operation's input shape.
    ///
    /// Required-member checks are not part of this step; [`CodecSet::decode`]
    /// runs them on the assembled result.
    ///
    /// # Errors
    ///
    /// [`DecodeError::Parse`] for malformed documents,
    /// [`DecodeError::Validation`] for shape mismatches.
    fn decode(
        &self,
        service: &ServiceModel,
        operation: &OperationModel,
        request: &WireRequest<'_>,
    ) -> Result<Params, DecodeError>;

    /// Renders output params. Only members declared in the output shape are
    /// written.
    ///
    /// # Errors
    ///
    /// Fails only if the body serializer fails.
    fn encode(
        &self,
        service: &ServiceModel,
        operation: &OperationModel,
        output: &Params,
        request_id: &str,
    ) -> anyhow::Result<EncodedResponse>;

    /// Renders a fault in the protocol's canonical error representation.
    fn encode_error(
        &self,
        service: Option<&ServiceModel>,
        fault: &ServiceError,
        request_id: &str,
    ) -> EncodedResponse;
}

/// One codec per protocol family.
#[derive(Debug)]
pub struct CodecSet {
    query: QueryCodec,
    ec2: QueryCodec,
    json: JsonCodec,
    rest_json: RestJsonCodec,
    rest_xml: RestXmlCodec,
    cbor: CborCodec,
}

impl CodecSet {
    /// Creates the set. With `strict`, undeclared input members are rejected.
    #[must_use]
    pub fn new(strict: bool) -> Self {
        Self {
            query: QueryCodec::new(QueryDialect::Query, strict),
            ec2: QueryCodec::new(QueryDialect::Ec2, strict),
            json: JsonCodec::new(strict),
            rest_json: RestJsonCodec::new(strict),
            rest_xml: RestXmlCodec::new(strict),
            cbor: CborCodec::new(strict),
        }
    }

    /// The codec for a protocol.
    #[must_use]
    pub fn get(&self, protocol: Protocol) -> &dyn Codec {
        match protocol {
            Protocol::Query => &self.query,
            Protocol::Ec2 => &self.ec2,
            Protocol::Json => &self.json,
            Protocol::RestJson => &self.rest_json,
            Protocol::RestXml => &self.rest_xml,
            Protocol::SmithyRpcV2Cbor => &self.cbor,
        }
    }

    /// Decodes with the service's codec and checks required members.
    ///
    /// # Errors
    ///
    /// See [`Codec::decode`]; a missing required member is a
    /// [`DecodeError::Validation`].
    pub fn decode(
        &self,
        service: &ServiceModel,
        operation: &OperationModel,
        request: &WireRequest<'_>,
    ) -> Result<Params, DecodeError> {
        let params = self.get(service.protocol).decode(service, operation, request)?;
        if let Some(input) = operation.input.as_deref() {
            coerce::check_required(service, input, &params, "")?;
        }
        Ok(params)
    }
}

impl Default for CodecSet {
    fn default() -> Self {
        Self::new(false)
    }
}

// ---------------------------------------------------------------------------
// Test fixtures
// ---------------------------------------------------------------------------
