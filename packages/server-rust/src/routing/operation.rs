//! Operation resolution per protocol family.

use std::collections::BTreeMap;

use http::Method;
use stratus_core::{Catalog, Protocol, ServiceModel};

use super::template::{rank, Ranked, UriTemplate};
use super::{IdentificationError, RequestRouter};
use crate::codec::WireRequest;

/// A compiled REST binding of one operation.
#[derive(Debug, Clone)]
pub struct RestRoute {
    pub operation: String,
    pub method: Method,
    pub template: UriTemplate,
}

/// The operation a request targets, with decoded URI labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedOperation {
    pub name: String,
    pub path_params: BTreeMap<String, String>,
}

impl ResolvedOperation {
    fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path_params: BTreeMap::new(),
        }
    }
}

/// Compiles the request URI templates of every REST service in the catalog.
pub(crate) fn compile_routes(catalog: &dyn Catalog) -> BTreeMap<String, Vec<RestRoute>> {
    let mut routes = BTreeMap::new();
    for service in catalog.services().iter().filter(|s| s.protocol.is_rest()) {
        let mut compiled = Vec::with_capacity(service.operations.len());
        for op in service.operations.values() {
            let Ok(method) = Method::from_bytes(op.http.method.as_bytes()) else {
                tracing::warn!(service = %service.name, operation = %op.name, method = %op.http.method, "skipping operation with invalid method");
                continue;
            };
            match UriTemplate::parse(&op.http.request_uri) {
                Ok(template) => compiled.push(RestRoute {
                    operation: op.name.clone(),
                    method,
                    template,
                }),
                Err(e) => {
                    tracing::warn!(service = %service.name, operation = %op.name, error = %e, "skipping operation with invalid request URI");
                }
            }
        }
        routes.insert(service.name.clone(), compiled);
    }
    routes
}

/// `/service/<Name>/operation/<Op>` of an RPC v2 request.
pub(crate) fn rpc_v2_path(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix("/service/")?;
    let (service, op) = rest.split_once("/operation/")?;
    (!service.is_empty() && !op.is_empty() && !op.contains('/')).then_some((service, op))
}

/// `(prefix, operation)` of the `X-Amz-Target` header.
pub(crate) fn target_header<'a>(request: &'a WireRequest<'_>) -> Option<(&'a str, &'a str)> {
    request.header("x-amz-target")?.rsplit_once('.')
}

/// The `Action` of a form-encoded request, from the body or the query string.
pub(crate) fn form_action(request: &WireRequest<'_>) -> Option<String> {
    let is_form = request
        .header("content-type")
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
    let find = |bytes: &[u8]| {
        form_urlencoded::parse(bytes)
            .find(|(k, _)| k == "Action")
            .map(|(_, v)| v.into_owned())
    };
    is_form
        .then(|| find(request.body))
        .flatten()
        .or_else(|| find(request.query.as_bytes()))
}

impl RequestRouter {
    /// Resolves the operation of a request already attributed to `service`.
    ///
    /// # Errors
    ///
    /// [`IdentificationError`] when the request names no operation, names
    /// one the model lacks, or matches several REST templates equally well.
    pub fn resolve_operation(
        &self,
        service: &ServiceModel,
        request: &WireRequest<'_>,
    ) -> Result<ResolvedOperation, IdentificationError> {
        let named = |operation: &str| {
            if service.operation(operation).is_some() {
                Ok(ResolvedOperation::named(operation))
            } else {
                Err(IdentificationError::UnknownOperation {
                    service: service.name.clone(),
                    operation: operation.to_string(),
                })
            }
        };
        let missing = |detail| IdentificationError::MissingOperation {
            service: service.name.clone(),
            detail,
        };

        match service.protocol {
            Protocol::Json => {
                let (_, op) = target_header(request).ok_or_else(|| missing("no X-Amz-Target header"))?;
                named(op)
            }
            Protocol::Query | Protocol::Ec2 => {
                let action = form_action(request).ok_or_else(|| missing("no Action parameter"))?;
                named(&action)
            }
            Protocol::SmithyRpcV2Cbor => {
                let (_, op) = rpc_v2_path(request.path)
                    .ok_or_else(|| missing("path is not /service/<name>/operation/<op>"))?;
                named(op)
            }
            Protocol::RestJson | Protocol::RestXml => match self.match_rest(&service.name, request) {
                Ranked::Unique(resolved) => Ok(resolved),
                Ranked::Tie(candidates) => Err(IdentificationError::Ambiguous {
                    service: service.name.clone(),
                    candidates: candidates.into_iter().map(|c| c.name).collect(),
                }),
                Ranked::None => Err(IdentificationError::UnknownOperation {
                    service: service.name.clone(),
                    operation: format!("{} {}", request.method, request.path),
                }),
            },
        }
    }

    /// Ranks the REST routes of a service against the request.
    pub(crate) fn match_rest(
        &self,
        service: &str,
        request: &WireRequest<'_>,
    ) -> Ranked<ResolvedOperation> {
        let Some(routes) = self.routes.get(service) else {
            return Ranked::None;
        };
        let query = request.query_pairs();
        let candidates = routes
            .iter()
            .filter(|r| r.method == *request.method)
            .filter_map(|r| {
                let params = r.template.matches(request.path, &query)?;
                Some((
                    r.template.specificity(),
                    ResolvedOperation {
                        name: r.operation.clone(),
                        path_params: params,
                    },
                ))
            })
            .collect();
        rank(candidates)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
