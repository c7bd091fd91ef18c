//! Service identification and tenant extraction.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use stratus_core::{Params, ServiceModel, Value};

use super::operation::{form_action, rpc_v2_path, target_header};
use super::template::Ranked;
use super::{IdentificationError, RequestRouter, Signal, INTERNAL_DATA_HEADER};
use crate::codec::WireRequest;

/// Scope part of a SigV4 `Authorization` header.
static AUTH_CREDENTIAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Credential=([^,\s]+)").unwrap_or_else(|e| unreachable!("static pattern: {e}"))
});

/// Region-shaped host label (`us-east-1`, `us-gov-west-1`).
static REGION_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z]{2}(-[a-z]+)+-\d+$").unwrap_or_else(|e| unreachable!("static pattern: {e}"))
});

/// `AKID/date/region/service/aws4_request`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialScope {
    pub access_key: String,
    pub date: String,
    pub region: String,
    pub service: String,
}

impl CredentialScope {
    /// Parses the slash-separated credential string.
    #[must_use]
    pub fn parse(credential: &str) -> Option<Self> {
        let mut parts = credential.split('/');
        let access_key = parts.next()?;
        let date = parts.next()?;
        let region = parts.next()?;
        let service = parts.next()?;
        if parts.next()? != "aws4_request" || parts.next().is_some() {
            return None;
        }
        if access_key.is_empty() || region.is_empty() || service.is_empty() {
            return None;
        }
        Some(Self {
            access_key: access_key.to_string(),
            date: date.to_string(),
            region: region.to_string(),
            service: service.to_string(),
        })
    }

    /// Scope from the `Authorization` header, else the presigned
    /// `X-Amz-Credential` query parameter.
    #[must_use]
    pub fn from_request(request: &WireRequest<'_>) -> Option<Self> {
        if let Some(auth) = request.header("authorization") {
            if let Some(scope) = AUTH_CREDENTIAL
                .captures(auth)
                .and_then(|c| c.get(1))
                .and_then(|m| Self::parse(m.as_str()))
            {
                return Some(scope);
            }
        }
        request
            .query_pairs()
            .into_iter()
            .find(|(k, _)| k == "X-Amz-Credential")
            .and_then(|(_, v)| Self::parse(&v))
    }
}

/// The service a request targets and how it was recognized.
#[derive(Debug, Clone)]
pub struct Identified {
    pub service: Arc<ServiceModel>,
    pub signal: Signal,
    /// Parameters carried by the internal data header, minus `service`.
    pub internal_params: Option<Params>,
}

/// Account and region a request acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant {
    pub account_id: String,
    pub region: String,
}

struct VirtualHost {
    service: Option<Arc<ServiceModel>>,
    region: Option<String>,
}

impl RequestRouter {
    /// Attributes the request to a service by consulting the configured
    /// signals in order. The first signal that yields exactly one service
    /// wins.
    ///
    /// # Errors
    ///
    /// [`IdentificationError::UnknownService`] when no signal is conclusive.
    pub fn identify(&self, request: &WireRequest<'_>) -> Result<Identified, IdentificationError> {
        let marker = internal_marker(request);
        let internal_params = marker.as_ref().map(|(_, params)| params.clone());

        for signal in &self.config.order {
            let found = match signal {
                Signal::InternalMarker => marker
                    .as_ref()
                    .and_then(|(name, _)| name.as_deref())
                    .and_then(|name| self.catalog.service(name)),
                Signal::VirtualHost => self.virtual_host(request).and_then(|vh| vh.service),
                Signal::CredentialScope => self.by_credential_scope(request),
                Signal::TargetHeader => target_header(request)
                    .and_then(|(prefix, _)| self.catalog.service_by_target_prefix(prefix)),
                Signal::PathHeuristics => self.by_path(&self.catalog.services(), request),
            };
            if let Some(service) = found {
                tracing::debug!(service = %service.name, signal = %signal, "service identified");
                return Ok(Identified {
                    service,
                    signal: *signal,
                    internal_params,
                });
            }
        }

        Err(IdentificationError::UnknownService {
            method: request.method.to_string(),
            path: request.path.to_string(),
        })
    }

    /// Extracts the tenant: region from the credential scope, else a region
    /// label of the virtual host, else the default; account from a
    /// twelve-digit access key, else the default.
    #[must_use]
    pub fn tenant(&self, request: &WireRequest<'_>) -> Tenant {
        let scope = CredentialScope::from_request(request);
        let region = scope
            .as_ref()
            .map(|s| s.region.clone())
            .or_else(|| self.virtual_host(request).and_then(|vh| vh.region))
            .unwrap_or_else(|| self.config.default_region.clone());
        let account_id = scope
            .map(|s| s.access_key)
            .filter(|key| key.len() == 12 && key.bytes().all(|b| b.is_ascii_digit()))
            .unwrap_or_else(|| self.config.default_account.clone());
        Tenant { account_id, region }
    }

    /// `<service>[.<region>].<base>` or `<bucket>.<service>[.<region>].<base>`.
    fn virtual_host(&self, request: &WireRequest<'_>) -> Option<VirtualHost> {
        let host = request.header("host")?;
        let host = match host.rsplit_once(':') {
            Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
            _ => host,
        };
        let host = host.to_ascii_lowercase();

        let labels = self.config.base_domains.iter().find_map(|base| {
            let rest = host.strip_suffix(base.as_str())?.strip_suffix('.')?;
            (!rest.is_empty()).then(|| rest.split('.').map(str::to_string).collect::<Vec<_>>())
        })?;

        for idx in 0..labels.len().min(2) {
            let mut owners = self.catalog.services_by_endpoint_prefix(&labels[idx]);
            if owners.len() == 1 {
                let region = labels
                    .get(idx + 1)
                    .filter(|l| REGION_LABEL.is_match(l))
                    .cloned();
                return Some(VirtualHost {
                    service: owners.pop(),
                    region,
                });
            }
        }
        let region = labels.iter().find(|l| REGION_LABEL.is_match(l)).cloned();
        Some(VirtualHost {
            service: None,
            region,
        })
    }

    fn by_credential_scope(&self, request: &WireRequest<'_>) -> Option<Arc<ServiceModel>> {
        let scope = CredentialScope::from_request(request)?;
        let owners = self.catalog.services_by_signing_name(&scope.service);
        match owners.len() {
            0 => None,
            1 => owners.into_iter().next(),
            _ => {
                let by_target = target_header(request).and_then(|(prefix, _)| {
                    unique(
                        owners
                            .iter()
                            .filter(|s| s.metadata.target_prefix.as_deref() == Some(prefix))
                            .cloned()
                            .collect(),
                    )
                });
                by_target.or_else(|| self.by_path(&owners, request))
            }
        }
    }

    /// RPC v2 path, then REST template owner, then query `Action` owner.
    fn by_path(
        &self,
        candidates: &[Arc<ServiceModel>],
        request: &WireRequest<'_>,
    ) -> Option<Arc<ServiceModel>> {
        if let Some((name, _)) = rpc_v2_path(request.path) {
            let found = unique(
                candidates
                    .iter()
                    .filter(|s| {
                        s.metadata.target_prefix.as_deref() == Some(name)
                            || s.name == name
                            || s.metadata.service_id.as_deref() == Some(name)
                    })
                    .cloned()
                    .collect(),
            );
            if found.is_some() {
                return found;
            }
        }

        let rest = unique(
            candidates
                .iter()
                .filter(|s| s.protocol.is_rest())
                .filter(|s| !matches!(self.match_rest(&s.name, request), Ranked::None))
                .cloned()
                .collect(),
        );
        if rest.is_some() {
            return rest;
        }

        let action = form_action(request)?;
        unique(
            candidates
                .iter()
                .filter(|s| s.protocol.is_query_family() && s.operation(&action).is_some())
                .cloned()
                .collect(),
        )
    }
}

fn unique(mut found: Vec<Arc<ServiceModel>>) -> Option<Arc<ServiceModel>> {
    if found.len() == 1 {
        found.pop()
    } else {
        None
    }
}

/// `(service, params)` of the internal data header, when it holds a JSON
/// object.
fn internal_marker(request: &WireRequest<'_>) -> Option<(Option<String>, Params)> {
    let raw = request.header(INTERNAL_DATA_HEADER)?;
    let serde_json::Value::Object(fields) = serde_json::from_str(raw).ok()? else {
        tracing::debug!(header = INTERNAL_DATA_HEADER, "ignoring non-object internal data");
        return None;
    };
    let mut service = None;
    let mut params = Params::new();
    for (key, value) in fields {
        match (key.as_str(), value) {
            ("service", serde_json::Value::String(name)) => service = Some(name),
            (_, value) => {
                params.insert(key, Value::from_json(value));
            }
        }
    }
    Some((service, params))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
