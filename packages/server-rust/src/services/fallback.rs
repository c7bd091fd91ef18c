//! Broad, model-driven emulation for operations without a native handler.
//!
//! Operations are read as `<Verb><Noun>`: `CreateTable` creates a `Table`,
//! `ListTables` lists them. Resources are plain parameter maps stored per
//! tenant and rendered back through whatever the output shape declares.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use stratus_core::{Params, ServiceError, ServiceModel, ShapeKind, TenantContext, Value};

use crate::service::dispatch::{Fallback, HandlerError};
use crate::service::ServerConfig;
use crate::storage::{AccountRegionStore, Attribute, TenantValidator};

/// Resources by kind, then by identifier.
type Resources = RwLock<BTreeMap<String, BTreeMap<String, Params>>>;

static RESOURCES: Attribute<Resources> = Attribute::local("resources", || RwLock::new(BTreeMap::new()));

/// Verb families the emulation understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    /// `Create*`: fails when the resource exists.
    Create,
    /// `Put*`: creates or replaces.
    Put,
    /// `Describe*`, `Get*`.
    Read,
    /// `List*`.
    List,
    /// `Update*`, `Modify*`: merges into an existing resource.
    Update,
    /// `Delete*`, `Remove*`.
    Delete,
}

impl Verb {
    const PREFIXES: [(&'static str, Verb); 9] = [
        ("Create", Verb::Create),
        ("Put", Verb::Put),
        ("Describe", Verb::Read),
        ("Get", Verb::Read),
        ("List", Verb::List),
        ("Update", Verb::Update),
        ("Modify", Verb::Update),
        ("Delete", Verb::Delete),
        ("Remove", Verb::Delete),
    ];

    /// Splits an operation name into verb and singular resource kind.
    #[must_use]
    pub fn parse(operation: &str) -> Option<(Verb, String)> {
        let (verb, noun) = Self::PREFIXES.iter().find_map(|(prefix, verb)| {
            let rest = operation.strip_prefix(prefix)?;
            rest.starts_with(|c: char| c.is_ascii_uppercase()).then_some((*verb, rest))
        })?;
        let noun = if verb == Verb::List { singular(noun) } else { noun.to_string() };
        Some((verb, noun))
    }
}

fn singular(noun: &str) -> String {
    if let Some(stem) = noun.strip_suffix("ies") {
        format!("{stem}y")
    } else if noun.ends_with("ss") {
        noun.to_string()
    } else {
        noun.strip_suffix('s').unwrap_or(noun).to_string()
    }
}

/// Generic emulation shared by every fallback-enabled service.
#[derive(Debug)]
pub struct ConventionalFallback {
    validator: TenantValidator,
    stores: DashMap<String, Arc<AccountRegionStore>>,
}

impl ConventionalFallback {
    #[must_use]
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            validator: TenantValidator::new(config.permissive_regions),
            stores: DashMap::new(),
        }
    }

    fn store(&self, service: &str) -> Arc<AccountRegionStore> {
        Arc::clone(
            self.stores
                .entry(service.to_string())
                .or_insert_with(|| Arc::new(AccountRegionStore::new(service, self.validator)))
                .value(),
        )
    }

    /// Drops everything stored for `service`.
    pub fn reset(&self, service: &str) {
        if let Some((_, store)) = self.stores.remove(service) {
            store.reset();
        }
    }
}

#[async_trait]
impl Fallback for ConventionalFallback {
    async fn invoke(&self, ctx: &TenantContext, operation: &str, params: Params) -> Result<Params, HandlerError> {
        let service = &ctx.service;
        let Some((verb, kind)) = Verb::parse(operation) else {
            return Err(ServiceError::new(
                "NotImplemented",
                format!("{operation} of {} has no generic emulation", service.name),
            )
            .with_status(501)
            .into());
        };
        let tenant = self.store(&service.name).get(&ctx.account_id, &ctx.region)?;
        let resources = tenant.get(&RESOURCES);

        let named = |params: &Params| {
            let id = identifier(&kind, params).ok_or_else(|| {
                ServiceError::new(
                    "ValidationException",
                    format!("{operation} does not name a {kind}"),
                )
            })?;
            tracing::debug!(service = %service.name, operation, verb = ?verb, kind = %kind, id = %id, "fallback");
            Ok::<_, ServiceError>(id)
        };

        let mut resources = resources.write();
        let record = match verb {
            Verb::List => {
                let empty = BTreeMap::new();
                let all = resources.get(&kind).unwrap_or(&empty);
                tracing::debug!(service = %service.name, operation, kind = %kind, count = all.len(), "fallback list");
                return Ok(render_list(service, operation, all));
            }
            Verb::Create | Verb::Put => {
                let id = named(&params)?;
                let of_kind = resources.entry(kind.clone()).or_default();
                if verb == Verb::Create && of_kind.contains_key(&id) {
                    return Err(in_use(&kind, &id).into());
                }
                let record = new_record(ctx, &kind, &id, params);
                of_kind.insert(id, record.clone());
                record
            }
            Verb::Read => {
                let id = named(&params)?;
                resources
                    .get(&kind)
                    .and_then(|of_kind| of_kind.get(&id))
                    .cloned()
                    .ok_or_else(|| not_found(&kind, &id))?
            }
            Verb::Update => {
                let id = named(&params)?;
                let record = resources
                    .get_mut(&kind)
                    .and_then(|of_kind| of_kind.get_mut(&id))
                    .ok_or_else(|| not_found(&kind, &id))?;
                record.extend(params);
                record.clone()
            }
            Verb::Delete => {
                let id = named(&params)?;
                let mut record = resources
                    .get_mut(&kind)
                    .and_then(|of_kind| of_kind.remove(&id))
                    .ok_or_else(|| not_found(&kind, &id))?;
                record.insert(format!("{kind}Status"), Value::from("DELETING"));
                record
            }
        };
        drop(resources);
        Ok(render_one(service, operation, &record))
    }
}

/// Identifier of the addressed resource: `<Kind>Name`, `<Kind>Id`,
/// `<Kind>Arn`, then `Name`, `Id`, `Key`.
fn identifier(kind: &str, params: &Params) -> Option<String> {
    let candidates = [
        format!("{kind}Name"),
        format!("{kind}Id"),
        format!("{kind}Arn"),
        "Name".to_string(),
        "Id".to_string(),
        "Key".to_string(),
    ];
    candidates.iter().find_map(|key| match params.get(key)? {
        Value::String(s) => Some(s.clone()),
        other => serde_json::to_string(other).ok(),
    })
}

fn new_record(ctx: &TenantContext, kind: &str, id: &str, params: Params) -> Params {
    let mut record = params;
    record.insert(format!("{kind}Status"), Value::from("ACTIVE"));
    record
        .entry(format!("{kind}Arn"))
        .or_insert_with(|| Value::String(ctx.arn(&format!("{}/{id}", kind.to_ascii_lowercase()))));
    record.insert("CreationDateTime".to_string(), Value::Timestamp(Utc::now()));
    record
}

fn not_found(kind: &str, id: &str) -> ServiceError {
    ServiceError::new("ResourceNotFoundException", format!("{kind} not found: {id}"))
}

fn in_use(kind: &str, id: &str) -> ServiceError {
    ServiceError::new("ResourceInUseException", format!("{kind} already exists: {id}"))
}

/// Output with every structure member set to the record and every scalar
/// member copied from it. The codec drops what the shapes do not declare.
fn render_one(service: &ServiceModel, operation: &str, record: &Params) -> Params {
    let Some(output) = service.operation(operation).and_then(|op| service.output_shape(op)) else {
        return Params::new();
    };
    output
        .members
        .iter()
        .filter_map(|(name, member)| {
            let target = service.shape(&member.shape)?;
            if target.kind == ShapeKind::Structure {
                Some((name.clone(), Value::Map(record.clone())))
            } else {
                record.get(name).map(|v| (name.clone(), v.clone()))
            }
        })
        .collect()
}

/// Output with every list member filled: structures for lists of
/// structures, identifiers otherwise.
fn render_list(service: &ServiceModel, operation: &str, all: &BTreeMap<String, Params>) -> Params {
    let Some(output) = service.operation(operation).and_then(|op| service.output_shape(op)) else {
        return Params::new();
    };
    output
        .members
        .iter()
        .filter_map(|(name, member)| {
            let target = service.shape(&member.shape)?;
            if target.kind != ShapeKind::List {
                return None;
            }
            let item = target.member.as_ref().and_then(|m| service.shape(&m.shape))?;
            let values = if item.kind == ShapeKind::Structure {
                all.values().map(|r| Value::Map(r.clone())).collect()
            } else {
                all.keys().map(|id| Value::String(id.clone())).collect()
            };
            Some((name.clone(), Value::List(values)))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use stratus_core::Catalog;

    use super::*;
    use crate::services::builtin_catalog;

    fn ctx(operation: &str, account: &str) -> TenantContext {
        TenantContext {
            account_id: account.to_string(),
            region: "us-east-1".to_string(),
            request_id: "req".to_string(),
            service: builtin_catalog().unwrap().service("dynamodb").unwrap(),
            operation: operation.to_string(),
            internal_params: None,
        }
    }

    fn table(name: &str) -> Params {
        Params::from([("TableName".to_string(), Value::from(name))])
    }

    async fn call(fallback: &ConventionalFallback, operation: &str, account: &str, params: Params) -> Result<Params, HandlerError> {
        fallback.invoke(&ctx(operation, account), operation, params).await
    }

    fn code(err: HandlerError) -> String {
        match err {
            HandlerError::Service(e) => e.code,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_verbs_and_nouns() {
        assert_eq!(Verb::parse("CreateTable"), Some((Verb::Create, "Table".to_string())));
        assert_eq!(Verb::parse("ListTables"), Some((Verb::List, "Table".to_string())));
        assert_eq!(Verb::parse("ListPolicies"), Some((Verb::List, "Policy".to_string())));
        assert_eq!(Verb::parse("ListAccess"), Some((Verb::List, "Access".to_string())));
        assert_eq!(Verb::parse("DescribeTable"), Some((Verb::Read, "Table".to_string())));
        assert_eq!(Verb::parse("Getaway"), None);
        assert_eq!(Verb::parse("TagResource"), None);
    }

    #[tokio::test]
    async fn create_describe_list_delete() {
        let fallback = ConventionalFallback::new(&ServerConfig::default());
        let account = "000000000000";

        let created = call(&fallback, "CreateTable", account, table("users")).await.unwrap();
        let description = created["TableDescription"].as_map().unwrap();
        assert_eq!(description["TableName"], Value::from("users"));
        assert_eq!(description["TableStatus"], Value::from("ACTIVE"));
        assert_eq!(
            description["TableArn"],
            Value::from("arn:aws:dynamodb:us-east-1:000000000000:table/users")
        );

        let dup = call(&fallback, "CreateTable", account, table("users")).await.unwrap_err();
        assert_eq!(code(dup), "ResourceInUseException");

        call(&fallback, "CreateTable", account, table("orders")).await.unwrap();
        let listed = call(&fallback, "ListTables", account, Params::new()).await.unwrap();
        assert_eq!(
            listed["TableNames"],
            Value::List(vec![Value::from("orders"), Value::from("users")])
        );

        let described = call(&fallback, "DescribeTable", account, table("users")).await.unwrap();
        assert_eq!(described["Table"].as_map().unwrap()["TableName"], Value::from("users"));

        call(&fallback, "DeleteTable", account, table("users")).await.unwrap();
        let missing = call(&fallback, "DescribeTable", account, table("users")).await.unwrap_err();
        assert_eq!(code(missing), "ResourceNotFoundException");
    }

    #[tokio::test]
    async fn empty_listing_and_missing_deletes() {
        let fallback = ConventionalFallback::new(&ServerConfig::default());
        let account = "000000000000";

        let listed = call(&fallback, "ListTables", account, Params::new()).await.unwrap();
        assert_eq!(listed["TableNames"], Value::List(vec![]));

        let err = call(&fallback, "DeleteTable", account, table("ghost")).await.unwrap_err();
        assert_eq!(code(err), "ResourceNotFoundException");
        let err = call(&fallback, "UpdateTable", account, table("ghost")).await.unwrap_err();
        assert_eq!(code(err), "ResourceNotFoundException");

        let listed = call(&fallback, "ListTables", account, Params::new()).await.unwrap();
        assert_eq!(listed["TableNames"], Value::List(vec![]));
    }

    #[tokio::test]
    async fn resources_are_tenant_scoped() {
        let fallback = ConventionalFallback::new(&ServerConfig::default());
        call(&fallback, "CreateTable", "111111111111", table("t")).await.unwrap();
        let other = call(&fallback, "DescribeTable", "222222222222", table("t")).await.unwrap_err();
        assert_eq!(code(other), "ResourceNotFoundException");

        fallback.reset("dynamodb");
        let gone = call(&fallback, "DescribeTable", "111111111111", table("t")).await.unwrap_err();
        assert_eq!(code(gone), "ResourceNotFoundException");
    }

    #[tokio::test]
    async fn update_merges_and_unnamed_requests_fail() {
        let fallback = ConventionalFallback::new(&ServerConfig::default());
        let account = "000000000000";
        call(&fallback, "CreateTable", account, table("t")).await.unwrap();

        let mut update = table("t");
        update.insert("BillingMode".to_string(), Value::from("PAY_PER_REQUEST"));
        call(&fallback, "UpdateTable", account, update).await.unwrap();
        let described = call(&fallback, "DescribeTable", account, table("t")).await.unwrap();
        assert_eq!(
            described["Table"].as_map().unwrap()["BillingMode"],
            Value::from("PAY_PER_REQUEST")
        );

        let err = call(&fallback, "DescribeTable", account, Params::new()).await.unwrap_err();
        assert_eq!(code(err), "ValidationException");
    }
}
