//! Per-service tenant arena keyed by account and region.

use std::any::Any;
use std::sync::Arc;

use dashmap::DashMap;

use super::attribute::{Attribute, AttributeScope, AttributeSlots};
use super::tenant::{StoreError, TenantValidator};

/// State of one (account, region) tenant of a service.
///
/// Holds its own local slots plus shared handles to the account-wide and
/// process-wide slots, so a write through any tenant of the same account
/// is visible to every other region immediately.
#[derive(Debug)]
pub struct TenantState {
    account_id: String,
    region: String,
    local: AttributeSlots,
    account: Arc<AttributeSlots>,
    global: Arc<AttributeSlots>,
}

impl TenantState {
    /// Account this state belongs to.
    #[must_use]
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Region this state belongs to.
    #[must_use]
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Returns the value of `attr` from the slot map its scope selects.
    pub fn get<T: Any + Send + Sync>(&self, attr: &Attribute<T>) -> Arc<T> {
        match attr.scope() {
            AttributeScope::Local => self.local.get_or_init(attr),
            AttributeScope::CrossRegion => self.account.get_or_init(attr),
            AttributeScope::CrossAccount => self.global.get_or_init(attr),
        }
    }
}

/// Hierarchical state container of one service: account → region → state.
///
/// Tenants are created lazily on first [`get`](AccountRegionStore::get) and
/// live until reset. Creation goes through a `DashMap` entry, so concurrent
/// first accesses for one key observe the same `Arc<TenantState>`.
#[derive(Debug)]
pub struct AccountRegionStore {
    service: String,
    validator: TenantValidator,
    tenants: DashMap<(String, String), Arc<TenantState>>,
    accounts: DashMap<String, Arc<AttributeSlots>>,
    global: Arc<AttributeSlots>,
}

impl AccountRegionStore {
    /// Creates an empty store for the named service.
    #[must_use]
    pub fn new(service: impl Into<String>, validator: TenantValidator) -> Self {
        Self {
            service: service.into(),
            validator,
            tenants: DashMap::new(),
            accounts: DashMap::new(),
            global: Arc::new(AttributeSlots::default()),
        }
    }

    /// Name of the owning service.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Returns the tenant state, creating it on first access.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the account id or region is invalid; in that
    /// case no state is created.
    pub fn get(&self, account_id: &str, region: &str) -> Result<Arc<TenantState>, StoreError> {
        self.validator.validate(account_id, region)?;

        let key = (account_id.to_string(), region.to_string());
        if let Some(existing) = self.tenants.get(&key) {
            return Ok(Arc::clone(existing.value()));
        }

        let state = self
            .tenants
            .entry(key)
            .or_insert_with(|| {
                let account = self
                    .accounts
                    .entry(account_id.to_string())
                    .or_default()
                    .value()
                    .clone();
                tracing::debug!(
                    service = %self.service,
                    account_id,
                    region,
                    "creating tenant state"
                );
                Arc::new(TenantState {
                    account_id: account_id.to_string(),
                    region: region.to_string(),
                    local: AttributeSlots::default(),
                    account,
                    global: Arc::clone(&self.global),
                })
            })
            .value()
            .clone();
        Ok(state)
    }

    /// Snapshot of every materialized tenant.
    #[must_use]
    pub fn tenants(&self) -> Vec<Arc<TenantState>> {
        self.tenants.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Account ids that have state.
    #[must_use]
    pub fn accounts(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.accounts.iter().map(|e| e.key().clone()).collect();
        ids.sort_unstable();
        ids
    }

    /// Regions of `account_id` that have state.
    #[must_use]
    pub fn regions(&self, account_id: &str) -> Vec<String> {
        let mut regions: Vec<String> = self
            .tenants
            .iter()
            .filter(|e| e.key().0 == account_id)
            .map(|e| e.key().1.clone())
            .collect();
        regions.sort_unstable();
        regions
    }

    /// Drops all state of one account (local and cross-region).
    pub fn reset_account(&self, account_id: &str) {
        self.tenants.retain(|(account, _), _| account != account_id);
        self.accounts.remove(account_id);
    }

    /// Drops every tenant and the process-wide slots.
    pub fn reset(&self) {
        self.tenants.clear();
        self.accounts.clear();
        self.global.clear();
        tracing::info!(service = %self.service, "store reset");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
