//! Scoped attribute declarations and the slot maps that hold their values.
//!
//! A provider declares each piece of its state once, together with the scope
//! the value lives in:
//!
//! ```
//! use dashmap::DashMap;
//! use stratus_server::storage::{Attribute, AttributeScope};
//!
//! static QUEUES: Attribute<DashMap<String, u64>> = Attribute::local("queues", DashMap::new);
//! assert_eq!(QUEUES.scope(), AttributeScope::Local);
//! ```
//!
//! The store consults `scope()` directly to decide which slot map answers a
//! lookup; nothing redirects field access behind the caller's back.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

/// Sharing level of an attribute value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeScope {
    /// One value per (account, region).
    Local,
    /// One value per account, shared by all of its regions.
    CrossRegion,
    /// One value for the whole process.
    CrossAccount,
}

/// Declaration of a typed, scoped piece of service state.
///
/// `T` carries its own synchronization (`DashMap`, `RwLock`, atomics); the
/// store only guarantees that every caller sees the same `Arc<T>`.
pub struct Attribute<T> {
    name: &'static str,
    scope: AttributeScope,
    init: fn() -> T,
}

impl<T> Attribute<T> {
    /// Declares a per-(account, region) attribute.
    pub const fn local(name: &'static str, init: fn() -> T) -> Self {
        Self { name, scope: AttributeScope::Local, init }
    }

    /// Declares a per-account attribute shared across regions.
    pub const fn cross_region(name: &'static str, init: fn() -> T) -> Self {
        Self { name, scope: AttributeScope::CrossRegion, init }
    }

    /// Declares a process-wide attribute.
    pub const fn cross_account(name: &'static str, init: fn() -> T) -> Self {
        Self { name, scope: AttributeScope::CrossAccount, init }
    }

    /// Attribute name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Declared scope.
    #[must_use]
    pub const fn scope(&self) -> AttributeScope {
        self.scope
    }
}

impl<T> fmt::Debug for Attribute<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attribute")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Lazily populated attribute values of one scope instance.
///
/// Slots are keyed by `(name, TypeId)` so two declarations that share a name
/// but differ in type never alias.
#[derive(Default)]
pub struct AttributeSlots {
    slots: DashMap<(&'static str, TypeId), Arc<dyn Any + Send + Sync>>,
}

impl AttributeSlots {
    /// Returns the value for `attr`, creating it on first access.
    ///
    /// Creation runs under the map's shard lock, so concurrent first accesses
    /// observe the same instance.
    pub fn get_or_init<T: Any + Send + Sync>(&self, attr: &Attribute<T>) -> Arc<T> {
        let key = (attr.name, TypeId::of::<T>());
        let slot = self
            .slots
            .entry(key)
            .or_insert_with(|| Arc::new((attr.init)()) as Arc<dyn Any + Send + Sync>)
            .value()
            .clone();
        slot.downcast::<T>()
            .unwrap_or_else(|_| unreachable!("slot {} is keyed by its TypeId", attr.name))
    }

    /// Whether a value exists for `attr`.
    pub fn contains<T: Any>(&self, attr: &Attribute<T>) -> bool {
        self.slots.contains_key(&(attr.name, TypeId::of::<T>()))
    }

    /// Number of materialized attributes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no attribute has been materialized.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drops every value.
    pub fn clear(&self) {
        self.slots.clear();
    }
}

impl fmt::Debug for AttributeSlots {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.slots.iter().map(|e| e.key().0).collect();
        f.debug_struct("AttributeSlots").field("names", &names).finish()
    }
}
