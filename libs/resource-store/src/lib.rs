//! # resource-store
//!
//! `resource-store` defines a trait `ResourceStore` that provides get/list/
//! create/update/delete over [`Lease`], [`Pool`] and [`Network`] objects plus a
//! change subscription per [`Kind`].
//!
//! Deletion is two-phase: an object whose `finalizer` flag is set is only
//! stamped with a deletion timestamp, and disappears once an update clears
//! the flag. Subscribers see every create/update/delete in write order.
//!
//! [`MemoryStore`] is an in-process implementation.
//!
//! [`ResourceStore`]: crate::ResourceStore
//! [`MemoryStore`]: crate::memory::MemoryStore
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    non_snake_case,
    non_upper_case_globals
)]
use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use futures::stream::BoxStream;

pub mod error;
pub mod memory;
pub mod models;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use models::*;

/// stream of change notifications for a single kind
pub type NotificationStream = BoxStream<'static, StoreResult<Notification>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Created,
    Updated,
    /// the object is gone from the store, `object` holds its last state
    Deleted,
}

/// A change to one object, carrying the object's state after the change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub change: ChangeType,
    pub object: Object,
}

impl Notification {
    pub fn kind(&self) -> Kind {
        self.object.kind()
    }

    pub fn key(&self) -> ObjectKey {
        self.object.key()
    }
}

/// Label selector, all requirements must hold.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    equals: BTreeMap<String, String>,
    absent: BTreeSet<String>,
}

impl Selector {
    /// matches every object
    pub fn everything() -> Self {
        Self::default()
    }

    /// label `key` must equal `val`
    pub fn eq(mut self, key: impl Into<String>, val: impl Into<String>) -> Self {
        self.equals.insert(key.into(), val.into());
        self
    }

    /// label `key` must not be set
    pub fn absent(mut self, key: impl Into<String>) -> Self {
        self.absent.insert(key.into());
        self
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.equals
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|l| l == v))
            && self.absent.iter().all(|k| !labels.contains_key(k))
    }
}

/// Capability over the external declarative store that schedules capacity.
///
/// Implementations must deliver notifications for the same object in the
/// order the writes were applied.
#[async_trait]
pub trait ResourceStore: Send + Sync + 'static {
    /// fetch one object, `StoreError::NotFound` if it doesn't exist
    async fn get<R: Resource>(&self, namespace: &str, name: &str) -> StoreResult<R>;

    /// all objects of a kind in `namespace` whose labels match `selector`
    async fn list<R: Resource>(&self, namespace: &str, selector: &Selector)
    -> StoreResult<Vec<R>>;

    /// create the object, generating a name from `generate_name` if `name` is
    /// empty. Returns the object as stored.
    async fn create<R: Resource>(&self, object: R) -> StoreResult<R>;

    /// replace the object. The resource version must match the stored one.
    /// Clearing the finalizer on a deleting object removes it.
    async fn update<R: Resource>(&self, object: R) -> StoreResult<R>;

    /// request removal. Objects with a finalizer are only marked for deletion.
    async fn delete<R: Resource>(&self, object: &R) -> StoreResult<()>;

    /// change notifications for every object of `kind`
    fn subscribe(&self, kind: Kind) -> NotificationStream;
}
