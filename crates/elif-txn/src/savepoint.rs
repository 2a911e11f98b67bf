//! Transaction Savepoints
//!
//! A [`ResourceSavepoint`] is an opaque rollback marker on one resource. A
//! [`CompositeSavepoint`] bundles one marker per resource that existed when it
//! was taken; resources acquired afterwards are not covered by it.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::connection::FactoryKey;
use crate::resource::DeferredQueue;

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Unique id of a transaction resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(u64);

impl ResourceId {
    pub(crate) fn next() -> Self {
        ResourceId(NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Unique id of a transaction scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(u64);

impl TransactionId {
    pub(crate) fn next() -> Self {
        TransactionId(NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// Rollback marker on a single resource
#[derive(Debug, Clone)]
pub struct ResourceSavepoint {
    pub(crate) resource_id: ResourceId,
    /// Driver savepoint name, absent when the resource had no open connection
    pub(crate) name: Option<String>,
    pub(crate) queue: DeferredQueue,
}

impl ResourceSavepoint {
    pub fn resource_id(&self) -> ResourceId {
        self.resource_id
    }

    /// Generated driver savepoint name (`SAVEPOINT_<n>`)
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

/// One savepoint per resource known at creation time
#[derive(Debug, Clone)]
pub struct CompositeSavepoint {
    pub(crate) transaction_id: TransactionId,
    pub(crate) entries: Vec<(FactoryKey, ResourceSavepoint)>,
}

impl CompositeSavepoint {
    /// Root transaction this savepoint was taken on
    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn covers(&self, factory: FactoryKey) -> bool {
        self.entries.iter().any(|(key, _)| *key == factory)
    }

    pub fn get(&self, factory: FactoryKey) -> Option<&ResourceSavepoint> {
        self.entries
            .iter()
            .find(|(key, _)| *key == factory)
            .map(|(_, sp)| sp)
    }
}
