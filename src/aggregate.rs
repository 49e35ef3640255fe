//! Materialized aggregate output.
//!
//! The dispatcher hands the writer a per-cycle stream of (key, value) write
//! requests with delete-then-insert semantics: a recomputed key's prior entry
//! is always replaced wholesale. Observers are notified as entries appear and
//! disappear.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::error::{IndexError, Result};
use crate::model::ReduceKey;

/// One buffered write request produced by a reducer. `value: None` removes
/// the key's entry (its last contributing row is gone).
#[derive(Debug, Clone)]
pub struct AggregateWrite {
    pub key: ReduceKey,
    pub value: Option<Value>,
}

/// Hooks for external observers of the materialized aggregate.
pub trait AggregateObserver: Send + Sync {
    fn entry_created(&self, key: &ReduceKey, value: &Value);
    fn entry_deleted(&self, key: &ReduceKey);
}

/// Sink for reduced values. The engine buffers a whole cycle's writes and
/// applies them together, so no partially-reduced value is visible mid-cycle.
pub trait MaterializedWriter: Send {
    /// Replace the entry for `key` (delete-then-insert).
    fn put(&mut self, key: &ReduceKey, value: Value) -> Result<()>;

    /// Remove the entry for `key`, if any.
    fn delete(&mut self, key: &ReduceKey) -> Result<()>;
}

/// In-memory materialized aggregate store, shared between the dispatcher
/// (writer) and queries (reader).
#[derive(Default)]
pub struct MaterializedStore {
    entries: BTreeMap<ReduceKey, Value>,
    observers: Vec<Arc<dyn AggregateObserver>>,
}

impl MaterializedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_observer(&mut self, observer: Arc<dyn AggregateObserver>) {
        self.observers.push(observer);
    }

    pub fn get(&self, key: &ReduceKey) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&ReduceKey, &Value)> {
        self.entries.iter()
    }
}

impl MaterializedWriter for MaterializedStore {
    fn put(&mut self, key: &ReduceKey, value: Value) -> Result<()> {
        if self.entries.remove(key).is_some() {
            for observer in &self.observers {
                observer.entry_deleted(key);
            }
        }
        for observer in &self.observers {
            observer.entry_created(key, &value);
        }
        self.entries.insert(key.clone(), value);
        Ok(())
    }

    fn delete(&mut self, key: &ReduceKey) -> Result<()> {
        if self.entries.remove(key).is_some() {
            for observer in &self.observers {
                observer.entry_deleted(key);
            }
        }
        Ok(())
    }
}

/// Shared handle used by the engine: the dispatcher locks it per cycle flush,
/// queries lock it per read.
pub type SharedMaterialized = Arc<Mutex<MaterializedStore>>;

/// Lock helper that surfaces poisoning as a storage error instead of
/// panicking inside a cycle.
pub(crate) fn lock_materialized(
    store: &SharedMaterialized,
) -> Result<std::sync::MutexGuard<'_, MaterializedStore>> {
    store
        .lock()
        .map_err(|_| IndexError::Storage("materialized store lock poisoned".into()))
}
