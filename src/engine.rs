//! Facade wiring one index's components together.
//!
//! Owns the storage, the map stage, the dispatcher, and the materialized
//! store, and exposes the surface an outer scheduler drives: feed document
//! changes in, run reduction cycles, query staleness and aggregates. The
//! facade adds no semantics of its own.

use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::aggregate::{
    lock_materialized, AggregateObserver, MaterializedStore, SharedMaterialized,
};
use crate::cancel::CancellationToken;
use crate::definition::IndexDefinition;
use crate::dispatch::{CycleReport, DispatcherConfig, ReductionDispatcher};
use crate::error::{ErrorLog, RecordedError, Result};
use crate::mapping::{DocumentChange, MapStage, MapStats};
use crate::model::ReduceKey;
use crate::storage::IndexStorage;

/// One map-reduce index: definition, storage, and workers, assembled.
pub struct MapReduceIndex {
    map_stage: MapStage,
    dispatcher: ReductionDispatcher,
    materialized: SharedMaterialized,
    errors: Arc<ErrorLog>,
}

impl MapReduceIndex {
    pub fn new(definition: IndexDefinition, config: DispatcherConfig) -> Self {
        let definition = Arc::new(definition);
        let storage = IndexStorage::new();
        let errors = Arc::new(ErrorLog::default());
        let materialized: SharedMaterialized = Arc::new(Mutex::new(MaterializedStore::new()));
        let map_stage = MapStage::new(storage.clone(), definition.clone(), errors.clone());
        let dispatcher = ReductionDispatcher::new(
            storage,
            definition,
            materialized.clone(),
            errors.clone(),
            config,
        );
        Self {
            map_stage,
            dispatcher,
            materialized,
            errors,
        }
    }

    pub fn with_defaults(definition: IndexDefinition) -> Self {
        Self::new(definition, DispatcherConfig::default())
    }

    /// Register an observer of materialized entry creations and deletions.
    pub fn register_observer(&self, observer: Arc<dyn AggregateObserver>) -> Result<()> {
        lock_materialized(&self.materialized)?.register_observer(observer);
        Ok(())
    }

    /// Apply a batch of document change notifications.
    pub fn index_documents(&self, changes: &[DocumentChange]) -> Result<MapStats> {
        self.map_stage.index_batch(changes)
    }

    /// Run one reduction cycle; returns whether any work was committed.
    pub fn run_reduction_cycle(&mut self, token: &CancellationToken) -> Result<bool> {
        self.dispatcher.run_reduction_cycle(token)
    }

    /// Run cycles until the ledger drains or the token trips.
    pub fn reduce_to_completion(&mut self, token: &CancellationToken) -> Result<()> {
        while self.is_stale()? {
            if token.is_cancelled() || !self.run_reduction_cycle(token)? {
                break;
            }
        }
        Ok(())
    }

    /// Purge residual state of keys no document produces anymore.
    pub fn drain_cleanup(&self) -> Result<usize> {
        self.map_stage.drain_cleanup()
    }

    pub fn is_stale(&self) -> Result<bool> {
        self.dispatcher.is_stale()
    }

    /// The materialized aggregate for a key, if present.
    pub fn aggregate(&self, key: &ReduceKey) -> Result<Option<Value>> {
        Ok(lock_materialized(&self.materialized)?.get(key).cloned())
    }

    /// All materialized entries, in key order.
    pub fn aggregates(&self) -> Result<Vec<(ReduceKey, Value)>> {
        Ok(lock_materialized(&self.materialized)?
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    pub fn last_report(&self) -> &CycleReport {
        self.dispatcher.last_report()
    }

    /// Recent recorded errors, oldest first.
    pub fn recent_errors(&self, n: usize) -> Vec<RecordedError> {
        self.errors.recent(n)
    }

    pub fn total_errors(&self) -> u64 {
        self.errors.total()
    }
}
