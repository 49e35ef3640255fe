//! Map stage: turns document change notifications into mapped-result rows and
//! level-0 reduction markers.
//!
//! For each changed document the stage deletes the document's prior tuples,
//! re-evaluates the map function, writes the new tuples, and schedules a
//! level-0 marker for every (key, bucket) slot it touched — removed slots
//! included, so aggregates shrink as documents disappear. Keys that lost
//! their last producing document go to an asynchronous cleanup queue instead
//! of being processed inline, which keeps deletion fan-out off the
//! synchronous map path.
//!
//! Map failures are robust per document: the failure is recorded, the
//! document's stale tuples are removed, and the batch continues.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::definition::IndexDefinition;
use crate::error::{ErrorLog, IndexError, Result};
use crate::model::{
    Bucket, Document, DocumentId, Level, MappedResultEntry, ReduceKey, ScheduledReduction,
};
use crate::storage::{IndexStorage, WriteBatch};

/// A change notification from the document store.
#[derive(Debug, Clone)]
pub enum DocumentChange {
    Put(Document),
    Delete(DocumentId),
}

impl DocumentChange {
    fn doc_id(&self) -> &DocumentId {
        match self {
            DocumentChange::Put(doc) => &doc.id,
            DocumentChange::Delete(id) => id,
        }
    }
}

/// Counters for one map batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapStats {
    pub docs_put: usize,
    pub docs_removed: usize,
    pub docs_without_key: usize,
    pub docs_unchanged: usize,
    pub map_errors: usize,
    pub tuples_written: usize,
    pub tuples_deleted: usize,
}

/// Prior state of one document's tuples, captured before the batch mutates
/// anything.
type PriorTuples = Vec<(ReduceKey, Bucket, u64)>;

pub struct MapStage {
    storage: IndexStorage,
    definition: Arc<IndexDefinition>,
    errors: Arc<ErrorLog>,
    cleanup: Mutex<BTreeSet<ReduceKey>>,
}

impl MapStage {
    pub fn new(
        storage: IndexStorage,
        definition: Arc<IndexDefinition>,
        errors: Arc<ErrorLog>,
    ) -> Self {
        Self {
            storage,
            definition,
            errors,
            cleanup: Mutex::new(BTreeSet::new()),
        }
    }

    /// Apply a batch of document changes. One committed storage batch covers
    /// the whole call: tuple replacement, marker scheduling, and the change
    /// cursor bump become visible together.
    pub fn index_batch(&self, changes: &[DocumentChange]) -> Result<MapStats> {
        // A later change to a document supersedes an earlier one in the same
        // batch; only the last one is applied.
        let mut last: BTreeMap<&DocumentId, usize> = BTreeMap::new();
        for (i, change) in changes.iter().enumerate() {
            last.insert(change.doc_id(), i);
        }
        let effective: Vec<&DocumentChange> = changes
            .iter()
            .enumerate()
            .filter(|(i, change)| last[change.doc_id()] == *i)
            .map(|(_, change)| change)
            .collect();

        let prior = self.capture_prior(&effective)?;

        let mut batch = WriteBatch::new();
        // Bump before scheduling so every marker this batch inserts carries a
        // cursor strictly above any reduction cycle already in flight.
        batch.bump_change_cursor();
        let mut stats = MapStats::default();
        // Keys whose rows this batch removed and may have orphaned.
        let mut candidates: BTreeSet<ReduceKey> = BTreeSet::new();
        // Keys some document in this batch still produces.
        let mut produced: BTreeSet<ReduceKey> = BTreeSet::new();

        for (change, prior) in effective.into_iter().zip(prior) {
            match change {
                DocumentChange::Delete(id) => {
                    stats.docs_removed += 1;
                    remove_prior(&mut batch, id, &prior, &mut candidates, &mut stats);
                }
                DocumentChange::Put(doc) => {
                    let tuples = match self.definition.map(doc) {
                        Ok(tuples) => tuples,
                        Err(err) => {
                            stats.map_errors += 1;
                            self.errors.record(IndexError::Map {
                                doc_id: doc.id.clone(),
                                detail: err.to_string(),
                            });
                            remove_prior(&mut batch, &doc.id, &prior, &mut candidates, &mut stats);
                            continue;
                        }
                    };

                    if tuples.is_empty() {
                        debug!(doc = %doc.id, "document yields no reduce key, skipping");
                        stats.docs_without_key += 1;
                        remove_prior(&mut batch, &doc.id, &prior, &mut candidates, &mut stats);
                        continue;
                    }

                    let entries: Vec<MappedResultEntry> = tuples
                        .into_iter()
                        .map(|t| MappedResultEntry::new(doc.id.clone(), t.key, t.value))
                        .collect();

                    if same_content(&prior, &entries) {
                        stats.docs_unchanged += 1;
                        produced.extend(entries.into_iter().map(|e| e.key));
                        continue;
                    }

                    stats.docs_put += 1;
                    remove_prior(&mut batch, &doc.id, &prior, &mut candidates, &mut stats);
                    for entry in entries {
                        produced.insert(entry.key.clone());
                        batch.schedule(ScheduledReduction::new(
                            Level::Zero,
                            entry.key.clone(),
                            entry.bucket,
                        ));
                        batch.put_mapped(entry);
                        stats.tuples_written += 1;
                    }
                }
            }
        }

        candidates.retain(|key| !produced.contains(key));
        self.storage.commit(batch)?;

        if !candidates.is_empty() {
            let mut queue = lock_cleanup(&self.cleanup)?;
            queue.extend(candidates);
        }

        info!(
            index = self.definition.name(),
            docs = changes.len(),
            tuples = stats.tuples_written,
            map_errors = stats.map_errors,
            "map batch applied"
        );
        Ok(stats)
    }

    /// Process the asynchronous cleanup queue: purge the reduce-type entry and
    /// residual intermediates of keys that no document produces anymore.
    ///
    /// Keys with markers still pending stay queued; their aggregates are
    /// removed by the normal reduction path first. Returns the number of keys
    /// purged.
    pub fn drain_cleanup(&self) -> Result<usize> {
        let queued: Vec<ReduceKey> = {
            let mut queue = lock_cleanup(&self.cleanup)?;
            std::mem::take(&mut *queue).into_iter().collect()
        };
        if queued.is_empty() {
            return Ok(0);
        }

        let mut batch = WriteBatch::new();
        let mut requeue = Vec::new();
        let mut purged = 0usize;
        {
            let snap = self.storage.snapshot()?;
            for key in queued {
                if snap.has_rows_for_key(&key) {
                    // Re-referenced since it was queued.
                    continue;
                }
                if !snap.pending_for_key(&key).is_empty() {
                    requeue.push(key);
                    continue;
                }
                debug!(key = %key, "purging orphaned reduce key");
                batch.clear_intermediates(key.clone(), &Level::ALL);
                batch.clear_mode(key);
                purged += 1;
            }
        }
        self.storage.commit(batch)?;

        if !requeue.is_empty() {
            let mut queue = lock_cleanup(&self.cleanup)?;
            queue.extend(requeue);
        }
        Ok(purged)
    }

    /// Keys currently waiting in the cleanup queue.
    pub fn cleanup_backlog(&self) -> usize {
        lock_cleanup(&self.cleanup).map(|q| q.len()).unwrap_or(0)
    }

    fn capture_prior(&self, changes: &[&DocumentChange]) -> Result<Vec<PriorTuples>> {
        let snap = self.storage.snapshot()?;
        Ok(changes
            .iter()
            .map(|change| {
                snap.entries_for_document(change.doc_id())
                    .into_iter()
                    .map(|e| (e.key.clone(), e.bucket, e.content_hash))
                    .collect()
            })
            .collect())
    }
}

/// Delete a document's prior tuples and schedule the slots they occupied so
/// the next cycle folds the shrinkage in.
fn remove_prior(
    batch: &mut WriteBatch,
    doc_id: &DocumentId,
    prior: &PriorTuples,
    candidates: &mut BTreeSet<ReduceKey>,
    stats: &mut MapStats,
) {
    if prior.is_empty() {
        return;
    }
    batch.delete_doc_entries(doc_id.clone());
    stats.tuples_deleted += prior.len();
    for (key, bucket, _) in prior {
        batch.schedule(ScheduledReduction::new(Level::Zero, key.clone(), *bucket));
        candidates.insert(key.clone());
    }
}

/// True when a re-map reproduced the prior tuples exactly (same keys, same
/// values), in which case rewriting and rescheduling would only churn the
/// reducers.
fn same_content(prior: &PriorTuples, entries: &[MappedResultEntry]) -> bool {
    if prior.len() != entries.len() || prior.is_empty() {
        return false;
    }
    let mut old: Vec<u64> = prior.iter().map(|(_, _, hash)| *hash).collect();
    let mut new: Vec<u64> = entries.iter().map(|e| e.content_hash).collect();
    old.sort_unstable();
    new.sort_unstable();
    old == new
}

fn lock_cleanup(
    cleanup: &Mutex<BTreeSet<ReduceKey>>,
) -> Result<std::sync::MutexGuard<'_, BTreeSet<ReduceKey>>> {
    cleanup
        .lock()
        .map_err(|_| IndexError::Storage("cleanup queue lock poisoned".into()))
}
