//! Transactional keyed storage for one index.
//!
//! Holds the three persisted tables the engine bookkeeps with:
//!
//! 1. **Mapped results** — (document -> key, value) tuples, queryable by
//!    document id, by key, and by (key, bucket).
//! 2. **Scheduled-reduction ledger** — pending (level, key, bucket) work
//!    markers with set semantics.
//! 3. **Reduce-type directory** — the active strategy per key, plus the
//!    persisted tree intermediates that strategy relies on.
//!
//! The contract the rest of the engine depends on: [`Snapshot`] is a
//! consistent view for the duration of a read transaction, and a
//! [`WriteBatch`] either commits every buffered operation or none of them.
//! Any transactional keyed store could sit behind this API; the in-memory
//! implementation is the simplest one that honors it.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard};

use serde_json::Value;

use crate::error::{IndexError, Result};
use crate::model::{
    Bucket, DocumentId, Level, MappedResultEntry, ReduceKey, ReduceMode, ScheduledReduction,
};

/// Rows for one key: bucket -> document -> tuples (a document may emit
/// several tuples under the same key).
type KeyRows = BTreeMap<Bucket, BTreeMap<DocumentId, Vec<MappedResultEntry>>>;

#[derive(Debug, Default)]
struct Tables {
    mapped: BTreeMap<ReduceKey, KeyRows>,
    /// Reverse index: which (key, bucket) slots a document wrote into.
    doc_refs: BTreeMap<DocumentId, Vec<(ReduceKey, Bucket)>>,
    /// Pending markers, each tagged with the change cursor at insertion so a
    /// marker re-scheduled after a cycle's snapshot survives that cycle's
    /// deletions.
    ledger: BTreeMap<ScheduledReduction, u64>,
    modes: BTreeMap<ReduceKey, ReduceMode>,
    /// Reduced partial results per (key, level, bucket), reused as-is for
    /// buckets untouched by later cycles.
    intermediates: BTreeMap<ReduceKey, BTreeMap<(Level, Bucket), Value>>,
    /// Monotonic counter bumped by every committed map batch.
    change_cursor: u64,
    /// Change cursor observed at the start of the last committed reduction
    /// cycle; answers "reduced up to" queries.
    watermark: u64,
}

/// Storage handle for one index. Cheap to clone; all clones share state.
#[derive(Debug, Clone, Default)]
pub struct IndexStorage {
    inner: Arc<RwLock<Tables>>,
}

impl IndexStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a consistent read view. Writers block until it is dropped, so
    /// hold it only for the duration of one transaction.
    pub fn snapshot(&self) -> Result<Snapshot<'_>> {
        let guard = self
            .inner
            .read()
            .map_err(|_| IndexError::Storage("storage lock poisoned".into()))?;
        Ok(Snapshot { tables: guard })
    }

    /// Apply a batch atomically. The batch's operations become visible all at
    /// once; a batch that is never committed changes nothing.
    pub fn commit(&self, batch: WriteBatch) -> Result<()> {
        let mut tables = self
            .inner
            .write()
            .map_err(|_| IndexError::Storage("storage lock poisoned".into()))?;
        for op in batch.ops {
            tables.apply(op);
        }
        Ok(())
    }
}

impl Tables {
    fn apply(&mut self, op: Op) {
        match op {
            Op::PutMapped(entry) => {
                self.doc_refs
                    .entry(entry.doc_id.clone())
                    .or_default()
                    .push((entry.key.clone(), entry.bucket));
                self.mapped
                    .entry(entry.key.clone())
                    .or_default()
                    .entry(entry.bucket)
                    .or_default()
                    .entry(entry.doc_id.clone())
                    .or_default()
                    .push(entry);
            }
            Op::DeleteDocEntries(doc_id) => {
                let Some(refs) = self.doc_refs.remove(&doc_id) else {
                    return;
                };
                for (key, bucket) in refs {
                    let Some(key_rows) = self.mapped.get_mut(&key) else {
                        continue;
                    };
                    if let Some(bucket_rows) = key_rows.get_mut(&bucket) {
                        bucket_rows.remove(&doc_id);
                        if bucket_rows.is_empty() {
                            key_rows.remove(&bucket);
                        }
                    }
                    if key_rows.is_empty() {
                        self.mapped.remove(&key);
                    }
                }
            }
            Op::Schedule(marker) => {
                let at = self.change_cursor;
                self.ledger.insert(marker, at);
            }
            Op::Unschedule(marker, as_of) => {
                // A marker re-inserted after `as_of` is newer work the
                // deleting cycle never saw; it must survive.
                if self.ledger.get(&marker).is_some_and(|&at| at <= as_of) {
                    self.ledger.remove(&marker);
                }
            }
            Op::SetMode(key, mode) => {
                self.modes.insert(key, mode);
            }
            Op::ClearMode(key) => {
                self.modes.remove(&key);
            }
            Op::PutIntermediate(key, level, bucket, value) => {
                self.intermediates
                    .entry(key)
                    .or_default()
                    .insert((level, bucket), value);
            }
            Op::DeleteIntermediate(key, level, bucket) => {
                if let Some(per_key) = self.intermediates.get_mut(&key) {
                    per_key.remove(&(level, bucket));
                    if per_key.is_empty() {
                        self.intermediates.remove(&key);
                    }
                }
            }
            Op::ClearIntermediates(key, levels) => {
                if let Some(per_key) = self.intermediates.get_mut(&key) {
                    per_key.retain(|(level, _), _| !levels.contains(level));
                    if per_key.is_empty() {
                        self.intermediates.remove(&key);
                    }
                }
            }
            Op::BumpChangeCursor => {
                self.change_cursor += 1;
            }
            Op::AdvanceWatermark(to) => {
                self.watermark = self.watermark.max(to);
            }
        }
    }
}

/// One key's pending markers: level-0 buckets plus a count of retained
/// upper-level retry markers.
#[derive(Debug, Clone, Default)]
pub struct PendingKey {
    pub level0: Vec<Bucket>,
    pub upper: usize,
}

/// Consistent read view over all tables.
pub struct Snapshot<'a> {
    tables: RwLockReadGuard<'a, Tables>,
}

impl Snapshot<'_> {
    /// All live tuples a document currently contributes.
    pub fn entries_for_document(&self, doc_id: &DocumentId) -> Vec<&MappedResultEntry> {
        let Some(refs) = self.tables.doc_refs.get(doc_id) else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(refs.len());
        for (key, bucket) in refs {
            if let Some(rows) = self
                .tables
                .mapped
                .get(key)
                .and_then(|kr| kr.get(bucket))
                .and_then(|br| br.get(doc_id))
            {
                out.extend(rows.iter());
            }
        }
        out
    }

    /// All live tuples under a key, every bucket.
    pub fn rows_for_key(&self, key: &ReduceKey) -> Vec<&MappedResultEntry> {
        match self.tables.mapped.get(key) {
            Some(key_rows) => key_rows
                .values()
                .flat_map(|docs| docs.values().flatten())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Live tuples in one (key, bucket) slot.
    pub fn rows_in_bucket(&self, key: &ReduceKey, bucket: Bucket) -> Vec<&MappedResultEntry> {
        self.tables
            .mapped
            .get(key)
            .and_then(|kr| kr.get(&bucket))
            .map(|docs| docs.values().flatten().collect())
            .unwrap_or_default()
    }

    /// Distinct populated buckets under a key, used to seed a Direct-to-Tree
    /// migration.
    pub fn populated_buckets(&self, key: &ReduceKey) -> Vec<Bucket> {
        self.tables
            .mapped
            .get(key)
            .map(|kr| kr.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_rows_for_key(&self, key: &ReduceKey) -> bool {
        self.tables.mapped.contains_key(key)
    }

    /// Pending work grouped by key, in key order. A key appears when it has
    /// markers at any level, so retained upper-level retry markers keep their
    /// key in rotation even with no level-0 work.
    pub fn pending_by_key(&self) -> BTreeMap<ReduceKey, PendingKey> {
        let mut grouped: BTreeMap<ReduceKey, PendingKey> = BTreeMap::new();
        for marker in self.tables.ledger.keys() {
            let entry = grouped.entry(marker.key.clone()).or_default();
            if marker.level == Level::Zero {
                entry.level0.push(marker.bucket);
            } else {
                entry.upper += 1;
            }
        }
        grouped
    }

    /// Every pending marker for one key, all levels.
    pub fn pending_for_key(&self, key: &ReduceKey) -> Vec<ScheduledReduction> {
        self.tables
            .ledger
            .keys()
            .filter(|m| &m.key == key)
            .cloned()
            .collect()
    }

    pub fn ledger_len(&self) -> usize {
        self.tables.ledger.len()
    }

    pub fn ledger_is_empty(&self) -> bool {
        self.tables.ledger.is_empty()
    }

    pub fn mode(&self, key: &ReduceKey) -> Option<ReduceMode> {
        self.tables.modes.get(key).copied()
    }

    /// Stored intermediates for one key at one level, in bucket order.
    pub fn intermediates_at(&self, key: &ReduceKey, level: Level) -> Vec<(Bucket, &Value)> {
        let Some(per_key) = self.tables.intermediates.get(key) else {
            return Vec::new();
        };
        per_key
            .range((level, Bucket(0))..=(level, Bucket(u32::MAX)))
            .map(|(&(_, bucket), value)| (bucket, value))
            .collect()
    }

    pub fn change_cursor(&self) -> u64 {
        self.tables.change_cursor
    }

    pub fn watermark(&self) -> u64 {
        self.tables.watermark
    }
}

#[derive(Debug)]
enum Op {
    PutMapped(MappedResultEntry),
    DeleteDocEntries(DocumentId),
    Schedule(ScheduledReduction),
    Unschedule(ScheduledReduction, u64),
    SetMode(ReduceKey, ReduceMode),
    ClearMode(ReduceKey),
    PutIntermediate(ReduceKey, Level, Bucket, Value),
    DeleteIntermediate(ReduceKey, Level, Bucket),
    ClearIntermediates(ReduceKey, Vec<Level>),
    BumpChangeCursor,
    AdvanceWatermark(u64),
}

/// Buffered mutations, applied atomically by [`IndexStorage::commit`].
/// Dropping an uncommitted batch discards it wholesale.
#[derive(Debug, Default)]
pub struct WriteBatch {
    ops: Vec<Op>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_mapped(&mut self, entry: MappedResultEntry) {
        self.ops.push(Op::PutMapped(entry));
    }

    pub fn delete_doc_entries(&mut self, doc_id: DocumentId) {
        self.ops.push(Op::DeleteDocEntries(doc_id));
    }

    pub fn schedule(&mut self, marker: ScheduledReduction) {
        self.ops.push(Op::Schedule(marker));
    }

    /// Delete `marker` unless it was (re-)scheduled after change cursor
    /// `as_of`. Cycles pass the cursor of the snapshot they reduced from, so
    /// a marker inserted by a concurrent map batch is never lost.
    pub fn unschedule(&mut self, marker: ScheduledReduction, as_of: u64) {
        self.ops.push(Op::Unschedule(marker, as_of));
    }

    pub fn set_mode(&mut self, key: ReduceKey, mode: ReduceMode) {
        self.ops.push(Op::SetMode(key, mode));
    }

    pub fn clear_mode(&mut self, key: ReduceKey) {
        self.ops.push(Op::ClearMode(key));
    }

    pub fn put_intermediate(&mut self, key: ReduceKey, level: Level, bucket: Bucket, value: Value) {
        self.ops.push(Op::PutIntermediate(key, level, bucket, value));
    }

    pub fn delete_intermediate(&mut self, key: ReduceKey, level: Level, bucket: Bucket) {
        self.ops.push(Op::DeleteIntermediate(key, level, bucket));
    }

    pub fn clear_intermediates(&mut self, key: ReduceKey, levels: &[Level]) {
        self.ops
            .push(Op::ClearIntermediates(key, levels.to_vec()));
    }

    pub fn bump_change_cursor(&mut self) {
        self.ops.push(Op::BumpChangeCursor);
    }

    pub fn advance_watermark(&mut self, to: u64) {
        self.ops.push(Op::AdvanceWatermark(to));
    }

    /// Append another batch's operations after this one's.
    pub fn append(&mut self, mut other: WriteBatch) {
        self.ops.append(&mut other.ops);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(doc: &str, key: &str, value: i64) -> MappedResultEntry {
        MappedResultEntry::new(DocumentId::from(doc), ReduceKey::new(key), json!(value))
    }

    #[test]
    fn batch_is_atomic_until_commit() {
        let storage = IndexStorage::new();
        let mut batch = WriteBatch::new();
        batch.put_mapped(entry("users/1", "Poland", 1));
        batch.schedule(ScheduledReduction::new(
            Level::Zero,
            ReduceKey::new("Poland"),
            Bucket(3),
        ));

        // Nothing visible before commit.
        {
            let snap = storage.snapshot().unwrap();
            assert!(snap.rows_for_key(&ReduceKey::new("Poland")).is_empty());
            assert!(snap.ledger_is_empty());
        }

        storage.commit(batch).unwrap();
        let snap = storage.snapshot().unwrap();
        assert_eq!(snap.rows_for_key(&ReduceKey::new("Poland")).len(), 1);
        assert_eq!(snap.ledger_len(), 1);
    }

    #[test]
    fn dropped_batch_changes_nothing() {
        let storage = IndexStorage::new();
        {
            let mut batch = WriteBatch::new();
            batch.put_mapped(entry("users/1", "Poland", 1));
            drop(batch);
        }
        let snap = storage.snapshot().unwrap();
        assert!(snap.rows_for_key(&ReduceKey::new("Poland")).is_empty());
    }

    #[test]
    fn delete_doc_entries_removes_all_slots() {
        let storage = IndexStorage::new();
        let mut batch = WriteBatch::new();
        batch.put_mapped(entry("users/1", "Poland", 1));
        batch.put_mapped(entry("users/1", "Israel", 1));
        batch.put_mapped(entry("users/2", "Poland", 1));
        storage.commit(batch).unwrap();

        let mut batch = WriteBatch::new();
        batch.delete_doc_entries(DocumentId::from("users/1"));
        storage.commit(batch).unwrap();

        let snap = storage.snapshot().unwrap();
        assert!(snap.rows_for_key(&ReduceKey::new("Israel")).is_empty());
        let poland = snap.rows_for_key(&ReduceKey::new("Poland"));
        assert_eq!(poland.len(), 1);
        assert_eq!(poland[0].doc_id.as_str(), "users/2");
        assert!(snap
            .entries_for_document(&DocumentId::from("users/1"))
            .is_empty());
    }

    #[test]
    fn ledger_has_set_semantics() {
        let storage = IndexStorage::new();
        let marker = ScheduledReduction::new(Level::Zero, ReduceKey::new("Poland"), Bucket(5));
        let mut batch = WriteBatch::new();
        batch.schedule(marker.clone());
        batch.schedule(marker.clone());
        batch.schedule(ScheduledReduction::new(
            Level::Zero,
            ReduceKey::new("poland"),
            Bucket(5),
        ));
        storage.commit(batch).unwrap();

        let snap = storage.snapshot().unwrap();
        assert_eq!(snap.ledger_len(), 1);
        drop(snap);

        let mut batch = WriteBatch::new();
        batch.unschedule(marker, 0);
        storage.commit(batch).unwrap();
        assert!(storage.snapshot().unwrap().ledger_is_empty());
    }

    #[test]
    fn schedule_then_unschedule_in_one_batch_nets_nothing() {
        let storage = IndexStorage::new();
        let marker = ScheduledReduction::new(Level::One, ReduceKey::new("k"), Bucket(1));
        let mut batch = WriteBatch::new();
        batch.schedule(marker.clone());
        batch.unschedule(marker, 0);
        storage.commit(batch).unwrap();
        assert!(storage.snapshot().unwrap().ledger_is_empty());
    }

    #[test]
    fn marker_rescheduled_after_snapshot_survives_unschedule() {
        let storage = IndexStorage::new();
        let marker = ScheduledReduction::new(Level::Zero, ReduceKey::new("k"), Bucket(9));

        // Marker inserted after the cursor a cycle snapshotted at.
        let mut batch = WriteBatch::new();
        batch.bump_change_cursor();
        batch.schedule(marker.clone());
        storage.commit(batch).unwrap();

        let mut batch = WriteBatch::new();
        batch.unschedule(marker.clone(), 0);
        storage.commit(batch).unwrap();
        assert_eq!(storage.snapshot().unwrap().ledger_len(), 1);

        // Seen at or before the cursor: deleted.
        let mut batch = WriteBatch::new();
        batch.unschedule(marker, 1);
        storage.commit(batch).unwrap();
        assert!(storage.snapshot().unwrap().ledger_is_empty());
    }

    #[test]
    fn pending_by_key_separates_levels() {
        let storage = IndexStorage::new();
        let key = ReduceKey::new("Poland");
        let mut batch = WriteBatch::new();
        batch.schedule(ScheduledReduction::new(Level::Zero, key.clone(), Bucket(3)));
        batch.schedule(ScheduledReduction::new(Level::Zero, key.clone(), Bucket(8)));
        batch.schedule(ScheduledReduction::new(Level::One, key.clone(), Bucket(0)));
        batch.schedule(ScheduledReduction::new(
            Level::Two,
            ReduceKey::new("Israel"),
            Bucket(0),
        ));
        storage.commit(batch).unwrap();

        let snap = storage.snapshot().unwrap();
        let grouped = snap.pending_by_key();
        assert_eq!(grouped[&key].level0, vec![Bucket(3), Bucket(8)]);
        assert_eq!(grouped[&key].upper, 1);
        // A key with only upper-level markers still shows up.
        let israel = &grouped[&ReduceKey::new("Israel")];
        assert!(israel.level0.is_empty());
        assert_eq!(israel.upper, 1);
    }

    #[test]
    fn intermediates_are_scoped_by_level() {
        let storage = IndexStorage::new();
        let key = ReduceKey::new("Poland");
        let mut batch = WriteBatch::new();
        batch.put_intermediate(key.clone(), Level::Zero, Bucket(2), json!(4));
        batch.put_intermediate(key.clone(), Level::Zero, Bucket(9), json!(6));
        batch.put_intermediate(key.clone(), Level::One, Bucket(0), json!(10));
        storage.commit(batch).unwrap();

        {
            let snap = storage.snapshot().unwrap();
            let level0 = snap.intermediates_at(&key, Level::Zero);
            assert_eq!(level0.len(), 2);
            assert_eq!(level0[0], (Bucket(2), &json!(4)));
            assert_eq!(snap.intermediates_at(&key, Level::One).len(), 1);
        }

        let mut batch = WriteBatch::new();
        batch.clear_intermediates(key.clone(), &[Level::One]);
        storage.commit(batch).unwrap();
        let snap = storage.snapshot().unwrap();
        assert_eq!(snap.intermediates_at(&key, Level::Zero).len(), 2);
        assert!(snap.intermediates_at(&key, Level::One).is_empty());
    }

    #[test]
    fn watermark_is_monotonic() {
        let storage = IndexStorage::new();
        let mut batch = WriteBatch::new();
        batch.advance_watermark(10);
        batch.advance_watermark(4);
        storage.commit(batch).unwrap();
        assert_eq!(storage.snapshot().unwrap().watermark(), 10);
    }

    #[test]
    fn fanout_doc_keeps_multiple_tuples_per_key() {
        let storage = IndexStorage::new();
        let mut batch = WriteBatch::new();
        batch.put_mapped(entry("orders/1", "Poland", 2));
        batch.put_mapped(entry("orders/1", "Poland", 3));
        storage.commit(batch).unwrap();

        let snap = storage.snapshot().unwrap();
        assert_eq!(snap.rows_for_key(&ReduceKey::new("Poland")).len(), 2);
        drop(snap);

        let mut batch = WriteBatch::new();
        batch.delete_doc_entries(DocumentId::from("orders/1"));
        storage.commit(batch).unwrap();
        assert!(storage
            .snapshot()
            .unwrap()
            .rows_for_key(&ReduceKey::new("Poland"))
            .is_empty());
    }
}
