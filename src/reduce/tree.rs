//! Tree reduction: the three-level bucketed incremental fold.
//!
//! Level 0 folds the raw mapped rows of each pending (key, bucket) unit and
//! stores the partial result; level 1 folds level-0 partials grouped by
//! `bucket / FAN_IN`; level 2 folds all level-1 partials into the final
//! aggregate. Only buckets touched this cycle are recomputed and promoted —
//! untouched buckets' stored partials are reused as-is, which is what turns
//! an O(all rows) recompute into O(changed rows) plus O(1) per touched
//! bucket per upper level.
//!
//! Within a level, buckets are independent and order is irrelevant; the
//! reduce function is associative and commutative by contract. A bucket whose
//! last row vanished is still folded once more so its stored partial is
//! deleted and upper levels stop counting it.
//!
//! Per-unit reduce failures are recorded and that unit's marker survives for
//! the next cycle; the rest of the cycle proceeds. Cancellation is checked
//! before each level and each unit and unwinds without touching anything.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::aggregate::AggregateWrite;
use crate::cancel::CancellationToken;
use crate::definition::IndexDefinition;
use crate::error::{ErrorLog, IndexError, Result};
use crate::model::{Bucket, Level, ReduceKey, ReduceMode, ScheduledReduction};
use crate::reduce::{fold_unit, Inputs, KeyOutcome, ReduceInput};
use crate::storage::{Snapshot, WriteBatch};

/// Per-level pending buckets plus the overlay of partials recomputed this
/// cycle. The overlay shadows the snapshot so level N+1 folds the values
/// level N just produced, not last cycle's.
struct TreeState {
    pending: [BTreeSet<Bucket>; 3],
    /// `None` marks a partial deleted this cycle (bucket went empty).
    overlay: BTreeMap<(Level, Bucket), Option<Value>>,
}

impl TreeState {
    fn new(level0: &[Bucket], persisted: &[ScheduledReduction]) -> Self {
        let mut pending: [BTreeSet<Bucket>; 3] =
            [BTreeSet::new(), BTreeSet::new(), BTreeSet::new()];
        pending[0].extend(level0.iter().copied());
        // Leftovers from an interrupted or partially failed earlier cycle
        // resume at the level they were scheduled for.
        for marker in persisted {
            pending[level_index(marker.level)].insert(marker.bucket);
        }
        Self {
            pending,
            overlay: BTreeMap::new(),
        }
    }

    fn take_pending(&mut self, level: Level) -> BTreeSet<Bucket> {
        std::mem::take(&mut self.pending[level_index(level)])
    }

    fn promote(&mut self, level: Level, bucket: Bucket) {
        self.pending[level_index(level)].insert(bucket);
    }

    /// Child partials feeding one fold: stored intermediates shadowed by this
    /// cycle's overlay, optionally restricted to one parent bucket.
    fn child_inputs<'a>(
        &'a self,
        snap: &'a Snapshot<'_>,
        key: &ReduceKey,
        child_level: Level,
        parent: Option<Bucket>,
    ) -> Inputs<'a> {
        let in_scope =
            |bucket: Bucket| parent.map_or(true, |p| bucket.parent() == p);

        let mut merged: BTreeMap<Bucket, &'a Value> = BTreeMap::new();
        for (bucket, value) in snap.intermediates_at(key, child_level) {
            if in_scope(bucket) {
                merged.insert(bucket, value);
            }
        }
        let range = (child_level, Bucket(0))..=(child_level, Bucket(u32::MAX));
        for (&(_, bucket), value) in self.overlay.range(range) {
            if !in_scope(bucket) {
                continue;
            }
            match value {
                Some(v) => {
                    merged.insert(bucket, v);
                }
                None => {
                    merged.remove(&bucket);
                }
            }
        }
        merged
            .into_values()
            .map(ReduceInput::TreeIntermediate)
            .collect()
    }
}

fn level_index(level: Level) -> usize {
    match level {
        Level::Zero => 0,
        Level::One => 1,
        Level::Two => 2,
    }
}

/// Reduce one key through the bucketed tree.
///
/// `pending0` is this cycle's page of level-0 buckets (ledger markers, plus
/// seeded buckets on a Direct-to-Tree migration). Returns an error only for
/// cancellation; unit failures are folded into the outcome.
pub(crate) fn reduce_key(
    snap: &Snapshot<'_>,
    definition: &IndexDefinition,
    key: &ReduceKey,
    pending0: &[Bucket],
    token: &CancellationToken,
    errors: &ErrorLog,
) -> Result<KeyOutcome> {
    let persisted = snap.pending_for_key(key);
    let as_of = snap.change_cursor();
    let mut state = TreeState::new(pending0, &persisted);
    let mut batch = WriteBatch::new();
    let mut write = None;
    let mut rows = 0usize;
    let mut bytes = 0usize;
    let mut unit_errors = 0usize;

    for level in Level::ALL {
        if token.is_cancelled() {
            return Err(IndexError::Cancelled);
        }
        for bucket in state.take_pending(level) {
            if token.is_cancelled() {
                return Err(IndexError::Cancelled);
            }

            let inputs: Inputs<'_> = match level {
                Level::Zero => snap
                    .rows_in_bucket(key, bucket)
                    .into_iter()
                    .map(|e| ReduceInput::RawRow(&e.value))
                    .collect(),
                Level::One => state.child_inputs(snap, key, Level::Zero, Some(bucket)),
                Level::Two => state.child_inputs(snap, key, Level::One, None),
            };

            let out = match fold_unit(definition, key, level, bucket, &inputs) {
                Ok(out) => out,
                Err(err) => {
                    errors.record(err);
                    unit_errors += 1;
                    // Make sure the unit stays scheduled even if its marker
                    // was only promoted within this cycle.
                    batch.schedule(ScheduledReduction::new(level, key.clone(), bucket));
                    continue;
                }
            };
            // `inputs` borrows the overlay; release it before mutating state.
            drop(inputs);

            if level == Level::Zero {
                rows += out.rows;
            }
            bytes += out.bytes;
            batch.unschedule(ScheduledReduction::new(level, key.clone(), bucket), as_of);

            let Some(next) = level.next() else {
                // Final level: this fold is the key's new aggregate.
                write = Some(AggregateWrite {
                    key: key.clone(),
                    value: out.value,
                });
                continue;
            };

            match out.value {
                Some(value) => {
                    batch.put_intermediate(key.clone(), level, bucket, value.clone());
                    state.overlay.insert((level, bucket), Some(value));
                }
                None => {
                    // Bucket went empty: delete the stale partial so upper
                    // levels stop counting it.
                    batch.delete_intermediate(key.clone(), level, bucket);
                    state.overlay.insert((level, bucket), None);
                }
            }

            let parent = bucket.parent();
            state.promote(next, parent);
            batch.schedule(ScheduledReduction::new(next, key.clone(), parent));
        }
    }

    Ok(KeyOutcome {
        key: key.clone(),
        mode: ReduceMode::Tree,
        write,
        batch,
        rows,
        bytes,
        unit_errors,
    })
}
