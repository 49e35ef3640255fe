//! Direct reduction: one fold over every live row of a key.
//!
//! Bucketing is collapsed to the single synthetic bucket; cost is O(live
//! rows) per run, which is only acceptable below the dispatcher's
//! single-step threshold.

use crate::aggregate::AggregateWrite;
use crate::definition::IndexDefinition;
use crate::error::ErrorLog;
use crate::model::{Bucket, Level, ReduceKey, ReduceMode};
use crate::reduce::{fold_unit, Inputs, KeyOutcome, ReduceInput};
use crate::storage::{Snapshot, WriteBatch};

/// Reduce one key by folding all of its live mapped rows in a single pass.
///
/// On success the outcome consumes every pending marker the snapshot holds
/// for the key, at every level; on a reduce failure the markers are left in
/// place and only the error is recorded.
pub(crate) fn reduce_key(
    snap: &Snapshot<'_>,
    definition: &IndexDefinition,
    key: &ReduceKey,
    errors: &ErrorLog,
) -> KeyOutcome {
    let rows = snap.rows_for_key(key);
    let inputs: Inputs<'_> = rows.iter().map(|e| ReduceInput::RawRow(&e.value)).collect();

    match fold_unit(definition, key, Level::Two, Bucket::SYNTHETIC, &inputs) {
        Ok(out) => {
            let as_of = snap.change_cursor();
            let mut batch = WriteBatch::new();
            for marker in snap.pending_for_key(key) {
                batch.unschedule(marker, as_of);
            }
            KeyOutcome {
                key: key.clone(),
                mode: ReduceMode::Direct,
                write: Some(AggregateWrite {
                    key: key.clone(),
                    value: out.value,
                }),
                batch,
                rows: out.rows,
                bytes: out.bytes,
                unit_errors: 0,
            }
        }
        Err(err) => {
            errors.record(err);
            KeyOutcome {
                key: key.clone(),
                mode: ReduceMode::Direct,
                write: None,
                batch: WriteBatch::new(),
                rows: 0,
                bytes: 0,
                unit_errors: 1,
            }
        }
    }
}
