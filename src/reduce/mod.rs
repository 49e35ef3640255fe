//! The two reduction strategies and the fold they share.
//!
//! Raw mapped rows and previously reduced tree intermediates are folded by
//! the same code path, distinguished only by a tagged input variant; the
//! reduce function is required to be associative and commutative, so it
//! cannot tell partial results from raw values.

pub(crate) mod direct;
pub(crate) mod tree;

use serde_json::Value;
use smallvec::SmallVec;

use crate::aggregate::AggregateWrite;
use crate::definition::IndexDefinition;
use crate::error::{IndexError, Result};
use crate::model::{Bucket, Level, ReduceKey, ReduceMode};
use crate::storage::WriteBatch;

/// One value entering a fold, tagged with its provenance.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ReduceInput<'a> {
    /// A live mapped-result row.
    RawRow(&'a Value),
    /// A stored partial result from a lower tree level.
    TreeIntermediate(&'a Value),
}

impl<'a> ReduceInput<'a> {
    fn value(&self) -> &'a Value {
        match self {
            ReduceInput::RawRow(v) | ReduceInput::TreeIntermediate(v) => v,
        }
    }
}

/// Inline capacity covers typical per-bucket fan-in without allocating.
pub(crate) type Inputs<'a> = SmallVec<[ReduceInput<'a>; 16]>;

#[derive(Debug)]
pub(crate) struct FoldOutput {
    /// `None` when the unit had no inputs: an explicit empty result that
    /// upper levels and the materialized store must stop counting.
    pub value: Option<Value>,
    pub rows: usize,
    pub bytes: usize,
}

/// Fold one (key, bucket) unit at one level. An empty unit yields an explicit
/// empty output without invoking the reduce function.
pub(crate) fn fold_unit(
    definition: &IndexDefinition,
    key: &ReduceKey,
    level: Level,
    bucket: Bucket,
    inputs: &[ReduceInput<'_>],
) -> Result<FoldOutput> {
    if inputs.is_empty() {
        return Ok(FoldOutput {
            value: None,
            rows: 0,
            bytes: 0,
        });
    }

    let values: Vec<Value> = inputs.iter().map(|input| input.value().clone()).collect();
    let bytes = values.iter().map(estimated_size).sum();
    let reduced = definition
        .reduce(&values)
        .map_err(|err| IndexError::Reduce {
            key: key.clone(),
            level,
            bucket,
            detail: err.to_string(),
        })?;
    Ok(FoldOutput {
        value: Some(reduced),
        rows: values.len(),
        bytes,
    })
}

/// Approximate serialized size, for the auto-tuner's byte accounting.
fn estimated_size(value: &Value) -> usize {
    serde_json::to_vec(value).map(|buf| buf.len()).unwrap_or(0)
}

/// Result of reducing one key this cycle.
///
/// `write` is `Some` when a new aggregate was produced and the key's
/// bookkeeping in `batch` (marker deletions, intermediate updates) may be
/// committed. A key whose reduction failed outright carries `write: None`
/// and an empty batch, so its markers survive for retry.
#[derive(Debug)]
pub(crate) struct KeyOutcome {
    pub key: ReduceKey,
    pub mode: ReduceMode,
    pub write: Option<AggregateWrite>,
    pub batch: WriteBatch,
    /// Raw mapped rows folded (level 0 / direct pass).
    pub rows: usize,
    /// Bytes folded across all levels.
    pub bytes: usize,
    pub unit_errors: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::sum_reduce;
    use serde_json::json;

    fn def() -> IndexDefinition {
        IndexDefinition::new("test", |_doc| Ok(vec![]), sum_reduce)
    }

    #[test]
    fn fold_mixes_raw_rows_and_intermediates() {
        let (a, b, c) = (json!(1), json!(2), json!(7));
        let inputs = [
            ReduceInput::RawRow(&a),
            ReduceInput::RawRow(&b),
            ReduceInput::TreeIntermediate(&c),
        ];
        let out = fold_unit(
            &def(),
            &ReduceKey::new("k"),
            Level::One,
            Bucket(3),
            &inputs,
        )
        .unwrap();
        assert_eq!(out.value, Some(json!(10)));
        assert_eq!(out.rows, 3);
        assert!(out.bytes > 0);
    }

    #[test]
    fn empty_unit_folds_to_explicit_empty() {
        let out = fold_unit(
            &def(),
            &ReduceKey::new("k"),
            Level::Zero,
            Bucket(0),
            &[],
        )
        .unwrap();
        assert_eq!(out.value, None);
        assert_eq!(out.rows, 0);
    }

    #[test]
    fn reduce_failure_carries_unit_context() {
        let bad = json!("not a number");
        let inputs = [ReduceInput::RawRow(&bad)];
        let err = fold_unit(
            &def(),
            &ReduceKey::new("Poland"),
            Level::Zero,
            Bucket(42),
            &inputs,
        )
        .unwrap_err();
        match err {
            IndexError::Reduce { key, level, bucket, .. } => {
                assert_eq!(key, ReduceKey::new("Poland"));
                assert_eq!(level, Level::Zero);
                assert_eq!(bucket, Bucket(42));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
