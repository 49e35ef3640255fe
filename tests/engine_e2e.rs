//! End-to-end scenarios driving a whole index through map, reduce, and
//! materialized output.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tally::{
    AggregateObserver, CancellationToken, DispatcherConfig, Document, DocumentChange,
    DocumentId, IndexDefinition, MapReduceIndex, MappedTuple, ReduceKey, TunerConfig,
};

/// Count-by-location: map emits (location, 1), reduce sums.
fn location_count(threshold: usize) -> MapReduceIndex {
    let definition = IndexDefinition::new(
        "users/count-by-location",
        |doc: &Document| {
            let Some(loc) = doc.data.get("location").and_then(Value::as_str) else {
                return Ok(vec![]);
            };
            Ok(vec![MappedTuple::new(loc, json!(1))])
        },
        |values: &[Value]| {
            let mut total = 0i64;
            for v in values {
                total += v.as_i64().ok_or("expected integer")?;
            }
            Ok(json!(total))
        },
    );
    MapReduceIndex::new(
        definition,
        DispatcherConfig {
            single_step_threshold: threshold,
            tuner: TunerConfig::default(),
        },
    )
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn put(id: impl Into<String>, location: &str) -> DocumentChange {
    DocumentChange::Put(Document::new(id.into(), json!({ "location": location })))
}

fn delete(id: impl Into<String>) -> DocumentChange {
    DocumentChange::Delete(DocumentId::from(id.into()))
}

fn reduce_all(index: &mut MapReduceIndex) {
    index
        .reduce_to_completion(&CancellationToken::new())
        .unwrap();
}

fn count(index: &MapReduceIndex, key: &str) -> Option<i64> {
    index
        .aggregate(&ReduceKey::new(key))
        .unwrap()
        .and_then(|v| v.as_i64())
}

#[test]
fn two_documents_count_to_two() {
    let mut index = location_count(1024);
    index
        .index_documents(&[put("users/1", "Poland"), put("users/2", "Poland")])
        .unwrap();

    assert!(index.is_stale().unwrap());
    reduce_all(&mut index);

    assert_eq!(count(&index, "Poland"), Some(2));
    assert!(!index.is_stale().unwrap());
}

#[test]
fn reduce_keys_are_case_insensitive() {
    let mut index = location_count(1024);
    index
        .index_documents(&[put("users/1", "Poland"), put("users/2", "poland")])
        .unwrap();
    reduce_all(&mut index);

    assert_eq!(count(&index, "POLAND"), Some(2));
    assert_eq!(index.aggregates().unwrap().len(), 1);
}

#[test]
fn key_change_moves_contribution_without_duplicating() {
    let mut index = location_count(1024);
    index
        .index_documents(&[
            put("users/1", "Poland"),
            put("users/2", "Poland"),
            put("users/3", "Israel"),
        ])
        .unwrap();
    reduce_all(&mut index);
    assert_eq!(count(&index, "Poland"), Some(2));
    assert_eq!(count(&index, "Israel"), Some(1));

    // users/2 moves country: Poland loses its contribution, Israel gains it.
    index.index_documents(&[put("users/2", "Israel")]).unwrap();
    reduce_all(&mut index);

    assert_eq!(count(&index, "Poland"), Some(1));
    assert_eq!(count(&index, "Israel"), Some(2));
}

#[test]
fn deletes_shrink_the_aggregate_monotonically() {
    let mut index = location_count(1024);
    let n = 10usize;
    let m = 3usize;
    let changes: Vec<DocumentChange> =
        (0..n).map(|i| put(format!("users/{i}"), "Poland")).collect();
    index.index_documents(&changes).unwrap();
    reduce_all(&mut index);
    assert_eq!(count(&index, "Poland"), Some(n as i64));

    let removals: Vec<DocumentChange> =
        (0..m).map(|i| delete(format!("users/{i}"))).collect();
    index.index_documents(&removals).unwrap();
    reduce_all(&mut index);
    assert_eq!(count(&index, "Poland"), Some((n - m) as i64));

    // Deleting the rest removes the materialized entry entirely.
    let removals: Vec<DocumentChange> =
        (m..n).map(|i| delete(format!("users/{i}"))).collect();
    index.index_documents(&removals).unwrap();
    reduce_all(&mut index);
    assert_eq!(count(&index, "Poland"), None);
    assert!(index.aggregates().unwrap().is_empty());

    // The orphaned key's residual state is purged asynchronously.
    assert_eq!(index.drain_cleanup().unwrap(), 1);
}

#[test]
fn fifty_thousand_documents_across_two_keys_run_tree_mode() {
    init_tracing();
    let mut index = location_count(1024);
    let per_key = 25_000usize;

    // Batches keep the map stage's per-call snapshot bounded.
    for chunk_start in (0..per_key).step_by(5000) {
        let changes: Vec<DocumentChange> = (chunk_start..chunk_start + 5000)
            .flat_map(|i| {
                [
                    put(format!("users/pl/{i}"), "Poland"),
                    put(format!("users/il/{i}"), "Israel"),
                ]
            })
            .collect();
        index.index_documents(&changes).unwrap();
    }

    let token = CancellationToken::new();
    let mut tree_keys = 0usize;
    while index.is_stale().unwrap() {
        if !index.run_reduction_cycle(&token).unwrap() {
            break;
        }
        tree_keys += index.last_report().tree_keys;
    }

    // Both keys were over the threshold, so both went through the tree.
    assert!(tree_keys >= 2, "expected tree mode for both keys");
    assert_eq!(count(&index, "Poland"), Some(per_key as i64));
    assert_eq!(count(&index, "Israel"), Some(per_key as i64));
}

#[test]
fn incremental_update_after_bulk_load_stays_cheap() {
    let mut index = location_count(64);
    let changes: Vec<DocumentChange> =
        (0..2000).map(|i| put(format!("users/{i}"), "Poland")).collect();
    index.index_documents(&changes).unwrap();
    reduce_all(&mut index);
    assert_eq!(count(&index, "Poland"), Some(2000));

    // A follow-up batch above the threshold keeps the key in tree mode,
    // so only the touched level-0 buckets are re-folded.
    let more: Vec<DocumentChange> =
        (0..100).map(|i| put(format!("users/new/{i}"), "Poland")).collect();
    index.index_documents(&more).unwrap();
    reduce_all(&mut index);
    assert!(index.last_report().rows < 500, "refolded too many rows");
    assert_eq!(count(&index, "Poland"), Some(2100));

    // A single-document touch drops pending under the threshold and the
    // dispatcher migrates the key back to the direct strategy.
    index.index_documents(&[put("users/one-more", "Poland")]).unwrap();
    reduce_all(&mut index);
    assert_eq!(index.last_report().direct_keys, 1);
    assert_eq!(count(&index, "Poland"), Some(2101));
}

#[test]
fn map_failures_are_recorded_and_the_rest_indexes() {
    init_tracing();
    let definition = IndexDefinition::new(
        "strict",
        |doc: &Document| {
            let Some(loc) = doc.data.get("location") else {
                return Err("missing location".into());
            };
            let loc = loc.as_str().ok_or("location must be a string")?;
            Ok(vec![MappedTuple::new(loc, json!(1))])
        },
        |values: &[Value]| {
            Ok(json!(values.iter().filter_map(Value::as_i64).sum::<i64>()))
        },
    );
    let mut index = MapReduceIndex::with_defaults(definition);

    let stats = index
        .index_documents(&[
            put("users/1", "Poland"),
            DocumentChange::Put(Document::new("users/2", json!({}))),
        ])
        .unwrap();
    assert_eq!(stats.map_errors, 1);
    assert_eq!(index.total_errors(), 1);

    reduce_all(&mut index);
    assert_eq!(count(&index, "Poland"), Some(1));
    let recent = index.recent_errors(10);
    assert_eq!(recent.len(), 1);
    assert!(recent[0].error.to_string().contains("users/2"));
}

#[test]
fn observers_see_entry_lifecycle() {
    #[derive(Default)]
    struct Counting {
        created: AtomicUsize,
        deleted: AtomicUsize,
    }
    impl AggregateObserver for Counting {
        fn entry_created(&self, _key: &ReduceKey, _value: &Value) {
            self.created.fetch_add(1, Ordering::SeqCst);
        }
        fn entry_deleted(&self, _key: &ReduceKey) {
            self.deleted.fetch_add(1, Ordering::SeqCst);
        }
    }

    let mut index = location_count(1024);
    let observer = Arc::new(Counting::default());
    index.register_observer(observer.clone()).unwrap();

    index.index_documents(&[put("users/1", "Poland")]).unwrap();
    reduce_all(&mut index);
    index.index_documents(&[delete("users/1")]).unwrap();
    reduce_all(&mut index);

    assert_eq!(observer.created.load(Ordering::SeqCst), 1);
    assert_eq!(observer.deleted.load(Ordering::SeqCst), 1);
}
