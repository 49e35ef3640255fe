//! Reduction dispatcher: drives one reduction cycle for one index.
//!
//! Each cycle pages pending ledger markers under the auto-tuner's cap,
//! classifies every paged key by its pending level-0 count against the
//! single-step threshold (keys carrying only upper-level retry markers stay
//! on the tree so those resume), migrates the key's strategy when the
//! classification changed, runs the chosen reducer, and finally commits all
//! bookkeeping —
//! marker deletions, stored partials, directory updates, watermark — in one
//! storage batch, after the materialized writes landed. A cycle that fails or
//! is cancelled commits nothing, so re-running it is always safe: both
//! reducers are pure functions of the snapshot they read.
//!
//! One dispatcher instance serves one index and runs cycles serially, which
//! totally orders materialized writes per key. Concurrent map-stage batches
//! for the same index interleave safely; the cycle works off one consistent
//! snapshot and only deletes markers it saw there.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::aggregate::{lock_materialized, MaterializedWriter, SharedMaterialized};
use crate::cancel::CancellationToken;
use crate::definition::IndexDefinition;
use crate::error::{ErrorLog, IndexError, Result};
use crate::model::{Bucket, Level, ReduceKey, ReduceMode, ScheduledReduction};
use crate::reduce::{direct, tree, KeyOutcome};
use crate::storage::{IndexStorage, PendingKey, WriteBatch};
use crate::tuner::{BatchSizeTuner, TunerConfig};

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Keys with at most this many pending level-0 entries are reduced
    /// directly; above it they go through the bucketed tree.
    pub single_step_threshold: usize,
    pub tuner: TunerConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            single_step_threshold: 1024,
            tuner: TunerConfig::default(),
        }
    }
}

/// Measurements of one completed cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub keys_considered: usize,
    pub keys_reduced: usize,
    pub direct_keys: usize,
    pub tree_keys: usize,
    pub mode_switches: usize,
    /// Ledger markers the page consumed; the unit the tuner's cap is in.
    pub markers_taken: usize,
    /// Raw mapped rows folded.
    pub rows: usize,
    /// Bytes folded across all levels.
    pub bytes: usize,
    pub unit_errors: usize,
    pub write_errors: usize,
}

pub struct ReductionDispatcher {
    storage: IndexStorage,
    definition: Arc<IndexDefinition>,
    materialized: SharedMaterialized,
    errors: Arc<ErrorLog>,
    tuner: BatchSizeTuner,
    threshold: usize,
    last_report: CycleReport,
}

impl ReductionDispatcher {
    pub fn new(
        storage: IndexStorage,
        definition: Arc<IndexDefinition>,
        materialized: SharedMaterialized,
        errors: Arc<ErrorLog>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            storage,
            definition,
            materialized,
            errors,
            tuner: BatchSizeTuner::new(config.tuner),
            threshold: config.single_step_threshold,
            last_report: CycleReport::default(),
        }
    }

    /// True while the ledger holds pending markers: queries lag the document
    /// collection until the next cycle folds them in.
    pub fn is_stale(&self) -> Result<bool> {
        Ok(!self.storage.snapshot()?.ledger_is_empty())
    }

    /// Measurements of the most recent completed cycle.
    pub fn last_report(&self) -> &CycleReport {
        &self.last_report
    }

    /// The tuner's current per-cycle marker cap.
    pub fn batch_cap(&self) -> usize {
        self.tuner.batch_size()
    }

    /// Run one reduction cycle. Returns whether any work was committed.
    ///
    /// On cancellation nothing is committed and `Ok(false)` is returned; the
    /// next invocation repeats the same work. A storage-level error likewise
    /// leaves every marker in place.
    pub fn run_reduction_cycle(&mut self, token: &CancellationToken) -> Result<bool> {
        let started = Instant::now();
        if token.is_cancelled() {
            return Ok(false);
        }

        let mut report = CycleReport::default();
        let mut outcomes: Vec<KeyOutcome> = Vec::new();
        let cursor;
        {
            let snap = self.storage.snapshot()?;
            cursor = snap.change_cursor();
            let page = page_pending(snap.pending_by_key(), self.tuner.batch_size());
            if page.is_empty() {
                return Ok(false);
            }
            report.keys_considered = page.len();

            for (key, pending) in page {
                if token.is_cancelled() {
                    return Ok(false);
                }
                report.markers_taken += pending.level0.len() + pending.upper;
                let previous = snap.mode(&key);
                // A key carrying upper-level leftovers stays on the tree so
                // they resume instead of going stale.
                let target = if pending.level0.len() > self.threshold
                    || (pending.upper > 0 && previous == Some(ReduceMode::Tree))
                {
                    ReduceMode::Tree
                } else {
                    ReduceMode::Direct
                };
                debug!(
                    key = %key,
                    level0 = pending.level0.len(),
                    upper = pending.upper,
                    mode = %target,
                    "reducing key"
                );

                let mut outcome = match target {
                    ReduceMode::Direct => {
                        let mut outcome =
                            direct::reduce_key(&snap, &self.definition, &key, &self.errors);
                        if outcome.write.is_some() && previous == Some(ReduceMode::Tree) {
                            // Purge residual tree state before the direct
                            // aggregate becomes the one believed.
                            let mut migration = WriteBatch::new();
                            migration.clear_intermediates(key.clone(), &Level::ALL);
                            migration.append(std::mem::take(&mut outcome.batch));
                            outcome.batch = migration;
                        }
                        report.direct_keys += 1;
                        outcome
                    }
                    ReduceMode::Tree => {
                        let mut seeds: Vec<Bucket> = pending.level0;
                        let mut migration = WriteBatch::new();
                        if previous != Some(ReduceMode::Tree) {
                            // Seed level-0 markers from the key's live rows so
                            // the first tree pass starts from a complete view.
                            for bucket in snap.populated_buckets(&key) {
                                migration.schedule(ScheduledReduction::new(
                                    Level::Zero,
                                    key.clone(),
                                    bucket,
                                ));
                                seeds.push(bucket);
                            }
                        }
                        match tree::reduce_key(
                            &snap,
                            &self.definition,
                            &key,
                            &seeds,
                            token,
                            &self.errors,
                        ) {
                            Ok(mut outcome) => {
                                migration.append(std::mem::take(&mut outcome.batch));
                                outcome.batch = migration;
                                report.tree_keys += 1;
                                outcome
                            }
                            Err(err) if err.is_cancelled() => return Ok(false),
                            Err(err) => return Err(err),
                        }
                    }
                };

                if outcome.write.is_some() && previous != Some(target) {
                    outcome.batch.set_mode(key.clone(), target);
                    report.mode_switches += 1;
                }
                report.rows += outcome.rows;
                report.bytes += outcome.bytes;
                report.unit_errors += outcome.unit_errors;
                outcomes.push(outcome);
            }
        }

        // Flush aggregates, then commit bookkeeping for the keys whose write
        // landed; a failed write keeps its key's markers for retry.
        let mut commit = WriteBatch::new();
        {
            let mut store = lock_materialized(&self.materialized)?;
            for outcome in outcomes {
                let Some(write) = outcome.write else {
                    continue;
                };
                let applied = match write.value {
                    Some(value) => store.put(&write.key, value),
                    None => store.delete(&write.key),
                };
                match applied {
                    Ok(()) => {
                        commit.append(outcome.batch);
                        report.keys_reduced += 1;
                    }
                    Err(err) => {
                        report.write_errors += 1;
                        self.errors.record(IndexError::Write {
                            key: write.key.clone(),
                            detail: err.to_string(),
                        });
                    }
                }
            }
        }

        let work_done = report.keys_reduced > 0;
        commit.advance_watermark(cursor);
        self.storage.commit(commit)?;

        let elapsed = started.elapsed();
        self.tuner
            .record_cycle(report.markers_taken, report.bytes, elapsed);
        info!(
            index = self.definition.name(),
            keys = report.keys_reduced,
            direct = report.direct_keys,
            tree = report.tree_keys,
            rows = report.rows,
            unit_errors = report.unit_errors,
            elapsed_ms = elapsed.as_millis() as u64,
            "reduction cycle finished"
        );
        self.last_report = report;
        Ok(work_done)
    }
}

/// Take whole keys from the grouped pending work until the marker cap is
/// reached. Always takes at least one key so oversized keys cannot starve.
fn page_pending(
    grouped: std::collections::BTreeMap<ReduceKey, PendingKey>,
    cap: usize,
) -> Vec<(ReduceKey, PendingKey)> {
    let mut page = Vec::new();
    let mut taken = 0usize;
    for (key, pending) in grouped {
        if !page.is_empty() && taken >= cap {
            break;
        }
        taken += pending.level0.len() + pending.upper;
        page.push((key, pending));
    }
    page
}
