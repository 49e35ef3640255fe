//! Error taxonomy for the indexing engine.
//!
//! Unit-level failures (one document's map, one bucket's reduce) are recorded
//! in the [`ErrorLog`] and never abort a cycle. Cycle-level failures (storage
//! unavailable) propagate to the caller with all persistent state untouched.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

use thiserror::Error;
use tracing::warn;

use crate::model::{Bucket, DocumentId, Level, ReduceKey};

/// Errors that can occur while building or maintaining an index.
#[derive(Debug, Clone, Error)]
pub enum IndexError {
    /// The map function failed for one document.
    #[error("map failed for document {doc_id}: {detail}")]
    Map { doc_id: DocumentId, detail: String },

    /// The reduce function failed for one (key, bucket) unit.
    #[error("reduce failed for key {key} at level {level}, bucket {bucket}: {detail}")]
    Reduce {
        key: ReduceKey,
        level: Level,
        bucket: Bucket,
        detail: String,
    },

    /// Writing the materialized aggregate failed.
    #[error("materialized write failed for key {key}: {detail}")]
    Write { key: ReduceKey, detail: String },

    /// The storage layer failed; nothing from the current cycle was committed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Cooperative cancellation was requested. Not a failure: pending work
    /// markers are preserved and the next cycle resumes them.
    #[error("cancellation requested")]
    Cancelled,
}

impl IndexError {
    /// True for the cancellation sentinel, which callers treat as a clean
    /// early exit rather than an error.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, IndexError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, IndexError>;

/// One recorded unit failure.
#[derive(Debug, Clone)]
pub struct RecordedError {
    pub at: SystemTime,
    pub error: IndexError,
}

/// Bounded, rotating list of unit failures for one index.
///
/// An index with a nonzero backlog keeps reporting its recent errors while the
/// retained work markers are retried; once the oldest entries rotate out only
/// the running total remembers them.
#[derive(Debug)]
pub struct ErrorLog {
    entries: Mutex<VecDeque<RecordedError>>,
    capacity: usize,
    total: AtomicU64,
}

impl ErrorLog {
    pub const DEFAULT_CAPACITY: usize = 500;

    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
            total: AtomicU64::new(0),
        }
    }

    /// Record a unit failure, rotating out the oldest entry when full.
    pub fn record(&self, error: IndexError) {
        warn!(%error, "indexing error recorded");
        self.total.fetch_add(1, Ordering::Relaxed);
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(RecordedError {
            at: SystemTime::now(),
            error,
        });
    }

    /// Most recent errors, oldest first, at most `n`.
    pub fn recent(&self, n: usize) -> Vec<RecordedError> {
        let entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    /// Total errors ever recorded, including rotated-out ones.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

impl Default for ErrorLog {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
