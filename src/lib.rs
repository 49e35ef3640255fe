//! tally: incremental map-reduce aggregation over a mutating document
//! collection.
//!
//! An index definition supplies a map function (document to zero or more
//! key+value tuples) and a reduce function (associative, commutative fold of
//! values sharing a key). The engine keeps the materialized aggregate
//! consistent as documents are inserted, updated, and deleted, without
//! rescanning the whole dataset on every change.
//!
//! # How a change flows
//!
//! ```text
//! documents -> map stage -> {mapped results, ledger}
//!                               |
//!               dispatcher reads ledger + reduce-type directory
//!                               |
//!              direct reducer  or  3-level tree reducer
//!                               |
//!                  materialized aggregate (per key)
//! ```
//!
//! Per key, the dispatcher picks a strategy each cycle from the pending-entry
//! count: small keys are folded directly over all their live rows, large keys
//! go through a bucketed three-level tree where only buckets touched by a
//! change are recomputed and promoted. Keys migrate between strategies as
//! their cardinality crosses the threshold, with the residual state of the
//! abandoned strategy purged during the switch.
//!
//! # Guarantees
//!
//! - A cycle commits its bookkeeping only after the materialized writes
//!   landed; a failed or cancelled cycle commits nothing, so re-running it is
//!   idempotent.
//! - Per-unit map/reduce failures are recorded and retried; they never abort
//!   a cycle.
//! - Queries may lag by one cycle ([`MapReduceIndex::is_stale`] says whether
//!   they currently do). Cross-crash atomicity of a whole cycle is not
//!   promised, only idempotent convergence.

pub mod aggregate;
pub mod cancel;
pub mod definition;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod mapping;
pub mod model;
pub mod storage;
pub mod tuner;

mod reduce;

pub use aggregate::{AggregateObserver, MaterializedStore, MaterializedWriter};
pub use cancel::CancellationToken;
pub use definition::{IndexDefinition, MappedTuple};
pub use dispatch::{CycleReport, DispatcherConfig, ReductionDispatcher};
pub use engine::MapReduceIndex;
pub use error::{ErrorLog, IndexError, RecordedError, Result};
pub use mapping::{DocumentChange, MapStage, MapStats};
pub use model::{Bucket, Document, DocumentId, Level, ReduceKey, ReduceMode};
pub use tuner::{BatchSizeTuner, TunerConfig};
