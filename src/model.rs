//! Core data model: documents, reduce keys, buckets, levels, and the
//! persisted row types shared by the map stage and both reducers.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use fnv::FnvHasher;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Fan-in factor between tree levels: up to this many child buckets feed one
/// parent bucket.
pub const FAN_IN: u32 = 1024;

/// Level-0 buckets are drawn from `[0, FAN_IN^2)` so that one division per
/// promotion lands level-1 buckets in `[0, FAN_IN)` and level 2 is a single
/// synthetic bucket.
const BUCKET_SPACE: u64 = (FAN_IN as u64) * (FAN_IN as u64);

/// Identifier of a source document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub String);

impl DocumentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        DocumentId(s.to_owned())
    }
}

impl From<String> for DocumentId {
    fn from(s: String) -> Self {
        DocumentId(s)
    }
}

/// A raw document handed to the map function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub data: Value,
}

impl Document {
    pub fn new(id: impl Into<DocumentId>, data: Value) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }
}

/// Grouping key for aggregation. Comparison, equality, and hashing are
/// case-insensitive; the casing of the first writer is preserved for display
/// and for the materialized output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReduceKey(String);

impl ReduceKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn folded(&self) -> impl Iterator<Item = char> + '_ {
        self.0.chars().flat_map(char::to_lowercase)
    }
}

impl fmt::Display for ReduceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq for ReduceKey {
    fn eq(&self, other: &Self) -> bool {
        self.folded().eq(other.folded())
    }
}

impl Eq for ReduceKey {}

impl PartialOrd for ReduceKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReduceKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.folded().cmp(other.folded())
    }
}

impl Hash for ReduceKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for c in self.folded() {
            c.hash(state);
        }
    }
}

impl From<&str> for ReduceKey {
    fn from(s: &str) -> Self {
        ReduceKey::new(s)
    }
}

/// Fan-in grouping id. Carries no business meaning; it only bounds how many
/// units feed one fold at the next level up.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Bucket(pub u32);

impl Bucket {
    /// The single bucket used at the final level and by the direct reducer.
    pub const SYNTHETIC: Bucket = Bucket(0);

    /// Deterministic level-0 placement for a document. Any uniformly
    /// distributing function of the id would do; FNV-1a keeps placement stable
    /// across runs and platforms.
    pub fn for_document(id: &DocumentId) -> Bucket {
        let mut hasher = FnvHasher::default();
        hasher.write(id.as_str().as_bytes());
        Bucket((hasher.finish() % BUCKET_SPACE) as u32)
    }

    /// The bucket one level up that this bucket folds into.
    pub fn parent(self) -> Bucket {
        Bucket(self.0 / FAN_IN)
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The three fixed levels of the reduce tree, 0 closest to raw map output and
/// 2 producing the materialized aggregate.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Level {
    Zero,
    One,
    Two,
}

impl Level {
    pub const ALL: [Level; 3] = [Level::Zero, Level::One, Level::Two];

    pub fn next(self) -> Option<Level> {
        match self {
            Level::Zero => Some(Level::One),
            Level::One => Some(Level::Two),
            Level::Two => None,
        }
    }

    pub fn is_final(self) -> bool {
        self == Level::Two
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = match self {
            Level::Zero => 0,
            Level::One => 1,
            Level::Two => 2,
        };
        write!(f, "{n}")
    }
}

/// Active reduction strategy for one key, recorded in the reduce-type
/// directory. The materialized value visible for a key was produced entirely
/// under the mode recorded here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReduceMode {
    /// Single-pass fold of all live mapped rows. O(rows) per run.
    Direct,
    /// Three-level bucketed incremental fold. O(changed rows) per run.
    Tree,
}

impl fmt::Display for ReduceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReduceMode::Direct => f.write_str("direct"),
            ReduceMode::Tree => f.write_str("tree"),
        }
    }
}

/// One persisted (document -> key, value) tuple produced by the map stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappedResultEntry {
    pub doc_id: DocumentId,
    pub key: ReduceKey,
    pub bucket: Bucket,
    pub value: Value,
    /// FNV of (key, value); lets the map stage skip rescheduling documents
    /// whose re-map produced identical output.
    pub content_hash: u64,
}

impl MappedResultEntry {
    pub fn new(doc_id: DocumentId, key: ReduceKey, value: Value) -> Self {
        let bucket = Bucket::for_document(&doc_id);
        let content_hash = content_hash(&key, &value);
        Self {
            doc_id,
            key,
            bucket,
            value,
            content_hash,
        }
    }
}

/// Hash of a mapped tuple's user-visible content, casing of the key ignored.
pub fn content_hash(key: &ReduceKey, value: &Value) -> u64 {
    let mut hasher = FnvHasher::default();
    for c in key.as_str().chars().flat_map(char::to_lowercase) {
        let mut buf = [0u8; 4];
        hasher.write(c.encode_utf8(&mut buf).as_bytes());
    }
    hasher.write(value.to_string().as_bytes());
    hasher.finish()
}

/// One pending unit of reduction work: fold bucket `bucket` of `key` at
/// `level`. Stored with set semantics, so duplicate scheduling coalesces.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScheduledReduction {
    pub level: Level,
    pub key: ReduceKey,
    pub bucket: Bucket,
}

impl ScheduledReduction {
    pub fn new(level: Level, key: ReduceKey, bucket: Bucket) -> Self {
        Self { level, key, bucket }
    }
}
