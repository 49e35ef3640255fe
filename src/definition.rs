//! Index definitions: the map and reduce functions an index runs.
//!
//! Both functions come from the index-definition compiler, which is outside
//! this crate; here they are opaque callables. The reduce function must be
//! associative and commutative — buckets are folded in arbitrary order and
//! partial results are folded again at higher levels. That precondition is
//! enforced at definition-validation time, not here.

use std::fmt;

use serde_json::Value;

use crate::model::{Document, ReduceKey};

/// Error type for user-supplied map/reduce functions. Wrapped into
/// [`IndexError`](crate::IndexError) with unit context at the call site.
pub type FnError = Box<dyn std::error::Error + Send + Sync>;

/// One (reduce key, value) tuple emitted by the map function.
#[derive(Debug, Clone)]
pub struct MappedTuple {
    pub key: ReduceKey,
    pub value: Value,
}

impl MappedTuple {
    pub fn new(key: impl Into<ReduceKey>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// `document -> zero or more (key, value)`. An empty vec means the document
/// yields no reduce key and is skipped with a diagnostic.
pub type MapFn = dyn Fn(&Document) -> Result<Vec<MappedTuple>, FnError> + Send + Sync;

/// Associative, commutative fold of values sharing one reduce key. Receives
/// raw mapped values and previously reduced partial results alike.
pub type ReduceFn = dyn Fn(&[Value]) -> Result<Value, FnError> + Send + Sync;

/// A compiled index definition: name plus the two functions.
pub struct IndexDefinition {
    name: String,
    map: Box<MapFn>,
    reduce: Box<ReduceFn>,
}

impl IndexDefinition {
    pub fn new<M, R>(name: impl Into<String>, map: M, reduce: R) -> Self
    where
        M: Fn(&Document) -> Result<Vec<MappedTuple>, FnError> + Send + Sync + 'static,
        R: Fn(&[Value]) -> Result<Value, FnError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            map: Box::new(map),
            reduce: Box::new(reduce),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn map(&self, doc: &Document) -> Result<Vec<MappedTuple>, FnError> {
        (self.map)(doc)
    }

    pub fn reduce(&self, values: &[Value]) -> Result<Value, FnError> {
        (self.reduce)(values)
    }
}

impl fmt::Debug for IndexDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexDefinition")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Sums numeric values. The usual reduce for count-style aggregations where
/// the map emits `1` per document.
///
/// All-integer inputs are summed exactly in `i64`; a float input or an
/// integer overflow falls back to `f64`.
pub fn sum_reduce(values: &[Value]) -> Result<Value, FnError> {
    let mut int_total: Option<i64> = Some(0);
    let mut float_total = 0.0f64;
    for v in values {
        let f = v
            .as_f64()
            .ok_or_else(|| format!("expected a number, got {v}"))?;
        float_total += f;
        int_total = match (int_total, v.as_i64()) {
            (Some(acc), Some(n)) => acc.checked_add(n),
            _ => None,
        };
    }
    Ok(match int_total {
        Some(n) => Value::from(n),
        None => Value::from(float_total),
    })
}
