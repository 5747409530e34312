//! Run-scoped variable store threaded between node executors.
//!
//! Every key has exactly one producer per run. `Append` writes extend an
//! existing array instead of replacing it. Branch execution works on forks:
//! a fork records its writes in a journal which is replayed onto the parent
//! by [`ExecutionContext::merge`], or simply dropped to discard them.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::value::lookup_path;

/// Producer name used for keys seeded before the first node runs.
pub const INPUT_PRODUCER: &str = "input";

/// How a write combines with an existing value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    #[default]
    Replace,
    Append,
}

/// A single pending write produced by a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextWrite {
    pub key: String,
    pub value: Value,
    #[serde(default)]
    pub mode: WriteMode,
}

impl ContextWrite {
    pub fn replace(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
            mode: WriteMode::Replace,
        }
    }

    pub fn append(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
            mode: WriteMode::Append,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ContextError {
    #[error("cannot append to '{key}': existing value is not an array")]
    AppendToNonArray { key: String },

    #[error("key '{key}' already produced by '{existing}', rejected write from '{producer}'")]
    DuplicateProducer {
        key: String,
        existing: String,
        producer: String,
    },
}

#[derive(Debug, Clone)]
struct JournalEntry {
    producer: String,
    write: ContextWrite,
}

/// The mutable key → value bag owned by one run.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    values: BTreeMap<String, Value>,
    producers: HashMap<String, String>,
    journal: Vec<JournalEntry>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a context from initial inputs (e.g. an imported export document).
    pub fn with_inputs(inputs: impl IntoIterator<Item = (String, Value)>) -> Self {
        let mut ctx = Self::new();
        for (key, value) in inputs {
            ctx.producers.insert(key.clone(), INPUT_PRODUCER.to_string());
            ctx.values.insert(key, value);
        }
        ctx
    }

    /// Exact key lookup.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Exact key lookup, falling back to a dotted path into a stored value
    /// (`asset.name` reads field `name` of key `asset`).
    pub fn resolve(&self, path: &str) -> Option<&Value> {
        resolve_in(&self.values, path)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Producer that first wrote `key`, if any.
    pub fn producer_of(&self, key: &str) -> Option<&str> {
        self.producers.get(key).map(String::as_str)
    }

    /// Write on behalf of the engine's input producer.
    pub fn set(&mut self, key: &str, value: Value, mode: WriteMode) -> Result<(), ContextError> {
        self.apply(
            INPUT_PRODUCER,
            ContextWrite {
                key: key.to_string(),
                value,
                mode,
            },
        )
    }

    /// Apply a node's write, enforcing the single-producer and append rules.
    pub fn apply(&mut self, producer: &str, write: ContextWrite) -> Result<(), ContextError> {
        match write.mode {
            WriteMode::Replace => {
                if let Some(existing) = self.producers.get(&write.key) {
                    if existing != producer {
                        return Err(ContextError::DuplicateProducer {
                            key: write.key.clone(),
                            existing: existing.clone(),
                            producer: producer.to_string(),
                        });
                    }
                }
                self.values.insert(write.key.clone(), write.value.clone());
            }
            WriteMode::Append => {
                let slot = self
                    .values
                    .entry(write.key.clone())
                    .or_insert_with(|| Value::Array(Vec::new()));
                let Value::Array(items) = slot else {
                    return Err(ContextError::AppendToNonArray {
                        key: write.key.clone(),
                    });
                };
                match &write.value {
                    Value::Array(more) => items.extend(more.iter().cloned()),
                    other => items.push(other.clone()),
                }
            }
        }
        self.producers
            .entry(write.key.clone())
            .or_insert_with(|| producer.to_string());
        self.journal.push(JournalEntry {
            producer: producer.to_string(),
            write,
        });
        Ok(())
    }

    /// Apply several writes atomically: either all succeed or none are kept.
    pub fn apply_all(&mut self, producer: &str, writes: &[ContextWrite]) -> Result<(), ContextError> {
        self.check(writes.iter().map(|w| (producer, w)))?;
        for write in writes {
            self.apply(producer, write.clone())?;
        }
        Ok(())
    }

    /// A child context seeded with the current values and an empty journal.
    pub fn fork(&self) -> Self {
        Self {
            values: self.values.clone(),
            producers: self.producers.clone(),
            journal: Vec::new(),
        }
    }

    /// Replay a fork's journal onto this context, all or nothing.
    pub fn merge(&mut self, child: ExecutionContext) -> Result<(), ContextError> {
        self.check(child.journal.iter().map(|e| (e.producer.as_str(), &e.write)))?;
        for entry in child.journal {
            self.apply(&entry.producer, entry.write)?;
        }
        Ok(())
    }

    /// Forget the journal. Values and producers are kept; a context with no
    /// parent to merge into calls this after every applied batch.
    pub fn commit(&mut self) {
        self.journal.clear();
    }

    /// Run the producer and append rules over a batch without touching
    /// state, tracking keys the batch itself creates.
    fn check<'a>(
        &'a self,
        writes: impl IntoIterator<Item = (&'a str, &'a ContextWrite)>,
    ) -> Result<(), ContextError> {
        // key -> (owning producer, value is an array)
        let mut staged: HashMap<&'a str, (&'a str, bool)> = HashMap::new();
        for (producer, write) in writes {
            let key = write.key.as_str();
            let (owner, is_array) = match staged.get(key) {
                Some(&(owner, is_array)) => (Some(owner), Some(is_array)),
                None => (
                    self.producers.get(key).map(String::as_str),
                    self.values.get(key).map(Value::is_array),
                ),
            };
            let is_array = match write.mode {
                WriteMode::Replace => {
                    if let Some(existing) = owner.filter(|o| *o != producer) {
                        return Err(ContextError::DuplicateProducer {
                            key: write.key.clone(),
                            existing: existing.to_string(),
                            producer: producer.to_string(),
                        });
                    }
                    write.value.is_array()
                }
                WriteMode::Append => {
                    if is_array == Some(false) {
                        return Err(ContextError::AppendToNonArray {
                            key: write.key.clone(),
                        });
                    }
                    true
                }
            };
            staged.insert(key, (owner.unwrap_or(producer), is_array));
        }
        Ok(())
    }

    /// Number of writes recorded since this context was created, forked or
    /// last committed.
    pub fn pending_writes(&self) -> usize {
        self.journal.len()
    }

    /// Immutable copy of the current values.
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot(self.values.clone())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Frozen view of a context, used for history records and export.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextSnapshot(BTreeMap<String, Value>);

impl ContextSnapshot {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Same lookup rules as [`ExecutionContext::resolve`].
    pub fn resolve(&self, path: &str) -> Option<&Value> {
        resolve_in(&self.0, path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The export document: every key mapped to its final value.
    pub fn to_json(&self) -> Value {
        Value::Object(self.0.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    /// Rebuild a fresh context (all keys owned by the input producer).
    pub fn to_context(&self) -> ExecutionContext {
        ExecutionContext::with_inputs(self.0.clone())
    }
}

fn resolve_in<'a>(values: &'a BTreeMap<String, Value>, path: &str) -> Option<&'a Value> {
    if let Some(v) = values.get(path) {
        return Some(v);
    }
    let mut split = path.len();
    while let Some(idx) = path[..split].rfind('.') {
        if let Some(root) = values.get(&path[..idx]) {
            return lookup_path(root, &path[idx + 1..]);
        }
        split = idx;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn append_extends_array_and_creates_missing_key() {
        let mut ctx = ExecutionContext::new();
        ctx.apply("a", ContextWrite::append("items", json!(1))).unwrap();
        ctx.apply("a", ContextWrite::append("items", json!([2, 3]))).unwrap();
        assert_eq!(ctx.get("items"), Some(&json!([1, 2, 3])));
    }

    #[test]
    fn append_onto_scalar_is_a_type_mismatch() {
        let mut ctx = ExecutionContext::new();
        ctx.apply("a", ContextWrite::replace("total", json!(5))).unwrap();
        let err = ctx
            .apply("a", ContextWrite::append("total", json!(1)))
            .unwrap_err();
        assert!(matches!(err, ContextError::AppendToNonArray { key } if key == "total"));
    }

    #[test]
    fn second_producer_cannot_replace_a_key() {
        let mut ctx = ExecutionContext::new();
        ctx.apply("a", ContextWrite::replace("k", json!(1))).unwrap();
        let err = ctx.apply("b", ContextWrite::replace("k", json!(2))).unwrap_err();
        assert!(matches!(err, ContextError::DuplicateProducer { .. }));
        assert_eq!(ctx.get("k"), Some(&json!(1)));
    }

    #[test]
    fn snapshot_is_detached_from_later_writes() {
        let mut ctx = ExecutionContext::new();
        ctx.apply("a", ContextWrite::replace("k", json!(1))).unwrap();
        let snap = ctx.snapshot();
        ctx.apply("b", ContextWrite::replace("other", json!(2))).unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap.to_json(), json!({ "k": 1 }));
    }

    #[test]
    fn fork_then_merge_replays_writes() {
        let mut parent = ExecutionContext::with_inputs([("seed".to_string(), json!(true))]);
        let mut child = parent.fork();
        child.apply("n1", ContextWrite::replace("out", json!("x"))).unwrap();
        assert!(parent.get("out").is_none());
        parent.merge(child).unwrap();
        assert_eq!(parent.get("out"), Some(&json!("x")));
        assert_eq!(parent.producer_of("out"), Some("n1"));
    }

    #[test]
    fn dropped_fork_leaves_parent_untouched() {
        let parent = ExecutionContext::new();
        let mut child = parent.fork();
        child.apply("n1", ContextWrite::replace("out", json!(1))).unwrap();
        drop(child);
        assert!(parent.is_empty());
    }

    #[test]
    fn resolve_reads_into_nested_values() {
        let ctx = ExecutionContext::with_inputs([(
            "asset".to_string(),
            json!({ "name": "Pump", "custom": { "zone": "A" } }),
        )]);
        assert_eq!(ctx.resolve("asset.name"), Some(&json!("Pump")));
        assert_eq!(ctx.resolve("asset.custom.zone"), Some(&json!("A")));
        assert_eq!(ctx.resolve("asset.missing"), None);
    }

    #[test]
    fn failed_merge_leaves_parent_untouched() {
        let mut parent = ExecutionContext::new();
        parent.apply("a", ContextWrite::replace("owned", json!(1))).unwrap();
        let mut child = parent.fork();
        child.apply("b", ContextWrite::replace("fresh", json!(2))).unwrap();
        child.apply("b", ContextWrite::append("list", json!(3))).unwrap();
        let mut rival = parent.fork();
        rival.apply("c", ContextWrite::replace("fresh", json!(4))).unwrap();

        parent.merge(child).unwrap();
        let before = parent.snapshot();
        let err = parent.merge(rival).unwrap_err();
        assert!(matches!(err, ContextError::DuplicateProducer { key, .. } if key == "fresh"));
        assert_eq!(parent.snapshot(), before);
        assert_eq!(parent.get("list"), Some(&json!([3])));
    }

    #[test]
    fn batch_checks_see_keys_created_earlier_in_the_batch() {
        let mut ctx = ExecutionContext::new();
        let writes = vec![
            ContextWrite::replace("k", json!(1)),
            ContextWrite::append("k", json!(2)),
        ];
        assert!(matches!(
            ctx.apply_all("a", &writes),
            Err(ContextError::AppendToNonArray { .. })
        ));
        assert!(ctx.is_empty());

        let writes = vec![
            ContextWrite::replace("k", json!([1])),
            ContextWrite::append("k", json!(2)),
        ];
        ctx.apply_all("a", &writes).unwrap();
        assert_eq!(ctx.get("k"), Some(&json!([1, 2])));
    }

    #[test]
    fn commit_drops_the_journal_but_keeps_values() {
        let mut ctx = ExecutionContext::new();
        let child = {
            let mut child = ctx.fork();
            child.apply("n1", ContextWrite::replace("out", json!(1))).unwrap();
            child
        };
        ctx.merge(child).unwrap();
        assert_eq!(ctx.pending_writes(), 1);
        ctx.commit();
        assert_eq!(ctx.pending_writes(), 0);
        assert_eq!(ctx.producer_of("out"), Some("n1"));
        assert!(ctx
            .apply("n2", ContextWrite::replace("out", json!(2)))
            .is_err());
    }

    #[test]
    fn apply_all_is_atomic() {
        let mut ctx = ExecutionContext::new();
        ctx.apply("a", ContextWrite::replace("scalar", json!(1))).unwrap();
        let writes = vec![
            ContextWrite::replace("fresh", json!(1)),
            ContextWrite::append("scalar", json!(2)),
        ];
        assert!(ctx.apply_all("a", &writes).is_err());
        assert!(ctx.get("fresh").is_none());
    }
}
