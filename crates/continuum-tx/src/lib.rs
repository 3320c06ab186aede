#![forbid(unsafe_code)]

//! **continuum-tx** – a delta-based transaction façade over an
//! already-replayed or snapshot-loaded base graph (spec §4.12, C12).
//!
//! Unlike `continuum-proxy::Facade`, a transaction never touches the base
//! graph until `save`: reads check the delta first and fall back to the
//! base, writes land only in the delta (dot-joined path → [`DeltaEntry`]),
//! and a collection mutating method copy-on-first-writes its target into
//! the delta before mutating the copy in place — the base's own composite
//! is never shared into the delta, or a transaction's in-progress edits
//! would leak into direct reads of the base (spec §8 property 5,
//! "transaction isolation").

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use continuum_event::{Event, EventKind};
use continuum_path::{Path, PathError};
use continuum_store_core::{EventLog, LogError};
use continuum_value::{new_ref, DateValue, FunctionValue, MapKey, NodeId, SetKey, Value};
use indexmap::IndexMap;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TxError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error("no value at {0:?} within this transaction")]
    NotFound(Path),
    #[error("cannot mutate a non-composite value at {0:?}")]
    NotComposite(Path),
}

/// One delta entry: a staged value, or the deletion sentinel (spec §3
/// Glossary "Delta").
#[derive(Clone)]
pub enum DeltaEntry {
    Value(Value),
    Deleted,
}

/// An opaque snapshot of the delta, returned by [`Transaction::checkpoint`]
/// and consumed by [`Transaction::restore_checkpoint`].
#[derive(Clone)]
pub struct Checkpoint(IndexMap<String, DeltaEntry>);

/// A transaction over `base`. Holds no reference to any
/// `continuum-proxy::Facade` — reads/writes route through `continuum-path`
/// directly, exactly like the base-graph façade does, just staged in the
/// delta instead of applied immediately (spec §4.12).
pub struct Transaction {
    base: Value,
    log: Arc<dyn EventLog>,
    delta: RefCell<IndexMap<String, DeltaEntry>>,
}

impl Transaction {
    pub fn new(base: Value, log: Arc<dyn EventLog>) -> Self {
        Self { base, log, delta: RefCell::new(IndexMap::new()) }
    }

    /// `Clean` iff the delta is empty — the state machine's two states
    /// collapse to this one observable fact (spec §4.12 state machine).
    pub fn is_dirty(&self) -> bool {
        !self.delta.borrow().is_empty()
    }

    pub fn base(&self) -> &Value {
        &self.base
    }

    /// Delta first (a `Deleted` entry reads as absent), falling back to the
    /// base graph (spec §4.12 `get`).
    pub fn get(&self, path: &Path) -> Option<Value> {
        let key = path.to_dotted();
        match self.delta.borrow().get(&key) {
            Some(DeltaEntry::Deleted) => return None,
            Some(DeltaEntry::Value(v)) => return Some(v.clone()),
            None => {}
        }
        continuum_path::get(&self.base, path)
    }

    pub fn has(&self, path: &Path) -> bool {
        self.get(path).is_some()
    }

    pub fn set(&self, path: &Path, value: Value) {
        self.delta.borrow_mut().insert(path.to_dotted(), DeltaEntry::Value(value));
    }

    pub fn delete(&self, path: &Path) {
        self.delta.borrow_mut().insert(path.to_dotted(), DeltaEntry::Deleted);
    }

    /// Copy-on-first-write: stage a private deep copy of the composite at
    /// `path` into the delta (unless already staged) and return it, so a
    /// mutating method can edit the copy without ever touching the base's
    /// `Rc` (spec §4.12: "copy-on-first-write into the delta at the
    /// array's path").
    fn delta_copy(&self, path: &Path) -> Result<Value, TxError> {
        let key = path.to_dotted();
        if let Some(entry) = self.delta.borrow().get(&key) {
            return match entry {
                DeltaEntry::Value(v) => Ok(v.clone()),
                DeltaEntry::Deleted => Err(TxError::NotFound(path.clone())),
            };
        }
        let base_value = continuum_path::get(&self.base, path).ok_or_else(|| TxError::NotFound(path.clone()))?;
        let mut seen = HashMap::new();
        let copy = deep_clone(&base_value, &mut seen);
        self.delta.borrow_mut().insert(key, DeltaEntry::Value(copy.clone()));
        Ok(copy)
    }

    fn delta_array(&self, path: &Path) -> Result<continuum_value::Ref<Vec<Value>>, TxError> {
        match self.delta_copy(path)? {
            Value::Array(items) => Ok(items),
            _ => Err(TxError::NotComposite(path.clone())),
        }
    }

    fn delta_map(&self, path: &Path) -> Result<continuum_value::Ref<IndexMap<MapKey, Value>>, TxError> {
        match self.delta_copy(path)? {
            Value::Map(entries) => Ok(entries),
            _ => Err(TxError::NotComposite(path.clone())),
        }
    }

    fn delta_set(&self, path: &Path) -> Result<continuum_value::Ref<indexmap::IndexSet<SetKey>>, TxError> {
        match self.delta_copy(path)? {
            Value::Set(entries) => Ok(entries),
            _ => Err(TxError::NotComposite(path.clone())),
        }
    }

    //── Array mutating methods ────────────────────────────────────────

    pub fn push(&self, path: &Path, items: Vec<Value>) -> Result<(), TxError> {
        self.delta_array(path)?.borrow_mut().extend(items);
        Ok(())
    }

    pub fn pop(&self, path: &Path) -> Result<(), TxError> {
        self.delta_array(path)?.borrow_mut().pop();
        Ok(())
    }

    pub fn shift(&self, path: &Path) -> Result<(), TxError> {
        let arr = self.delta_array(path)?;
        let mut arr = arr.borrow_mut();
        if !arr.is_empty() {
            arr.remove(0);
        }
        Ok(())
    }

    pub fn unshift(&self, path: &Path, items: Vec<Value>) -> Result<(), TxError> {
        self.delta_array(path)?.borrow_mut().splice(0..0, items);
        Ok(())
    }

    pub fn splice(&self, path: &Path, start: i64, delete_count: i64, items: Vec<Value>) -> Result<(), TxError> {
        let arr = self.delta_array(path)?;
        let mut arr = arr.borrow_mut();
        let len = arr.len();
        let start = normalize_index(start, len);
        let delete_count = delete_count.max(0) as usize;
        let end = (start + delete_count).min(len);
        arr.splice(start..end, items);
        Ok(())
    }

    pub fn sort(&self, path: &Path) -> Result<(), TxError> {
        self.delta_array(path)?
            .borrow_mut()
            .sort_by_key(value_sort_key);
        Ok(())
    }

    pub fn reverse(&self, path: &Path) -> Result<(), TxError> {
        self.delta_array(path)?.borrow_mut().reverse();
        Ok(())
    }

    pub fn fill(&self, path: &Path, value: Value, start: i64, end: i64) -> Result<(), TxError> {
        let arr = self.delta_array(path)?;
        let mut arr = arr.borrow_mut();
        let len = arr.len();
        let start = normalize_index(start, len);
        let end = normalize_index(end, len);
        for slot in arr.iter_mut().take(end).skip(start) {
            *slot = value.clone();
        }
        Ok(())
    }

    pub fn copy_within(&self, path: &Path, target: i64, start: i64, end: i64) -> Result<(), TxError> {
        let arr = self.delta_array(path)?;
        let mut arr = arr.borrow_mut();
        let len = arr.len();
        let target = normalize_index(target, len);
        let start = normalize_index(start, len);
        let end = normalize_index(end, len);
        if start >= end {
            return Ok(());
        }
        let block: Vec<Value> = arr[start..end].to_vec();
        let copy_len = block.len().min(len - target);
        arr[target..target + copy_len].clone_from_slice(&block[..copy_len]);
        Ok(())
    }

    //── Map mutating methods ──────────────────────────────────────────

    pub fn map_set(&self, path: &Path, key: Value, value: Value) -> Result<(), TxError> {
        self.delta_map(path)?.borrow_mut().insert(MapKey(key), value);
        Ok(())
    }

    pub fn map_delete(&self, path: &Path, key: Value) -> Result<(), TxError> {
        self.delta_map(path)?.borrow_mut().shift_remove(&MapKey(key));
        Ok(())
    }

    pub fn map_clear(&self, path: &Path) -> Result<(), TxError> {
        self.delta_map(path)?.borrow_mut().clear();
        Ok(())
    }

    //── Set mutating methods ──────────────────────────────────────────

    pub fn set_add(&self, path: &Path, value: Value) -> Result<(), TxError> {
        self.delta_set(path)?.borrow_mut().insert(SetKey(value));
        Ok(())
    }

    pub fn set_delete(&self, path: &Path, value: Value) -> Result<(), TxError> {
        self.delta_set(path)?.borrow_mut().shift_remove(&SetKey(value));
        Ok(())
    }

    pub fn set_clear(&self, path: &Path) -> Result<(), TxError> {
        self.delta_set(path)?.borrow_mut().clear();
        Ok(())
    }

    //── Checkpoint / restore ──────────────────────────────────────────

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.delta.borrow().clone())
    }

    pub fn restore_checkpoint(&self, token: Checkpoint) {
        *self.delta.borrow_mut() = token.0;
    }

    pub fn discard(&self) {
        self.delta.borrow_mut().clear();
    }

    /// Flush the delta shallowest-first (spec §4.12): one `SET` per staged
    /// value, one `DELETE` per staged deletion, applied to the base graph
    /// and appended to the log. A closed log fails the whole call without
    /// clearing the delta, so the transaction's observable state is
    /// unchanged on failure (spec §4.12 "the transaction's state does not
    /// change on failure").
    pub async fn save(&self) -> Result<(), TxError> {
        let mut entries: Vec<(String, DeltaEntry)> =
            self.delta.borrow().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        entries.sort_by_key(|(k, _)| path_depth(k));

        for (key, entry) in &entries {
            let path = Path::from_dotted(key);
            debug!(path = %key, "flushing transaction delta entry");
            match entry {
                DeltaEntry::Value(value) => {
                    continuum_path::set(&self.base, &path, value.clone())?;
                    let encoded = continuum_codec::encode_event_value(value, &path, &HashMap::new());
                    self.log.append(Event::new(EventKind::Set { value: encoded }, path, now_ms())).await?;
                }
                DeltaEntry::Deleted => {
                    continuum_path::delete(&self.base, &path)?;
                    self.log.append(Event::new(EventKind::Delete, path, now_ms())).await?;
                }
            }
        }
        self.delta.borrow_mut().clear();
        Ok(())
    }
}

fn path_depth(dotted: &str) -> usize {
    if dotted.is_empty() {
        0
    } else {
        dotted.matches('.').count() + 1
    }
}

/// A private, cycle-safe deep copy of a composite — the base's `Rc` is
/// never shared into the delta (spec §4.12 copy-on-first-write,
/// §8 property 5 transaction isolation). `seen` preserves shared/cyclic
/// structure *within the copy* the same way `structural_eq` does for
/// comparison.
fn deep_clone(v: &Value, seen: &mut HashMap<NodeId, Value>) -> Value {
    let Some(id) = continuum_value::identity(v) else {
        return v.clone();
    };
    if let Some(existing) = seen.get(&id) {
        return existing.clone();
    }
    match v {
        Value::Array(items) => {
            let copy = Value::Array(new_ref(Vec::new()));
            seen.insert(id, copy.clone());
            let cloned: Vec<Value> = items.borrow().iter().map(|i| deep_clone(i, seen)).collect();
            if let Value::Array(dst) = &copy {
                *dst.borrow_mut() = cloned;
            }
            copy
        }
        Value::Object(fields) => {
            let copy = Value::Object(new_ref(IndexMap::new()));
            seen.insert(id, copy.clone());
            let cloned: IndexMap<String, Value> =
                fields.borrow().iter().map(|(k, v)| (k.clone(), deep_clone(v, seen))).collect();
            if let Value::Object(dst) = &copy {
                *dst.borrow_mut() = cloned;
            }
            copy
        }
        Value::Map(entries) => {
            let copy = Value::Map(new_ref(IndexMap::new()));
            seen.insert(id, copy.clone());
            let cloned: IndexMap<MapKey, Value> = entries
                .borrow()
                .iter()
                .map(|(k, v)| (MapKey(deep_clone(&k.0, seen)), deep_clone(v, seen)))
                .collect();
            if let Value::Map(dst) = &copy {
                *dst.borrow_mut() = cloned;
            }
            copy
        }
        Value::Set(entries) => {
            let copy = Value::Set(new_ref(indexmap::IndexSet::new()));
            seen.insert(id, copy.clone());
            let cloned: indexmap::IndexSet<SetKey> =
                entries.borrow().iter().map(|k| SetKey(deep_clone(&k.0, seen))).collect();
            if let Value::Set(dst) = &copy {
                *dst.borrow_mut() = cloned;
            }
            copy
        }
        Value::Date(d) => {
            let d = d.borrow();
            let properties = d.properties.iter().map(|(k, v)| (k.clone(), deep_clone(v, seen))).collect();
            let copy = Value::Date(new_ref(DateValue { timestamp: d.timestamp, properties }));
            seen.insert(id, copy.clone());
            copy
        }
        Value::Regex(r) => {
            let copy = Value::Regex(new_ref(r.borrow().clone()));
            seen.insert(id, copy.clone());
            copy
        }
        Value::Function(f) => {
            let copy = Value::Function(new_ref(FunctionValue { source_code: f.borrow().source_code.clone() }));
            seen.insert(id, copy.clone());
            copy
        }
        _ => unreachable!("identity() only returns Some for composite categories"),
    }
}

fn normalize_index(i: i64, len: usize) -> usize {
    if i < 0 {
        (len as i64 + i).max(0) as usize
    } else {
        (i as usize).min(len)
    }
}

fn value_sort_key(v: &Value) -> String {
    match v {
        Value::Null => "null".to_string(),
        Value::Undefined => "undefined".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Str(s) => s.clone(),
        Value::BigInt(s) => s.clone(),
        other => format!("{other:?}"),
    }
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use continuum_store_memory::MemoryLog;

    fn tx_over(base: Value) -> Transaction {
        Transaction::new(base, Arc::new(MemoryLog::new()))
    }

    #[test]
    fn reads_prefer_delta_over_base() {
        let base = Value::object();
        continuum_path::set(&base, &Path::from_segments(["count"]), Value::Number(0.0)).unwrap();
        let tx = tx_over(base.clone());
        assert!(!tx.is_dirty());
        tx.set(&Path::from_segments(["count"]), Value::Number(1.0));
        assert!(tx.is_dirty());
        assert!(matches!(tx.get(&Path::from_segments(["count"])), Some(Value::Number(n)) if n == 1.0));
        assert!(matches!(continuum_path::get(&base, &Path::from_segments(["count"])), Some(Value::Number(n)) if n == 0.0));
    }

    #[tokio::test]
    async fn save_coalesces_repeat_writes_into_one_set_event() {
        let base = Value::object();
        continuum_path::set(&base, &Path::from_segments(["count"]), Value::Number(0.0)).unwrap();
        let log = Arc::new(MemoryLog::new());
        let tx = Transaction::new(base.clone(), log.clone());
        tx.set(&Path::from_segments(["count"]), Value::Number(1.0));
        tx.set(&Path::from_segments(["count"]), Value::Number(2.0));
        assert!(tx.is_dirty());
        tx.save().await.unwrap();
        assert!(!tx.is_dirty());
        assert!(matches!(continuum_path::get(&base, &Path::from_segments(["count"])), Some(Value::Number(n)) if n == 2.0));
        assert_eq!(log.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn discard_drops_delta_and_leaves_base_untouched() {
        let base = Value::object();
        continuum_path::set(&base, &Path::from_segments(["a"]), Value::Number(1.0)).unwrap();
        let log = Arc::new(MemoryLog::new());
        let tx = Transaction::new(base.clone(), log.clone());
        tx.set(&Path::from_segments(["a"]), Value::Number(99.0));
        tx.set(&Path::from_segments(["b"]), Value::Str("new".into()));
        tx.discard();
        assert!(!tx.is_dirty());
        assert!(matches!(continuum_path::get(&base, &Path::from_segments(["a"])), Some(Value::Number(n)) if n == 1.0));
        assert!(log.get_all().await.unwrap().is_empty());
    }

    #[test]
    fn checkpoint_and_restore_round_trip_the_delta() {
        let tx = tx_over(Value::object());
        tx.set(&Path::from_segments(["x"]), Value::Number(1.0));
        let checkpoint = tx.checkpoint();
        tx.set(&Path::from_segments(["y"]), Value::Number(2.0));
        tx.restore_checkpoint(checkpoint);
        assert!(tx.get(&Path::from_segments(["y"])).is_none());
        assert!(matches!(tx.get(&Path::from_segments(["x"])), Some(Value::Number(n)) if n == 1.0));
    }

    #[test]
    fn array_mutation_copies_into_delta_without_touching_base() {
        let base = Value::object();
        continuum_path::set(&base, &Path::from_segments(["items"]), Value::array()).unwrap();
        if let Some(Value::Array(items)) = continuum_path::get(&base, &Path::from_segments(["items"])) {
            items.borrow_mut().push(Value::Number(1.0));
        }
        let tx = tx_over(base.clone());
        tx.push(&Path::from_segments(["items"]), vec![Value::Number(2.0)]).unwrap();
        if let Some(Value::Array(items)) = tx.get(&Path::from_segments(["items"])) {
            assert_eq!(items.borrow().len(), 2);
        } else {
            panic!("expected array");
        }
        if let Some(Value::Array(items)) = continuum_path::get(&base, &Path::from_segments(["items"])) {
            assert_eq!(items.borrow().len(), 1, "base array must be untouched until save");
        }
    }
}
