#![forbid(unsafe_code)]

//! **continuum-event** – the closed mutation event taxonomy (spec §4.5),
//! collection-strategy descriptors (§4.6), and the apply half of event
//! dispatch consumed by `continuum-replay` and `continuum-tx`. The *build*
//! half (constructing an `Event` from a live mutation) belongs to whichever
//! layer observes the mutation — `continuum-proxy` for live interception,
//! `continuum-tx` for transaction saves — since Rust's enum exhaustiveness
//! already gives the "closed taxonomy" guarantee at compile time; only
//! *apply* needs a runtime registry, because it dispatches on a tag that
//! arrived over the wire and may not be one of the eighteen.

use continuum_codec::CodecError;
use continuum_path::{Path, PathError};
use continuum_value::{MapKey, SetKey, Value};
use serde_json::Value as Json;
use std::collections::HashMap;
use thiserror::Error;

/// One entry in the closed mutation taxonomy (spec §4.5). Payloads that
/// carry a `Value` travel as `serde_json::Value` — the event-mode encoding
/// produced by `continuum-codec` — since an `Event` must be able to survive
/// a trip through an `EventLog` backend.
#[derive(Debug, Clone)]
pub enum EventKind {
    Set { value: Json },
    Delete,
    ArrayPush { items: Vec<Json> },
    ArrayPop,
    ArrayShift,
    ArrayUnshift { items: Vec<Json> },
    ArraySplice { start: i64, delete_count: i64, items: Vec<Json> },
    ArraySort,
    ArrayReverse,
    ArrayFill { value: Json, start: i64, end: i64 },
    ArrayCopyWithin { target: i64, start: i64, end: i64 },
    MapSet { key: Json, value: Json },
    MapDelete { key: Json },
    MapClear,
    SetAdd { value: Json },
    SetDelete { value: Json },
    SetClear,
    Script { source: String },
}

impl EventKind {
    /// Wire tag name, used as the `type` field of the NDJSON event stream
    /// (spec §6) and as the `HandlerRegistry` lookup key.
    pub fn tag_name(&self) -> &'static str {
        match self {
            EventKind::Set { .. } => "SET",
            EventKind::Delete => "DELETE",
            EventKind::ArrayPush { .. } => "ARRAY_PUSH",
            EventKind::ArrayPop => "ARRAY_POP",
            EventKind::ArrayShift => "ARRAY_SHIFT",
            EventKind::ArrayUnshift { .. } => "ARRAY_UNSHIFT",
            EventKind::ArraySplice { .. } => "ARRAY_SPLICE",
            EventKind::ArraySort => "ARRAY_SORT",
            EventKind::ArrayReverse => "ARRAY_REVERSE",
            EventKind::ArrayFill { .. } => "ARRAY_FILL",
            EventKind::ArrayCopyWithin { .. } => "ARRAY_COPYWITHIN",
            EventKind::MapSet { .. } => "MAP_SET",
            EventKind::MapDelete { .. } => "MAP_DELETE",
            EventKind::MapClear => "MAP_CLEAR",
            EventKind::SetAdd { .. } => "SET_ADD",
            EventKind::SetDelete { .. } => "SET_DELETE",
            EventKind::SetClear => "SET_CLEAR",
            EventKind::Script { .. } => "SCRIPT",
        }
    }

    /// All eighteen tags, for validating that a `HandlerRegistry` is
    /// complete (spec §4.5: "populated ... with exactly these 18 entries").
    pub const ALL_TAGS: [&'static str; 18] = [
        "SET",
        "DELETE",
        "ARRAY_PUSH",
        "ARRAY_POP",
        "ARRAY_SHIFT",
        "ARRAY_UNSHIFT",
        "ARRAY_SPLICE",
        "ARRAY_SORT",
        "ARRAY_REVERSE",
        "ARRAY_FILL",
        "ARRAY_COPYWITHIN",
        "MAP_SET",
        "MAP_DELETE",
        "MAP_CLEAR",
        "SET_ADD",
        "SET_DELETE",
        "SET_CLEAR",
        "SCRIPT",
    ];
}

/// A complete mutation record: tag-specific payload, the path to the object
/// being mutated (the parent for a property write, the collection itself
/// for a collection method), and a best-effort wall-clock timestamp.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub path: Path,
    pub timestamp_ms: u64,
}

impl Event {
    pub fn new(kind: EventKind, path: Path, timestamp_ms: u64) -> Self {
        Self { kind, path, timestamp_ms }
    }
}

/// Errors raised applying an event during replay or transaction save.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("unknown event type: {0:?}")]
    UnknownEventType(String),
    #[error("expected a composite value at {0:?} for this collection operation")]
    NotComposite(Path),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Dispatch table populated at construction with exactly the eighteen
/// handlers named in spec §4.5; an attempt to apply a tag outside that set
/// is a fatal configuration error (`UnknownEventType`), never a silent
/// no-op.
type Handler = fn(&Event, &Value) -> Result<(), EventError>;

pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Handler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        let mut handlers: HashMap<&'static str, Handler> = HashMap::new();
        handlers.insert("SET", apply_set);
        handlers.insert("DELETE", apply_delete);
        handlers.insert("ARRAY_PUSH", apply_array_push);
        handlers.insert("ARRAY_POP", apply_array_pop);
        handlers.insert("ARRAY_SHIFT", apply_array_shift);
        handlers.insert("ARRAY_UNSHIFT", apply_array_unshift);
        handlers.insert("ARRAY_SPLICE", apply_array_splice);
        handlers.insert("ARRAY_SORT", apply_array_sort);
        handlers.insert("ARRAY_REVERSE", apply_array_reverse);
        handlers.insert("ARRAY_FILL", apply_array_fill);
        handlers.insert("ARRAY_COPYWITHIN", apply_array_copy_within);
        handlers.insert("MAP_SET", apply_map_set);
        handlers.insert("MAP_DELETE", apply_map_delete);
        handlers.insert("MAP_CLEAR", apply_map_clear);
        handlers.insert("SET_ADD", apply_set_add);
        handlers.insert("SET_DELETE", apply_set_delete);
        handlers.insert("SET_CLEAR", apply_set_clear);
        handlers.insert("SCRIPT", apply_script);
        debug_assert_eq!(handlers.len(), EventKind::ALL_TAGS.len());
        Self { handlers }
    }

    /// Apply `event`'s mutation to `root`, navigating via `continuum-path`.
    pub fn apply(&self, event: &Event, root: &Value) -> Result<(), EventError> {
        let handler = self
            .handlers
            .get(event.kind.tag_name())
            .ok_or_else(|| EventError::UnknownEventType(event.kind.tag_name().to_string()))?;
        handler(event, root)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

//─────────────────────────────
//  Per-tag apply handlers
//─────────────────────────────

fn apply_set(event: &Event, root: &Value) -> Result<(), EventError> {
    let EventKind::Set { value } = &event.kind else { unreachable!() };
    let decoded = continuum_codec::decode_event_value(value, root)?;
    // `continuum_path::set` already dispatches Map-parent writes through
    // `IndexMap::insert` rather than object field assignment (spec §4.5:
    // "SET on a Map parent uses Map .set rather than bracket assignment" —
    // the distinction lives in `continuum-path::write_final`, not here).
    continuum_path::set(root, &event.path, decoded)?;
    Ok(())
}

fn apply_delete(event: &Event, root: &Value) -> Result<(), EventError> {
    continuum_path::delete(root, &event.path)?;
    Ok(())
}

fn target_array(root: &Value, path: &Path) -> Result<continuum_value::Ref<Vec<Value>>, EventError> {
    match continuum_path::get(root, path) {
        Some(Value::Array(items)) => Ok(items),
        _ => Err(EventError::NotComposite(path.clone())),
    }
}

fn target_map(root: &Value, path: &Path) -> Result<continuum_value::Ref<indexmap::IndexMap<MapKey, Value>>, EventError> {
    match continuum_path::get(root, path) {
        Some(Value::Map(entries)) => Ok(entries),
        _ => Err(EventError::NotComposite(path.clone())),
    }
}

fn target_set(root: &Value, path: &Path) -> Result<continuum_value::Ref<indexmap::IndexSet<SetKey>>, EventError> {
    match continuum_path::get(root, path) {
        Some(Value::Set(entries)) => Ok(entries),
        _ => Err(EventError::NotComposite(path.clone())),
    }
}

fn decode_items(items: &[Json], root: &Value) -> Result<Vec<Value>, EventError> {
    items
        .iter()
        .map(|j| continuum_codec::decode_event_value(j, root).map_err(EventError::from))
        .collect()
}

/// Clamp a JS-style (possibly negative, possibly out-of-range) index to
/// `0..=len`, counting from the end when negative — the same normalisation
/// `ARRAY_SPLICE`/`ARRAY_FILL`/`ARRAY_COPYWITHIN` need at replay time.
fn normalize_index(i: i64, len: usize) -> usize {
    if i < 0 {
        (len as i64 + i).max(0) as usize
    } else {
        (i as usize).min(len)
    }
}

fn apply_array_push(event: &Event, root: &Value) -> Result<(), EventError> {
    let EventKind::ArrayPush { items } = &event.kind else { unreachable!() };
    let array = target_array(root, &event.path)?;
    let decoded = decode_items(items, root)?;
    array.borrow_mut().extend(decoded);
    Ok(())
}

fn apply_array_pop(event: &Event, root: &Value) -> Result<(), EventError> {
    let array = target_array(root, &event.path)?;
    array.borrow_mut().pop();
    Ok(())
}

fn apply_array_shift(event: &Event, root: &Value) -> Result<(), EventError> {
    let array = target_array(root, &event.path)?;
    let mut array = array.borrow_mut();
    if !array.is_empty() {
        array.remove(0);
    }
    Ok(())
}

fn apply_array_unshift(event: &Event, root: &Value) -> Result<(), EventError> {
    let EventKind::ArrayUnshift { items } = &event.kind else { unreachable!() };
    let array = target_array(root, &event.path)?;
    let decoded = decode_items(items, root)?;
    array.borrow_mut().splice(0..0, decoded);
    Ok(())
}

fn apply_array_splice(event: &Event, root: &Value) -> Result<(), EventError> {
    let EventKind::ArraySplice { start, delete_count, items } = &event.kind else { unreachable!() };
    let array = target_array(root, &event.path)?;
    let decoded = decode_items(items, root)?;
    let mut array = array.borrow_mut();
    let len = array.len();
    let start = normalize_index(*start, len);
    // a negative deleteCount behaves as 0 (spec §4.5 ordering/tie-break note).
    let delete_count = (*delete_count).max(0) as usize;
    let end = (start + delete_count).min(len);
    array.splice(start..end, decoded);
    Ok(())
}

fn apply_array_sort(event: &Event, root: &Value) -> Result<(), EventError> {
    let array = target_array(root, &event.path)?;
    // No custom comparator is ever captured (spec §4.5: "not serialisable");
    // replay always uses this canonical string-based ordering.
    array.borrow_mut().sort_by_key(value_sort_key);
    Ok(())
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

fn apply_array_reverse(event: &Event, root: &Value) -> Result<(), EventError> {
    let array = target_array(root, &event.path)?;
    array.borrow_mut().reverse();
    Ok(())
}

fn apply_array_fill(event: &Event, root: &Value) -> Result<(), EventError> {
    let EventKind::ArrayFill { value, start, end } = &event.kind else { unreachable!() };
    let array = target_array(root, &event.path)?;
    let decoded = continuum_codec::decode_event_value(value, root)?;
    let mut array = array.borrow_mut();
    let len = array.len();
    let start = normalize_index(*start, len);
    let end = normalize_index(*end, len);
    for slot in array.iter_mut().take(end).skip(start) {
        *slot = decoded.clone();
    }
    Ok(())
}

fn apply_array_copy_within(event: &Event, root: &Value) -> Result<(), EventError> {
    let EventKind::ArrayCopyWithin { target, start, end } = &event.kind else { unreachable!() };
    let array = target_array(root, &event.path)?;
    let mut array = array.borrow_mut();
    let len = array.len();
    let target = normalize_index(*target, len);
    let start = normalize_index(*start, len);
    let end = normalize_index(*end, len);
    if start >= end {
        return Ok(());
    }
    let block: Vec<Value> = array[start..end].to_vec();
    let copy_len = block.len().min(len - target);
    array[target..target + copy_len].clone_from_slice(&block[..copy_len]);
    Ok(())
}

fn apply_map_set(event: &Event, root: &Value) -> Result<(), EventError> {
    let EventKind::MapSet { key, value } = &event.kind else { unreachable!() };
    let map = target_map(root, &event.path)?;
    let key = continuum_codec::decode_event_value(key, root)?;
    let value = continuum_codec::decode_event_value(value, root)?;
    map.borrow_mut().insert(MapKey(key), value);
    Ok(())
}

fn apply_map_delete(event: &Event, root: &Value) -> Result<(), EventError> {
    let EventKind::MapDelete { key } = &event.kind else { unreachable!() };
    let map = target_map(root, &event.path)?;
    let key = continuum_codec::decode_event_value(key, root)?;
    map.borrow_mut().shift_remove(&MapKey(key));
    Ok(())
}

fn apply_map_clear(event: &Event, root: &Value) -> Result<(), EventError> {
    let map = target_map(root, &event.path)?;
    map.borrow_mut().clear();
    Ok(())
}

fn apply_set_add(event: &Event, root: &Value) -> Result<(), EventError> {
    let EventKind::SetAdd { value } = &event.kind else { unreachable!() };
    let set = target_set(root, &event.path)?;
    let value = continuum_codec::decode_event_value(value, root)?;
    set.borrow_mut().insert(SetKey(value));
    Ok(())
}

fn apply_set_delete(event: &Event, root: &Value) -> Result<(), EventError> {
    let EventKind::SetDelete { value } = &event.kind else { unreachable!() };
    let set = target_set(root, &event.path)?;
    let value = continuum_codec::decode_event_value(value, root)?;
    set.borrow_mut().shift_remove(&SetKey(value));
    Ok(())
}

fn apply_set_clear(event: &Event, root: &Value) -> Result<(), EventError> {
    let set = target_set(root, &event.path)?;
    set.borrow_mut().clear();
    Ok(())
}

/// `SCRIPT` is a pure audit marker (Open Question #2): apply only validates
/// that the path still resolves, and never re-runs captured source.
fn apply_script(event: &Event, root: &Value) -> Result<(), EventError> {
    if !event.path.is_root() && continuum_path::get(root, &event.path).is_none() {
        return Err(EventError::Path(PathError::NotFound(event.path.clone())));
    }
    Ok(())
}

//─────────────────────────────
//  Collection strategy (C6)
//─────────────────────────────

/// The three collection strategies selected by runtime class (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    Sequence,
    KeyedMap,
    Set,
}

impl CollectionKind {
    pub fn for_value(v: &Value) -> Option<CollectionKind> {
        match v {
            Value::Array(_) => Some(CollectionKind::Sequence),
            Value::Map(_) => Some(CollectionKind::KeyedMap),
            Value::Set(_) => Some(CollectionKind::Set),
            _ => None,
        }
    }

    /// The method names that mutate this collection kind and therefore
    /// require C6's wrap-and-emit treatment rather than passing through.
    pub const fn mutating_ops(self) -> &'static [&'static str] {
        match self {
            CollectionKind::Sequence => &[
                "push", "pop", "shift", "unshift", "splice", "sort", "reverse", "fill", "copyWithin",
            ],
            CollectionKind::KeyedMap => &["set", "delete", "clear"],
            CollectionKind::Set => &["add", "delete", "clear"],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use continuum_value::new_ref as vref;

    fn ts() -> u64 {
        0
    }

    #[test]
    fn registry_has_exactly_eighteen_tags() {
        let registry = HandlerRegistry::new();
        assert_eq!(registry.handlers.len(), 18);
        for tag in EventKind::ALL_TAGS {
            assert!(registry.handlers.contains_key(tag));
        }
    }

    #[test]
    fn unknown_tag_lookup_is_fatal() {
        let registry = HandlerRegistry::new();
        assert!(!registry.handlers.contains_key("NOT_A_TAG"));
    }

    #[test]
    fn set_event_writes_through_object_and_map_parents() {
        let registry = HandlerRegistry::new();
        let root = Value::object();
        let event = Event::new(
            EventKind::Set { value: serde_json::json!(42.0) },
            Path::from_segments(["count"]),
            ts(),
        );
        registry.apply(&event, &root).unwrap();
        assert!(matches!(continuum_path::get(&root, &Path::from_segments(["count"])), Some(Value::Number(n)) if n == 42.0));

        let map_root = Value::Map(vref(Default::default()));
        let map_event = Event::new(
            EventKind::Set { value: serde_json::json!("v") },
            Path::from_segments(["k"]),
            ts(),
        );
        registry.apply(&map_event, &map_root).unwrap();
        if let Value::Map(entries) = &map_root {
            assert!(entries.borrow().contains_key(&MapKey(Value::Str("k".into()))));
        }
    }

    #[test]
    fn array_push_then_splice_then_sort() {
        let registry = HandlerRegistry::new();
        let root = Value::object();
        continuum_path::set(&root, &Path::from_segments(["items"]), Value::array()).unwrap();
        let push = Event::new(
            EventKind::ArrayPush { items: vec![serde_json::json!(3.0), serde_json::json!(1.0), serde_json::json!(2.0)] },
            Path::from_segments(["items"]),
            ts(),
        );
        registry.apply(&push, &root).unwrap();
        let sort = Event::new(EventKind::ArraySort, Path::from_segments(["items"]), ts());
        registry.apply(&sort, &root).unwrap();
        if let Some(Value::Array(items)) = continuum_path::get(&root, &Path::from_segments(["items"])) {
            let nums: Vec<f64> = items.borrow().iter().map(|v| if let Value::Number(n) = v { *n } else { panic!() }).collect();
            assert_eq!(nums, vec![1.0, 2.0, 3.0]);
        } else {
            panic!("expected array");
        }
    }

    #[test]
    fn array_splice_clamps_negative_delete_count() {
        let registry = HandlerRegistry::new();
        let root = Value::object();
        continuum_path::set(&root, &Path::from_segments(["items"]), Value::array()).unwrap();
        let push = Event::new(
            EventKind::ArrayPush { items: vec![serde_json::json!(1.0), serde_json::json!(2.0)] },
            Path::from_segments(["items"]),
            ts(),
        );
        registry.apply(&push, &root).unwrap();
        let splice = Event::new(
            EventKind::ArraySplice { start: 0, delete_count: -5, items: vec![] },
            Path::from_segments(["items"]),
            ts(),
        );
        registry.apply(&splice, &root).unwrap();
        if let Some(Value::Array(items)) = continuum_path::get(&root, &Path::from_segments(["items"])) {
            assert_eq!(items.borrow().len(), 2);
        }
    }

    #[test]
    fn map_set_and_delete_round_trip() {
        let registry = HandlerRegistry::new();
        let root = Value::object();
        continuum_path::set(&root, &Path::from_segments(["m"]), Value::Map(vref(Default::default()))).unwrap();
        let set_event = Event::new(
            EventKind::MapSet { key: serde_json::json!("k"), value: serde_json::json!(1.0) },
            Path::from_segments(["m"]),
            ts(),
        );
        registry.apply(&set_event, &root).unwrap();
        let delete_event = Event::new(EventKind::MapDelete { key: serde_json::json!("k") }, Path::from_segments(["m"]), ts());
        registry.apply(&delete_event, &root).unwrap();
        if let Some(Value::Map(entries)) = continuum_path::get(&root, &Path::from_segments(["m"])) {
            assert!(entries.borrow().is_empty());
        }
    }

    #[test]
    fn script_event_validates_path_but_changes_nothing() {
        let registry = HandlerRegistry::new();
        let root = Value::object();
        let ok = Event::new(EventKind::Script { source: "x".into() }, Path::root(), ts());
        registry.apply(&ok, &root).unwrap();

        let missing = Event::new(EventKind::Script { source: "x".into() }, Path::from_segments(["nope"]), ts());
        assert!(registry.apply(&missing, &root).is_err());
    }
}
