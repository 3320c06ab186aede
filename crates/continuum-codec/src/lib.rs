#![forbid(unsafe_code)]

//! **continuum-codec** – self-describing JSON encoding/decoding of
//! [`continuum_value::Value`] graphs, with path-based reference resolution
//! standing in for the object-identity preservation a JS `JSON.stringify`
//! replacer/reviver pair gets for free via closures over a `WeakMap` (spec
//! §4.3/§4.4).
//!
//! Two independent axes vary by caller:
//!
//! - *where* cycles are tracked (the whole document for a snapshot, vs. one
//!   event's value scoped against the live memory image) — [`CycleStrategy`].
//! - *where* a `ref` node resolves against (the document itself for a
//!   snapshot, vs. the value being built first and the memory image second
//!   for an event) — implemented as the two public entry points sharing one
//!   two-pass decoder.
//!
//! Decoding is two-pass: [`decode_structural`] builds every non-`ref` node
//! directly and leaves a placeholder plus a recorded [`Patch`] for every
//! `ref` node it meets, then a resolution pass walks the recorded patches and
//! writes the resolved value into the already-built parent in place — safe
//! because composites are `Rc<RefCell<_>>` handles, so patching a slot after
//! the fact never requires rebuilding the surrounding structure.

use std::collections::HashMap;

use continuum_path::Path;
use continuum_value::{
    classify, new_ref, DateValue, FunctionValue, MapKey, NodeId, RegexValue, SetKey, Value,
    ValueCategory,
};
use serde_json::{json, Map as JsonMap, Value as Json};
use thiserror::Error;

/// Errors raised while decoding a document (spec §7).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed snapshot/event document: {0}")]
    SnapshotFormat(String),
    #[error("ref node could not be resolved against either scope: {0:?}")]
    PathResolution(Path),
}

//─────────────────────────────
//  Encoding: cycle strategies
//─────────────────────────────

/// How a composite's repeat appearance during one encode pass is handled:
/// inline it again, or cut the recursion short with a `ref` node.
enum RefDecision {
    Inline,
    Ref(Path),
}

/// Strategy object the recursive encoder consults before descending into a
/// composite. `SnapshotTracker` and `EventValueTracker` are the spec's two
/// named strategies (§4.3); both are driven through this one trait so the
/// encoder itself is written once.
trait CycleStrategy {
    fn check(&mut self, id: NodeId, at: &Path) -> RefDecision;
}

/// Whole-document tracking: a snapshot has one scope, so the first path a
/// node is seen at is canonical and every later appearance becomes an
/// absolute ref to that path.
struct SnapshotTracker {
    seen: HashMap<NodeId, Path>,
}

impl SnapshotTracker {
    fn new() -> Self {
        Self { seen: HashMap::new() }
    }
}

impl CycleStrategy for SnapshotTracker {
    fn check(&mut self, id: NodeId, at: &Path) -> RefDecision {
        if let Some(first) = self.seen.get(&id) {
            return RefDecision::Ref(first.clone());
        }
        self.seen.insert(id, at.clone());
        RefDecision::Inline
    }
}

/// Event-value tracking: only the value actually being assigned is encoded,
/// so a node already living in the memory image outside the subtree being
/// written must be referenced by its absolute image path (rule 1); a node
/// seen earlier in *this* call is referenced relative to the value's own
/// root (rule 2); anything else is encoded inline and recorded (rule 3).
struct EventValueTracker<'a> {
    global_paths: &'a HashMap<NodeId, Path>,
    current_path: Path,
    seen_local: HashMap<NodeId, Path>,
}

impl<'a> EventValueTracker<'a> {
    fn new(global_paths: &'a HashMap<NodeId, Path>, current_path: Path) -> Self {
        Self {
            global_paths,
            current_path,
            seen_local: HashMap::new(),
        }
    }
}

impl<'a> CycleStrategy for EventValueTracker<'a> {
    fn check(&mut self, id: NodeId, at: &Path) -> RefDecision {
        if let Some(absolute) = self.global_paths.get(&id) {
            if !absolute.is_within(&self.current_path) {
                return RefDecision::Ref(absolute.clone());
            }
        }
        if let Some(relative) = self.seen_local.get(&id) {
            return RefDecision::Ref(relative.clone());
        }
        self.seen_local.insert(id, at.clone());
        RefDecision::Inline
    }
}

//─────────────────────────────
//  Encoding
//─────────────────────────────

/// Encode `root` as a whole snapshot document (spec §4.3, C3).
pub fn encode_snapshot(root: &Value) -> Json {
    let mut tracker = SnapshotTracker::new();
    encode_value(root, &Path::root(), &mut tracker).unwrap_or(Json::Null)
}

/// Encode a single event's value, scoped against the live memory image's
/// `target → path` map so cross-references outside the value being written
/// come out as absolute refs and self-references within it come out
/// relative (spec §4.3 rule 1/2).
pub fn encode_event_value(value: &Value, current_path: &Path, global_paths: &HashMap<NodeId, Path>) -> Json {
    let mut tracker = EventValueTracker::new(global_paths, current_path.clone());
    encode_value(value, &Path::root(), &mut tracker).unwrap_or(Json::Null)
}

/// Encode one value. Returns `None` only for an unserialisable `Function`
/// with no captured source — the caller omits that slot entirely rather
/// than writing a node for it (spec §4.3 `Unserialisable`).
fn encode_value(v: &Value, at: &Path, strategy: &mut dyn CycleStrategy) -> Option<Json> {
    if let Some(id) = continuum_value::identity(v) {
        if let RefDecision::Ref(path) = strategy.check(id, at) {
            return Some(ref_node(&path));
        }
    }

    Some(match classify(v).category {
        ValueCategory::Null => Json::Null,
        ValueCategory::Undefined => json!({ "__type__": "undefined" }),
        ValueCategory::Bool => {
            let Value::Bool(b) = v else { unreachable!() };
            Json::Bool(*b)
        }
        ValueCategory::Number => {
            let Value::Number(n) = v else { unreachable!() };
            encode_number(*n)
        }
        ValueCategory::Str => {
            let Value::Str(s) = v else { unreachable!() };
            Json::String(s.clone())
        }
        ValueCategory::BigInt => {
            let Value::BigInt(s) = v else { unreachable!() };
            json!({ "__type__": "bigint", "value": s })
        }
        ValueCategory::Symbol => {
            let Value::Symbol(_, desc) = v else { unreachable!() };
            json!({ "__type__": "symbol", "description": desc })
        }
        ValueCategory::Date => {
            let Value::Date(d) = v else { unreachable!() };
            let d = d.borrow();
            let mut map = JsonMap::new();
            map.insert("__type__".into(), Json::String("date".into()));
            map.insert(
                "__dateValue__".into(),
                match d.timestamp {
                    Some(ts) => Json::String(ts.to_rfc3339()),
                    None => Json::Null,
                },
            );
            for (k, prop) in d.properties.iter() {
                if let Some(encoded) = encode_value(prop, &at.child(k.clone()), strategy) {
                    map.insert(k.clone(), encoded);
                }
            }
            Json::Object(map)
        }
        ValueCategory::Regexp => {
            let Value::Regex(r) = v else { unreachable!() };
            let r = r.borrow();
            json!({
                "__type__": "regexp",
                "source": r.source,
                "flags": r.flags,
                "lastIndex": r.last_index,
            })
        }
        ValueCategory::Function => {
            let Value::Function(f) = v else { unreachable!() };
            match &f.borrow().source_code {
                Some(src) => json!({ "__type__": "function", "sourceCode": src }),
                None => return None,
            }
        }
        ValueCategory::Array => {
            let Value::Array(items) = v else { unreachable!() };
            let items = items.borrow();
            Json::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| encode_value(item, &at.child(i.to_string()), strategy).unwrap_or(Json::Null))
                    .collect(),
            )
        }
        ValueCategory::Map => {
            let Value::Map(entries) = v else { unreachable!() };
            let entries = entries.borrow();
            let pairs: Vec<Json> = entries
                .iter()
                .filter_map(|(k, val)| {
                    let ek = encode_value(&k.0, &at.child("key"), strategy)?;
                    let ev = encode_value(val, &at.child("value"), strategy).unwrap_or(Json::Null);
                    Some(Json::Array(vec![ek, ev]))
                })
                .collect();
            json!({ "__type__": "map", "entries": pairs })
        }
        ValueCategory::Set => {
            let Value::Set(entries) = v else { unreachable!() };
            let entries = entries.borrow();
            let values: Vec<Json> = entries
                .iter()
                .filter_map(|k| encode_value(&k.0, &at.child("value"), strategy))
                .collect();
            json!({ "__type__": "set", "values": values })
        }
        ValueCategory::Object => {
            let Value::Object(fields) = v else { unreachable!() };
            let fields = fields.borrow();
            let mut map = JsonMap::new();
            for (k, val) in fields.iter() {
                if let Some(encoded) = encode_value(val, &at.child(k.clone()), strategy) {
                    map.insert(k.clone(), encoded);
                }
            }
            Json::Object(map)
        }
    })
}

/// Finite numbers pass through as JSON numbers; NaN/±∞ have no JSON
/// representation, so they get the same self-describing tagged form as
/// every other special encoding rather than silently collapsing to `null`
/// (the `Number` invariant in spec §3 requires all three to round-trip).
fn encode_number(n: f64) -> Json {
    if n.is_finite() {
        json!(n)
    } else if n.is_nan() {
        json!({ "__type__": "number", "value": "NaN" })
    } else if n > 0.0 {
        json!({ "__type__": "number", "value": "Infinity" })
    } else {
        json!({ "__type__": "number", "value": "-Infinity" })
    }
}

fn ref_node(path: &Path) -> Json {
    json!({ "__type__": "ref", "path": path.0 })
}

//─────────────────────────────
//  Decoding
//─────────────────────────────

/// Where a still-pending `ref` node must be written back once resolved.
enum PatchKey {
    ArrayIndex(usize),
    ObjectField(String),
    MapEntry(MapKey),
    SetSlot(SetKey),
    DateProperty(String),
}

struct Patch {
    parent: Value,
    key: PatchKey,
    target: Path,
}

fn apply_patch(patch: Patch, resolved: Value) {
    match (&patch.parent, patch.key) {
        (Value::Array(items), PatchKey::ArrayIndex(i)) => items.borrow_mut()[i] = resolved,
        (Value::Object(fields), PatchKey::ObjectField(k)) => {
            fields.borrow_mut().insert(k, resolved);
        }
        (Value::Map(entries), PatchKey::MapEntry(k)) => {
            entries.borrow_mut().insert(k, resolved);
        }
        (Value::Set(entries), PatchKey::SetSlot(placeholder)) => {
            let mut entries = entries.borrow_mut();
            entries.shift_remove(&placeholder);
            entries.insert(SetKey(resolved));
        }
        (Value::Date(d), PatchKey::DateProperty(k)) => {
            d.borrow_mut().properties.insert(k, resolved);
        }
        _ => unreachable!("patch key/parent kind mismatch"),
    }
}

/// Decode a whole snapshot document (spec §4.4, C4). Refs resolve against
/// the document itself — the only scope there is.
pub fn decode_snapshot(doc: &Json) -> Result<Value, CodecError> {
    if let Some(path) = ref_node_path(doc)? {
        return Err(CodecError::SnapshotFormat(format!(
            "document root cannot itself be a bare ref to {path:?}"
        )));
    }
    let mut patches = Vec::new();
    let built = decode_structural(doc, &mut patches)?;
    for patch in patches {
        let resolved = continuum_path::get(&built, &patch.target)
            .ok_or_else(|| CodecError::PathResolution(patch.target.clone()))?;
        apply_patch(patch, resolved);
    }
    Ok(built)
}

/// Decode one event's value. Hierarchical resolution (spec §4.4): a ref
/// first tries the value being built (a self-reference within the same
/// event payload), then falls back to the live memory image.
pub fn decode_event_value(doc: &Json, memory_root: &Value) -> Result<Value, CodecError> {
    if let Some(path) = ref_node_path(doc)? {
        return continuum_path::get(memory_root, &path).ok_or(CodecError::PathResolution(path));
    }
    let mut patches = Vec::new();
    let built = decode_structural(doc, &mut patches)?;
    for patch in patches {
        let resolved = continuum_path::get(&built, &patch.target)
            .or_else(|| continuum_path::get(memory_root, &patch.target))
            .ok_or_else(|| CodecError::PathResolution(patch.target.clone()))?;
        apply_patch(patch, resolved);
    }
    Ok(built)
}

/// If `node` is a `ref` node, its target path; a format error if it claims
/// to be one but is missing/misshapen `path`.
fn ref_node_path(node: &Json) -> Result<Option<Path>, CodecError> {
    let Some(obj) = node.as_object() else { return Ok(None) };
    match obj.get("__type__").and_then(Json::as_str) {
        Some("ref") => {
            let segments = obj
                .get("path")
                .and_then(Json::as_array)
                .ok_or_else(|| CodecError::SnapshotFormat("ref node missing path array".into()))?;
            let segments = segments
                .iter()
                .map(|s| {
                    s.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| CodecError::SnapshotFormat("ref path segment not a string".into()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Some(Path(segments)))
        }
        _ => Ok(None),
    }
}

/// Build the value tree for `node`, never resolving a `ref` child — such a
/// child becomes a placeholder plus a recorded [`Patch`] in `patches`,
/// applied once the structural pass has finished and every node has a
/// stable identity to patch into.
fn decode_structural(node: &Json, patches: &mut Vec<Patch>) -> Result<Value, CodecError> {
    match node {
        Json::Null => Ok(Value::Null),
        Json::Bool(b) => Ok(Value::Bool(*b)),
        Json::Number(n) => Ok(Value::Number(n.as_f64().ok_or_else(|| {
            CodecError::SnapshotFormat(format!("number {n} has no f64 representation"))
        })?)),
        Json::String(s) => Ok(Value::Str(s.clone())),
        Json::Array(items) => {
            let container = new_ref(Vec::with_capacity(items.len()));
            let value = Value::Array(container.clone());
            for (i, item) in items.iter().enumerate() {
                if let Some(path) = ref_node_path(item)? {
                    container.borrow_mut().push(Value::Undefined);
                    patches.push(Patch {
                        parent: value.clone(),
                        key: PatchKey::ArrayIndex(i),
                        target: path,
                    });
                } else {
                    let decoded = decode_structural(item, patches)?;
                    container.borrow_mut().push(decoded);
                }
            }
            Ok(value)
        }
        Json::Object(map) => decode_tagged_object(map, patches),
    }
}

fn decode_tagged_object(map: &JsonMap<String, Json>, patches: &mut Vec<Patch>) -> Result<Value, CodecError> {
    match map.get("__type__").and_then(Json::as_str) {
        None => decode_plain_object(map, patches),
        Some("undefined") => Ok(Value::Undefined),
        Some("number") => decode_tagged_number(map),
        Some("bigint") => {
            let text = require_str(map, "value", "bigint")?;
            Ok(Value::BigInt(text.to_string()))
        }
        Some("symbol") => {
            let description = map
                .get("description")
                .and_then(|d| if d.is_null() { None } else { d.as_str() })
                .map(str::to_string);
            Ok(Value::Symbol(continuum_value::SymbolId::new(), description))
        }
        Some("date") => decode_date(map, patches),
        Some("regexp") => decode_regexp(map),
        Some("function") => {
            let source_code = map.get("sourceCode").and_then(|s| s.as_str()).map(str::to_string);
            Ok(Value::Function(new_ref(FunctionValue { source_code })))
        }
        Some("map") => decode_map(map, patches),
        Some("set") => decode_set(map, patches),
        Some("ref") => Err(CodecError::SnapshotFormat(
            "ref node encountered where a resolved value was expected".into(),
        )),
        Some(other) => Err(CodecError::SnapshotFormat(format!("unknown __type__ tag {other:?}"))),
    }
}

fn decode_tagged_number(map: &JsonMap<String, Json>) -> Result<Value, CodecError> {
    match require_str(map, "value", "number")? {
        "NaN" => Ok(Value::Number(f64::NAN)),
        "Infinity" => Ok(Value::Number(f64::INFINITY)),
        "-Infinity" => Ok(Value::Number(f64::NEG_INFINITY)),
        other => Err(CodecError::SnapshotFormat(format!("unrecognised non-finite number tag {other:?}"))),
    }
}

fn decode_date(map: &JsonMap<String, Json>, patches: &mut Vec<Patch>) -> Result<Value, CodecError> {
    let raw = map
        .get("__dateValue__")
        .ok_or_else(|| CodecError::SnapshotFormat("date node missing __dateValue__".into()))?;
    let timestamp = match raw {
        Json::Null => None,
        Json::String(s) => Some(
            chrono::DateTime::parse_from_rfc3339(s)
                .map_err(|e| CodecError::SnapshotFormat(format!("invalid __dateValue__: {e}")))?
                .with_timezone(&chrono::Utc),
        ),
        _ => return Err(CodecError::SnapshotFormat("__dateValue__ must be a string or null".into())),
    };
    let container = new_ref(DateValue {
        timestamp,
        properties: Default::default(),
    });
    let value = Value::Date(container.clone());
    for (k, v) in map.iter() {
        if k == "__type__" || k == "__dateValue__" {
            continue;
        }
        if let Some(path) = ref_node_path(v)? {
            container.borrow_mut().properties.insert(k.clone(), Value::Undefined);
            patches.push(Patch {
                parent: value.clone(),
                key: PatchKey::DateProperty(k.clone()),
                target: path,
            });
        } else {
            let decoded = decode_structural(v, patches)?;
            container.borrow_mut().properties.insert(k.clone(), decoded);
        }
    }
    Ok(value)
}

fn decode_regexp(map: &JsonMap<String, Json>) -> Result<Value, CodecError> {
    let source = require_str(map, "source", "regexp")?.to_string();
    let flags = require_str(map, "flags", "regexp")?.to_string();
    let last_index = map
        .get("lastIndex")
        .and_then(Json::as_i64)
        .ok_or_else(|| CodecError::SnapshotFormat("regexp node missing integer lastIndex".into()))?;
    Ok(Value::Regex(new_ref(RegexValue {
        source,
        flags,
        last_index,
    })))
}

fn decode_map(map: &JsonMap<String, Json>, patches: &mut Vec<Patch>) -> Result<Value, CodecError> {
    let entries_json = map
        .get("entries")
        .and_then(Json::as_array)
        .ok_or_else(|| CodecError::SnapshotFormat("map node missing entries array".into()))?;
    let container = new_ref(Default::default());
    let value = Value::Map(container.clone());
    for pair in entries_json {
        let pair = pair
            .as_array()
            .filter(|p| p.len() == 2)
            .ok_or_else(|| CodecError::SnapshotFormat("map entry must be a [key, value] pair".into()))?;
        if ref_node_path(&pair[0])?.is_some() {
            return Err(CodecError::SnapshotFormat(
                "a map key cannot itself be a deferred back-reference".into(),
            ));
        }
        let key = MapKey(decode_structural(&pair[0], patches)?);
        if let Some(path) = ref_node_path(&pair[1])? {
            container.borrow_mut().insert(key.clone(), Value::Undefined);
            patches.push(Patch {
                parent: value.clone(),
                key: PatchKey::MapEntry(key),
                target: path,
            });
        } else {
            let decoded = decode_structural(&pair[1], patches)?;
            container.borrow_mut().insert(key, decoded);
        }
    }
    Ok(value)
}

fn decode_set(map: &JsonMap<String, Json>, patches: &mut Vec<Patch>) -> Result<Value, CodecError> {
    let values_json = map
        .get("values")
        .and_then(Json::as_array)
        .ok_or_else(|| CodecError::SnapshotFormat("set node missing values array".into()))?;
    let container = new_ref(Default::default());
    let value = Value::Set(container.clone());
    for item in values_json {
        if let Some(path) = ref_node_path(item)? {
            // A composite member that is itself a back-reference is a rare
            // shape; a unique placeholder object keeps it distinguishable
            // from other pending slots until patched. Patching re-inserts
            // at the end, so relative order among such slots isn't
            // preserved — acceptable for this edge case.
            let placeholder = SetKey(Value::object());
            container.borrow_mut().insert(placeholder.clone());
            patches.push(Patch {
                parent: value.clone(),
                key: PatchKey::SetSlot(placeholder),
                target: path,
            });
        } else {
            let decoded = decode_structural(item, patches)?;
            container.borrow_mut().insert(SetKey(decoded));
        }
    }
    Ok(value)
}

fn decode_plain_object(map: &JsonMap<String, Json>, patches: &mut Vec<Patch>) -> Result<Value, CodecError> {
    let container = new_ref(Default::default());
    let value = Value::Object(container.clone());
    for (k, v) in map.iter() {
        if let Some(path) = ref_node_path(v)? {
            container.borrow_mut().insert(k.clone(), Value::Undefined);
            patches.push(Patch {
                parent: value.clone(),
                key: PatchKey::ObjectField(k.clone()),
                target: path,
            });
        } else {
            let decoded = decode_structural(v, patches)?;
            container.borrow_mut().insert(k.clone(), decoded);
        }
    }
    Ok(value)
}

fn require_str<'a>(map: &'a JsonMap<String, Json>, key: &str, tag: &str) -> Result<&'a str, CodecError> {
    map.get(key)
        .and_then(Json::as_str)
        .ok_or_else(|| CodecError::SnapshotFormat(format!("{tag} node missing string field {key:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use continuum_value::new_ref as vref;

    #[test]
    fn primitives_round_trip_through_snapshot() {
        let root = Value::object();
        if let Value::Object(fields) = &root {
            let mut fields = fields.borrow_mut();
            fields.insert("n".into(), Value::Number(42.0));
            fields.insert("nan".into(), Value::Number(f64::NAN));
            fields.insert("inf".into(), Value::Number(f64::INFINITY));
            fields.insert("s".into(), Value::Str("hi".into()));
            fields.insert("u".into(), Value::Undefined);
            fields.insert("big".into(), Value::BigInt("12345678901234567890".into()));
        }
        let doc = encode_snapshot(&root);
        let decoded = decode_snapshot(&doc).unwrap();
        assert!(continuum_value::structural_eq(&root, &decoded));
    }

    #[test]
    fn self_cycle_round_trips_through_snapshot() {
        let root = Value::object();
        if let Value::Object(fields) = &root {
            fields.borrow_mut().insert("self".into(), root.clone());
        }
        let doc = encode_snapshot(&root);
        assert_eq!(doc["self"]["__type__"], json!("ref"));
        let decoded = decode_snapshot(&doc).unwrap();
        if let Value::Object(fields) = &decoded {
            let back = fields.borrow().get("self").cloned().unwrap();
            assert_eq!(continuum_value::identity(&back), continuum_value::identity(&decoded));
        } else {
            panic!("expected object");
        }
    }

    #[test]
    fn shared_reference_is_deduplicated_not_duplicated() {
        let shared = Value::object();
        let root = Value::object();
        if let Value::Object(fields) = &root {
            fields.borrow_mut().insert("a".into(), shared.clone());
            fields.borrow_mut().insert("b".into(), shared.clone());
        }
        let doc = encode_snapshot(&root);
        let decoded = decode_snapshot(&doc).unwrap();
        if let Value::Object(fields) = &decoded {
            let fields = fields.borrow();
            let a = fields.get("a").unwrap();
            let b = fields.get("b").unwrap();
            assert_eq!(continuum_value::identity(a), continuum_value::identity(b));
        }
    }

    #[test]
    fn date_properties_survive_round_trip() {
        let date = Value::Date(vref(DateValue::valid(chrono::Utc::now())));
        if let Value::Date(d) = &date {
            d.borrow_mut().properties.insert("note".into(), Value::Str("x".into()));
        }
        let doc = encode_snapshot(&date);
        let decoded = decode_snapshot(&doc).unwrap();
        assert!(continuum_value::structural_eq(&date, &decoded));
    }

    #[test]
    fn unserialisable_function_slot_is_omitted() {
        let root = Value::object();
        if let Value::Object(fields) = &root {
            fields
                .borrow_mut()
                .insert("f".into(), Value::Function(vref(FunctionValue { source_code: None })));
        }
        let doc = encode_snapshot(&root);
        assert!(doc.as_object().unwrap().get("f").is_none());
    }

    #[test]
    fn event_value_refs_outside_subtree_are_absolute() {
        let memory_root = Value::object();
        let shared = Value::object();
        if let Value::Object(fields) = &memory_root {
            fields.borrow_mut().insert("shared".into(), shared.clone());
        }
        let mut global_paths = HashMap::new();
        global_paths.insert(continuum_value::identity(&shared).unwrap(), Path::from_segments(["shared"]));

        let payload = Value::object();
        if let Value::Object(fields) = &payload {
            fields.borrow_mut().insert("ref_to_shared".into(), shared.clone());
        }
        let current_path = Path::from_segments(["nested"]);
        let doc = encode_event_value(&payload, &current_path, &global_paths);
        assert_eq!(doc["ref_to_shared"]["path"], json!(["shared"]));

        let decoded = decode_event_value(&doc, &memory_root).unwrap();
        if let Value::Object(fields) = &decoded {
            let back = fields.borrow().get("ref_to_shared").cloned().unwrap();
            assert_eq!(continuum_value::identity(&back), continuum_value::identity(&shared));
        }
    }

    #[test]
    fn malformed_ref_path_is_a_format_error() {
        let doc = json!({ "a": { "__type__": "ref" } });
        assert!(matches!(decode_snapshot(&doc), Err(CodecError::SnapshotFormat(_))));
    }

    #[test]
    fn missing_path_resolution_is_reported() {
        let doc = json!({ "a": { "__type__": "ref", "path": ["nope"] } });
        assert!(matches!(decode_snapshot(&doc), Err(CodecError::PathResolution(_))));
    }

    proptest::proptest! {
        #[test]
        fn array_of_numbers_round_trips(values in proptest::collection::vec(-1000.0f64..1000.0, 0..20)) {
            let root = Value::Array(vref(values.iter().map(|n| Value::Number(*n)).collect()));
            let doc = encode_snapshot(&root);
            let decoded = decode_snapshot(&doc).unwrap();
            proptest::prop_assert!(continuum_value::structural_eq(&root, &decoded));
        }
    }
}
