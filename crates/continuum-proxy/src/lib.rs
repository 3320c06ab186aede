#![forbid(unsafe_code)]

//! **continuum-proxy** – the interception layer and proxy identity
//! infrastructure (spec §4.7/§4.8, C7/C8).
//!
//! Per SPEC_FULL §6, this is the one component that cannot be transliterated
//! directly: there is no Proxy trap and no weak map in safe Rust. The
//! realisation here leans on what `continuum-value::Value` already gives us
//! for free — every composite is an `Rc<RefCell<_>>` handle, so its stable
//! `NodeId` (`continuum_value::identity`) already plays the role the
//! spec's `target→facade`/`facade→target` weak maps exist to provide.
//! That collapses the three-map design in §4.8 to the one map that carries
//! genuinely new information: `target → path`.
//!
//! [`Facade`] is the façade handle: it owns a clone of the underlying
//! `Value` (an `Rc` clone, cheap, shares identity) plus its own path and a
//! handle to the shared [`ProxyInfra`]. Mutating methods perform the native
//! mutation by building a [`continuum_event::Event`] and dispatching it
//! through the same `HandlerRegistry` the replay engine uses (C5), then —
//! unless `is_replaying` is set — append the identical event through the
//! `EventLog` (C9). Driving both the live mutation and the logged event off
//! one dispatch keeps live application and replay bit-for-bit identical.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use continuum_event::{Event, EventError, EventKind, HandlerRegistry};
use continuum_path::Path;
use continuum_store_core::{EventLog, LogError};
use continuum_value::{classify, identity, NodeId, Value, ValueCategory};
use serde_json::Value as Json;
use thiserror::Error;

/// Errors raised while intercepting a mutation (spec §7).
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Event(#[from] EventError),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error("cannot mutate a non-composite value at {0:?}")]
    NotComposite(Path),
}

/// The shared infrastructure backing every façade over one root (spec §4.8).
/// `target_to_path` is the one map the Rust realisation still needs —
/// `identity()` already gives every composite a stable key, so there is
/// nothing left for `facade→target`/`target→facade` to carry.
pub struct ProxyInfra {
    root: Value,
    target_to_path: Mutex<HashMap<NodeId, Path>>,
    is_replaying: AtomicBool,
    log: Arc<dyn EventLog>,
    registry: HandlerRegistry,
}

impl ProxyInfra {
    /// Build the infrastructure for `root` and its matching root façade,
    /// registering the root's own identity at [`Path::root`].
    pub fn new(root: Value, log: Arc<dyn EventLog>) -> (Arc<ProxyInfra>, Facade) {
        // `ProxyInfra` carries an `Rc`-based `Value` graph, so it is
        // deliberately confined to one thread (spec values never cross
        // threads); `Arc` here is only for cheap shared ownership across
        // `Facade` clones, not cross-thread sharing.
        #[allow(clippy::arc_with_non_send_sync)]
        let infra = Arc::new(ProxyInfra {
            root: root.clone(),
            target_to_path: Mutex::new(HashMap::new()),
            is_replaying: AtomicBool::new(false),
            log,
            registry: HandlerRegistry::new(),
        });
        let facade = Facade::wrap(root, Path::root(), infra.clone());
        (infra, facade)
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    pub fn is_replaying(&self) -> bool {
        self.is_replaying.load(Ordering::SeqCst)
    }

    /// Set by the replay engine (C10) for the duration of a replay so
    /// mutations it applies do not re-emit (spec §4.10 "non-re-emission").
    pub fn set_replaying(&self, replaying: bool) {
        self.is_replaying.store(replaying, Ordering::SeqCst);
    }

    pub fn path_of(&self, id: NodeId) -> Option<Path> {
        self.target_to_path.lock().unwrap().get(&id).cloned()
    }

    /// Dispatch a raw, already-recorded event straight through C5's
    /// registry with no re-encoding and no re-logging — the replay engine's
    /// sole hook into the infrastructure (spec §4.10).
    pub fn apply_event(&self, event: &Event) -> Result<(), EventError> {
        self.registry.apply(event, &self.root)
    }

    /// Path uniqueness at first sight (spec §3): never overwrite an
    /// already-registered node's path.
    fn register_path(&self, id: NodeId, path: Path) {
        self.target_to_path.lock().unwrap().entry(id).or_insert(path);
    }

    fn global_paths_snapshot(&self) -> HashMap<NodeId, Path> {
        self.target_to_path.lock().unwrap().clone()
    }
}

/// A façade over one composite value. Cloning never clones the underlying
/// `Value` — the clone is an `Rc` clone of the same allocation plus a
/// cheap `Arc` clone of the shared infra, so two façades with the same
/// `NodeId` are, for every observable purpose, the same façade.
#[derive(Clone)]
pub struct Facade {
    infra: Arc<ProxyInfra>,
    value: Value,
    path: Path,
}

impl Facade {
    /// Wrap `value` at `path`, registering its identity *before* recursing
    /// into children — the critical wrapping-order invariant (spec §4.7)
    /// that makes cyclic graphs terminate instead of diverging. Primitives
    /// are returned unwrapped (§4.7: "primitives ... are not wrapped").
    pub fn wrap(value: Value, path: Path, infra: Arc<ProxyInfra>) -> Facade {
        if let Some(id) = identity(&value) {
            if infra.path_of(id).is_none() {
                infra.register_path(id, path.clone());
                wrap_children(&value, &path, &infra);
            }
        }
        Facade { infra, value, path }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn infra(&self) -> &Arc<ProxyInfra> {
        &self.infra
    }

    fn encode(&self, v: &Value, at: &Path) -> Json {
        continuum_codec::encode_event_value(v, at, &self.infra.global_paths_snapshot())
    }

    /// Dispatch through C5's registry (native mutation on `infra.root`)
    /// then, unless replaying, append the identical event (spec §4.7 get/set
    /// traps, §4.10 non-re-emission).
    async fn emit(&self, kind: EventKind, target_path: Path) -> Result<(), ProxyError> {
        let event = Event::new(kind, target_path, now_ms());
        self.infra.registry.apply(&event, self.infra.root())?;
        if !self.infra.is_replaying() {
            self.infra.log.append(event).await?;
        }
        Ok(())
    }

    //── get / set / delete traps (§4.7) ──────────────────────────────

    /// Read a field/index/key and, if the result is composite, wrap it —
    /// recording its path on first sight.
    pub fn get(&self, key: &str) -> Option<Facade> {
        let child_path = self.path.child(key);
        let child = continuum_path::get(&self.value, &Path::from_segments([key]))?;
        Some(Facade::wrap(child, child_path, self.infra.clone()))
    }

    /// Build the child path, recursively wrap the incoming value (so any
    /// nested composites are tracked), write it, and — unless replaying —
    /// emit a `SET` with event-mode serialisation (spec §4.7).
    pub async fn set(&self, key: &str, new_value: Value) -> Result<(), ProxyError> {
        let child_path = self.path.child(key);
        Facade::wrap(new_value.clone(), child_path.clone(), self.infra.clone());
        let encoded = self.encode(&new_value, &child_path);
        self.emit(EventKind::Set { value: encoded }, child_path).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), ProxyError> {
        self.emit(EventKind::Delete, self.path.child(key)).await
    }

    //── Date/Regex intrinsic setters (SPEC_FULL §6) ──────────────────

    /// `Date` setter methods (`setTime`, `setFullYear`, ...) still need to
    /// produce a `SET` event for replay to round-trip; the concrete
    /// auxiliary property chosen is `time` (spec §4.7).
    pub async fn date_set_time(&self, millis: f64) -> Result<(), ProxyError> {
        self.set("time", Value::Number(millis)).await
    }

    /// Regex cursor advance is logged against the auxiliary `lastIndex`
    /// property (spec §4.7).
    pub async fn regex_advance(&self, last_index: i64) -> Result<(), ProxyError> {
        self.set("lastIndex", Value::Number(last_index as f64)).await
    }

    //── Array mutating methods (C6 Sequence strategy) ────────────────

    fn array_len(&self) -> Result<usize, ProxyError> {
        match &self.value {
            Value::Array(items) => Ok(items.borrow().len()),
            _ => Err(ProxyError::NotComposite(self.path.clone())),
        }
    }

    fn encode_items_at(&self, items: &[Value], base_index: usize) -> Vec<Json> {
        items
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let at = self.path.child((base_index + i).to_string());
                Facade::wrap(v.clone(), at.clone(), self.infra.clone());
                self.encode(v, &at)
            })
            .collect()
    }

    pub async fn push(&self, items: Vec<Value>) -> Result<(), ProxyError> {
        let base = self.array_len()?;
        let encoded = self.encode_items_at(&items, base);
        self.emit(EventKind::ArrayPush { items: encoded }, self.path.clone()).await
    }

    pub async fn pop(&self) -> Result<(), ProxyError> {
        self.emit(EventKind::ArrayPop, self.path.clone()).await
    }

    pub async fn shift(&self) -> Result<(), ProxyError> {
        self.emit(EventKind::ArrayShift, self.path.clone()).await
    }

    pub async fn unshift(&self, items: Vec<Value>) -> Result<(), ProxyError> {
        let encoded = self.encode_items_at(&items, 0);
        self.emit(EventKind::ArrayUnshift { items: encoded }, self.path.clone()).await
    }

    pub async fn splice(&self, start: i64, delete_count: i64, items: Vec<Value>) -> Result<(), ProxyError> {
        let len = self.array_len()?;
        let base = normalize_index(start, len);
        let encoded = self.encode_items_at(&items, base);
        self.emit(
            EventKind::ArraySplice { start, delete_count, items: encoded },
            self.path.clone(),
        )
        .await
    }

    pub async fn sort(&self) -> Result<(), ProxyError> {
        self.emit(EventKind::ArraySort, self.path.clone()).await
    }

    pub async fn reverse(&self) -> Result<(), ProxyError> {
        self.emit(EventKind::ArrayReverse, self.path.clone()).await
    }

    pub async fn fill(&self, value: Value, start: i64, end: i64) -> Result<(), ProxyError> {
        let at = self.path.child(start.max(0).to_string());
        Facade::wrap(value.clone(), at.clone(), self.infra.clone());
        let encoded = self.encode(&value, &at);
        self.emit(EventKind::ArrayFill { value: encoded, start, end }, self.path.clone()).await
    }

    pub async fn copy_within(&self, target: i64, start: i64, end: i64) -> Result<(), ProxyError> {
        self.emit(EventKind::ArrayCopyWithin { target, start, end }, self.path.clone()).await
    }

    //── Map mutating methods (C6 KeyedMap strategy) ──────────────────

    pub async fn map_set(&self, key: Value, value: Value) -> Result<(), ProxyError> {
        let key_at = self.path.child("key");
        let value_at = self.path.child("value");
        Facade::wrap(key.clone(), key_at.clone(), self.infra.clone());
        Facade::wrap(value.clone(), value_at.clone(), self.infra.clone());
        let key = self.encode(&key, &key_at);
        let value = self.encode(&value, &value_at);
        self.emit(EventKind::MapSet { key, value }, self.path.clone()).await
    }

    pub async fn map_delete(&self, key: Value) -> Result<(), ProxyError> {
        let key_at = self.path.child("key");
        let key = self.encode(&key, &key_at);
        self.emit(EventKind::MapDelete { key }, self.path.clone()).await
    }

    pub async fn map_clear(&self) -> Result<(), ProxyError> {
        self.emit(EventKind::MapClear, self.path.clone()).await
    }

    //── Set mutating methods (C6 Set strategy) ───────────────────────

    pub async fn set_add(&self, value: Value) -> Result<(), ProxyError> {
        let at = self.path.child("value");
        Facade::wrap(value.clone(), at.clone(), self.infra.clone());
        let value = self.encode(&value, &at);
        self.emit(EventKind::SetAdd { value }, self.path.clone()).await
    }

    pub async fn set_delete(&self, value: Value) -> Result<(), ProxyError> {
        let at = self.path.child("value");
        let value = self.encode(&value, &at);
        self.emit(EventKind::SetDelete { value }, self.path.clone()).await
    }

    pub async fn set_clear(&self) -> Result<(), ProxyError> {
        self.emit(EventKind::SetClear, self.path.clone()).await
    }
}

/// Recurse into a composite's children, registering each reachable
/// composite's path on first sight (spec §4.7 wrapping-order invariant).
/// Only children reachable by a genuine navigable `Path` segment are
/// registered: `continuum-path` only addresses `Map` entries by a string
/// key and does not address `Set` members at all, so non-string map keys
/// and set members are wrapped (for identity) but not independently
/// path-addressable — the same limitation `continuum-path::step` has.
fn wrap_children(value: &Value, path: &Path, infra: &Arc<ProxyInfra>) {
    match value {
        Value::Object(fields) => {
            let entries: Vec<(String, Value)> = fields.borrow().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            for (k, v) in entries {
                Facade::wrap(v, path.child(k), infra.clone());
            }
        }
        Value::Array(items) => {
            let entries: Vec<Value> = items.borrow().iter().cloned().collect();
            for (i, v) in entries.into_iter().enumerate() {
                Facade::wrap(v, path.child(i.to_string()), infra.clone());
            }
        }
        Value::Map(entries) => {
            let pairs: Vec<(Value, Value)> = entries.borrow().iter().map(|(k, v)| (k.0.clone(), v.clone())).collect();
            for (k, v) in pairs {
                if let Value::Str(s) = &k {
                    Facade::wrap(v, path.child(s.clone()), infra.clone());
                } else if identity(&v).is_some() {
                    Facade::wrap(v, path.clone(), infra.clone());
                }
            }
        }
        Value::Set(entries) => {
            let members: Vec<Value> = entries.borrow().iter().map(|k| k.0.clone()).collect();
            for v in members {
                if identity(&v).is_some() {
                    Facade::wrap(v, path.clone(), infra.clone());
                }
            }
        }
        Value::Date(d) => {
            let props: Vec<(String, Value)> = d.borrow().properties.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            for (k, v) in props {
                Facade::wrap(v, path.child(k), infra.clone());
            }
        }
        _ => {}
    }
}

/// JS-style negative-index clamp, matching `continuum-event`'s own
/// normalisation so the index a façade method logs is the index replay
/// will reproduce.
fn normalize_index(i: i64, len: usize) -> usize {
    if i < 0 {
        (len as i64 + i).max(0) as usize
    } else {
        (i as usize).min(len)
    }
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Whether `v` is composite per the same category test `classify` performs,
/// used by callers deciding whether a value returned from `get` needs
/// wrapping at all (§4.7: primitives are returned as-is).
pub fn is_composite(v: &Value) -> bool {
    let c = classify(v);
    !matches!(c.category, ValueCategory::Null | ValueCategory::Undefined | ValueCategory::Bool | ValueCategory::Number | ValueCategory::Str | ValueCategory::BigInt | ValueCategory::Symbol)
}

#[cfg(test)]
mod tests {
    use super::*;
    use continuum_store_memory::MemoryLog;
    use continuum_value::new_ref;

    fn root_facade() -> (Arc<ProxyInfra>, Facade) {
        let log: Arc<dyn EventLog> = Arc::new(MemoryLog::new());
        ProxyInfra::new(Value::object(), log)
    }

    #[tokio::test]
    async fn set_then_get_round_trips_and_logs_an_event() {
        let (infra, root) = root_facade();
        root.set("name", Value::Str("ada".into())).await.unwrap();
        let child = root.get("name").unwrap();
        assert!(matches!(child.value(), Value::Str(s) if s == "ada"));
        assert!(matches!(continuum_path::get(infra.root(), &Path::from_segments(["name"])), Some(Value::Str(s)) if s == "ada"));
        assert_eq!(infra.log.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn replaying_mutations_do_not_append_events() {
        let (infra, root) = root_facade();
        infra.set_replaying(true);
        root.set("x", Value::Number(1.0)).await.unwrap();
        assert!(infra.log.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn nested_object_is_wrapped_and_path_registered() {
        let (infra, root) = root_facade();
        let nested = Value::object();
        root.set("child", nested.clone()).await.unwrap();
        let id = identity(&nested).unwrap();
        assert_eq!(infra.path_of(id), Some(Path::from_segments(["child"])));
    }

    #[tokio::test]
    async fn self_cycle_does_not_diverge_on_wrap() {
        let log: Arc<dyn EventLog> = Arc::new(MemoryLog::new());
        let root = Value::object();
        if let Value::Object(fields) = &root {
            fields.borrow_mut().insert("self".to_string(), root.clone());
        }
        let (infra, _facade) = ProxyInfra::new(root.clone(), log);
        let id = identity(&root).unwrap();
        // first sight wins: the root's own registration is at the root path,
        // not the later "self" child path the cyclic reference would imply.
        assert_eq!(infra.path_of(id), Some(Path::root()));
    }

    #[tokio::test]
    async fn array_push_appends_and_emits_array_push_event() {
        let (infra, root) = root_facade();
        root.set("items", Value::array()).await.unwrap();
        let items_facade = root.get("items").unwrap();
        items_facade.push(vec![Value::Number(1.0), Value::Number(2.0)]).await.unwrap();
        if let Some(Value::Array(arr)) = continuum_path::get(infra.root(), &Path::from_segments(["items"])) {
            assert_eq!(arr.borrow().len(), 2);
        } else {
            panic!("expected array");
        }
        let events = infra.log.get_all().await.unwrap();
        assert_eq!(events.last().unwrap().kind.tag_name(), "ARRAY_PUSH");
    }

    #[tokio::test]
    async fn map_set_routes_through_map_strategy_not_object_fields() {
        let (infra, root) = root_facade();
        root.set("m", Value::Map(new_ref(Default::default()))).await.unwrap();
        let map_facade = root.get("m").unwrap();
        map_facade.map_set(Value::Str("k".into()), Value::Number(7.0)).await.unwrap();
        if let Some(Value::Map(entries)) = continuum_path::get(infra.root(), &Path::from_segments(["m"])) {
            assert_eq!(entries.borrow().len(), 1);
        } else {
            panic!("expected map");
        }
    }
}
