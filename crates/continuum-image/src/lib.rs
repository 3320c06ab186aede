#![forbid(unsafe_code)]

//! **continuum-image** – the memory-image façade (spec §4.11, C11): the
//! public entry point that ties interception (C7/C8), the event log (C9)
//! and the replay engine (C10) together into `create`/`snapshotJson`/
//! `loadSnapshot`/`replayTo`/`replayFromLog`/`isMemoryImage`.
//!
//! The spec models a process-wide weak registry `rootFaçade→infrastructure`
//! so accessor functions can find a root's infrastructure without the
//! caller threading it through. [`Facade`] already carries its
//! `Arc<ProxyInfra>` directly, so the registry here exists purely to serve
//! the spec's "opaque handle" accessors (§4.11, and spec.md's "a small
//! handle the caller receives at `create`", spec.md §11 Open Questions):
//! `RootId` is that handle, keyed on the root's [`continuum_value::NodeId`].
//!
//! `continuum_value::Value` is `Rc`-based (spec's values live on one
//! thread, mirroring the single-threaded runtime spec.md was written
//! against), so it is neither `Send` nor `Sync` — a genuinely process-wide
//! `static` registry holding it is not possible without unsafe. The
//! registry below is `thread_local!` instead, which is the faithful
//! realisation: every memory image already lives and dies on one thread.
//! Unlike a JS weak map, it also holds a strong `Arc`, so an entry
//! outlives every other reference to its root until [`forget`] removes it
//! explicitly — documented in `DESIGN.md`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use continuum_event::{Event, EventError};
use continuum_proxy::{Facade, ProxyInfra};
use continuum_store_core::{EventLog, LogError};
use continuum_value::{identity, NodeId, Value};
use serde_json::Value as Json;
use thiserror::Error;
use tracing::{debug, info};

/// Errors raised by the memory-image façade (spec §7).
#[derive(Debug, Error)]
pub enum ImageError {
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Event(#[from] EventError),
    #[error(transparent)]
    Codec(#[from] continuum_codec::CodecError),
    #[error("failed to (de)serialise snapshot JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0:?} is not a known memory image root")]
    NotMemoryImage(RootId),
}

/// Opaque handle to a registered root, stable for as long as the root
/// remains registered (spec.md §11: "a small handle the caller receives
/// at `create`"). Carries the root value's own identity, so two handles
/// are equal iff they name the same underlying root.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct RootId(NodeId);

/// Whether [`create`] should start a fresh root or first hydrate
/// `initial_root` by replaying the attached log's existing history.
/// Irrelevant to [`replay_to`]/[`replay_from_log`], which always replay
/// unconditionally.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ReplayState {
    Fresh,
    ResumeFromLog,
}

/// Builder for the three knobs C11's `create`/`replayTo`/`replayFromLog`
/// share (spec §4.11): which log to attach, whether to resume from it, and
/// an opaque metadata blob outer presentation layers can stash alongside
/// the root (spec.md §4.6 treats the analogous `metadata_provider` as an
/// opaque pass-through, so this does the same for arbitrary JSON).
pub struct Options {
    pub event_log: Arc<dyn EventLog>,
    pub replay_state: ReplayState,
    pub metadata: Option<Json>,
}

impl Options {
    pub fn new(event_log: Arc<dyn EventLog>) -> Self {
        Options { event_log, replay_state: ReplayState::Fresh, metadata: None }
    }

    pub fn resuming_from_log(mut self) -> Self {
        self.replay_state = ReplayState::ResumeFromLog;
        self
    }

    pub fn with_metadata(mut self, metadata: Json) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

struct RegistryEntry {
    infra: Arc<ProxyInfra>,
    metadata: Option<Json>,
}

thread_local! {
    static REGISTRY: RefCell<HashMap<RootId, RegistryEntry>> = RefCell::new(HashMap::new());
}

fn register(infra: Arc<ProxyInfra>, metadata: Option<Json>) -> RootId {
    let id = RootId(identity(infra.root()).expect("memory image root is always composite"));
    REGISTRY.with(|r| r.borrow_mut().insert(id, RegistryEntry { infra, metadata }));
    id
}

/// The wrapped root C11 hands back: a live [`Facade`] plus the [`RootId`]
/// it was registered under.
pub struct MemoryImage {
    id: RootId,
    root: Facade,
}

impl MemoryImage {
    pub fn id(&self) -> RootId {
        self.id
    }

    pub fn root(&self) -> &Facade {
        &self.root
    }
}

/// C11 `create` (spec §4.11): wrap `initial_root` under fresh
/// infrastructure backed by `options.event_log`, optionally hydrating it
/// from the log's existing history first (`ReplayState::ResumeFromLog`),
/// then register the result under a fresh [`RootId`].
pub async fn create(initial_root: Value, options: Options) -> Result<MemoryImage, ImageError> {
    let (infra, root) = ProxyInfra::new(initial_root, options.event_log.clone());
    if options.replay_state == ReplayState::ResumeFromLog {
        let events = options.event_log.get_all().await?;
        info!(count = events.len(), "resuming memory image from log history");
        continuum_replay::replay(&infra, events)?;
    }
    let id = register(infra, options.metadata);
    debug!(?id, "memory image created");
    Ok(MemoryImage { id, root })
}

/// C11 `snapshotJson` (spec §4.11): fails with [`ImageError::NotMemoryImage`]
/// if `image`'s `RootId` is no longer registered (e.g. after [`forget`]).
pub fn snapshot_json(image: &MemoryImage) -> Result<String, ImageError> {
    REGISTRY.with(|r| {
        let reg = r.borrow();
        let entry = reg.get(&image.id).ok_or(ImageError::NotMemoryImage(image.id))?;
        let doc = continuum_codec::encode_snapshot(entry.infra.root());
        Ok(serde_json::to_string(&doc)?)
    })
}

/// C11 `loadSnapshot` (spec §4.11): decodes to a **plain** graph, with no
/// façade, log, or registry entry attached. Callers who want a live
/// memory image wrap the result themselves via [`create`].
pub fn load_snapshot(json: &str) -> Result<Value, ImageError> {
    let doc: Json = serde_json::from_str(json)?;
    Ok(continuum_codec::decode_snapshot(&doc)?)
}

/// C11 `replayTo` (spec §4.11): build a fresh wrapped root from
/// `initial_root` by replaying an explicit event sequence, then attach
/// `options.event_log` for any further live mutation.
pub async fn replay_to(
    initial_root: Value,
    events: impl IntoIterator<Item = Event>,
    options: Options,
) -> Result<MemoryImage, ImageError> {
    let (infra, root) = ProxyInfra::new(initial_root, options.event_log);
    continuum_replay::replay(&infra, events)?;
    let id = register(infra, options.metadata);
    debug!(?id, "memory image rebuilt via explicit replay");
    Ok(MemoryImage { id, root })
}

/// C11 `replayFromLog` (spec §4.11): same as [`replay_to`], but the event
/// sequence is read from `options.event_log` itself rather than supplied
/// by the caller.
pub async fn replay_from_log(initial_root: Value, options: Options) -> Result<MemoryImage, ImageError> {
    let events = options.event_log.get_all().await?;
    replay_to(initial_root, events, Options { replay_state: ReplayState::Fresh, ..options }).await
}

/// C11 `isMemoryImage` (spec §4.11): true iff `value`'s identity names a
/// currently-registered root.
pub fn is_memory_image(value: &Value) -> bool {
    match identity(value) {
        Some(id) => REGISTRY.with(|r| r.borrow().contains_key(&RootId(id))),
        None => false,
    }
}

/// Opaque accessor for the infrastructure backing a registered root (spec
/// §4.11: "opaque accessors for the infrastructure and metadata, used by
/// outer UI-style layers").
pub fn infra_of(id: RootId) -> Option<Arc<ProxyInfra>> {
    REGISTRY.with(|r| r.borrow().get(&id).map(|e| e.infra.clone()))
}

/// Opaque accessor for the metadata attached at `create`/`replayTo`.
pub fn metadata_of(id: RootId) -> Option<Json> {
    REGISTRY.with(|r| r.borrow().get(&id).and_then(|e| e.metadata.clone()))
}

/// Remove `id` from the registry. There is no automatic reclamation (the
/// registry holds a strong `Arc`, unlike the spec's weak map) — callers
/// that create many short-lived images should call this when done with
/// one, or the registry grows for the life of the thread.
pub fn forget(id: RootId) {
    REGISTRY.with(|r| {
        r.borrow_mut().remove(&id);
    });
}
