#![forbid(unsafe_code)]

//! **continuum-replay** – reconstructs a value graph from a recorded event
//! sequence (spec §4.10, C10).
//!
//! Contract: set `is_replaying=true` on the root's [`ProxyInfra`], apply
//! every event strictly in iteration order through C5's registry (path
//! navigation + dispatch, reused verbatim from `continuum-proxy`'s own
//! `ProxyInfra::apply_event` so live mutation and replay share one code
//! path), then restore the flag — even on error, via a guard — before
//! propagating the first error. There is no partial-apply recovery (spec
//! §4.10): the state left behind is whatever state the error was raised in.

use continuum_event::{Event, EventError};
use continuum_proxy::ProxyInfra;
use std::sync::Arc;
use tracing::debug;

/// Restores `infra.is_replaying` to `false` on drop, so an early return
/// (including via `?`) still leaves the flag in its resting state.
struct ReplayGuard<'a> {
    infra: &'a ProxyInfra,
}

impl Drop for ReplayGuard<'_> {
    fn drop(&mut self) {
        self.infra.set_replaying(false);
    }
}

/// Apply `events` to `infra`'s root, strictly in order, with event
/// re-emission suppressed for the duration (spec §4.10).
pub fn replay(infra: &Arc<ProxyInfra>, events: impl IntoIterator<Item = Event>) -> Result<(), EventError> {
    infra.set_replaying(true);
    let _guard = ReplayGuard { infra };
    for event in events {
        debug!(tag = event.kind.tag_name(), path = ?event.path, "replaying event");
        infra.apply_event(&event)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use continuum_event::EventKind;
    use continuum_path::Path;
    use continuum_store_memory::MemoryLog;
    use continuum_value::Value;
    use serde_json::json;
    use std::sync::Arc as StdArc;

    fn ts() -> u64 {
        0
    }

    #[tokio::test]
    async fn replay_applies_events_in_order_without_reemitting() {
        let log: StdArc<dyn continuum_store_core::EventLog> = StdArc::new(MemoryLog::new());
        let (infra, _root) = ProxyInfra::new(Value::object(), log.clone());

        let events = vec![
            Event::new(EventKind::Set { value: json!([]) }, Path::from_segments(["items"]), ts()),
            Event::new(EventKind::ArrayPush { items: vec![json!(1.0), json!(2.0)] }, Path::from_segments(["items"]), ts()),
            Event::new(EventKind::ArraySort, Path::from_segments(["items"]), ts()),
        ];
        // ArrayPush needs an actual array at `items`; the SET event above
        // writes an empty-array wire value that decodes to `Value::array()`.
        replay(&infra, events).unwrap();

        assert!(!infra.is_replaying());
        if let Some(Value::Array(items)) = continuum_path::get(infra.root(), &Path::from_segments(["items"])) {
            assert_eq!(items.borrow().len(), 2);
        } else {
            panic!("expected items array");
        }
        // replay must never append to the log itself.
        assert!(log.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replay_restores_is_replaying_on_error() {
        let log: StdArc<dyn continuum_store_core::EventLog> = StdArc::new(MemoryLog::new());
        let (infra, _root) = ProxyInfra::new(Value::object(), log);
        let bad = vec![Event::new(EventKind::ArrayPop, Path::from_segments(["missing"]), ts())];
        assert!(replay(&infra, bad).is_err());
        assert!(!infra.is_replaying());
    }
}
