#![forbid(unsafe_code)]

//! **continuum-store-core** – the abstract append-only event log contract
//! consumed by the engine (spec §4.9/C9), grounded on
//! `toka-store-core::StorageBackend`'s shape: a small `Send + Sync`
//! `async_trait`, an optional extension trait for the capability not every
//! backend can offer, and a `thiserror` error enum at the boundary.
//!
//! The core depends only on [`EventLog`] as a trait object — it makes no
//! assumption about durability or multi-writer semantics, only that within
//! one backend instance `get_all`/`stream` return events in append order
//! (spec §4.9/§5).

use async_trait::async_trait;
use continuum_event::Event;
use thiserror::Error;

/// Errors a backend may raise (spec §7: `LogClosed`, `LogTransport`).
#[derive(Debug, Error)]
pub enum LogError {
    /// The backend has been explicitly closed (spec §5: browser-backed logs
    /// "enter a terminal `Closed` state"; any further call fails loudly).
    #[error("event log is closed")]
    Closed,
    /// Any failure in the underlying transport (file I/O, network, etc).
    #[error("event log transport error: {0}")]
    Transport(String),
}

/// Minimal interface consumed by the core (spec §4.9).
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append one event. Completes asynchronously; backends may suspend here.
    async fn append(&self, event: Event) -> Result<(), LogError>;

    /// Yield all events in insertion order.
    async fn get_all(&self) -> Result<Vec<Event>, LogError>;

    /// Truncate the log.
    async fn clear(&self) -> Result<(), LogError>;
}

/// Optional extension for backends that can stream events one at a time
/// for memory-frugal replay (spec §4.9) — mirrors how
/// `toka-store-core::WalStorageBackend` extends the base `StorageBackend`
/// rather than forcing every backend to implement every capability.
#[async_trait]
pub trait StreamingEventLog: EventLog {
    /// Yield events one at a time, in the same order `get_all` would.
    async fn stream(&self) -> Result<Vec<Event>, LogError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use continuum_event::EventKind;
    use continuum_path::Path;
    use std::sync::Mutex;

    /// A trivial in-test backend, just enough to exercise the trait's
    /// async contract without pulling in `continuum-store-memory`.
    struct VecLog(Mutex<Vec<Event>>);

    #[async_trait]
    impl EventLog for VecLog {
        async fn append(&self, event: Event) -> Result<(), LogError> {
            self.0.lock().unwrap().push(event);
            Ok(())
        }

        async fn get_all(&self) -> Result<Vec<Event>, LogError> {
            Ok(self.0.lock().unwrap().clone())
        }

        async fn clear(&self) -> Result<(), LogError> {
            self.0.lock().unwrap().clear();
            Ok(())
        }
    }

    #[tokio::test]
    async fn append_preserves_order() {
        let log = VecLog(Mutex::new(Vec::new()));
        for i in 0..3 {
            log.append(Event::new(EventKind::Script { source: i.to_string() }, Path::root(), 0))
                .await
                .unwrap();
        }
        let all = log.get_all().await.unwrap();
        let sources: Vec<String> = all
            .iter()
            .map(|e| match &e.kind {
                EventKind::Script { source } => source.clone(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(sources, vec!["0", "1", "2"]);
    }

    #[tokio::test]
    async fn clear_empties_the_log() {
        let log = VecLog(Mutex::new(Vec::new()));
        log.append(Event::new(EventKind::Script { source: "x".into() }, Path::root(), 0))
            .await
            .unwrap();
        log.clear().await.unwrap();
        assert!(log.get_all().await.unwrap().is_empty());
    }
}
