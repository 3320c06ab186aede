#![forbid(unsafe_code)]

//! **continuum-store-memory** – the in-memory reference `EventLog` backend,
//! grounded on `toka-store-memory::MemoryBackend`'s shape: an
//! `Arc<RwLock<Vec<_>>>` behind a small `Clone`-able handle, a close/reopen
//! lifecycle, and `tokio::sync::RwLock` for the async trait methods.

use async_trait::async_trait;
use continuum_event::Event;
use continuum_store_core::{EventLog, LogError, StreamingEventLog};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// A fast, non-persistent `EventLog` suitable for tests and short-lived
/// memory images. All events are lost when the process terminates.
#[derive(Debug, Clone)]
pub struct MemoryLog {
    events: Arc<RwLock<Vec<Event>>>,
    closed: Arc<RwLock<bool>>,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLog {
    pub fn new() -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            closed: Arc::new(RwLock::new(false)),
        }
    }

    /// Enter the terminal closed state (spec §5); any further call fails
    /// loudly with [`LogError::Closed`].
    pub async fn close(&self) {
        *self.closed.write().await = true;
    }

    async fn check_open(&self) -> Result<(), LogError> {
        if *self.closed.read().await {
            Err(LogError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl EventLog for MemoryLog {
    async fn append(&self, event: Event) -> Result<(), LogError> {
        self.check_open().await?;
        debug!(tag = event.kind.tag_name(), "appending event");
        self.events.write().await.push(event);
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<Event>, LogError> {
        self.check_open().await?;
        Ok(self.events.read().await.clone())
    }

    async fn clear(&self) -> Result<(), LogError> {
        self.check_open().await?;
        self.events.write().await.clear();
        Ok(())
    }
}

#[async_trait]
impl StreamingEventLog for MemoryLog {
    async fn stream(&self) -> Result<Vec<Event>, LogError> {
        self.get_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use continuum_event::EventKind;
    use continuum_path::Path;

    fn event(n: u32) -> Event {
        Event::new(EventKind::Script { source: n.to_string() }, Path::root(), 0)
    }

    #[tokio::test]
    async fn append_and_get_all_preserve_order() {
        let log = MemoryLog::new();
        log.append(event(0)).await.unwrap();
        log.append(event(1)).await.unwrap();
        let all = log.get_all().await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn closed_log_rejects_further_calls() {
        let log = MemoryLog::new();
        log.append(event(0)).await.unwrap();
        log.close().await;
        assert!(matches!(log.append(event(1)).await, Err(LogError::Closed)));
        assert!(matches!(log.get_all().await, Err(LogError::Closed)));
    }

    #[tokio::test]
    async fn clear_truncates() {
        let log = MemoryLog::new();
        log.append(event(0)).await.unwrap();
        log.clear().await.unwrap();
        assert!(log.get_all().await.unwrap().is_empty());
    }
}
