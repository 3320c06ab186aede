#![forbid(unsafe_code)]

//! **continuum-store-file** – an append-only, newline-delimited-JSON
//! `EventLog` backend (spec §6), grounded on
//! `toka-store-sled::SledBackend`'s open/close lifecycle: an explicit
//! `open`/`open_with_options` constructor, a `temporary()` test helper, and a
//! handle held for the file's lifetime rather than reopened per call.
//!
//! Each line is one `\n`-terminated JSON object: `type` (one of the
//! eighteen tags), `timestamp` (integer milliseconds since epoch), `path`
//! (array of strings), plus the tag-specific fields listed in spec §4.5.

use async_trait::async_trait;
use continuum_event::{Event, EventKind};
use continuum_path::Path;
use continuum_store_core::{EventLog, LogError, StreamingEventLog};
use serde_json::{json, Value as Json};
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::debug;

/// Construction knobs for [`FileLog::open_with_options`], mirroring
/// `SledBackend::open_with_config`'s separation of "where" from "how".
#[derive(Debug, Clone)]
pub struct OpenOptionsConfig {
    /// Buffer size (bytes) used when reading the file back on `get_all`.
    pub read_buffer: usize,
}

impl Default for OpenOptionsConfig {
    fn default() -> Self {
        Self { read_buffer: 64 * 1024 }
    }
}

struct Inner {
    path: PathBuf,
    handle: Mutex<Option<File>>,
    closed: Mutex<bool>,
}

/// A durable, append-only `EventLog` backend storing one JSON object per
/// line. The file handle opens on construction and is held until the
/// `FileLog` (and every clone of its `Arc`) is dropped.
#[derive(Clone)]
pub struct FileLog {
    inner: Arc<Inner>,
    config: OpenOptionsConfig,
}

impl FileLog {
    /// Open (creating if absent) the NDJSON log at `path`.
    pub async fn open(path: impl AsRef<FsPath>) -> Result<Self, LogError> {
        Self::open_with_options(path, OpenOptionsConfig::default()).await
    }

    /// Open with explicit configuration.
    pub async fn open_with_options(path: impl AsRef<FsPath>, config: OpenOptionsConfig) -> Result<Self, LogError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)
            .await
            .map_err(|e| LogError::Transport(e.to_string()))?;
        Ok(Self {
            inner: Arc::new(Inner {
                path,
                handle: Mutex::new(Some(file)),
                closed: Mutex::new(false),
            }),
            config,
        })
    }

    /// Create a log backed by a fresh temporary directory, removed on drop
    /// of the returned `TempDir`.
    pub async fn temporary() -> Result<(Self, tempfile::TempDir), LogError> {
        let dir = tempfile::tempdir().map_err(|e| LogError::Transport(e.to_string()))?;
        let path = dir.path().join("events.ndjson");
        let log = Self::open(&path).await?;
        Ok((log, dir))
    }

    /// Enter the terminal closed state (spec §5); further calls fail loudly.
    pub async fn close(&self) {
        *self.inner.closed.lock().await = true;
        self.inner.handle.lock().await.take();
    }

    async fn check_open(&self) -> Result<(), LogError> {
        if *self.inner.closed.lock().await {
            Err(LogError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl EventLog for FileLog {
    async fn append(&self, event: Event) -> Result<(), LogError> {
        self.check_open().await?;
        let line = event_to_json(&event).to_string();
        debug!(tag = event.kind.tag_name(), path = %self.inner.path.display(), "appending event");
        let mut guard = self.inner.handle.lock().await;
        let file = guard.as_mut().ok_or(LogError::Closed)?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| LogError::Transport(e.to_string()))?;
        file.write_all(b"\n").await.map_err(|e| LogError::Transport(e.to_string()))?;
        file.flush().await.map_err(|e| LogError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<Event>, LogError> {
        self.check_open().await?;
        let file = File::open(&self.inner.path)
            .await
            .map_err(|e| LogError::Transport(e.to_string()))?;
        let mut reader = BufReader::with_capacity(self.config.read_buffer, file);
        let mut events = Vec::new();
        let mut line = String::new();
        loop {
            line.clear();
            let bytes = reader.read_line(&mut line).await.map_err(|e| LogError::Transport(e.to_string()))?;
            if bytes == 0 {
                break;
            }
            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                continue;
            }
            events.push(json_to_event(trimmed)?);
        }
        Ok(events)
    }

    async fn clear(&self) -> Result<(), LogError> {
        self.check_open().await?;
        let mut guard = self.inner.handle.lock().await;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .read(true)
            .open(&self.inner.path)
            .await
            .map_err(|e| LogError::Transport(e.to_string()))?;
        *guard = Some(file);
        Ok(())
    }
}

#[async_trait]
impl StreamingEventLog for FileLog {
    async fn stream(&self) -> Result<Vec<Event>, LogError> {
        self.get_all().await
    }
}

//─────────────────────────────
//  Wire encoding (spec §6)
//─────────────────────────────

fn event_to_json(event: &Event) -> Json {
    let mut obj = json!({
        "type": event.kind.tag_name(),
        "timestamp": event.timestamp_ms,
        "path": event.path.0,
    });
    let fields = match &event.kind {
        EventKind::Set { value } => json!({ "value": value }),
        EventKind::Delete => json!({}),
        EventKind::ArrayPush { items } => json!({ "items": items }),
        EventKind::ArrayPop => json!({}),
        EventKind::ArrayShift => json!({}),
        EventKind::ArrayUnshift { items } => json!({ "items": items }),
        EventKind::ArraySplice { start, delete_count, items } => {
            json!({ "start": start, "deleteCount": delete_count, "items": items })
        }
        EventKind::ArraySort => json!({}),
        EventKind::ArrayReverse => json!({}),
        EventKind::ArrayFill { value, start, end } => json!({ "value": value, "start": start, "end": end }),
        EventKind::ArrayCopyWithin { target, start, end } => json!({ "target": target, "start": start, "end": end }),
        EventKind::MapSet { key, value } => json!({ "key": key, "value": value }),
        EventKind::MapDelete { key } => json!({ "key": key }),
        EventKind::MapClear => json!({}),
        EventKind::SetAdd { value } => json!({ "value": value }),
        EventKind::SetDelete { value } => json!({ "value": value }),
        EventKind::SetClear => json!({}),
        EventKind::Script { source } => json!({ "source": source }),
    };
    if let (Json::Object(obj), Json::Object(fields)) = (&mut obj, fields) {
        obj.extend(fields);
    }
    obj
}

fn json_to_event(line: &str) -> Result<Event, LogError> {
    let value: Json = serde_json::from_str(line).map_err(|e| LogError::Transport(e.to_string()))?;
    let obj = value.as_object().ok_or_else(|| LogError::Transport("event line is not a JSON object".into()))?;
    let tag = obj
        .get("type")
        .and_then(Json::as_str)
        .ok_or_else(|| LogError::Transport("event line missing string `type`".into()))?;
    let timestamp_ms = obj
        .get("timestamp")
        .and_then(Json::as_u64)
        .ok_or_else(|| LogError::Transport("event line missing integer `timestamp`".into()))?;
    let path = obj
        .get("path")
        .and_then(Json::as_array)
        .ok_or_else(|| LogError::Transport("event line missing `path` array".into()))?
        .iter()
        .map(|s| s.as_str().map(str::to_string).ok_or_else(|| LogError::Transport("path segment not a string".into())))
        .collect::<Result<Vec<_>, _>>()?;

    let field = |name: &str| -> Result<Json, LogError> {
        obj.get(name).cloned().ok_or_else(|| LogError::Transport(format!("event line missing `{name}`")))
    };
    let kind = match tag {
        "SET" => EventKind::Set { value: field("value")? },
        "DELETE" => EventKind::Delete,
        "ARRAY_PUSH" => EventKind::ArrayPush { items: as_array(field("items")?)? },
        "ARRAY_POP" => EventKind::ArrayPop,
        "ARRAY_SHIFT" => EventKind::ArrayShift,
        "ARRAY_UNSHIFT" => EventKind::ArrayUnshift { items: as_array(field("items")?)? },
        "ARRAY_SPLICE" => EventKind::ArraySplice {
            start: as_i64(field("start")?)?,
            delete_count: as_i64(field("deleteCount")?)?,
            items: as_array(field("items")?)?,
        },
        "ARRAY_SORT" => EventKind::ArraySort,
        "ARRAY_REVERSE" => EventKind::ArrayReverse,
        "ARRAY_FILL" => EventKind::ArrayFill {
            value: field("value")?,
            start: as_i64(field("start")?)?,
            end: as_i64(field("end")?)?,
        },
        "ARRAY_COPYWITHIN" => EventKind::ArrayCopyWithin {
            target: as_i64(field("target")?)?,
            start: as_i64(field("start")?)?,
            end: as_i64(field("end")?)?,
        },
        "MAP_SET" => EventKind::MapSet { key: field("key")?, value: field("value")? },
        "MAP_DELETE" => EventKind::MapDelete { key: field("key")? },
        "MAP_CLEAR" => EventKind::MapClear,
        "SET_ADD" => EventKind::SetAdd { value: field("value")? },
        "SET_DELETE" => EventKind::SetDelete { value: field("value")? },
        "SET_CLEAR" => EventKind::SetClear,
        "SCRIPT" => EventKind::Script {
            source: field("source")?.as_str().ok_or_else(|| LogError::Transport("`source` not a string".into()))?.to_string(),
        },
        other => return Err(LogError::Transport(format!("unknown event type `{other}`"))),
    };
    Ok(Event::new(kind, Path(path), timestamp_ms))
}

fn as_array(v: Json) -> Result<Vec<Json>, LogError> {
    v.as_array().cloned().ok_or_else(|| LogError::Transport("expected a JSON array".into()))
}

fn as_i64(v: Json) -> Result<i64, LogError> {
    v.as_i64().ok_or_else(|| LogError::Transport("expected a JSON integer".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_and_get_all_round_trip() {
        let (log, _dir) = FileLog::temporary().await.unwrap();
        log.append(Event::new(EventKind::Set { value: json!(1.0) }, Path::from_segments(["a"]), 1000))
            .await
            .unwrap();
        log.append(Event::new(
            EventKind::ArraySplice { start: 0, delete_count: -1, items: vec![json!("x")] },
            Path::from_segments(["items"]),
            1001,
        ))
        .await
        .unwrap();
        let all = log.get_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].kind.tag_name(), "SET");
        assert_eq!(all[1].kind.tag_name(), "ARRAY_SPLICE");
    }

    #[tokio::test]
    async fn closed_log_rejects_further_calls() {
        let (log, _dir) = FileLog::temporary().await.unwrap();
        log.close().await;
        assert!(matches!(
            log.append(Event::new(EventKind::Delete, Path::root(), 0)).await,
            Err(LogError::Closed)
        ));
    }

    #[tokio::test]
    async fn clear_truncates_the_file() {
        let (log, _dir) = FileLog::temporary().await.unwrap();
        log.append(Event::new(EventKind::Delete, Path::root(), 0)).await.unwrap();
        log.clear().await.unwrap();
        assert!(log.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reopening_an_existing_file_reads_prior_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.ndjson");
        {
            let log = FileLog::open(&path).await.unwrap();
            log.append(Event::new(EventKind::Delete, Path::root(), 0)).await.unwrap();
        }
        let reopened = FileLog::open(&path).await.unwrap();
        assert_eq!(reopened.get_all().await.unwrap().len(), 1);
    }
}
