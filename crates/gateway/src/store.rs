//! External collaborator stores.
//!
//! The pipeline talks to these through narrow traits; the bundled
//! implementations are JSONL append logs, an atomically replaced JSON state
//! file, and an in-process broadcast bus. Writes are best-effort and off the
//! hot path; failures are logged, never swallowed silently.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tokio::{io::AsyncWriteExt, sync::broadcast};

use crate::{cooldown::CooldownState, tap::TapRole, usage::UsageRecord};

/// Usage record persistence.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Append a new record.
    async fn append(&self, record: &UsageRecord) -> anyhow::Result<()>;

    /// Persist updated token counts and cost for an existing record.
    async fn update_usage(&self, record: &UsageRecord) -> anyhow::Result<()>;

    /// Query records, newest state per request id.
    async fn query(&self, query: &UsageQuery) -> anyhow::Result<Vec<UsageRecord>>;

    /// Delete records by request id.
    async fn delete(&self, request_ids: &[String]) -> anyhow::Result<()>;
}

/// Filters for `UsageStore::query`.
#[derive(Debug, Default)]
pub struct UsageQuery {
    pub request_id: Option<String>,
    pub api_key_name: Option<String>,
    pub provider: Option<String>,
    pub limit: Option<usize>,
}

/// One error log entry, keyed by request id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub request_id: String,
    pub timestamp: Timestamp,
    pub error_type: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Error record persistence.
#[async_trait]
pub trait ErrorStore: Send + Sync {
    async fn append(&self, record: &ErrorRecord) -> anyhow::Result<()>;
    async fn query_by_id(&self, request_id: &str) -> anyhow::Result<Vec<ErrorRecord>>;
    async fn delete(&self, request_ids: &[String]) -> anyhow::Result<()>;
}

/// Cooldown state persistence: one JSON document, replaced whole.
#[async_trait]
pub trait CooldownStore: Send + Sync {
    async fn load(&self) -> anyhow::Result<CooldownState>;
    async fn save(&self, state: &CooldownState) -> anyhow::Result<()>;
}

/// JSONL-backed usage store.
///
/// Updates append a superseding full record; reads keep the last state per
/// request id. Deletes compact the file.
pub struct JsonlUsageStore {
    path: PathBuf,
}

impl JsonlUsageStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    async fn read_all(&self) -> anyhow::Result<Vec<UsageRecord>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut by_id = indexmap::IndexMap::new();

        for line in content.lines().filter(|line| !line.trim().is_empty()) {
            match serde_json::from_str::<UsageRecord>(line) {
                Ok(record) => {
                    by_id.insert(record.request_id.clone(), record);
                }
                Err(e) => log::warn!("Skipping unparseable usage record: {e}"),
            }
        }

        Ok(by_id.into_values().collect())
    }
}

async fn append_line(path: &Path, line: String) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;

    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;

    Ok(())
}

/// Replace a file's contents atomically: write a sibling temp file, rename
/// over the target.
async fn replace_atomic(path: &Path, content: String) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;

    Ok(())
}

#[async_trait]
impl UsageStore for JsonlUsageStore {
    async fn append(&self, record: &UsageRecord) -> anyhow::Result<()> {
        append_line(&self.path, serde_json::to_string(record)?).await
    }

    async fn update_usage(&self, record: &UsageRecord) -> anyhow::Result<()> {
        // Last writer wins on read; compaction happens on delete.
        append_line(&self.path, serde_json::to_string(record)?).await
    }

    async fn query(&self, query: &UsageQuery) -> anyhow::Result<Vec<UsageRecord>> {
        let mut records = self.read_all().await?;

        records.retain(|record| {
            query
                .request_id
                .as_ref()
                .is_none_or(|id| &record.request_id == id)
                && query
                    .api_key_name
                    .as_ref()
                    .is_none_or(|name| record.api_key_name.as_ref() == Some(name))
                && query
                    .provider
                    .as_ref()
                    .is_none_or(|provider| record.provider.as_ref() == Some(provider))
        });

        if let Some(limit) = query.limit {
            let skip = records.len().saturating_sub(limit);
            records.drain(..skip);
        }

        Ok(records)
    }

    async fn delete(&self, request_ids: &[String]) -> anyhow::Result<()> {
        let mut records = self.read_all().await?;
        records.retain(|record| !request_ids.contains(&record.request_id));

        let mut content = String::new();
        for record in records {
            content.push_str(&serde_json::to_string(&record)?);
            content.push('\n');
        }

        replace_atomic(&self.path, content).await
    }
}

/// JSONL-backed error store.
pub struct JsonlErrorStore {
    path: PathBuf,
}

impl JsonlErrorStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    async fn read_all(&self) -> anyhow::Result<Vec<ErrorRecord>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

#[async_trait]
impl ErrorStore for JsonlErrorStore {
    async fn append(&self, record: &ErrorRecord) -> anyhow::Result<()> {
        append_line(&self.path, serde_json::to_string(record)?).await
    }

    async fn query_by_id(&self, request_id: &str) -> anyhow::Result<Vec<ErrorRecord>> {
        let mut records = self.read_all().await?;
        records.retain(|record| record.request_id == request_id);
        Ok(records)
    }

    async fn delete(&self, request_ids: &[String]) -> anyhow::Result<()> {
        let mut records = self.read_all().await?;
        records.retain(|record| !request_ids.contains(&record.request_id));

        let mut content = String::new();
        for record in records {
            content.push_str(&serde_json::to_string(&record)?);
            content.push('\n');
        }

        replace_atomic(&self.path, content).await
    }
}

/// JSON-file cooldown store with atomic replace.
pub struct JsonCooldownStore {
    path: PathBuf,
}

impl JsonCooldownStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl CooldownStore for JsonCooldownStore {
    async fn load(&self) -> anyhow::Result<CooldownState> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(CooldownState::default()),
            Err(e) => return Err(e.into()),
        };

        Ok(serde_json::from_str(&content)?)
    }

    async fn save(&self, state: &CooldownState) -> anyhow::Result<()> {
        replace_atomic(&self.path, serde_json::to_string_pretty(state)?).await
    }
}

/// No-op cooldown store for tests and ephemeral runs.
pub struct NullCooldownStore;

#[async_trait]
impl CooldownStore for NullCooldownStore {
    async fn load(&self) -> anyhow::Result<CooldownState> {
        Ok(CooldownState::default())
    }

    async fn save(&self, _state: &CooldownState) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Persisted form of one request's captured SSE traffic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugTrace {
    pub request_id: String,
    /// Raw provider-side SSE text.
    pub provider_sse: String,
    /// Raw client-side SSE text.
    pub client_sse: String,
}

/// In-flight capture of stream chunks plus flush-to-disk on finalization.
pub struct DebugLogger {
    dir: PathBuf,
    captures: DashMap<String, DebugTrace>,
}

impl DebugLogger {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            captures: DashMap::new(),
        }
    }

    /// Record one observed chunk. Bytes are captured as lossy UTF-8; SSE is
    /// text on every supported wire.
    pub fn record_chunk(&self, request_id: &str, role: TapRole, chunk: &Bytes) {
        let mut capture = self
            .captures
            .entry(request_id.to_string())
            .or_insert_with(|| DebugTrace {
                request_id: request_id.to_string(),
                ..Default::default()
            });

        let text = String::from_utf8_lossy(chunk);
        match role {
            TapRole::Provider => capture.provider_sse.push_str(&text),
            TapRole::Client => capture.client_sse.push_str(&text),
        }
    }

    /// The captured text so far for one side.
    pub fn captured(&self, request_id: &str, role: TapRole) -> Option<String> {
        self.captures.get(request_id).map(|capture| match role {
            TapRole::Provider => capture.provider_sse.clone(),
            TapRole::Client => capture.client_sse.clone(),
        })
    }

    /// Write the trace to disk and drop the in-memory capture.
    pub async fn flush(&self, request_id: &str) {
        let Some((_, trace)) = self.captures.remove(request_id) else {
            return;
        };

        let path = self.dir.join(format!("{request_id}.json"));

        let content = match serde_json::to_string(&trace) {
            Ok(content) => content,
            Err(e) => {
                log::error!("Failed to serialize debug trace for {request_id}: {e}");
                return;
            }
        };

        if let Err(e) = replace_atomic(&path, content).await {
            log::error!("Failed to flush debug trace for {request_id}: {e}");
        }
    }

    /// Read a flushed trace back.
    pub async fn query_by_id(&self, request_id: &str) -> anyhow::Result<Option<DebugTrace>> {
        let path = self.dir.join(format!("{request_id}.json"));

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Delete a flushed trace.
    pub async fn delete(&self, request_id: &str) -> anyhow::Result<()> {
        let path = self.dir.join(format!("{request_id}.json"));

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// A gateway event on the bus.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayEvent {
    pub kind: String,
    pub timestamp: Timestamp,
    pub payload: serde_json::Value,
}

/// In-process broadcast bus; observers subscribe for an SSE feed.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GatewayEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }
}

impl EventBus {
    /// Publish an event; dropped silently when nobody listens.
    pub fn emit(&self, kind: &str, payload: serde_json::Value) {
        let event = GatewayEvent {
            kind: kind.to_string(),
            timestamp: Timestamp::now(),
            payload,
        };

        let _ = self.tx.send(event);
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unified::UnifiedUsage;

    fn record(id: &str, pending: bool) -> UsageRecord {
        UsageRecord {
            request_id: id.to_string(),
            pending,
            ..UsageRecord::new_for_test()
        }
    }

    #[tokio::test]
    async fn usage_store_update_supersedes_append() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlUsageStore::new(dir.path().join("usage.jsonl"));

        store.append(&record("req_1", true)).await.unwrap();

        let mut updated = record("req_1", false);
        updated.usage = UnifiedUsage {
            input_tokens: 10,
            output_tokens: 5,
            total_tokens: 15,
            ..Default::default()
        };
        store.update_usage(&updated).await.unwrap();

        let records = store.query(&UsageQuery::default()).await.unwrap();

        assert_eq!(records.len(), 1);
        assert!(!records[0].pending);
        assert_eq!(records[0].usage.total_tokens, 15);
    }

    #[tokio::test]
    async fn usage_store_delete_compacts() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlUsageStore::new(dir.path().join("usage.jsonl"));

        store.append(&record("req_1", false)).await.unwrap();
        store.append(&record("req_2", false)).await.unwrap();

        store.delete(&["req_1".to_string()]).await.unwrap();

        let records = store.query(&UsageQuery::default()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].request_id, "req_2");
    }

    #[tokio::test]
    async fn cooldown_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonCooldownStore::new(dir.path().join("cooldowns.json"));

        // Missing file loads empty.
        assert!(store.load().await.unwrap().entries.is_empty());

        let now = Timestamp::now();
        let state = CooldownState {
            entries: vec![crate::cooldown::CooldownEntry {
                provider: "acme".into(),
                model: None,
                account: None,
                reason: config::CooldownReason::RateLimit,
                start_time: now,
                end_time: now + std::time::Duration::from_secs(60),
                http_status: Some(429),
                message: None,
                retry_after: Some(60),
            }],
        };

        store.save(&state).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.entries.len(), 1);
        assert_eq!(loaded.entries[0].provider, "acme");
    }

    #[tokio::test]
    async fn debug_logger_captures_and_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let logger = DebugLogger::new(dir.path().to_path_buf());

        logger.record_chunk("req_1", TapRole::Provider, &Bytes::from_static(b"data: {}\n\n"));
        logger.record_chunk("req_1", TapRole::Client, &Bytes::from_static(b"data: [DONE]\n\n"));

        assert_eq!(
            logger.captured("req_1", TapRole::Client).as_deref(),
            Some("data: [DONE]\n\n")
        );

        logger.flush("req_1").await;
        assert!(logger.captured("req_1", TapRole::Client).is_none());

        let trace = logger.query_by_id("req_1").await.unwrap().unwrap();
        assert_eq!(trace.provider_sse, "data: {}\n\n");

        logger.delete("req_1").await.unwrap();
        assert!(logger.query_by_id("req_1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn event_bus_delivers_to_subscribers() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit("cooldown_set", serde_json::json!({"provider": "acme"}));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, "cooldown_set");
        assert_eq!(event.payload["provider"], "acme");
    }
}
