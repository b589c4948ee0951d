//! Performance log store implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{ApiRequestLog, LogStoreError, PerformanceLogEntry, PerformanceLogStore};

/// LLM call rows file name.
pub const LLM_LOG_FILE: &str = "llm_requests.jsonl";

/// API request rows file name.
pub const API_LOG_FILE: &str = "api_requests.jsonl";

/// In-memory log store.
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    llm: RwLock<Vec<PerformanceLogEntry>>,
    api: RwLock<Vec<ApiRequestLog>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every LLM row.
    pub fn llm_snapshot(&self) -> Vec<PerformanceLogEntry> {
        self.llm.read().clone()
    }

    /// Snapshot of every API row.
    pub fn api_snapshot(&self) -> Vec<ApiRequestLog> {
        self.api.read().clone()
    }
}

#[async_trait]
impl PerformanceLogStore for MemoryLogStore {
    async fn append_llm(&self, entry: &PerformanceLogEntry) -> Result<(), LogStoreError> {
        self.llm.write().push(entry.clone());
        Ok(())
    }

    async fn append_api(&self, entry: &ApiRequestLog) -> Result<(), LogStoreError> {
        self.api.write().push(entry.clone());
        Ok(())
    }

    async fn llm_entries(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<PerformanceLogEntry>, LogStoreError> {
        let mut rows: Vec<_> = self
            .llm
            .read()
            .iter()
            .filter(|e| e.timestamp >= since)
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.timestamp);
        Ok(rows)
    }

    async fn api_entries(&self, since: DateTime<Utc>) -> Result<Vec<ApiRequestLog>, LogStoreError> {
        let mut rows: Vec<_> = self
            .api
            .read()
            .iter()
            .filter(|e| e.timestamp >= since)
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.timestamp);
        Ok(rows)
    }
}

/// JSON Lines log store: one row per line, one file per row type.
#[derive(Debug)]
pub struct JsonlLogStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlLogStore {
    /// Create a store writing under `dir` (created on first append).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn append_line<T: Serialize>(&self, file: &str, row: &T) -> Result<(), LogStoreError> {
        let mut line = serde_json::to_vec(row)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut handle = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(file))
            .await?;
        handle.write_all(&line).await?;
        handle.flush().await?;
        Ok(())
    }

    async fn read_rows<T: DeserializeOwned>(&self, file: &str) -> Result<Vec<T>, LogStoreError> {
        let raw = match tokio::fs::read_to_string(self.dir.join(file)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut rows = Vec::new();
        for (index, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(row) => rows.push(row),
                // A torn trailing line from a crash mid-append is skipped
                Err(e) => tracing::warn!(file, line = index + 1, error = %e, "Skipping malformed log row"),
            }
        }
        Ok(rows)
    }
}

#[async_trait]
impl PerformanceLogStore for JsonlLogStore {
    async fn append_llm(&self, entry: &PerformanceLogEntry) -> Result<(), LogStoreError> {
        self.append_line(LLM_LOG_FILE, entry).await
    }

    async fn append_api(&self, entry: &ApiRequestLog) -> Result<(), LogStoreError> {
        self.append_line(API_LOG_FILE, entry).await
    }

    async fn llm_entries(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<PerformanceLogEntry>, LogStoreError> {
        let mut rows: Vec<PerformanceLogEntry> = self.read_rows(LLM_LOG_FILE).await?;
        rows.retain(|e| e.timestamp >= since);
        rows.sort_by_key(|e| e.timestamp);
        Ok(rows)
    }

    async fn api_entries(&self, since: DateTime<Utc>) -> Result<Vec<ApiRequestLog>, LogStoreError> {
        let mut rows: Vec<ApiRequestLog> = self.read_rows(API_LOG_FILE).await?;
        rows.retain(|e| e.timestamp >= since);
        rows.sort_by_key(|e| e.timestamp);
        Ok(rows)
    }
}
