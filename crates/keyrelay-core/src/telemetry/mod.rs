//! Performance log schema and persistence.
//!
//! Rows are append-only: the tracker writes them once and the
//! [`AggregationReader`](crate::aggregation::AggregationReader) reads them.

mod store;

pub use store::{JsonlLogStore, MemoryLogStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;
use thiserror::Error;

/// Errors from performance log stores.
#[derive(Error, Debug)]
pub enum LogStoreError {
    #[error("Log store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Log row serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Kind of tracked LLM call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Blocking completion
    Completion,

    /// Streaming completion
    StreamingCompletion,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Completion => "completion",
            Operation::StreamingCompletion => "streaming_completion",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tracked LLM call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceLogEntry {
    pub provider: String,
    pub model: String,
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Milliseconds to the first non-empty streamed chunk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_first_token: Option<f64>,

    pub total_duration_ms: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u32>,

    pub success: bool,

    /// `LlmErrorKind` tag, e.g. `RATE_LIMIT`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    pub timestamp: DateTime<Utc>,

    /// Request shape; never prompt text or stop-sequence contents
    #[serde(default)]
    pub metadata: Map<String, JsonValue>,
}

/// One tracked inbound API request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRequestLog {
    pub endpoint: String,
    pub method: String,
    pub status_code: u16,
    pub duration_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ApiRequestLog {
    /// 1xx-3xx responses count as successes.
    pub fn is_success(&self) -> bool {
        self.status_code < 400
    }
}

/// Append-only sink and time-ranged source for performance rows.
#[async_trait]
pub trait PerformanceLogStore: Send + Sync {
    /// Persist one LLM call row.
    async fn append_llm(&self, entry: &PerformanceLogEntry) -> Result<(), LogStoreError>;

    /// Persist one API request row.
    async fn append_api(&self, entry: &ApiRequestLog) -> Result<(), LogStoreError>;

    /// LLM rows with `timestamp >= since`, oldest first.
    async fn llm_entries(&self, since: DateTime<Utc>)
        -> Result<Vec<PerformanceLogEntry>, LogStoreError>;

    /// API rows with `timestamp >= since`, oldest first.
    async fn api_entries(&self, since: DateTime<Utc>) -> Result<Vec<ApiRequestLog>, LogStoreError>;
}
