//! Query-time aggregation of performance log rows.
//!
//! Everything here is recomputed from the raw rows on each call; nothing is
//! written back. Percentiles use floor-indexed selection over ascending
//! samples:
//!
//! ```text
//! index = min(floor(count * p), count - 1)
//! ```
//!
//! so `[10, 20, 30, 40, 50]` gives p50 = 30 and p95 = 50. No interpolation.

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::telemetry::{
    ApiRequestLog, LogStoreError, Operation, PerformanceLogEntry, PerformanceLogStore,
};

/// How many failed calls the dashboard lists.
pub const RECENT_ERROR_LIMIT: usize = 10;

/// Select the `p` percentile of ascending `sorted` samples.
///
/// Returns `None` for an empty slice.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let index = ((sorted.len() as f64) * p).floor() as usize;
    Some(sorted[index.min(sorted.len() - 1)])
}

/// `successes / total`, or 0 when there were no requests.
pub fn success_rate(successes: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        successes as f64 / total as f64
    }
}

/// Look-back window for metrics queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TimeWindow {
    #[serde(rename = "1h")]
    LastHour,
    #[default]
    #[serde(rename = "24h")]
    LastDay,
    #[serde(rename = "7d")]
    LastWeek,
    #[serde(rename = "30d")]
    LastMonth,
}

impl TimeWindow {
    pub fn duration(&self) -> Duration {
        match self {
            TimeWindow::LastHour => Duration::hours(1),
            TimeWindow::LastDay => Duration::hours(24),
            TimeWindow::LastWeek => Duration::days(7),
            TimeWindow::LastMonth => Duration::days(30),
        }
    }

    /// Oldest timestamp inside the window ending at `now`.
    pub fn start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.duration()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeWindow::LastHour => "1h",
            TimeWindow::LastDay => "24h",
            TimeWindow::LastWeek => "7d",
            TimeWindow::LastMonth => "30d",
        }
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeWindow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1h" => Ok(TimeWindow::LastHour),
            "24h" | "1d" => Ok(TimeWindow::LastDay),
            "7d" => Ok(TimeWindow::LastWeek),
            "30d" => Ok(TimeWindow::LastMonth),
            other => Err(format!(
                "unknown time window '{}' (expected 1h, 24h, 7d or 30d)",
                other
            )),
        }
    }
}

/// Count, mean and floor-indexed percentiles of a latency sample.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LatencySummary {
    pub count: usize,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

impl LatencySummary {
    /// Summarize samples in any order. An empty sample is all zeros.
    pub fn from_samples(mut samples: Vec<f64>) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        samples.sort_by(f64::total_cmp);

        let count = samples.len();
        let sum: f64 = samples.iter().sum();
        Self {
            count,
            avg_ms: sum / count as f64,
            p50_ms: percentile(&samples, 0.50).unwrap_or_default(),
            p95_ms: percentile(&samples, 0.95).unwrap_or_default(),
            p99_ms: percentile(&samples, 0.99).unwrap_or_default(),
        }
    }
}

/// Metrics for one `(provider, model, operation)` group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmPerformanceMetrics {
    pub provider: String,
    pub model: String,
    pub operation: Operation,
    pub request_count: usize,
    pub success_count: usize,
    pub success_rate: f64,
    pub latency: LatencySummary,
    /// Mean time to first token over rows that recorded one
    pub avg_time_to_first_token_ms: Option<f64>,
    pub total_tokens: u64,
}

/// Metrics for one `(endpoint, method)` group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiPerformanceMetrics {
    pub endpoint: String,
    pub method: String,
    pub request_count: usize,
    pub success_count: usize,
    pub success_rate: f64,
    pub latency: LatencySummary,
}

/// Group LLM rows by `(provider, model, operation)`, sorted by that key.
pub fn llm_metrics(entries: &[PerformanceLogEntry]) -> Vec<LlmPerformanceMetrics> {
    let mut groups: BTreeMap<(&str, &str, Operation), Vec<&PerformanceLogEntry>> = BTreeMap::new();
    for entry in entries {
        groups
            .entry((entry.provider.as_str(), entry.model.as_str(), entry.operation))
            .or_default()
            .push(entry);
    }

    groups
        .into_iter()
        .map(|((provider, model, operation), rows)| {
            let success_count = rows.iter().filter(|e| e.success).count();
            let ttfts: Vec<f64> = rows.iter().filter_map(|e| e.time_to_first_token).collect();
            LlmPerformanceMetrics {
                provider: provider.to_string(),
                model: model.to_string(),
                operation,
                request_count: rows.len(),
                success_count,
                success_rate: success_rate(success_count, rows.len()),
                latency: LatencySummary::from_samples(
                    rows.iter().map(|e| e.total_duration_ms).collect(),
                ),
                avg_time_to_first_token_ms: mean(&ttfts),
                total_tokens: rows.iter().filter_map(|e| e.token_count).map(u64::from).sum(),
            }
        })
        .collect()
}

/// Group API rows by `(endpoint, method)`, sorted by that key.
pub fn api_metrics(entries: &[ApiRequestLog]) -> Vec<ApiPerformanceMetrics> {
    let mut groups: BTreeMap<(&str, &str), Vec<&ApiRequestLog>> = BTreeMap::new();
    for entry in entries {
        groups
            .entry((entry.endpoint.as_str(), entry.method.as_str()))
            .or_default()
            .push(entry);
    }

    groups
        .into_iter()
        .map(|((endpoint, method), rows)| {
            let success_count = rows.iter().filter(|e| e.is_success()).count();
            ApiPerformanceMetrics {
                endpoint: endpoint.to_string(),
                method: method.to_string(),
                request_count: rows.len(),
                success_count,
                success_rate: success_rate(success_count, rows.len()),
                latency: LatencySummary::from_samples(rows.iter().map(|e| e.duration_ms).collect()),
            }
        })
        .collect()
}

/// Request volume for one clock hour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyBucket {
    pub hour: DateTime<Utc>,
    pub llm_requests: usize,
    pub llm_errors: usize,
    pub api_requests: usize,
    pub avg_llm_latency_ms: f64,
}

/// One failed LLM call, for the dashboard error list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentError {
    pub timestamp: DateTime<Utc>,
    pub provider: String,
    pub model: String,
    pub operation: Operation,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

/// Everything a dashboard shows for one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardData {
    pub window: TimeWindow,
    pub generated_at: DateTime<Utc>,
    pub total_llm_requests: usize,
    pub total_api_requests: usize,
    pub llm_success_rate: f64,
    pub api_success_rate: f64,
    pub llm_latency: LatencySummary,
    pub total_tokens: u64,
    pub active_providers: usize,
    pub hourly: Vec<HourlyBucket>,
    pub errors_by_kind: BTreeMap<String, usize>,
    /// Newest first
    pub recent_errors: Vec<RecentError>,
    pub llm: Vec<LlmPerformanceMetrics>,
    pub api: Vec<ApiPerformanceMetrics>,
}

/// Build dashboard data from rows already limited to `window`.
pub fn dashboard(
    window: TimeWindow,
    now: DateTime<Utc>,
    llm_rows: &[PerformanceLogEntry],
    api_rows: &[ApiRequestLog],
) -> DashboardData {
    let llm_successes = llm_rows.iter().filter(|e| e.success).count();
    let api_successes = api_rows.iter().filter(|e| e.is_success()).count();

    let mut errors_by_kind = BTreeMap::new();
    for entry in llm_rows.iter().filter(|e| !e.success) {
        let kind = entry.error_kind.clone().unwrap_or_else(|| "UNKNOWN".to_string());
        *errors_by_kind.entry(kind).or_insert(0) += 1;
    }

    let mut failures: Vec<&PerformanceLogEntry> = llm_rows.iter().filter(|e| !e.success).collect();
    failures.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    let recent_errors = failures
        .into_iter()
        .take(RECENT_ERROR_LIMIT)
        .map(|e| RecentError {
            timestamp: e.timestamp,
            provider: e.provider.clone(),
            model: e.model.clone(),
            operation: e.operation,
            error_kind: e.error_kind.clone(),
            error_message: e.error_message.clone(),
        })
        .collect();

    let active_providers = llm_rows
        .iter()
        .map(|e| e.provider.as_str())
        .collect::<HashSet<_>>()
        .len();

    DashboardData {
        window,
        generated_at: now,
        total_llm_requests: llm_rows.len(),
        total_api_requests: api_rows.len(),
        llm_success_rate: success_rate(llm_successes, llm_rows.len()),
        api_success_rate: success_rate(api_successes, api_rows.len()),
        llm_latency: LatencySummary::from_samples(
            llm_rows.iter().map(|e| e.total_duration_ms).collect(),
        ),
        total_tokens: llm_rows.iter().filter_map(|e| e.token_count).map(u64::from).sum(),
        active_providers,
        hourly: hourly_buckets(llm_rows, api_rows),
        errors_by_kind,
        recent_errors,
        llm: llm_metrics(llm_rows),
        api: api_metrics(api_rows),
    }
}

fn hourly_buckets(llm_rows: &[PerformanceLogEntry], api_rows: &[ApiRequestLog]) -> Vec<HourlyBucket> {
    #[derive(Default)]
    struct Acc {
        llm: usize,
        errors: usize,
        api: usize,
        latency_sum: f64,
    }

    let mut hours: BTreeMap<DateTime<Utc>, Acc> = BTreeMap::new();
    for entry in llm_rows {
        let acc = hours.entry(truncate_to_hour(entry.timestamp)).or_default();
        acc.llm += 1;
        acc.latency_sum += entry.total_duration_ms;
        if !entry.success {
            acc.errors += 1;
        }
    }
    for entry in api_rows {
        hours.entry(truncate_to_hour(entry.timestamp)).or_default().api += 1;
    }

    hours
        .into_iter()
        .map(|(hour, acc)| HourlyBucket {
            hour,
            llm_requests: acc.llm,
            llm_errors: acc.errors,
            api_requests: acc.api,
            avg_llm_latency_ms: if acc.llm == 0 {
                0.0
            } else {
                acc.latency_sum / acc.llm as f64
            },
        })
        .collect()
}

fn truncate_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(Duration::hours(1)).unwrap_or(ts)
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// What a [`PerformanceAggregate`] measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    LlmLatency,
    LlmTtft,
    ApiLatency,
    SuccessRate,
}

/// Derived metric row. Recomputable from the log, never a source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceAggregate {
    pub metric_type: MetricType,
    /// `provider/model/operation` or `METHOD endpoint`
    pub metric_target: String,
    pub time_window: TimeWindow,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub sample_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p50: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p95: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p99: Option<f64>,
}

impl PerformanceAggregate {
    fn latency(
        metric_type: MetricType,
        target: String,
        window: TimeWindow,
        now: DateTime<Utc>,
        summary: &LatencySummary,
    ) -> Self {
        Self {
            metric_type,
            metric_target: target,
            time_window: window,
            timestamp: now,
            value: summary.avg_ms,
            sample_count: summary.count,
            p50: Some(summary.p50_ms),
            p95: Some(summary.p95_ms),
            p99: Some(summary.p99_ms),
        }
    }

    fn rate(target: String, window: TimeWindow, now: DateTime<Utc>, rate: f64, count: usize) -> Self {
        Self {
            metric_type: MetricType::SuccessRate,
            metric_target: target,
            time_window: window,
            timestamp: now,
            value: rate,
            sample_count: count,
            p50: None,
            p95: None,
            p99: None,
        }
    }
}

/// Aggregate rows for every LLM and API target seen in the window.
pub fn aggregates(
    window: TimeWindow,
    now: DateTime<Utc>,
    llm_rows: &[PerformanceLogEntry],
    api_rows: &[ApiRequestLog],
) -> Vec<PerformanceAggregate> {
    let mut out = Vec::new();

    for m in llm_metrics(llm_rows) {
        let target = format!("{}/{}/{}", m.provider, m.model, m.operation);
        out.push(PerformanceAggregate::latency(
            MetricType::LlmLatency,
            target.clone(),
            window,
            now,
            &m.latency,
        ));

        let ttfts: Vec<f64> = llm_rows
            .iter()
            .filter(|e| e.provider == m.provider && e.model == m.model && e.operation == m.operation)
            .filter_map(|e| e.time_to_first_token)
            .collect();
        if !ttfts.is_empty() {
            out.push(PerformanceAggregate::latency(
                MetricType::LlmTtft,
                target.clone(),
                window,
                now,
                &LatencySummary::from_samples(ttfts),
            ));
        }

        out.push(PerformanceAggregate::rate(
            target,
            window,
            now,
            m.success_rate,
            m.request_count,
        ));
    }

    for m in api_metrics(api_rows) {
        let target = format!("{} {}", m.method, m.endpoint);
        out.push(PerformanceAggregate::latency(
            MetricType::ApiLatency,
            target.clone(),
            window,
            now,
            &m.latency,
        ));
        out.push(PerformanceAggregate::rate(
            target,
            window,
            now,
            m.success_rate,
            m.request_count,
        ));
    }

    out
}

/// Reads rows from a [`PerformanceLogStore`] and summarizes them.
#[derive(Clone)]
pub struct AggregationReader {
    store: Arc<dyn PerformanceLogStore>,
}

impl AggregationReader {
    pub fn new(store: Arc<dyn PerformanceLogStore>) -> Self {
        Self { store }
    }

    /// Per-`(endpoint, method)` metrics over `window`.
    pub async fn api_performance_metrics(
        &self,
        window: TimeWindow,
    ) -> Result<Vec<ApiPerformanceMetrics>, LogStoreError> {
        let rows = self.store.api_entries(window.start(Utc::now())).await?;
        Ok(api_metrics(&rows))
    }

    /// Per-`(provider, model, operation)` metrics over `window`.
    pub async fn llm_performance_metrics(
        &self,
        window: TimeWindow,
    ) -> Result<Vec<LlmPerformanceMetrics>, LogStoreError> {
        let rows = self.store.llm_entries(window.start(Utc::now())).await?;
        Ok(llm_metrics(&rows))
    }

    pub async fn dashboard_data(&self, window: TimeWindow) -> Result<DashboardData, LogStoreError> {
        let now = Utc::now();
        let since = window.start(now);
        let llm_rows = self.store.llm_entries(since).await?;
        let api_rows = self.store.api_entries(since).await?;
        Ok(dashboard(window, now, &llm_rows, &api_rows))
    }

    pub async fn aggregates(
        &self,
        window: TimeWindow,
    ) -> Result<Vec<PerformanceAggregate>, LogStoreError> {
        let now = Utc::now();
        let since = window.start(now);
        let llm_rows = self.store.llm_entries(since).await?;
        let api_rows = self.store.api_entries(since).await?;
        Ok(aggregates(window, now, &llm_rows, &api_rows))
    }
}

impl fmt::Debug for AggregationReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregationReader").finish_non_exhaustive()
    }
}
