//! # Trace Ingestion
//!
//! Pluggable access to the telemetry backend holding agent execution spans.
//! Backends implement [`TraceAdapter`]; [`convert::spans_to_task_traces`] turns
//! their spans into the `TaskTrace` records the learning engine analyzes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

pub mod convert;
pub mod signoz;

pub use convert::spans_to_task_traces;
pub use signoz::SignozTraceAdapter;

/// Trace backend errors
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("HTTP request to trace backend failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Trace backend returned {status}: {body}")]
    Backend { status: u16, body: String },

    #[error("Trace backend response exceeds {limit} bytes")]
    ResponseTooLarge { limit: usize },

    #[error("Failed to decode trace backend response: {0}")]
    Decode(String),

    #[error("Invalid trace backend configuration: {0}")]
    Config(String),
}

/// Inclusive time window for span queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// Window ending now and reaching `lookback` into the past
    pub fn trailing(lookback: Duration, now: DateTime<Utc>) -> Self {
        let lookback = chrono::Duration::from_std(lookback).unwrap_or(chrono::Duration::zero());
        Self {
            start: now - lookback,
            end: now,
        }
    }
}

/// Criteria for a span query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpanFilter {
    pub task_name: Option<String>,
    pub time_range: Option<TimeRange>,
    pub trace_id: Option<String>,
    pub attributes: BTreeMap<String, String>,
    pub limit: usize,
}

/// Event recorded on a span
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanEvent {
    pub name: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub attributes: BTreeMap<String, String>,
}

/// One span as returned by a trace backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub span_id: String,
    pub trace_id: String,
    pub parent_span_id: Option<String>,
    pub operation_name: String,
    pub task_name: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration: Duration,
    /// `true` when the span completed without error
    pub status: bool,
    pub error_message: Option<String>,
    pub attributes: BTreeMap<String, String>,
    pub events: Vec<SpanEvent>,
}

/// Query interface over an execution-trace backend
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TraceAdapter: Send + Sync {
    /// Spans matching `filter`, newest first
    async fn query_spans(&self, filter: &SpanFilter) -> Result<Vec<Span>, TelemetryError>;

    /// Whether the backend is reachable; callers skip querying when it is not
    async fn available(&self) -> bool;

    /// Backend name for logs
    fn name(&self) -> &'static str;
}

/// Adapter used when no trace backend is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTraceAdapter;

#[async_trait]
impl TraceAdapter for NoopTraceAdapter {
    async fn query_spans(&self, _filter: &SpanFilter) -> Result<Vec<Span>, TelemetryError> {
        Ok(Vec::new())
    }

    async fn available(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}
