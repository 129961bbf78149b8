//! SigNoz query-API trace adapter

use super::{Span, SpanEvent, SpanFilter, TelemetryError, TimeRange, TraceAdapter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Default cap on response bodies (50 MiB)
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 50 * 1024 * 1024;

const AVAILABILITY_TTL: Duration = Duration::from_secs(30);
const API_KEY_HEADER: &str = "SIGNOZ-API-KEY";
const DEFAULT_LOOKBACK: Duration = Duration::from_secs(24 * 60 * 60);
const TASK_NAME_KEYS: [&str; 4] = ["task.name", "task_name", "function_name", "method_name"];

/// Trace adapter backed by the SigNoz Query Builder v5 API
pub struct SignozTraceAdapter {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    max_response_bytes: usize,
    availability: RwLock<Option<(Instant, bool)>>,
}

impl SignozTraceAdapter {
    pub fn new(endpoint: &str, api_key: String, timeout: Duration) -> Result<Self, TelemetryError> {
        let endpoint = endpoint.trim_end_matches('/').to_string();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(TelemetryError::Config(format!(
                "endpoint must be an http(s) URL, got '{endpoint}'"
            )));
        }

        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint,
            api_key,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
            availability: RwLock::new(None),
        })
    }

    #[must_use]
    pub fn with_max_response_bytes(mut self, limit: usize) -> Self {
        self.max_response_bytes = limit;
        self
    }

    async fn request(&self, method: reqwest::Method, path: &str, body: Option<&Value>) -> Result<Vec<u8>, TelemetryError> {
        let mut req = self
            .http
            .request(method, format!("{}{path}", self.endpoint))
            .header(API_KEY_HEADER, &self.api_key)
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await?;
        let status = resp.status();

        let mut buf = Vec::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if buf.len() + chunk.len() > self.max_response_bytes {
                return Err(TelemetryError::ResponseTooLarge {
                    limit: self.max_response_bytes,
                });
            }
            buf.extend_from_slice(&chunk);
        }

        if status.is_client_error() || status.is_server_error() {
            return Err(TelemetryError::Backend {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&buf).into_owned(),
            });
        }

        Ok(buf)
    }

    async fn check_availability(&self) -> bool {
        match self.request(reqwest::Method::GET, "/api/v1/version", None).await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "SigNoz availability check failed");
                false
            }
        }
    }
}

#[async_trait]
impl TraceAdapter for SignozTraceAdapter {
    async fn query_spans(&self, filter: &SpanFilter) -> Result<Vec<Span>, TelemetryError> {
        let payload = build_query_payload(filter, Utc::now());
        let body = self
            .request(reqwest::Method::POST, "/api/v5/query_range", Some(&payload))
            .await?;
        let spans = parse_span_response(&body, filter.limit)?;
        debug!(count = spans.len(), "Fetched spans from SigNoz");
        Ok(spans)
    }

    async fn available(&self) -> bool {
        if let Some((checked_at, value)) = *self.availability.read().await {
            if checked_at.elapsed() < AVAILABILITY_TTL {
                return value;
            }
        }

        let value = self.check_availability().await;
        *self.availability.write().await = Some((Instant::now(), value));
        value
    }

    fn name(&self) -> &'static str {
        "signoz"
    }
}

/// Quote-escape a value for a filter expression
pub fn escape_filter_value(value: &str) -> String {
    value.replace('\'', "''")
}

/// Build the v5 filter expression; conditions are joined with AND
pub fn build_filter_expression(filter: &SpanFilter) -> String {
    let mut conditions = Vec::new();

    if let Some(task) = filter.task_name.as_deref().filter(|t| !t.is_empty()) {
        let task = escape_filter_value(task);
        conditions.push(format!(
            "(attributes['task.name'] = '{task}' OR attributes['task_name'] = '{task}' OR operationName = '{task}')"
        ));
    }

    if let Some(trace_id) = filter.trace_id.as_deref().filter(|t| !t.is_empty()) {
        conditions.push(format!("traceID = '{}'", escape_filter_value(trace_id)));
    }

    for (key, value) in &filter.attributes {
        conditions.push(format!(
            "attributes['{}'] = '{}'",
            escape_filter_value(key),
            escape_filter_value(value)
        ));
    }

    conditions.join(" AND ")
}

/// Build the Query Builder v5 request body
pub fn build_query_payload(filter: &SpanFilter, now: DateTime<Utc>) -> Value {
    let range = filter
        .time_range
        .unwrap_or_else(|| TimeRange::trailing(DEFAULT_LOOKBACK, now));

    let select_fields: Vec<Value> = [
        "spanID",
        "traceID",
        "parentSpanID",
        "operationName",
        "timestamp",
        "duration",
        "statusCode",
        "attributes",
        "events",
    ]
    .iter()
    .map(|name| json!({ "name": name }))
    .collect();

    json!({
        "start": range.start.timestamp_millis(),
        "end": range.end.timestamp_millis(),
        "requestType": "raw",
        "variables": {},
        "compositeQuery": {
            "queries": [{
                "type": "builder_query",
                "spec": {
                    "name": "A",
                    "signal": "traces",
                    "filter": { "expression": build_filter_expression(filter) },
                    "selectFields": select_fields,
                    "order": [{ "key": { "name": "timestamp" }, "direction": "desc" }],
                    "limit": filter.limit,
                    "offset": 0,
                    "disabled": false
                }
            }]
        }
    })
}

/// Parse a query-range response into spans, honoring `limit` (0 = unlimited)
pub fn parse_span_response(body: &[u8], limit: usize) -> Result<Vec<Span>, TelemetryError> {
    let root: Value =
        serde_json::from_slice(body).map_err(|e| TelemetryError::Decode(e.to_string()))?;

    let results = root
        .pointer("/data/result")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut spans = Vec::new();
    for row in results.iter().flat_map(expand_result_row) {
        match row_to_span(row) {
            Some(span) => spans.push(span),
            None => warn!("Skipping malformed span row"),
        }
        if limit > 0 && spans.len() >= limit {
            break;
        }
    }
    Ok(spans)
}

/// v5 wraps rows as `{ "list": [{ "data": {...} }] }`; older responses inline them
fn expand_result_row(row: &Value) -> Vec<&Map<String, Value>> {
    match row.get("list").and_then(Value::as_array) {
        Some(list) => list
            .iter()
            .filter_map(|item| item.get("data").unwrap_or(item).as_object())
            .collect(),
        None => row.as_object().into_iter().collect(),
    }
}

fn row_to_span(row: &Map<String, Value>) -> Option<Span> {
    let str_field = |key: &str| row.get(key).and_then(Value::as_str).map(str::to_string);

    let span_id = str_field("spanID").or_else(|| str_field("span_id"))?;
    let operation_name = str_field("operationName")
        .or_else(|| str_field("name"))
        .unwrap_or_default();

    let start_time = row
        .get("timestamp")
        .and_then(parse_timestamp)
        .unwrap_or_else(Utc::now);

    let duration_nanos = row
        .get("duration")
        .or_else(|| row.get("durationNano"))
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let duration = Duration::from_nanos(duration_nanos.max(0.0) as u64);
    let end_time = start_time
        + chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());

    let status_code = row.get("statusCode").and_then(Value::as_i64).unwrap_or(0);
    let has_error = row.get("hasError").and_then(Value::as_bool).unwrap_or(false);
    let status = status_code < 400 && !has_error;

    let attributes = string_map(row.get("attributes"));
    let error_message = if status {
        None
    } else {
        attributes
            .get("error.message")
            .cloned()
            .or_else(|| Some(format!("Status code: {status_code}")))
    };

    let events = row
        .get("events")
        .and_then(Value::as_array)
        .map(|events| {
            events
                .iter()
                .filter_map(Value::as_object)
                .map(|event| SpanEvent {
                    name: event
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    timestamp: event.get("timestamp").and_then(parse_timestamp),
                    attributes: string_map(event.get("attributes")),
                })
                .collect()
        })
        .unwrap_or_default();

    let task_name = extract_task_name(&operation_name, &attributes);

    Some(Span {
        span_id,
        trace_id: str_field("traceID").unwrap_or_default(),
        parent_span_id: str_field("parentSpanID").filter(|p| !p.is_empty()),
        operation_name,
        task_name,
        start_time,
        end_time,
        duration,
        status,
        error_message,
        attributes,
        events,
    })
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(Value::as_object)
        .map(|obj| {
            obj.iter()
                .map(|(k, v)| {
                    let v = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), v)
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Task label from well-known attributes; `execute_task` spans may also use `task`
fn extract_task_name(operation_name: &str, attributes: &BTreeMap<String, String>) -> Option<String> {
    TASK_NAME_KEYS
        .iter()
        .filter_map(|key| attributes.get(*key))
        .find(|v| !v.is_empty())
        .cloned()
        .or_else(|| {
            (operation_name == super::convert::TASK_EXECUTION_OPERATION)
                .then(|| attributes.get("task").filter(|v| !v.is_empty()).cloned())
                .flatten()
        })
}
