//! Span → `TaskTrace` conversion

use super::Span;
use crate::learning::{TaskTrace, ToolCall};
use std::collections::{BTreeMap, HashMap};

/// Operation name of spans that wrap one task execution
pub const TASK_EXECUTION_OPERATION: &str = "execute_task";

const TASK_NAME_ATTRIBUTES: [&str; 2] = ["task.name", "task_name"];

/// Convert task-execution spans into traces. Spans without a task label are
/// dropped; child spans carrying `tool.name` become the trace's tool calls.
pub fn spans_to_task_traces(spans: &[Span]) -> Vec<TaskTrace> {
    let mut children: HashMap<&str, Vec<&Span>> = HashMap::new();
    for span in spans {
        if let Some(parent) = span.parent_span_id.as_deref().filter(|p| !p.is_empty()) {
            children.entry(parent).or_default().push(span);
        }
    }

    spans
        .iter()
        .filter(|span| span.operation_name == TASK_EXECUTION_OPERATION)
        .filter_map(|span| {
            let task_name = task_name_of(span)?;
            let tool_calls = children
                .get(span.span_id.as_str())
                .map(|c| tool_calls_from(c))
                .unwrap_or_default();

            let duration = if span.duration.is_zero() {
                (span.end_time - span.start_time).to_std().unwrap_or_default()
            } else {
                span.duration
            };

            Some(TaskTrace {
                task_name,
                timestamp: span.start_time,
                inputs: json_object_attribute(span, "task.inputs"),
                outputs: json_object_attribute(span, "task.outputs"),
                tool_calls,
                duration,
                success: span.status,
                error_message: span
                    .error_message
                    .clone()
                    .or_else(|| span.attributes.get("error.message").cloned())
                    .filter(|m| !m.is_empty()),
            })
        })
        .collect()
}

fn task_name_of(span: &Span) -> Option<String> {
    span.task_name
        .iter()
        .chain(
            TASK_NAME_ATTRIBUTES
                .iter()
                .filter_map(|key| span.attributes.get(*key)),
        )
        .find(|name| !name.trim().is_empty())
        .cloned()
}

fn tool_calls_from(children: &[&Span]) -> Vec<ToolCall> {
    let mut tools: Vec<&Span> = children
        .iter()
        .copied()
        .filter(|s| s.attributes.get("tool.name").is_some_and(|n| !n.is_empty()))
        .collect();
    tools.sort_by_key(|s| s.start_time);

    tools
        .into_iter()
        .map(|s| ToolCall {
            tool_name: s.attributes.get("tool.name").cloned().unwrap_or_default(),
            method: s
                .attributes
                .get("tool.method")
                .filter(|m| !m.is_empty())
                .cloned()
                .unwrap_or_else(|| s.operation_name.clone()),
            parameters: json_object_attribute(s, "tool.parameters"),
            result: s
                .attributes
                .get("tool.result")
                .map(|raw| {
                    serde_json::from_str(raw)
                        .unwrap_or_else(|_| serde_json::Value::String(raw.clone()))
                })
                .unwrap_or(serde_json::Value::Null),
            duration: s.duration,
            success: s.status,
        })
        .collect()
}

/// Parse a JSON-object attribute; missing or malformed values yield an empty map
fn json_object_attribute(span: &Span, key: &str) -> BTreeMap<String, serde_json::Value> {
    span.attributes
        .get(key)
        .and_then(|raw| serde_json::from_str::<BTreeMap<String, serde_json::Value>>(raw).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn span(id: &str, parent: Option<&str>, op: &str, task: Option<&str>, secs: u32) -> Span {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, secs).unwrap();
        Span {
            span_id: id.to_string(),
            trace_id: "trace-1".to_string(),
            parent_span_id: parent.map(str::to_string),
            operation_name: op.to_string(),
            task_name: task.map(str::to_string),
            start_time: start,
            end_time: start + chrono::Duration::seconds(2),
            duration: Duration::from_secs(2),
            status: true,
            error_message: None,
            attributes: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    #[test]
    fn keeps_only_labelled_task_execution_spans() {
        let mut task = span("span-1", None, "execute_task", Some("fetch_data"), 0);
        task.attributes
            .insert("task.inputs".to_string(), r#"{"id": 123}"#.to_string());
        task.attributes
            .insert("task.outputs".to_string(), "not json".to_string());

        let spans = vec![
            task,
            span("span-2", None, "tool_call", Some("database_query"), 1),
            span("span-3", None, "execute_task", Some(""), 2),
        ];

        let traces = spans_to_task_traces(&spans);
        assert_eq!(traces.len(), 1);

        let trace = &traces[0];
        assert_eq!(trace.task_name, "fetch_data");
        assert_eq!(trace.duration, Duration::from_secs(2));
        assert!(trace.success);
        assert!(trace.error_message.is_none());
        assert_eq!(trace.inputs["id"], serde_json::json!(123));
        assert!(trace.outputs.is_empty());
        assert!(trace.tool_calls.is_empty());
    }

    #[test]
    fn task_name_falls_back_to_attributes() {
        let mut task = span("span-1", None, "execute_task", None, 0);
        task.attributes
            .insert("task_name".to_string(), "summarize".to_string());

        let traces = spans_to_task_traces(&[task]);
        assert_eq!(traces[0].task_name, "summarize");
    }

    #[test]
    fn child_tool_spans_become_ordered_tool_calls() {
        let task = span("root", None, "execute_task", Some("sync"), 0);

        let mut second = span("c2", Some("root"), "POST /items", None, 5);
        second
            .attributes
            .insert("tool.name".to_string(), "http".to_string());
        second.status = false;

        let mut first = span("c1", Some("root"), "query", None, 1);
        first
            .attributes
            .insert("tool.name".to_string(), "database".to_string());
        first
            .attributes
            .insert("tool.method".to_string(), "select".to_string());
        first
            .attributes
            .insert("tool.result".to_string(), r#"{"rows": 2}"#.to_string());

        let unrelated = span("c3", Some("root"), "log", None, 3);

        let traces = spans_to_task_traces(&[task, second, first, unrelated]);
        let calls = &traces[0].tool_calls;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].signature(), "database.select");
        assert_eq!(calls[0].result, serde_json::json!({"rows": 2}));
        assert_eq!(calls[1].signature(), "http.POST /items");
        assert!(!calls[1].success);
    }

    #[test]
    fn failed_span_carries_error_message() {
        let mut task = span("root", None, "execute_task", Some("sync"), 0);
        task.status = false;
        task.attributes
            .insert("error.message".to_string(), "timeout".to_string());

        let traces = spans_to_task_traces(&[task]);
        assert!(!traces[0].success);
        assert_eq!(traces[0].error_message.as_deref(), Some("timeout"));
    }
}
