//! Task failure signals derived from Warning events

use super::status::TaskLearningStatus;
use crate::tasks::types::Result;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Event;
use kube::api::{Api, ListParams};
use kube::Client;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;
use tracing::debug;

/// Keywords that mark an event message as a failure, in match priority order
const FAILURE_KEYWORDS: [&str; 9] = [
    "failed",
    "error",
    "execution failed",
    "runtime error",
    "panic",
    "exception",
    "timeout",
    "connection failed",
    "network error",
];

/// Failures included verbatim in an error context
const MAX_CONTEXT_FAILURES: usize = 5;

/// Assumed executions per hour when estimating the recent error rate
const ESTIMATED_HOURLY_EXECUTIONS: usize = 12;

const UNKNOWN_TASK: &str = "unknown";

lazy_static! {
    static ref QUOTED_TASK: Regex = Regex::new(r"(?i)task '([^']+)'").unwrap();
}

/// Error categories searched for in failure messages
const ERROR_CATEGORIES: [(&str, &[&str]); 6] = [
    ("network_connectivity", &["connection", "network", "timeout"]),
    ("auth_errors", &["unauthorized", "forbidden", "authentication"]),
    ("resource_exhaustion", &["resource", "memory", "disk"]),
    (
        "external_service_errors",
        &["api", "service unavailable", "500"],
    ),
    ("input_validation_errors", &["invalid", "validation", "format"]),
    ("runtime_logic_errors", &["nil pointer", "null", "undefined"]),
];

/// A parsed task failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub task_name: String,
    pub timestamp: DateTime<Utc>,
    pub error_message: String,
    /// First failure keyword found in the message
    pub error_type: String,
    pub context: String,
}

/// Load the agent's Warning events and parse them into failures grouped by task
pub async fn list_task_failures(
    client: Client,
    namespace: &str,
    agent_name: &str,
    lookback: Duration,
    now: DateTime<Utc>,
) -> Result<BTreeMap<String, Vec<TaskFailure>>> {
    let events: Api<Event> = Api::namespaced(client, namespace);
    let list = events
        .list(&ListParams::default().fields("type=Warning"))
        .await?;

    let failures = parse_task_failures(agent_name, &list.items, lookback, now);
    debug!(
        agent = %agent_name,
        events = list.items.len(),
        tasks_with_failures = failures.len(),
        "Parsed task failures from events"
    );
    Ok(failures)
}

/// Parse failures from events related to `agent_name` within `lookback` of `now`
pub fn parse_task_failures(
    agent_name: &str,
    events: &[Event],
    lookback: Duration,
    now: DateTime<Utc>,
) -> BTreeMap<String, Vec<TaskFailure>> {
    let cutoff = now - chrono::Duration::from_std(lookback).unwrap_or(chrono::Duration::zero());
    let mut grouped: BTreeMap<String, Vec<TaskFailure>> = BTreeMap::new();

    for event in events {
        if !is_agent_related(event, agent_name) {
            continue;
        }
        let Some(failure) = parse_task_failure(event) else {
            continue;
        };
        if failure.timestamp <= cutoff {
            continue;
        }
        grouped
            .entry(failure.task_name.clone())
            .or_default()
            .push(failure);
    }

    grouped
}

fn is_agent_related(event: &Event, agent_name: &str) -> bool {
    if agent_name.is_empty() {
        return false;
    }
    event
        .message
        .as_deref()
        .is_some_and(|m| m.contains(agent_name))
        || event
            .involved_object
            .name
            .as_deref()
            .is_some_and(|n| n.contains(agent_name))
}

/// Parse one event into a failure; `None` for non-Warning or non-failure events
pub fn parse_task_failure(event: &Event) -> Option<TaskFailure> {
    if event.type_.as_deref() != Some("Warning") {
        return None;
    }

    let message = event.message.clone().unwrap_or_default();
    let lowered = message.to_lowercase();
    let error_type = FAILURE_KEYWORDS
        .iter()
        .find(|keyword| lowered.contains(*keyword))?;

    let task_name = extract_task_name(&message).unwrap_or_else(|| UNKNOWN_TASK.to_string());

    Some(TaskFailure {
        task_name,
        timestamp: event_timestamp(event)?,
        error_message: message,
        error_type: (*error_type).to_string(),
        context: format!(
            "Event: {}/{}",
            event.reason.as_deref().unwrap_or_default(),
            event.involved_object.kind.as_deref().unwrap_or_default()
        ),
    })
}

fn event_timestamp(event: &Event) -> Option<DateTime<Utc>> {
    event
        .first_timestamp
        .as_ref()
        .map(|t| t.0)
        .or_else(|| event.last_timestamp.as_ref().map(|t| t.0))
        .or_else(|| event.event_time.as_ref().map(|t| t.0))
        .or_else(|| event.metadata.creation_timestamp.as_ref().map(|t| t.0))
}

/// Task name from `task 'name'` or `task name` in a message
pub fn extract_task_name(message: &str) -> Option<String> {
    if let Some(captures) = QUOTED_TASK.captures(message) {
        return Some(captures[1].to_string());
    }

    let words: Vec<&str> = message.split_whitespace().collect();
    words
        .windows(2)
        .filter(|pair| pair[0].eq_ignore_ascii_case("task"))
        .map(|pair| pair[1].trim_matches(|c| matches!(c, '\'' | ':' | ',' | '.')))
        .find(|candidate| !candidate.is_empty() && *candidate != "failed")
        .map(str::to_string)
}

/// Recount the failure streak for a task.
///
/// Only failures inside `window` and after the last observed success count. When
/// the newest failure is already stale the streak is zero.
pub fn update_consecutive_failures(
    status: &mut TaskLearningStatus,
    failures: &[TaskFailure],
    window: Duration,
    now: DateTime<Utc>,
) {
    let Some(newest) = failures.iter().max_by_key(|f| f.timestamp) else {
        return;
    };

    let cutoff = now - chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
    if newest.timestamp < cutoff {
        status.consecutive_failures = 0;
        return;
    }

    let streak_start = status
        .last_success_time
        .map_or(cutoff, |success| success.max(cutoff));

    let count = failures
        .iter()
        .filter(|f| f.timestamp >= cutoff && f.timestamp > streak_start)
        .count();

    status.consecutive_failures = u32::try_from(count).unwrap_or(u32::MAX);
    status.last_failure_time = Some(newest.timestamp);
    status.last_error_message = Some(newest.error_message.clone());
    status.failure_pattern = Some(newest.error_type.clone());

    debug!(
        task = %status.task_name,
        consecutive_failures = status.consecutive_failures,
        error_type = %newest.error_type,
        "Updated consecutive failures"
    );
}

/// Failures in the last hour over an assumed twelve executions, capped at 1.0
#[allow(clippy::cast_precision_loss)]
pub fn recent_error_rate(failures: &[TaskFailure], now: DateTime<Utc>) -> f64 {
    let cutoff = now - chrono::Duration::hours(1);
    let recent = failures.iter().filter(|f| f.timestamp > cutoff).count();
    if recent >= ESTIMATED_HOURLY_EXECUTIONS {
        return 1.0;
    }
    recent as f64 / ESTIMATED_HOURLY_EXECUTIONS as f64
}

/// Occurrence counts per error type and per message category
pub fn analyze_error_patterns(failures: &[TaskFailure]) -> BTreeMap<String, usize> {
    let mut patterns = BTreeMap::new();

    for failure in failures {
        if !failure.error_type.is_empty() {
            *patterns.entry(failure.error_type.clone()).or_insert(0) += 1;
        }

        let message = failure.error_message.to_lowercase();
        for (category, needles) in ERROR_CATEGORIES {
            if needles.iter().any(|n| message.contains(n)) {
                *patterns.entry(category.to_string()).or_insert(0) += 1;
            }
        }
    }

    patterns
}

/// Human-readable failure summary handed to the synthesizer
pub fn build_error_context(task_name: &str, failures: &[TaskFailure]) -> String {
    if failures.is_empty() {
        return "No recent failure data available".to_string();
    }

    let mut sorted: Vec<&TaskFailure> = failures.iter().collect();
    sorted.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    let mut text = format!(
        "Task '{task_name}' has encountered {} recent failures:\n\n",
        failures.len()
    );

    for (i, failure) in sorted.iter().take(MAX_CONTEXT_FAILURES).enumerate() {
        let _ = writeln!(
            text,
            "Failure {} (at {}):",
            i + 1,
            failure.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        );
        let _ = writeln!(text, "  Error Type: {}", failure.error_type);
        let _ = writeln!(text, "  Message: {}", failure.error_message);
        let _ = writeln!(text, "  Context: {}", failure.context);
        text.push('\n');
    }

    let patterns = analyze_error_patterns(failures);
    if !patterns.is_empty() {
        text.push_str("Common error patterns identified:\n");
        for (pattern, count) in &patterns {
            let _ = writeln!(text, "  - {pattern} (occurred {count} times)");
        }
        text.push('\n');
    }

    text.push_str(
        "Please analyze these failures and generate a more robust implementation of this task \
         that addresses the identified error patterns. Consider adding error handling, input \
         validation, timeouts, retries, or alternative approaches as appropriate.",
    );
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use k8s_openapi::api::core::v1::ObjectReference;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn event(type_: &str, object: &str, message: &str, at: DateTime<Utc>) -> Event {
        Event {
            type_: Some(type_.to_string()),
            message: Some(message.to_string()),
            reason: Some("BackOff".to_string()),
            involved_object: ObjectReference {
                kind: Some("Pod".to_string()),
                name: Some(object.to_string()),
                ..Default::default()
            },
            first_timestamp: Some(Time(at)),
            ..Default::default()
        }
    }

    fn failure(minutes_ago: i64) -> TaskFailure {
        TaskFailure {
            task_name: "fetch".to_string(),
            timestamp: now() - chrono::Duration::minutes(minutes_ago),
            error_message: format!("failure {minutes_ago}"),
            error_type: "failed".to_string(),
            context: String::new(),
        }
    }

    #[test]
    fn parses_quoted_task_name() {
        let e = event(
            "Warning",
            "bot-abc",
            "Task 'fetch_data' failed with timeout error",
            now(),
        );
        let f = parse_task_failure(&e).unwrap();
        assert_eq!(f.task_name, "fetch_data");
        assert_eq!(f.error_type, "failed");
        assert_eq!(f.context, "Event: BackOff/Pod");
    }

    #[test]
    fn parses_bare_task_name() {
        let e = event(
            "Warning",
            "bot",
            "Task process_data encountered runtime error: nil pointer",
            now(),
        );
        let f = parse_task_failure(&e).unwrap();
        assert_eq!(f.task_name, "process_data");
        assert_eq!(f.error_type, "error");
    }

    #[test]
    fn ignores_normal_and_non_failure_events() {
        assert!(parse_task_failure(&event("Normal", "bot", "Task x failed", now())).is_none());
        assert!(
            parse_task_failure(&event("Warning", "bot", "Pod started successfully", now()))
                .is_none()
        );
    }

    #[test]
    fn unknown_task_when_no_name() {
        let f = parse_task_failure(&event("Warning", "bot", "container panic", now())).unwrap();
        assert_eq!(f.task_name, "unknown");
        assert_eq!(f.error_type, "panic");
    }

    #[test]
    fn extract_rejects_failed_as_name() {
        assert_eq!(extract_task_name("task failed badly"), None);
        assert_eq!(
            extract_task_name("the task: sync, failed").as_deref(),
            None
        );
        assert_eq!(extract_task_name("Task sync, failed").as_deref(), Some("sync"));
    }

    #[test]
    fn filters_unrelated_and_stale_events() {
        let events = vec![
            event("Warning", "bot-1", "Task 'a' failed", now()),
            event("Warning", "other", "Task 'b' failed", now()),
            event("Warning", "other", "Task 'c' failed for bot", now()),
            event(
                "Warning",
                "bot-1",
                "Task 'd' failed",
                now() - chrono::Duration::hours(30),
            ),
        ];

        let grouped = parse_task_failures("bot", &events, Duration::from_secs(86_400), now());
        assert_eq!(grouped.keys().collect::<Vec<_>>(), vec!["a", "c"]);
    }

    #[test]
    fn recent_streak_counts_failures_in_window() {
        let mut status = TaskLearningStatus::new("fetch");
        update_consecutive_failures(
            &mut status,
            &[failure(10), failure(20), failure(30)],
            Duration::from_secs(7200),
            now(),
        );
        assert_eq!(status.consecutive_failures, 3);
        assert_eq!(status.last_error_message.as_deref(), Some("failure 10"));
        assert_eq!(status.failure_pattern.as_deref(), Some("failed"));
    }

    #[test]
    fn stale_newest_failure_resets_streak() {
        let mut status = TaskLearningStatus::new("fetch");
        status.consecutive_failures = 4;
        update_consecutive_failures(
            &mut status,
            &[failure(180)],
            Duration::from_secs(7200),
            now(),
        );
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.last_failure_time.is_none());
    }

    #[test]
    fn old_failures_outside_window_are_not_counted() {
        let mut status = TaskLearningStatus::new("fetch");
        update_consecutive_failures(
            &mut status,
            &[failure(10), failure(180), failure(20)],
            Duration::from_secs(7200),
            now(),
        );
        assert_eq!(status.consecutive_failures, 2);
    }

    #[test]
    fn success_after_failures_restarts_streak() {
        let mut status = TaskLearningStatus::new("fetch");
        status.last_success_time = Some(now() - chrono::Duration::minutes(15));
        update_consecutive_failures(
            &mut status,
            &[failure(10), failure(20), failure(30)],
            Duration::from_secs(7200),
            now(),
        );
        assert_eq!(status.consecutive_failures, 1);
    }

    #[test]
    fn error_rate_caps_at_one() {
        let few: Vec<_> = (0..3).map(|i| failure(i * 5)).collect();
        assert!((recent_error_rate(&few, now()) - 0.25).abs() < f64::EPSILON);

        let many: Vec<_> = (0..15).map(|i| failure(i)).collect();
        assert!((recent_error_rate(&many, now()) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn categorises_messages() {
        let mut f = failure(1);
        f.error_message = "connection timeout calling api".to_string();
        let patterns = analyze_error_patterns(&[f]);
        assert_eq!(patterns["failed"], 1);
        assert_eq!(patterns["network_connectivity"], 1);
        assert_eq!(patterns["external_service_errors"], 1);
        assert!(!patterns.contains_key("auth_errors"));
    }

    #[test]
    fn error_context_lists_newest_five() {
        let failures: Vec<_> = (1..=7).map(failure).collect();
        let text = build_error_context("fetch", &failures);
        assert!(text.starts_with("Task 'fetch' has encountered 7 recent failures:\n\n"));
        assert!(text.contains("Failure 1 (at 2025-03-01T11:59:00Z):"));
        assert!(text.contains("Failure 5 "));
        assert!(!text.contains("Failure 6 "));
        assert!(text.contains("  - failed (occurred 7 times)"));
        assert!(text.ends_with("alternative approaches as appropriate."));

        assert_eq!(
            build_error_context("fetch", &[]),
            "No recent failure data available"
        );
    }
}
