//! Pattern detection over a task's execution traces

use super::fallback;
use super::TaskTrace;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

/// Ceiling on reported confidence
pub const MAX_CONFIDENCE: f64 = 0.95;

/// Share of traces a single signature must exceed to count as dominant
const DOMINANT_SIGNATURE_RATIO: f64 = 0.7;
const DETERMINISTIC_SUCCESS_RATE: f64 = 0.8;
const MAX_DETERMINISTIC_VARIANTS: usize = 3;
const MIN_DETERMINISTIC_TRACES: usize = 3;
const RECOMMEND_CODE_CONFIDENCE: f64 = 0.7;
const TRANSFORMATION_KEYWORDS: [&str; 4] = ["transform", "convert", "process", "format"];

/// Classification of a task's dominant behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommonPattern {
    InsufficientData,
    NoPattern,
    SimpleToolSequence,
    ComplexToolSequence,
    DeterministicToolSequence,
    ConditionalLogic,
    SimpleTransformation,
    VariablePattern,
}

impl CommonPattern {
    pub fn as_str(self) -> &'static str {
        match self {
            CommonPattern::InsufficientData => "insufficient_data",
            CommonPattern::NoPattern => "no_pattern",
            CommonPattern::SimpleToolSequence => "simple_tool_sequence",
            CommonPattern::ComplexToolSequence => "complex_tool_sequence",
            CommonPattern::DeterministicToolSequence => "deterministic_tool_sequence",
            CommonPattern::ConditionalLogic => "conditional_logic",
            CommonPattern::SimpleTransformation => "simple_transformation",
            CommonPattern::VariablePattern => "variable_pattern",
        }
    }
}

impl std::fmt::Display for CommonPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of analyzing one task's traces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternAnalysis {
    pub task_name: String,
    pub is_deterministic: bool,
    /// In `[0, MAX_CONFIDENCE]`; zero only for an empty trace set
    pub confidence: f64,
    pub common_pattern: CommonPattern,
    pub consistency_score: f64,
    pub unique_pattern_count: usize,
    pub error_rate: f64,
    pub explanation: String,
    pub recommended_code: Option<String>,
}

/// Analyze the traces of one task
pub fn analyze_task_patterns(task_name: &str, traces: &[TaskTrace]) -> PatternAnalysis {
    if traces.is_empty() {
        return PatternAnalysis {
            task_name: task_name.to_string(),
            is_deterministic: false,
            confidence: 0.0,
            common_pattern: CommonPattern::InsufficientData,
            consistency_score: 0.0,
            unique_pattern_count: 0,
            error_rate: 0.0,
            explanation: "No execution traces available for analysis".to_string(),
            recommended_code: None,
        };
    }

    let signatures = tool_call_signatures(traces);
    let consistency_score = io_consistency(traces);
    let is_deterministic = is_deterministic(traces, &signatures);
    let confidence = pattern_confidence(traces, &signatures, consistency_score);
    let common_pattern = classify_pattern(&signatures);
    let error_rate = error_rate(traces);

    let mut analysis = PatternAnalysis {
        task_name: task_name.to_string(),
        is_deterministic,
        confidence,
        common_pattern,
        consistency_score,
        unique_pattern_count: unique_pattern_count(traces),
        error_rate,
        explanation: explain(task_name, traces.len(), confidence, is_deterministic, error_rate),
        recommended_code: None,
    };

    if confidence > RECOMMEND_CODE_CONFIDENCE && is_deterministic {
        analysis.recommended_code = Some(fallback::render_template(task_name, &analysis));
    }

    analysis
}

/// `tool.method` sequence of a trace joined by `->`
pub fn trace_signature(trace: &TaskTrace) -> String {
    trace
        .tool_calls
        .iter()
        .map(super::ToolCall::signature)
        .collect::<Vec<_>>()
        .join("->")
}

/// Frequency of each trace signature
pub fn tool_call_signatures(traces: &[TaskTrace]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for trace in traces {
        *counts.entry(trace_signature(trace)).or_insert(0) += 1;
    }
    counts
}

/// Most frequent signature; ties go to the lexicographically smallest
fn dominant_signature(signatures: &BTreeMap<String, usize>) -> Option<(&str, usize)> {
    let mut best: Option<(&str, usize)> = None;
    for (signature, &count) in signatures {
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((signature.as_str(), count));
        }
    }
    best
}

#[allow(clippy::cast_precision_loss)]
fn success_rate(traces: &[TaskTrace]) -> f64 {
    if traces.is_empty() {
        return 0.0;
    }
    traces.iter().filter(|t| t.success).count() as f64 / traces.len() as f64
}

/// Fraction of failed traces
pub fn error_rate(traces: &[TaskTrace]) -> f64 {
    if traces.is_empty() {
        return 0.0;
    }
    1.0 - success_rate(traces)
}

/// Input/output consistency proxy: success fraction, zero below two traces
fn io_consistency(traces: &[TaskTrace]) -> f64 {
    if traces.len() < 2 {
        return 0.0;
    }
    success_rate(traces)
}

#[allow(clippy::cast_precision_loss)]
fn is_deterministic(traces: &[TaskTrace], signatures: &BTreeMap<String, usize>) -> bool {
    if traces.len() < MIN_DETERMINISTIC_TRACES {
        return false;
    }

    let total = traces.len() as f64;
    if signatures
        .values()
        .any(|&count| count as f64 / total > DOMINANT_SIGNATURE_RATIO)
    {
        return true;
    }

    success_rate(traces) > DETERMINISTIC_SUCCESS_RATE && signatures.len() <= MAX_DETERMINISTIC_VARIANTS
}

#[allow(clippy::cast_precision_loss)]
fn pattern_confidence(
    traces: &[TaskTrace],
    signatures: &BTreeMap<String, usize>,
    io_consistency: f64,
) -> f64 {
    if traces.is_empty() {
        return 0.0;
    }

    let total = traces.len();
    let max_count = signatures.values().copied().max().unwrap_or(0);
    let frequency_ratio = max_count as f64 / total as f64;
    let combined = (frequency_ratio + io_consistency) / 2.0;

    let volume_bonus = match total {
        n if n >= 20 => 1.2,
        n if n >= 10 => 1.1,
        _ => 1.0,
    };

    (combined * volume_bonus).min(MAX_CONFIDENCE)
}

fn classify_pattern(signatures: &BTreeMap<String, usize>) -> CommonPattern {
    let Some((dominant, _)) = dominant_signature(signatures) else {
        return CommonPattern::NoPattern;
    };

    if dominant.contains("->") {
        return if dominant.matches("->").count() <= 2 {
            CommonPattern::SimpleToolSequence
        } else {
            CommonPattern::ComplexToolSequence
        };
    }

    match signatures.len() {
        1 => CommonPattern::DeterministicToolSequence,
        2..=3 => CommonPattern::ConditionalLogic,
        _ => {
            let lowered = dominant.to_lowercase();
            if TRANSFORMATION_KEYWORDS.iter().any(|k| lowered.contains(k)) {
                CommonPattern::SimpleTransformation
            } else {
                CommonPattern::VariablePattern
            }
        }
    }
}

/// Distinct (outcome, tool count, tool sequence) combinations
fn unique_pattern_count(traces: &[TaskTrace]) -> usize {
    traces
        .iter()
        .map(|trace| {
            let mut key = format!("success:{}|tools:{}", trace.success, trace.tool_calls.len());
            for call in &trace.tool_calls {
                key.push('|');
                key.push_str(&call.signature());
            }
            key
        })
        .collect::<BTreeSet<_>>()
        .len()
}

fn explain(
    task_name: &str,
    trace_count: usize,
    confidence: f64,
    is_deterministic: bool,
    error_rate: f64,
) -> String {
    let mut text = format!("Analysis of {trace_count} execution traces for task '{task_name}': ");

    text.push_str(if confidence > 0.8 {
        "Strong patterns detected. "
    } else if confidence > 0.6 {
        "Moderate patterns detected. "
    } else {
        "Weak or inconsistent patterns. "
    });

    text.push_str(if is_deterministic {
        "Task behavior is highly deterministic and suitable for symbolic optimization. "
    } else {
        "Task behavior shows variation that may limit optimization potential. "
    });

    if error_rate > 0.1 {
        let _ = write!(
            text,
            "Error rate of {:.1}% suggests optimization could improve reliability. ",
            error_rate * 100.0
        );
    } else {
        text.push_str("Low error rate indicates stable execution. ");
    }

    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learning::fixtures::trace;

    #[test]
    fn empty_traces_are_insufficient() {
        let analysis = analyze_task_patterns("noop", &[]);
        assert!(analysis.confidence.abs() < f64::EPSILON);
        assert_eq!(analysis.common_pattern, CommonPattern::InsufficientData);
        assert!(!analysis.is_deterministic);
        assert_eq!(analysis.unique_pattern_count, 0);
        assert_eq!(
            analysis.explanation,
            "No execution traces available for analysis"
        );
    }

    #[test]
    fn identical_two_step_traces_are_a_simple_sequence() {
        let traces: Vec<_> = (0..4)
            .map(|_| trace("fetch", true, &[("fetch", "get"), ("process", "transform")]))
            .collect();

        let analysis = analyze_task_patterns("fetch", &traces);
        assert!(analysis.is_deterministic);
        assert!((analysis.confidence - 0.95).abs() < 0.1);
        assert_eq!(analysis.common_pattern, CommonPattern::SimpleToolSequence);
        assert_eq!(analysis.unique_pattern_count, 1);
        assert!(analysis.recommended_code.is_some());
    }

    #[test]
    fn distinct_single_calls_with_failure_are_conditional() {
        let traces = vec![
            trace("route", true, &[("a", "x")]),
            trace("route", true, &[("b", "y")]),
            trace("route", false, &[("c", "z")]),
        ];

        let analysis = analyze_task_patterns("route", &traces);
        assert!(!analysis.is_deterministic);
        assert_eq!(analysis.common_pattern, CommonPattern::ConditionalLogic);
        assert!((analysis.confidence - 0.5).abs() < 0.1);
        assert!(analysis.recommended_code.is_none());
    }

    #[test]
    fn fewer_than_three_traces_never_deterministic() {
        let traces = vec![
            trace("t", true, &[("a", "x")]),
            trace("t", true, &[("a", "x")]),
        ];
        assert!(!analyze_task_patterns("t", &traces).is_deterministic);
    }

    #[test]
    fn single_trace_has_zero_consistency_but_positive_confidence() {
        let traces = vec![trace("t", true, &[("a", "x")])];
        let analysis = analyze_task_patterns("t", &traces);
        assert!(analysis.consistency_score.abs() < f64::EPSILON);
        assert!((analysis.confidence - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn high_success_with_few_variants_is_deterministic() {
        // No signature above 70%, but 100% success across 3 variants
        let traces = vec![
            trace("t", true, &[("a", "x")]),
            trace("t", true, &[("a", "x")]),
            trace("t", true, &[("b", "y")]),
            trace("t", true, &[("b", "y")]),
            trace("t", true, &[("c", "z")]),
        ];
        assert!(analyze_task_patterns("t", &traces).is_deterministic);
    }

    #[test]
    fn volume_bonus_applies_at_ten_and_twenty_traces() {
        let mixed = |n: usize| -> Vec<_> {
            (0..n)
                .map(|i| {
                    if i % 2 == 0 {
                        trace("t", true, &[("a", "x")])
                    } else {
                        trace("t", false, &[("b", "y")])
                    }
                })
                .collect()
        };

        // ratio 0.5, io 0.5 => 0.5 base
        assert!((analyze_task_patterns("t", &mixed(8)).confidence - 0.5).abs() < 1e-9);
        assert!((analyze_task_patterns("t", &mixed(10)).confidence - 0.55).abs() < 1e-9);
        assert!((analyze_task_patterns("t", &mixed(20)).confidence - 0.6).abs() < 1e-9);
    }

    #[test]
    fn long_chains_are_complex() {
        let traces = vec![trace(
            "t",
            true,
            &[("a", "1"), ("b", "2"), ("c", "3"), ("d", "4")],
        )];
        assert_eq!(
            analyze_task_patterns("t", &traces).common_pattern,
            CommonPattern::ComplexToolSequence
        );
    }

    #[test]
    fn single_signature_without_chain_is_deterministic_sequence() {
        let traces = vec![
            trace("t", true, &[("db", "query")]),
            trace("t", true, &[("db", "query")]),
        ];
        assert_eq!(
            analyze_task_patterns("t", &traces).common_pattern,
            CommonPattern::DeterministicToolSequence
        );
    }

    #[test]
    fn many_variants_with_keyword_are_transformations() {
        let mut traces = vec![
            trace("t", true, &[("json", "transform")]),
            trace("t", true, &[("json", "transform")]),
        ];
        traces.extend([
            trace("t", true, &[("a", "x")]),
            trace("t", true, &[("b", "y")]),
            trace("t", true, &[("c", "z")]),
        ]);
        assert_eq!(
            analyze_task_patterns("t", &traces).common_pattern,
            CommonPattern::SimpleTransformation
        );
    }

    #[test]
    fn many_variants_without_keyword_are_variable() {
        let traces = vec![
            trace("t", true, &[("a", "x")]),
            trace("t", true, &[("b", "y")]),
            trace("t", true, &[("c", "z")]),
            trace("t", true, &[("d", "w")]),
        ];
        assert_eq!(
            analyze_task_patterns("t", &traces).common_pattern,
            CommonPattern::VariablePattern
        );
    }

    #[test]
    fn explanation_reports_error_rate() {
        let traces = vec![
            trace("t", true, &[("a", "x")]),
            trace("t", false, &[("a", "x")]),
            trace("t", true, &[("a", "x")]),
            trace("t", true, &[("a", "x")]),
        ];
        let analysis = analyze_task_patterns("t", &traces);
        assert!((analysis.error_rate - 0.25).abs() < f64::EPSILON);
        assert!(analysis.explanation.contains("Error rate of 25.0%"));
        assert_eq!(analysis.unique_pattern_count, 2);
    }
}
