//! Deterministic code templates used when the synthesis service is unavailable

use super::analyzer::{CommonPattern, PatternAnalysis};
use std::fmt::Write as _;

/// Code for a task learned from `analysis`: the analyzer's recommendation when
/// present, otherwise a template keyed off the dominant pattern
pub fn generate_learned_code(task_name: &str, analysis: &PatternAnalysis) -> String {
    match analysis.recommended_code.as_deref() {
        Some(code) if !code.trim().is_empty() => code.to_string(),
        _ => render_template(task_name, analysis),
    }
}

/// Render the template for `analysis.common_pattern`
pub fn render_template(task_name: &str, analysis: &PatternAnalysis) -> String {
    let mut code = String::new();
    let _ = writeln!(code, "task :{task_name} do |inputs|");
    let _ = writeln!(
        code,
        "  # Learned implementation (confidence: {:.2})",
        analysis.confidence
    );
    let _ = writeln!(code, "  # Pattern: {}", analysis.common_pattern);
    code.push_str("  \n");
    code.push_str(pattern_body(analysis.common_pattern));
    code.push_str("  \n");
    code.push_str("  { result: result }\n");
    code.push_str("end\n");
    code
}

fn pattern_body(pattern: CommonPattern) -> &'static str {
    match pattern {
        CommonPattern::DeterministicToolSequence => concat!(
            "  # Optimized tool sequence based on execution patterns\n",
            "  result = execute_optimized_sequence(inputs)\n",
        ),
        CommonPattern::SimpleTransformation => concat!(
            "  # Direct data transformation without tool calls\n",
            "  result = transform_data(inputs)\n",
        ),
        CommonPattern::ConditionalLogic => concat!(
            "  # Conditional logic based on input patterns\n",
            "  if condition_check(inputs)\n",
            "    result = primary_path(inputs)\n",
            "  else\n",
            "    result = alternative_path(inputs)\n",
            "  end\n",
        ),
        _ => concat!(
            "  # Generic optimization based on observed patterns\n",
            "  result = execute_learned_pattern(inputs)\n",
        ),
    }
}
