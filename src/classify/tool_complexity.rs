//! Tool-call complexity analysis.
//!
//! Only computed when the request carries tools. Eight signals, each with a
//! fixed weight, summed and banded into the same five levels used for text
//! complexity. Hard and expert tool calls skip the drafter entirely.

use crate::classify::complexity::Complexity;
use crate::tools::ToolSpec;

/// Per-signal contributions for one analysis.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ToolSignals {
    pub tool_count: f64,
    pub parameter_fanout: f64,
    pub chaining: f64,
    pub conditional: f64,
    pub aggregation: f64,
    pub multi_entity: f64,
    pub multi_step: f64,
    pub references_tool_output: f64,
}

impl ToolSignals {
    pub fn total(&self) -> f64 {
        self.tool_count
            + self.parameter_fanout
            + self.chaining
            + self.conditional
            + self.aggregation
            + self.multi_entity
            + self.multi_step
            + self.references_tool_output
    }
}

/// Result of a tool-complexity analysis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToolComplexityEstimate {
    pub level: Complexity,
    pub score: f64,
    pub signals: ToolSignals,
}

const CHAINING_VERBS: &[&str] = &["then", "after", "afterwards", "next", "followed by"];
const CONDITIONAL_VERBS: &[&str] = &["if", "otherwise", "unless", "depending", "in case"];
const AGGREGATION_VERBS: &[&str] = &["compare", "combine", "aggregate", "merge", "summarize across"];
const TOOL_OUTPUT_REFERENCES: &[&str] =
    &["the result", "the output", "that response", "previous call", "use it to"];

/// Analyze the complexity of a tool-calling request.
pub fn analyze(query: &str, tools: &[ToolSpec], multi_turn: bool) -> ToolComplexityEstimate {
    let lower = query.to_lowercase();

    let signals = ToolSignals {
        tool_count: match tools.len() {
            0 | 1 => 0.0,
            2 | 3 => 1.0,
            _ => 2.0,
        },
        parameter_fanout: {
            let fanout: usize = tools.iter().map(ToolSpec::parameter_fanout).sum();
            match fanout {
                0..=4 => 0.0,
                5..=10 => 0.5,
                _ => 1.0,
            }
        },
        chaining: count_phrases(&lower, CHAINING_VERBS).min(2) as f64 * 1.0,
        conditional: count_phrases(&lower, CONDITIONAL_VERBS).min(2) as f64 * 1.0,
        aggregation: count_phrases(&lower, AGGREGATION_VERBS).min(2) as f64 * 1.0,
        multi_entity: if entity_list_count(query) >= 3 { 1.0 } else { 0.0 },
        multi_step: if has_numbered_steps(query) { 1.0 } else { 0.0 },
        references_tool_output: if multi_turn && count_phrases(&lower, TOOL_OUTPUT_REFERENCES) > 0 {
            1.0
        } else {
            0.0
        },
    };

    let score = signals.total();
    let level = match score {
        s if s <= 0.5 => Complexity::Trivial,
        s if s <= 1.5 => Complexity::Simple,
        s if s <= 3.0 => Complexity::Moderate,
        s if s <= 4.5 => Complexity::Hard,
        _ => Complexity::Expert,
    };

    ToolComplexityEstimate { level, score, signals }
}

fn count_phrases(haystack: &str, phrases: &[&str]) -> usize {
    phrases
        .iter()
        .filter(|p| {
            let mut start = 0;
            while let Some(pos) = haystack[start..].find(*p) {
                let abs = start + pos;
                let before_ok = abs == 0
                    || !haystack[..abs]
                        .chars()
                        .next_back()
                        .is_some_and(char::is_alphanumeric);
                let end = abs + p.len();
                let after_ok = end >= haystack.len()
                    || !haystack[end..].chars().next().is_some_and(char::is_alphanumeric);
                if before_ok && after_ok {
                    return true;
                }
                start = abs + 1;
            }
            false
        })
        .count()
}

/// Count comma/"and" separated mentions — a proxy for multi-entity requests
/// like "for Paris, Berlin and Madrid".
fn entity_list_count(query: &str) -> usize {
    let commas = query.matches(", ").count();
    let ands = query
        .split_whitespace()
        .filter(|w| w.eq_ignore_ascii_case("and"))
        .count();
    commas + ands + 1
}

fn has_numbered_steps(query: &str) -> bool {
    let numbered = query
        .lines()
        .filter(|line| {
            let t = line.trim_start();
            t.len() >= 3 && t.chars().next().is_some_and(|c| c.is_ascii_digit()) && {
                let rest = &t[1..];
                rest.starts_with(". ") || rest.starts_with(") ")
            }
        })
        .count();
    numbered >= 2
}
