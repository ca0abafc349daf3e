//! Query complexity estimation.
//!
//! A pure function of the query string: a small feature vector is extracted,
//! each feature contributes weighted points, and the sum is banded into the
//! five complexity levels. No model calls, no allocation beyond the feature
//! pass — this runs on every request before routing.

use serde::{Deserialize, Serialize};

/// Five-valued ordinal difficulty class. Ordering is meaningful:
/// `Trivial < Simple < Moderate < Hard < Expert`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Trivial,
    Simple,
    Moderate,
    Hard,
    Expert,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trivial => "trivial",
            Self::Simple => "simple",
            Self::Moderate => "moderate",
            Self::Hard => "hard",
            Self::Expert => "expert",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "trivial" => Some(Self::Trivial),
            "simple" => Some(Self::Simple),
            "moderate" => Some(Self::Moderate),
            "hard" => Some(Self::Hard),
            "expert" => Some(Self::Expert),
            _ => None,
        }
    }
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw feature counts extracted from a query.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ComplexityFeatures {
    pub word_count: usize,
    pub code_fences: usize,
    pub enumerations: usize,
    pub question_marks: usize,
    pub multi_step_connectives: usize,
    pub reasoning_verbs: usize,
    pub proof_demand: bool,
    pub paren_depth: usize,
}

/// Complexity estimate with a confidence derived from band position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComplexityEstimate {
    pub level: Complexity,
    pub confidence: f64,
    pub score: f64,
}

const MULTI_STEP_CONNECTIVES: &[&str] = &[
    "first", "then", "finally", "next", "afterwards", "after that", "step by step",
];

/// Formal-reasoning demands. A single one of these marks the query as deep
/// reasoning work regardless of its length.
const PROOF_VERBS: &[&str] = &["prove", "proof", "disprove", "derive", "theorem"];

const REASONING_VERBS: &[&str] = &[
    "compare", "analyze", "analyse", "justify", "evaluate", "optimize", "optimise",
    "demonstrate", "explain why",
];

/// Band upper edges (inclusive — ties break toward the lower level).
const BAND_EDGES: [f64; 4] = [1.5, 3.0, 5.0, 7.0];
/// Nominal width used for the open-ended expert band.
const EXPERT_BAND_WIDTH: f64 = 2.0;

/// Estimate the complexity of a query string.
pub fn estimate(query: &str) -> ComplexityEstimate {
    let features = extract_features(query);
    let score = score_features(&features);
    let (level, confidence) = band(score);
    ComplexityEstimate { level, confidence, score }
}

pub fn extract_features(query: &str) -> ComplexityFeatures {
    let lower = query.to_lowercase();

    let word_count = query.split_whitespace().count();
    let code_fences = query.matches("```").count() / 2;
    let question_marks = query.matches('?').count();

    // Enumerations: lines beginning with a digit-dot or a bullet
    let enumerations = query
        .lines()
        .filter(|line| {
            let t = line.trim_start();
            t.starts_with("- ")
                || t.starts_with("* ")
                || t.chars().next().is_some_and(|c| c.is_ascii_digit())
                    && (t.contains(". ") || t.contains(") "))
        })
        .count();

    let multi_step_connectives = MULTI_STEP_CONNECTIVES
        .iter()
        .filter(|c| contains_word(&lower, c))
        .count();

    let reasoning_verbs = REASONING_VERBS
        .iter()
        .filter(|v| contains_word(&lower, v))
        .count();

    let proof_demand = PROOF_VERBS.iter().any(|v| contains_word(&lower, v));

    let mut depth = 0usize;
    let mut max_depth = 0usize;
    for c in query.chars() {
        match c {
            '(' => {
                depth += 1;
                max_depth = max_depth.max(depth);
            }
            ')' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }

    ComplexityFeatures {
        word_count,
        code_fences,
        enumerations,
        question_marks,
        multi_step_connectives,
        reasoning_verbs,
        proof_demand,
        paren_depth: max_depth,
    }
}

fn score_features(f: &ComplexityFeatures) -> f64 {
    let mut score = 0.0;

    score += match f.word_count {
        0..=8 => 0.0,
        9..=25 => 1.0,
        26..=60 => 2.0,
        61..=120 => 3.0,
        _ => 4.0,
    };

    score += (f.code_fences as f64) * 1.5;
    score += (f.enumerations as f64).min(4.0) * 0.5;
    score += (f.question_marks.saturating_sub(1) as f64).min(3.0) * 0.5;
    score += (f.multi_step_connectives as f64).min(3.0) * 1.0;
    score += (f.reasoning_verbs as f64).min(3.0) * 1.5;
    if f.proof_demand {
        score += 5.5;
    }
    score += (f.paren_depth.saturating_sub(1) as f64).min(3.0) * 0.5;

    score
}

/// Map a score to a band and compute confidence from the distance to the
/// nearest band edge relative to the band width.
fn band(score: f64) -> (Complexity, f64) {
    let levels = [
        Complexity::Trivial,
        Complexity::Simple,
        Complexity::Moderate,
        Complexity::Hard,
        Complexity::Expert,
    ];

    let mut idx = BAND_EDGES.len();
    for (i, edge) in BAND_EDGES.iter().enumerate() {
        // Ties break toward the lower level: a score exactly on the edge
        // belongs to the band below it.
        if score <= *edge {
            idx = i;
            break;
        }
    }

    let (lower, upper) = match idx {
        0 => (0.0, BAND_EDGES[0]),
        i if i < BAND_EDGES.len() => (BAND_EDGES[i - 1], BAND_EDGES[i]),
        _ => (
            BAND_EDGES[BAND_EDGES.len() - 1],
            BAND_EDGES[BAND_EDGES.len() - 1] + EXPERT_BAND_WIDTH,
        ),
    };
    let width = upper - lower;
    let distance_to_edge = (score - lower).min(upper - score).max(0.0);
    let confidence = (1.0 - distance_to_edge / width).clamp(0.0, 1.0);

    (levels[idx], confidence)
}

fn contains_word(haystack: &str, needle: &str) -> bool {
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(needle) {
        let abs = start + pos;
        let before_ok = abs == 0
            || !haystack[..abs]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_alphanumeric());
        let end = abs + needle.len();
        let after_ok = end >= haystack.len()
            || !haystack[end..].chars().next().is_some_and(|c| c.is_alphanumeric());
        if before_ok && after_ok {
            return true;
        }
        start = abs + 1;
    }
    false
}
