//! The caller-facing result of one cascade request.
//!
//! A [`CascadeResult`] merges the per-stage model responses into one record
//! and enforces the accounting invariants: total cost is the sum of the stage
//! costs, and a request is exactly one of draft-accepted, verifier-answered,
//! or direct.

use serde::{Deserialize, Serialize};

use crate::classify::{Complexity, Domain};
use crate::router::Strategy;
use crate::tools::ToolCall;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeResult {
    pub request_id: String,
    pub content: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// The model whose answer is returned.
    pub model_used: String,

    pub total_cost: f64,
    pub total_tokens: u32,

    /// Final confidence of the returned answer.
    pub confidence: f64,
    pub latency_ms: u64,

    pub draft_accepted: bool,
    pub verifier_used: bool,
    /// The draft was accepted only because the verifier no longer fit the
    /// remaining budget.
    #[serde(default)]
    pub budget_forced: bool,

    pub draft_cost: f64,
    pub verifier_cost: f64,
    pub draft_latency_ms: u64,
    pub verifier_latency_ms: u64,

    pub complexity: Complexity,
    pub domain: Domain,
    pub routing_strategy: Strategy,
    pub reason: Vec<String>,

    /// Stage-by-stage execution trail.
    pub trace: Vec<String>,
}

impl CascadeResult {
    /// Check the accounting invariants. Called before a result leaves the
    /// executor; a violation is a bug, so this is a debug assertion in
    /// release paths and a hard check in tests.
    pub fn invariants_hold(&self) -> bool {
        let cost_adds_up = (self.total_cost - (self.draft_cost + self.verifier_cost)).abs() < 1e-9;

        let direct = self.routing_strategy.is_direct();
        let exclusive = if direct {
            !self.draft_accepted && !self.verifier_used
        } else {
            self.draft_accepted != self.verifier_used
        };

        cost_adds_up && exclusive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> CascadeResult {
        CascadeResult {
            request_id: "req".into(),
            content: "Paris".into(),
            tool_calls: Vec::new(),
            model_used: "cheap".into(),
            total_cost: 0.003,
            total_tokens: 42,
            confidence: 0.8,
            latency_ms: 150,
            draft_accepted: true,
            verifier_used: false,
            budget_forced: false,
            draft_cost: 0.003,
            verifier_cost: 0.0,
            draft_latency_ms: 150,
            verifier_latency_ms: 0,
            complexity: Complexity::Trivial,
            domain: Domain::Factual,
            routing_strategy: Strategy::Cascade,
            reason: vec!["complexity trivial maps to cascade".into()],
            trace: vec!["classify".into(), "draft".into(), "score".into()],
        }
    }

    #[test]
    fn accepted_draft_satisfies_invariants() {
        assert!(base().invariants_hold());
    }

    #[test]
    fn cost_mismatch_violates_invariants() {
        let mut result = base();
        result.total_cost = 0.01;
        assert!(!result.invariants_hold());
    }

    #[test]
    fn accepted_and_verified_together_violate_invariants() {
        let mut result = base();
        result.verifier_used = true;
        assert!(!result.invariants_hold());
    }

    #[test]
    fn direct_strategies_have_neither_flag_set() {
        let mut result = base();
        result.routing_strategy = Strategy::DirectBest;
        result.draft_accepted = false;
        result.verifier_used = false;
        result.draft_cost = 0.0;
        result.verifier_cost = 0.003;
        assert!(result.invariants_hold());

        // A direct result claiming draft acceptance is malformed.
        result.draft_accepted = true;
        assert!(!result.invariants_hold());
    }

    #[test]
    fn verifier_answer_satisfies_invariants() {
        let mut result = base();
        result.draft_accepted = false;
        result.verifier_used = true;
        result.verifier_cost = 0.01;
        result.total_cost = result.draft_cost + result.verifier_cost;
        result.model_used = "strong".into();
        assert!(result.invariants_hold());
    }

    #[test]
    fn serde_round_trip_preserves_accounting() {
        let result = base();
        let json = serde_json::to_string(&result).unwrap();
        let reloaded: CascadeResult = serde_json::from_str(&json).unwrap();
        assert!((reloaded.total_cost - result.total_cost).abs() < f64::EPSILON);
        assert_eq!(reloaded.draft_accepted, result.draft_accepted);
        assert_eq!(reloaded.routing_strategy, Strategy::Cascade);
        assert!(reloaded.invariants_hold());
    }
}
