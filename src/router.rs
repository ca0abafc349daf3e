//! Strategy routing — the brain of the cascade.
//!
//! [`route`] is a pure function from a classification, the request's tools,
//! and the merged rule decision to an executable [`RoutingDecision`]. Rules
//! are applied in a fixed order with first-match-wins semantics for the
//! strategy, and every rule records a reason string so the decision trace can
//! explain itself.

use serde::{Deserialize, Serialize};

use crate::classify::{Classification, Complexity};
use crate::config::{CascadeConfig, ModelSpec};
use crate::error::CascadeError;
use crate::rules::{apply_model_constraints, RuleDecision};
use crate::tools::ToolSpec;

/// Execution strategy for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Strategy {
    /// Draft with the cheap model, verify on rejection.
    Cascade,
    /// Single shot on the cheap model.
    DirectCheap,
    /// Single shot on the strong model.
    DirectBest,
    /// Cascade restricted to tool-capable models.
    ToolCascade,
    /// Tool request answered by the strong model only.
    DirectLarge,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cascade => "CASCADE",
            Self::DirectCheap => "DIRECT_CHEAP",
            Self::DirectBest => "DIRECT_BEST",
            Self::ToolCascade => "TOOL_CASCADE",
            Self::DirectLarge => "DIRECT_LARGE",
        }
    }

    /// Whether this strategy skips the draft/score/verify loop.
    pub fn is_direct(&self) -> bool {
        matches!(self, Self::DirectCheap | Self::DirectBest | Self::DirectLarge)
    }

    /// Whether this strategy answers tool requests.
    pub fn is_tool(&self) -> bool {
        matches!(self, Self::ToolCascade | Self::DirectLarge)
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Executable routing decision.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub strategy: Strategy,
    /// Model used for the draft (or the single call of `DirectCheap`).
    pub drafter: Option<String>,
    /// Model used for verification (or the single call of `DirectBest` /
    /// `DirectLarge`).
    pub verifier: Option<String>,
    pub threshold: f64,
    pub temperature: f64,
    pub max_tokens: u32,
    pub reason: Vec<String>,
    pub confidence: f64,
    /// Effective budget ceiling (caller budget merged with rule budget).
    pub budget: Option<f64>,
    pub failover_channel: Option<String>,
    /// Candidate pool after capability filtering and rule constraints.
    pub candidates: Vec<String>,
}

/// Inputs to [`route`] beyond the classification itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouteFlags {
    pub force_direct: bool,
    /// Set when the adaptive controller's hard-query memory matched.
    pub likely_hard: bool,
}

/// Route a classified request to a strategy and concrete models.
pub fn route(
    config: &CascadeConfig,
    classification: &Classification,
    tools: &[ToolSpec],
    rules: Option<&RuleDecision>,
    flags: RouteFlags,
    request_budget: Option<f64>,
) -> Result<RoutingDecision, CascadeError> {
    let mut reason: Vec<String> = Vec::new();
    if let Some(rules) = rules {
        reason.extend(rules.reason.iter().cloned());
    }

    // Candidate pool: capability filter first, then rule constraints.
    let pool: Vec<String> = if tools.is_empty() {
        config.models.iter().map(|m| m.name.clone()).collect()
    } else {
        let capable: Vec<String> = config
            .tool_capable_models()
            .into_iter()
            .map(|m| m.name.clone())
            .collect();
        if capable.is_empty() {
            return Err(CascadeError::Routing(
                "request carries tools but no pool model declares tool support".into(),
            ));
        }
        capable
    };

    let (candidates, relaxation) = apply_model_constraints(rules, &pool)?;
    if let Some(relaxation) = relaxation {
        reason.push(relaxation);
    }

    // Strategy selection, first match wins.
    let rule_strategy = rules.and_then(|r| r.strategy);
    let strategy = if flags.force_direct {
        reason.push("caller forced direct execution".to_string());
        if tools.is_empty() { Strategy::DirectBest } else { Strategy::DirectLarge }
    } else if flags.likely_hard {
        reason.push("query resembles known hard queries, skipping the drafter".to_string());
        if tools.is_empty() { Strategy::DirectBest } else { Strategy::DirectLarge }
    } else if !tools.is_empty() {
        let tool_complexity = classification.tool_complexity.unwrap_or(Complexity::Simple);
        if tool_complexity >= Complexity::Hard {
            reason.push(format!("tool complexity {tool_complexity} routes direct to the verifier"));
            Strategy::DirectLarge
        } else if matches!(rule_strategy, Some(s) if s.is_direct()) {
            reason.push("rule override routes the tool request direct".to_string());
            Strategy::DirectLarge
        } else {
            reason.push(format!("tool complexity {tool_complexity} cascades"));
            Strategy::ToolCascade
        }
    } else if let Some(strategy) = rule_strategy {
        // Reasons for the override were already recorded by the rule engine.
        strategy
    } else {
        match classification.complexity {
            Complexity::Trivial | Complexity::Simple | Complexity::Moderate => {
                reason.push(format!("complexity {} maps to cascade", classification.complexity));
                Strategy::Cascade
            }
            Complexity::Hard | Complexity::Expert => {
                reason.push(format!(
                    "complexity {} maps to direct verifier execution",
                    classification.complexity
                ));
                Strategy::DirectBest
            }
        }
    };

    // Model, threshold, and generation-parameter resolution.
    let domain = config.domain_settings(classification.domain);
    let constrained = rules.is_some_and(|r| {
        r.allowed_models.is_some() || r.forced_models.is_some() || r.excluded_models.is_some()
    });

    let drafter_name = resolve_model(
        domain.and_then(|d| d.drafter.as_deref()),
        &config.defaults.drafter,
        &candidates,
        constrained,
        rules.and_then(|r| r.preferred_models.as_deref()),
        config,
        Pick::Cheapest,
        &mut reason,
    );
    let verifier_name = resolve_model(
        domain.and_then(|d| d.verifier.as_deref()),
        &config.defaults.verifier,
        &candidates,
        constrained,
        rules.and_then(|r| r.preferred_models.as_deref()),
        config,
        Pick::BestQuality,
        &mut reason,
    );

    let threshold = rules
        .and_then(|r| r.quality_threshold)
        .or_else(|| domain.map(|d| d.threshold))
        .unwrap_or(config.defaults.threshold);
    let temperature = domain
        .map(|d| d.temperature)
        .unwrap_or(config.defaults.temperature);

    let budget = match (request_budget, rules.and_then(|r| r.max_budget)) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };

    let (drafter, verifier) = match strategy {
        Strategy::Cascade | Strategy::ToolCascade => (Some(drafter_name), Some(verifier_name)),
        Strategy::DirectCheap => (Some(drafter_name), None),
        Strategy::DirectBest | Strategy::DirectLarge => (None, Some(verifier_name)),
    };

    let confidence = rules
        .map(|r| r.confidence)
        .filter(|c| *c > 0.0)
        .unwrap_or(classification.complexity_confidence);

    Ok(RoutingDecision {
        strategy,
        drafter,
        verifier,
        threshold,
        temperature,
        max_tokens: config.defaults.max_tokens,
        reason,
        confidence,
        budget,
        failover_channel: rules.and_then(|r| r.failover_channel.clone()),
        candidates,
    })
}

#[derive(Clone, Copy, PartialEq)]
enum Pick {
    Cheapest,
    BestQuality,
}

/// Resolve a role (drafter or verifier) to a concrete model name.
///
/// Preference order: domain override, global default — each only if it is in
/// the candidate set. When constraints pushed both out, fall back to the
/// cheapest (drafter) or highest-quality (verifier) candidate and record the
/// substitution.
#[allow(clippy::too_many_arguments)]
fn resolve_model(
    domain_override: Option<&str>,
    default_name: &str,
    candidates: &[String],
    constrained: bool,
    preferred: Option<&[String]>,
    config: &CascadeConfig,
    pick: Pick,
    reason: &mut Vec<String>,
) -> String {
    let in_candidates = |name: &str| candidates.iter().any(|c| c.as_str() == name);

    // Preferred models that survive the constraints take precedence over the
    // configured names.
    if let Some(preferred) = preferred {
        let surviving: Vec<&ModelSpec> = preferred
            .iter()
            .filter(|name| in_candidates(name.as_str()))
            .filter_map(|name| config.model(name))
            .collect();
        if let Some(best) = pick_from(&surviving, pick) {
            return best.name.clone();
        }
    }

    if let Some(name) = domain_override {
        if in_candidates(name) {
            return name.to_string();
        }
    }
    if in_candidates(default_name) {
        return default_name.to_string();
    }

    // Constraints excluded every configured name: substitute from the pool.
    let specs: Vec<&ModelSpec> = candidates
        .iter()
        .filter_map(|name| config.model(name))
        .collect();
    if let Some(fallback) = pick_from(&specs, pick) {
        if constrained {
            reason.push(format!(
                "configured model unavailable under constraints, substituting `{}`",
                fallback.name
            ));
        }
        return fallback.name.clone();
    }

    // Candidate list was empty only if constraints already errored; keep the
    // configured default as a last resort.
    default_name.to_string()
}

fn pick_from<'a>(specs: &[&'a ModelSpec], pick: Pick) -> Option<&'a ModelSpec> {
    match pick {
        Pick::Cheapest => specs.iter().copied().min_by(|a, b| {
            a.cost_per_1k
                .partial_cmp(&b.cost_per_1k)
                .unwrap_or(std::cmp::Ordering::Equal)
        }),
        Pick::BestQuality => specs.iter().copied().max_by(|a, b| {
            let qa = (a.quality_tier.unwrap_or(0), a.cost_per_1k);
            let qb = (b.quality_tier.unwrap_or(0), b.cost_per_1k);
            qa.partial_cmp(&qb).unwrap_or(std::cmp::Ordering::Equal)
        }),
    }
}
