//! Layered routing rule engine.
//!
//! Six layers evaluated in a fixed order — domain, tenant, channel, tier,
//! workflow, KPI — each contributing an optional partial decision. Layers are
//! merged with later-wins semantics per field; every layer's reason string is
//! kept. The merged model constraints are then intersected with the router's
//! candidate set, with a relaxation ladder when the intersection is empty.

use std::collections::HashMap;
use std::sync::Arc;

use crate::classify::{Complexity, Domain};
use crate::config::CascadeConfig;
use crate::error::CascadeError;
use crate::router::Strategy;

/// Stable input context for rule evaluation, decoupled from executor
/// internals.
#[derive(Debug, Clone)]
pub struct RuleContext<'a> {
    pub query: &'a str,
    pub complexity: Complexity,
    pub complexity_confidence: f64,
    pub domain: Domain,
    pub domain_confidence: f64,
    pub has_tools: bool,
    pub multi_turn: bool,
    pub user_tier: Option<&'a str>,
    pub workflow: Option<&'a str>,
    pub tenant_id: Option<&'a str>,
    pub channel: Option<&'a str>,
    pub kpi_flags: &'a HashMap<String, String>,
}

/// Partial decision produced by one or more rule layers.
#[derive(Debug, Clone, Default)]
pub struct RuleDecision {
    pub strategy: Option<Strategy>,
    pub reason: Vec<String>,
    pub confidence: f64,
    pub allowed_models: Option<Vec<String>>,
    pub excluded_models: Option<Vec<String>>,
    pub preferred_models: Option<Vec<String>>,
    pub forced_models: Option<Vec<String>>,
    pub quality_threshold: Option<f64>,
    pub max_budget: Option<f64>,
    pub preferred_channel: Option<String>,
    pub failover_channel: Option<String>,
}

impl RuleDecision {
    pub fn is_override(&self) -> bool {
        self.strategy.is_some()
    }

    /// Merge `other` into `self`: later layers win on conflicting fields,
    /// reasons accumulate, confidence takes the max.
    fn merge(mut self, other: RuleDecision) -> RuleDecision {
        if other.strategy.is_some() {
            self.strategy = other.strategy;
        }
        self.reason.extend(other.reason);
        self.confidence = self.confidence.max(other.confidence);
        if other.allowed_models.is_some() {
            self.allowed_models = other.allowed_models;
        }
        if other.excluded_models.is_some() {
            self.excluded_models = other.excluded_models;
        }
        if other.preferred_models.is_some() {
            self.preferred_models = other.preferred_models;
        }
        if other.forced_models.is_some() {
            self.forced_models = other.forced_models;
        }
        if other.quality_threshold.is_some() {
            self.quality_threshold = other.quality_threshold;
        }
        if other.max_budget.is_some() {
            self.max_budget = other.max_budget;
        }
        if other.preferred_channel.is_some() {
            self.preferred_channel = other.preferred_channel;
        }
        if other.failover_channel.is_some() {
            self.failover_channel = other.failover_channel;
        }
        self
    }
}

/// Rule engine over the configuration tables.
pub struct RuleEngine {
    config: Arc<CascadeConfig>,
}

impl RuleEngine {
    pub fn new(config: Arc<CascadeConfig>) -> Self {
        Self { config }
    }

    /// Evaluate all layers and return the merged decision, or `None` when no
    /// layer matched.
    pub fn decide(&self, context: &RuleContext<'_>) -> Option<RuleDecision> {
        let layers = [
            self.domain_layer(context),
            self.tenant_layer(context),
            self.channel_layer(context),
            self.tier_layer(context),
            self.workflow_layer(context),
            self.kpi_layer(context),
        ];

        let mut merged: Option<RuleDecision> = None;
        for layer in layers.into_iter().flatten() {
            merged = Some(match merged {
                Some(base) => base.merge(layer),
                None => layer,
            });
        }
        merged
    }

    fn domain_layer(&self, context: &RuleContext<'_>) -> Option<RuleDecision> {
        let settings = self.config.domain_settings(context.domain)?;
        let confidence = if context.domain_confidence > 0.0 {
            context.domain_confidence
        } else {
            0.6
        };

        if settings.require_verifier {
            return Some(RuleDecision {
                strategy: Some(Strategy::DirectBest),
                reason: vec![format!("domain `{}` requires the verifier", context.domain)],
                confidence,
                ..Default::default()
            });
        }

        if let Some(whitelist) = &settings.cascade_complexities {
            return if whitelist.contains(&context.complexity) {
                Some(RuleDecision {
                    strategy: Some(Strategy::Cascade),
                    reason: vec![format!(
                        "domain `{}` whitelists {} for cascading",
                        context.domain, context.complexity
                    )],
                    confidence: confidence.min(context.complexity_confidence),
                    ..Default::default()
                })
            } else {
                Some(RuleDecision {
                    strategy: Some(Strategy::DirectBest),
                    reason: vec![format!(
                        "domain `{}` does not cascade {} queries",
                        context.domain, context.complexity
                    )],
                    confidence,
                    ..Default::default()
                })
            };
        }

        Some(RuleDecision {
            strategy: Some(Strategy::Cascade),
            reason: vec![format!("domain `{}` is configured for cascading", context.domain)],
            confidence,
            ..Default::default()
        })
    }

    fn tenant_layer(&self, context: &RuleContext<'_>) -> Option<RuleDecision> {
        let tenant_id = context.tenant_id?;
        let tenant = self.config.tenants.get(tenant_id)?;

        Some(RuleDecision {
            reason: vec![format!("tenant `{tenant_id}` constraints applied")],
            confidence: 0.75,
            allowed_models: (!tenant.allowed_models.is_empty())
                .then(|| tenant.allowed_models.clone()),
            preferred_channel: tenant.preferred_channel.clone(),
            ..Default::default()
        })
    }

    fn channel_layer(&self, context: &RuleContext<'_>) -> Option<RuleDecision> {
        let channel = context.channel?;
        let channels = &self.config.channels;

        let mut selected = channel;
        let mut failover = None;
        let mut models = channels.models.get(selected);
        if models.is_none() {
            if let Some(alternate) = channels.failover.get(selected) {
                failover = Some(alternate.clone());
                selected = alternate;
                models = channels.models.get(selected);
            }
        }
        if models.is_none() && failover.is_none() && !is_background_channel(channel) {
            return None;
        }

        let strategy = channels
            .strategies
            .get(selected)
            .or_else(|| channels.strategies.get(channel))
            .copied()
            .or_else(|| is_background_channel(selected).then_some(Strategy::DirectCheap));

        Some(RuleDecision {
            strategy,
            reason: vec![format!("channel `{channel}` routing applied")],
            confidence: 0.65,
            allowed_models: models.cloned(),
            preferred_channel: Some(selected.to_string()),
            failover_channel: failover,
            ..Default::default()
        })
    }

    fn tier_layer(&self, context: &RuleContext<'_>) -> Option<RuleDecision> {
        let tier_name = context.user_tier?;
        let tier = self.config.tiers.get(tier_name)?;

        Some(RuleDecision {
            reason: vec![format!("tier `{tier_name}` constraints applied")],
            confidence: 0.7,
            allowed_models: (!tier.allowed_models.is_empty()).then(|| tier.allowed_models.clone()),
            excluded_models: (!tier.excluded_models.is_empty())
                .then(|| tier.excluded_models.clone()),
            preferred_models: (!tier.preferred_models.is_empty())
                .then(|| tier.preferred_models.clone()),
            quality_threshold: tier.quality_threshold,
            max_budget: tier.max_budget,
            ..Default::default()
        })
    }

    fn workflow_layer(&self, context: &RuleContext<'_>) -> Option<RuleDecision> {
        let workflow_name = context.workflow?;
        let workflow = self.config.workflows.get(workflow_name)?;

        Some(RuleDecision {
            reason: vec![format!("workflow `{workflow_name}` overrides applied")],
            confidence: 0.8,
            forced_models: (!workflow.force_models.is_empty())
                .then(|| workflow.force_models.clone()),
            preferred_models: (!workflow.preferred_models.is_empty())
                .then(|| workflow.preferred_models.clone()),
            excluded_models: (!workflow.excluded_models.is_empty())
                .then(|| workflow.excluded_models.clone()),
            quality_threshold: workflow.quality_threshold,
            max_budget: workflow.max_budget,
            ..Default::default()
        })
    }

    fn kpi_layer(&self, context: &RuleContext<'_>) -> Option<RuleDecision> {
        let flags = context.kpi_flags;
        if flags.is_empty() {
            return None;
        }

        if let Some(profile) = flags.get("profile") {
            match profile.trim().to_lowercase().as_str() {
                "quality" | "best" | "accuracy" => {
                    return Some(RuleDecision {
                        strategy: Some(Strategy::DirectBest),
                        reason: vec![format!("KPI profile `{profile}` forces the verifier")],
                        confidence: 0.75,
                        ..Default::default()
                    });
                }
                "cost" | "cost_savings" | "cheap" | "fast" => {
                    return Some(RuleDecision {
                        strategy: Some(Strategy::Cascade),
                        reason: vec![format!("KPI profile `{profile}` forces cascading")],
                        confidence: 0.7,
                        ..Default::default()
                    });
                }
                _ => {}
            }
        }

        let risk = flags.get("risk").or_else(|| flags.get("compliance"));
        if let Some(risk) = risk {
            if matches!(risk.trim().to_lowercase().as_str(), "high" | "strict" | "true" | "1") {
                return Some(RuleDecision {
                    strategy: Some(Strategy::DirectBest),
                    reason: vec!["KPI risk/compliance flag forces the verifier".to_string()],
                    confidence: 0.8,
                    ..Default::default()
                });
            }
        }

        Some(RuleDecision {
            reason: vec!["KPI flags recorded".to_string()],
            confidence: 0.5,
            ..Default::default()
        })
    }
}

fn is_background_channel(channel: &str) -> bool {
    matches!(channel, "heartbeat" | "cron")
}

/// Intersect merged constraints with the router's candidate set.
///
/// Allow-lists and forced lists are hard constraints. Exclusions are soft:
/// when the full intersection is empty they are dropped first (the closest
/// non-empty superset), and the relaxation is recorded. An empty set even
/// after relaxation is a routing error carrying the relaxation trail.
pub fn apply_model_constraints(
    decision: Option<&RuleDecision>,
    candidates: &[String],
) -> Result<(Vec<String>, Option<String>), CascadeError> {
    let Some(decision) = decision else {
        return Ok((candidates.to_vec(), None));
    };

    let hard: Vec<String> = candidates
        .iter()
        .filter(|name| {
            decision
                .forced_models
                .as_ref()
                .is_none_or(|forced| forced.contains(*name))
        })
        .filter(|name| {
            decision
                .allowed_models
                .as_ref()
                .is_none_or(|allowed| allowed.contains(*name))
        })
        .cloned()
        .collect();

    let strict: Vec<String> = hard
        .iter()
        .filter(|name| {
            decision
                .excluded_models
                .as_ref()
                .is_none_or(|excluded| !excluded.contains(*name))
        })
        .cloned()
        .collect();

    if !strict.is_empty() {
        return Ok((strict, None));
    }

    if !hard.is_empty() {
        return Ok((
            hard,
            Some("model exclusions dropped: intersection was empty".to_string()),
        ));
    }

    Err(CascadeError::Routing(format!(
        "no candidate model satisfies the merged constraints \
         (allowed: {:?}, forced: {:?}, excluded: {:?}); relaxation exhausted",
        decision.allowed_models, decision.forced_models, decision.excluded_models
    )))
}
