//! Cascade execution.
//!
//! One request runs through a small state machine: classify → rule + route →
//! draft → score → (verify) → finalize. Direct strategies skip the loop and
//! issue a single call. The executor owns budget checks before every outbound
//! call, retry with exponential backoff for transient failures, cancellation
//! propagation, per-stage and overall deadlines, and result aggregation.
//!
//! Draft rejection is an internal state transition, never a caller-visible
//! error. A failed draft escalates to the verifier the same way a rejected
//! one does, in the spirit of try-cheap-then-escalate routing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::adaptive::AdaptiveController;
use crate::classify::{Classification, Classifier};
use crate::config::CascadeConfig;
use crate::error::{CascadeError, CascadeFailure, Stage};
use crate::message::Prompt;
use crate::metrics::{LatencyStage, MetricsRegistry};
use crate::provider::{
    estimate_tokens, CompletionOptions, ModelResponse, Provider, ProviderRegistry,
};
use crate::result::CascadeResult;
use crate::router::{route, RouteFlags, RoutingDecision, Strategy};
use crate::rules::{RuleContext, RuleEngine};
use crate::scorer::QualityScorer;
use crate::tools::{validate_tool_calls, ToolChoice, ToolSpec};
use crate::trace::{DecisionTrace, TraceRecord};

/// A generation request submitted by the caller.
#[derive(Debug, Clone)]
pub struct CascadeRequest {
    pub prompt: Prompt,
    pub tools: Vec<ToolSpec>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub tool_choice: ToolChoice,
    /// Hard spend ceiling in USD for this request.
    pub budget: Option<f64>,
    pub user_tier: Option<String>,
    pub workflow: Option<String>,
    pub tenant_id: Option<String>,
    pub channel: Option<String>,
    pub kpi_flags: HashMap<String, String>,
    /// Bypass the cascade entirely.
    pub force_direct: bool,
    /// Opaque pass-through metadata.
    pub metadata: serde_json::Map<String, Value>,
}

impl CascadeRequest {
    pub fn new(prompt: impl Into<Prompt>) -> Self {
        Self {
            prompt: prompt.into(),
            tools: Vec::new(),
            max_tokens: None,
            temperature: None,
            tool_choice: ToolChoice::Auto,
            budget: None,
            user_tier: None,
            workflow: None,
            tenant_id: None,
            channel: None,
            kpi_flags: HashMap::new(),
            force_direct: false,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn text(prompt: impl Into<String>) -> Self {
        Self::new(Prompt::Text(prompt.into()))
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = choice;
        self
    }

    pub fn with_budget(mut self, budget: f64) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.user_tier = Some(tier.into());
        self
    }

    pub fn with_workflow(mut self, workflow: impl Into<String>) -> Self {
        self.workflow = Some(workflow.into());
        self
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant.into());
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_kpi_flag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.kpi_flags.insert(key.into(), value.into());
        self
    }

    pub fn force_direct(mut self) -> Self {
        self.force_direct = true;
        self
    }
}

/// The cascade agent: process-lifetime state shared by all requests.
pub struct CascadeAgent {
    config: Arc<CascadeConfig>,
    providers: Arc<ProviderRegistry>,
    classifier: Classifier,
    rules: RuleEngine,
    scorer: QualityScorer,
    adaptive: Arc<AdaptiveController>,
    trace: Option<Arc<DecisionTrace>>,
    metrics: Arc<MetricsRegistry>,
}

impl CascadeAgent {
    pub fn new(config: CascadeConfig, providers: ProviderRegistry) -> Self {
        let config = Arc::new(config);
        Self {
            rules: RuleEngine::new(Arc::clone(&config)),
            classifier: Classifier::default(),
            scorer: QualityScorer::new(),
            adaptive: Arc::new(AdaptiveController::new(config.adaptive.clone())),
            trace: DecisionTrace::new(&config.trace).map(Arc::new),
            metrics: Arc::new(MetricsRegistry::new()),
            providers: Arc::new(providers),
            config,
        }
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_scorer(mut self, scorer: QualityScorer) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn with_adaptive(mut self, adaptive: AdaptiveController) -> Self {
        self.adaptive = Arc::new(adaptive);
        self
    }

    pub fn config(&self) -> &CascadeConfig {
        &self.config
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    pub fn adaptive(&self) -> &AdaptiveController {
        &self.adaptive
    }

    /// Flush the decision trace. Call once at shutdown.
    pub async fn shutdown(&self) {
        if let Some(trace) = &self.trace {
            trace.close().await;
        }
    }

    /// Execute one request to completion.
    pub async fn execute(&self, request: CascadeRequest) -> Result<CascadeResult, CascadeFailure> {
        self.execute_with_cancellation(request, CancellationToken::new())
            .await
    }

    /// Execute one request; cancelling the token aborts in-flight provider
    /// calls. Partial content is never returned, incurred cost is reported.
    pub async fn execute_with_cancellation(
        &self,
        request: CascadeRequest,
        cancel: CancellationToken,
    ) -> Result<CascadeResult, CascadeFailure> {
        let request_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let deadline = started + Duration::from_millis(self.config.timeouts.total_ms);

        let fail = |stage: Stage, error: CascadeError, cost: f64| {
            CascadeFailure::new(request_id.clone(), stage, error).with_cost(cost)
        };

        if request.prompt.is_empty() {
            return Err(fail(
                Stage::Classify,
                CascadeError::Validation("prompt is empty".into()),
                0.0,
            ));
        }
        if let Some(budget) = request.budget {
            if budget <= 0.0 {
                return Err(fail(
                    Stage::Route,
                    CascadeError::BudgetExceeded { needed: 0.0, remaining: 0.0, limit: budget },
                    0.0,
                ));
            }
        }

        let mut trail: Vec<String> = Vec::new();

        // CLASSIFY
        let classification = self.classifier.classify(&request.prompt, &request.tools);
        let query = request.prompt.last_user_message();
        trail.push(format!(
            "classify: complexity={} domain={}",
            classification.complexity, classification.domain
        ));
        tracing::debug!(
            request_id = %request_id,
            complexity = %classification.complexity,
            domain = %classification.domain,
            tool_complexity = ?classification.tool_complexity,
            "classified request"
        );

        // RULE + ROUTE
        let likely_hard = self.adaptive.is_likely_hard(&query).await;
        let rule_context = RuleContext {
            query: &query,
            complexity: classification.complexity,
            complexity_confidence: classification.complexity_confidence,
            domain: classification.domain,
            domain_confidence: classification.domain_confidence,
            has_tools: !request.tools.is_empty(),
            multi_turn: classification.multi_turn,
            user_tier: request.user_tier.as_deref(),
            workflow: request.workflow.as_deref(),
            tenant_id: request.tenant_id.as_deref(),
            channel: request.channel.as_deref(),
            kpi_flags: &request.kpi_flags,
        };
        let rule_decision = self.rules.decide(&rule_context);

        let mut decision = route(
            &self.config,
            &classification,
            &request.tools,
            rule_decision.as_ref(),
            RouteFlags { force_direct: request.force_direct, likely_hard },
            request.budget,
        )
        .map_err(|e| fail(Stage::Route, e, 0.0))?;

        if let Some(max_tokens) = request.max_tokens {
            decision.max_tokens = max_tokens;
        }
        if let Some(temperature) = request.temperature {
            decision.temperature = temperature;
        }
        trail.push(format!("route: strategy={}", decision.strategy));
        tracing::info!(
            request_id = %request_id,
            strategy = %decision.strategy,
            drafter = decision.drafter.as_deref().unwrap_or("-"),
            verifier = decision.verifier.as_deref().unwrap_or("-"),
            threshold = decision.threshold,
            "routed request"
        );

        // EXECUTE
        let outcome = if decision.strategy.is_direct() {
            self.run_direct(&request, &query, &decision, &cancel, deadline, &mut trail)
                .await
        } else {
            self.run_cascade(
                &request,
                &query,
                &classification,
                &decision,
                &cancel,
                deadline,
                &mut trail,
            )
            .await
        };

        // FINALIZE
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err((stage, error, cost)) => return Err(fail(stage, error, cost)),
        };
        trail.push("finalize".to_string());

        let q = outcome.q;
        let threshold_used = outcome.effective_threshold;
        let result = self.finalize(
            request_id,
            &classification,
            &decision,
            outcome,
            started,
            trail,
        );
        debug_assert!(result.invariants_hold(), "result invariants violated");
        self.publish(&result, &decision, q, threshold_used).await;
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Strategy execution
    // -----------------------------------------------------------------------

    async fn run_direct(
        &self,
        request: &CascadeRequest,
        query: &str,
        decision: &RoutingDecision,
        cancel: &CancellationToken,
        deadline: Instant,
        trail: &mut Vec<String>,
    ) -> Result<ExecOutcome, (Stage, CascadeError, f64)> {
        let (model, stage, stage_timeout) = match decision.strategy {
            Strategy::DirectCheap => (
                decision.drafter.as_deref().expect("direct-cheap has a drafter"),
                Stage::Draft,
                Duration::from_millis(self.config.timeouts.draft_ms),
            ),
            _ => (
                decision.verifier.as_deref().expect("direct strategy has a verifier"),
                Stage::Verify,
                Duration::from_millis(self.config.timeouts.verify_ms),
            ),
        };

        self.check_budget(model, query, decision, decision.budget, stage, 0.0)?;

        let options = self.options_for(request, decision);
        let response = self
            .call_model(model, &request.prompt, &options, cancel, deadline, stage_timeout, stage)
            .await
            .map_err(|e| (stage, e, 0.0))?;
        trail.push(format!("{stage}: model={model}"));

        if decision.strategy.is_tool() && !response.tool_calls.is_empty() {
            validate_tool_calls(&response.tool_calls, &request.tools)
                .map_err(|e| (stage, e, response.cost))?;
        }

        let confidence = self.scorer.score(&response, query).await.value;
        Ok(ExecOutcome {
            answer: response,
            answered_by_verifier: decision.strategy != Strategy::DirectCheap,
            draft: None,
            q: None,
            effective_threshold: decision.threshold,
            draft_accepted: false,
            verifier_used: false,
            budget_forced: false,
            confidence,
            speculative_verifier_cost: 0.0,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_cascade(
        &self,
        request: &CascadeRequest,
        query: &str,
        classification: &Classification,
        decision: &RoutingDecision,
        cancel: &CancellationToken,
        deadline: Instant,
        trail: &mut Vec<String>,
    ) -> Result<ExecOutcome, (Stage, CascadeError, f64)> {
        let drafter = decision.drafter.as_deref().expect("cascade has a drafter");
        let verifier = decision.verifier.as_deref().expect("cascade has a verifier");
        let draft_timeout = Duration::from_millis(self.config.timeouts.draft_ms);
        let verify_timeout = Duration::from_millis(self.config.timeouts.verify_ms);

        // Budget: the drafter itself must fit before the first outbound call.
        self.check_budget(drafter, query, decision, decision.budget, Stage::Draft, 0.0)?;

        let options = self.options_for(request, decision);

        // Budgeted requests stay sequential so the pre-call budget check
        // holds for the verifier as well.
        if self.config.defaults.parallel_speculative && decision.budget.is_none() {
            return self
                .run_parallel_speculative(
                    request, query, classification, decision, cancel, deadline, trail, &options,
                )
                .await;
        }

        // DRAFT
        let draft_result = self
            .call_model(
                drafter,
                &request.prompt,
                &options,
                cancel,
                deadline,
                draft_timeout,
                Stage::Draft,
            )
            .await;

        let draft = match draft_result {
            Ok(draft) => {
                trail.push(format!("draft: model={drafter}"));
                Some(draft)
            }
            Err(CascadeError::Cancelled { stage }) => {
                return Err((stage, CascadeError::Cancelled { stage }, 0.0));
            }
            Err(e) => {
                // A dead drafter escalates like a rejected draft.
                tracing::warn!(error = %e, drafter, "draft failed, escalating to verifier");
                trail.push(format!("draft failed ({}), escalating", e.kind()));
                None
            }
        };

        // SCORE
        let mut effective_threshold = decision.threshold;
        let mut q = None;
        if let Some(draft) = &draft {
            let score = self.scorer.score(draft, query).await;
            effective_threshold = self.effective_threshold(classification, decision);
            q = Some(score.value);
            trail.push(format!(
                "score: q={:.3} threshold={:.3} source={:?}",
                score.value, effective_threshold, score.source
            ));

            let tool_calls_valid = if decision.strategy.is_tool() && !draft.tool_calls.is_empty() {
                match validate_tool_calls(&draft.tool_calls, &request.tools) {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::debug!(error = %e, "draft tool calls failed validation, escalating");
                        trail.push("draft tool calls invalid, escalating".to_string());
                        false
                    }
                }
            } else {
                true
            };

            if score.value >= effective_threshold && tool_calls_valid {
                // Accepted: the verifier is skipped entirely.
                self.record_outcome(classification, score.value, true, None, query).await;
                let confidence = score.value;
                let draft = draft.clone();
                return Ok(ExecOutcome {
                    answer: draft.clone(),
                    answered_by_verifier: false,
                    draft: Some(draft),
                    q,
                    effective_threshold,
                    draft_accepted: true,
                    verifier_used: false,
                    budget_forced: false,
                    confidence,
                    speculative_verifier_cost: 0.0,
                });
            }
        }

        let draft_cost = draft.as_ref().map(|d| d.cost).unwrap_or(0.0);

        // Budget: can the verifier still fit? If not, the draft is accepted
        // regardless of its score.
        if let (Some(budget), Some(draft)) = (decision.budget, &draft) {
            let projected = self.projected_cost(verifier, query, decision);
            if draft_cost + projected > budget {
                trail.push("verifier over budget, accepting draft".to_string());
                tracing::warn!(
                    draft_cost,
                    projected,
                    budget,
                    "verifier does not fit the remaining budget, accepting draft"
                );
                let confidence = q.unwrap_or(draft.confidence);
                self.record_outcome(classification, confidence, true, None, query).await;
                let draft = draft.clone();
                return Ok(ExecOutcome {
                    answer: draft.clone(),
                    answered_by_verifier: false,
                    draft: Some(draft),
                    q,
                    effective_threshold,
                    draft_accepted: true,
                    verifier_used: false,
                    budget_forced: true,
                    confidence,
                    speculative_verifier_cost: 0.0,
                });
            }
        } else if let Some(budget) = decision.budget {
            // No draft to fall back on: the verifier must fit or we fail.
            self.check_budget(verifier, query, decision, Some(budget), Stage::Verify, draft_cost)?;
        }

        // VERIFY
        let verification = self
            .call_model(
                verifier,
                &request.prompt,
                &options,
                cancel,
                deadline,
                verify_timeout,
                Stage::Verify,
            )
            .await
            .map_err(|e| (Stage::Verify, e, draft_cost))?;
        trail.push(format!("verify: model={verifier}"));

        if decision.strategy.is_tool() && !verification.tool_calls.is_empty() {
            validate_tool_calls(&verification.tool_calls, &request.tools)
                .map_err(|e| (Stage::Verify, e, draft_cost + verification.cost))?;
        }

        let verifier_agreed = draft.as_ref().map(|d| responses_agree(d, &verification));
        if let Some(q) = q {
            self.record_outcome(classification, q, false, verifier_agreed, query)
                .await;
        }

        let confidence = self.scorer.score(&verification, query).await.value;
        Ok(ExecOutcome {
            answer: verification,
            answered_by_verifier: true,
            draft,
            q,
            effective_threshold,
            draft_accepted: false,
            verifier_used: true,
            budget_forced: false,
            confidence,
            speculative_verifier_cost: 0.0,
        })
    }

    /// Parallel speculative mode: draft and verifier are issued concurrently.
    /// An accepted draft cancels the verifier; its cost is charged only when
    /// the response had already completed (tokens were emitted).
    #[allow(clippy::too_many_arguments)]
    async fn run_parallel_speculative(
        &self,
        request: &CascadeRequest,
        query: &str,
        classification: &Classification,
        decision: &RoutingDecision,
        cancel: &CancellationToken,
        deadline: Instant,
        trail: &mut Vec<String>,
        options: &CompletionOptions,
    ) -> Result<ExecOutcome, (Stage, CascadeError, f64)> {
        let drafter = decision.drafter.as_deref().expect("cascade has a drafter");
        let verifier = decision.verifier.as_deref().expect("cascade has a verifier");
        let draft_timeout = Duration::from_millis(self.config.timeouts.draft_ms);
        let verify_timeout = Duration::from_millis(self.config.timeouts.verify_ms);

        let draft_fut = self.call_model(
            drafter,
            &request.prompt,
            options,
            cancel,
            deadline,
            draft_timeout,
            Stage::Draft,
        );
        let verify_fut = self.call_model(
            verifier,
            &request.prompt,
            options,
            cancel,
            deadline,
            verify_timeout,
            Stage::Verify,
        );
        tokio::pin!(draft_fut);
        tokio::pin!(verify_fut);

        let mut early_verify: Option<Result<ModelResponse, CascadeError>> = None;
        let draft_result = loop {
            tokio::select! {
                draft = &mut draft_fut => break draft,
                verify = &mut verify_fut, if early_verify.is_none() => {
                    early_verify = Some(verify);
                }
            }
        };
        trail.push("speculative: draft and verifier issued concurrently".to_string());

        let draft = match draft_result {
            Ok(draft) => Some(draft),
            Err(CascadeError::Cancelled { stage }) => {
                return Err((stage, CascadeError::Cancelled { stage }, 0.0));
            }
            Err(e) => {
                tracing::warn!(error = %e, drafter, "speculative draft failed");
                None
            }
        };

        let mut effective_threshold = decision.threshold;
        let mut q = None;
        if let Some(draft) = &draft {
            let score = self.scorer.score(draft, query).await;
            effective_threshold = self.effective_threshold(classification, decision);
            q = Some(score.value);

            let tool_calls_valid = if decision.strategy.is_tool() && !draft.tool_calls.is_empty() {
                validate_tool_calls(&draft.tool_calls, &request.tools).is_ok()
            } else {
                true
            };

            if score.value >= effective_threshold && tool_calls_valid {
                // Accepted. Dropping the pending verifier future cancels it;
                // a verifier that already completed has emitted tokens and is
                // charged as unused speculation.
                let speculative_cost = match &early_verify {
                    Some(Ok(response)) => response.cost,
                    _ => 0.0,
                };
                trail.push(format!(
                    "score: q={:.3} accepted, verifier cancelled (speculative cost {speculative_cost:.6})",
                    score.value
                ));
                self.record_outcome(classification, score.value, true, None, query).await;
                let confidence = score.value;
                let draft = draft.clone();
                return Ok(ExecOutcome {
                    answer: draft.clone(),
                    answered_by_verifier: false,
                    draft: Some(draft),
                    q,
                    effective_threshold,
                    draft_accepted: true,
                    verifier_used: false,
                    budget_forced: false,
                    confidence,
                    speculative_verifier_cost: 0.0,
                }
                .with_speculative_cost(speculative_cost));
            }
        }

        let draft_cost = draft.as_ref().map(|d| d.cost).unwrap_or(0.0);
        let verification = match early_verify {
            Some(result) => result,
            None => verify_fut.await,
        }
        .map_err(|e| (Stage::Verify, e, draft_cost))?;
        trail.push(format!("verify: model={verifier}"));

        if decision.strategy.is_tool() && !verification.tool_calls.is_empty() {
            validate_tool_calls(&verification.tool_calls, &request.tools)
                .map_err(|e| (Stage::Verify, e, draft_cost + verification.cost))?;
        }

        let verifier_agreed = draft.as_ref().map(|d| responses_agree(d, &verification));
        if let Some(q) = q {
            self.record_outcome(classification, q, false, verifier_agreed, query)
                .await;
        }

        let confidence = self.scorer.score(&verification, query).await.value;
        Ok(ExecOutcome {
            answer: verification,
            answered_by_verifier: true,
            draft,
            q,
            effective_threshold,
            draft_accepted: false,
            verifier_used: true,
            budget_forced: false,
            confidence,
            speculative_verifier_cost: 0.0,
        })
    }

    // -----------------------------------------------------------------------
    // Provider call plumbing
    // -----------------------------------------------------------------------

    /// One provider call with retry, cancellation, and deadline handling.
    ///
    /// Transient provider errors and rate limits retry with exponential
    /// backoff (base 1 s, doubling, capped, ≤10 % jitter, bounded attempts);
    /// rate limits honour `retry_after`. Model errors retry exactly once.
    /// Timeouts and permanent errors surface immediately.
    #[allow(clippy::too_many_arguments)]
    async fn call_model(
        &self,
        model: &str,
        prompt: &Prompt,
        options: &CompletionOptions,
        cancel: &CancellationToken,
        deadline: Instant,
        stage_timeout: Duration,
        stage: Stage,
    ) -> Result<ModelResponse, CascadeError> {
        let provider = self.provider_for(model)?;
        let retry = &self.config.retry;

        let mut attempt: u32 = 0;
        let mut model_retries: u32 = 0;
        let mut delay = Duration::from_millis(retry.base_delay_ms);

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(CascadeError::Timeout {
                    stage,
                    elapsed_ms: self.config.timeouts.total_ms,
                });
            }
            let call_timeout = stage_timeout.min(remaining);

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(CascadeError::Cancelled { stage }),
                outcome = tokio::time::timeout(call_timeout, provider.complete(prompt, model, options)) => {
                    match outcome {
                        Ok(inner) => inner,
                        Err(_) => Err(CascadeError::Timeout {
                            stage,
                            elapsed_ms: call_timeout.as_millis() as u64,
                        }),
                    }
                }
            };

            match result {
                Ok(response) => return Ok(response),
                Err(e @ CascadeError::Model { .. }) => {
                    if model_retries == 0 {
                        model_retries += 1;
                        tracing::warn!(model, error = %e, "model error, retrying once");
                        continue;
                    }
                    return Err(e);
                }
                Err(e) if e.is_retryable() && attempt + 1 < retry.max_attempts => {
                    attempt += 1;
                    let wait = e.retry_after().unwrap_or(delay);
                    let jitter = wait.mul_f64(rand::thread_rng().gen_range(0.0..=retry.jitter));
                    tracing::warn!(
                        model,
                        attempt,
                        error = %e,
                        wait_ms = (wait + jitter).as_millis() as u64,
                        "transient provider failure, backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(CascadeError::Cancelled { stage }),
                        _ = tokio::time::sleep(wait + jitter) => {}
                    }
                    delay = (delay * 2).min(Duration::from_millis(retry.max_delay_ms));
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn provider_for(&self, model: &str) -> Result<Arc<dyn Provider>, CascadeError> {
        let spec = self
            .config
            .model(model)
            .ok_or_else(|| CascadeError::Routing(format!("model `{model}` is not in the pool")))?;
        self.providers.get(&spec.provider)
    }

    /// Projected cost of calling `model` with the request's prompt and the
    /// decision's token ceiling.
    fn projected_cost(&self, model: &str, query: &str, decision: &RoutingDecision) -> f64 {
        let prompt_tokens = estimate_tokens(query);
        match self.provider_for(model) {
            Ok(provider) => provider.estimate_cost(prompt_tokens, decision.max_tokens, model),
            Err(_) => 0.0,
        }
    }

    /// Fail before an outbound call the budget cannot cover.
    fn check_budget(
        &self,
        model: &str,
        query: &str,
        decision: &RoutingDecision,
        budget: Option<f64>,
        stage: Stage,
        spent: f64,
    ) -> Result<(), (Stage, CascadeError, f64)> {
        let Some(budget) = budget else { return Ok(()) };
        let projected = self.projected_cost(model, query, decision);
        let remaining = budget - spent;
        if projected > remaining {
            return Err((
                stage,
                CascadeError::BudgetExceeded { needed: projected, remaining, limit: budget },
                spent,
            ));
        }
        Ok(())
    }

    fn options_for(&self, request: &CascadeRequest, decision: &RoutingDecision) -> CompletionOptions {
        CompletionOptions {
            max_tokens: decision.max_tokens,
            temperature: decision.temperature,
            system_prompt: None,
            tools: request.tools.clone(),
            tool_choice: request.tool_choice.clone(),
            logprobs: true,
            top_logprobs: Some(5),
        }
    }

    fn effective_threshold(
        &self,
        classification: &Classification,
        decision: &RoutingDecision,
    ) -> f64 {
        let adaptive_enabled = self
            .config
            .domain_settings(classification.domain)
            .map(|d| d.adaptive_threshold)
            .unwrap_or(true);
        if adaptive_enabled {
            self.adaptive.threshold(classification.domain, decision.threshold)
        } else {
            decision.threshold
        }
    }

    async fn record_outcome(
        &self,
        classification: &Classification,
        confidence: f64,
        accepted: bool,
        verifier_agreed: Option<bool>,
        query: &str,
    ) {
        self.adaptive
            .record(
                classification.domain,
                confidence,
                accepted,
                verifier_agreed,
                Some(query),
            )
            .await;
    }

    // -----------------------------------------------------------------------
    // Finalization
    // -----------------------------------------------------------------------

    fn finalize(
        &self,
        request_id: String,
        classification: &Classification,
        decision: &RoutingDecision,
        outcome: ExecOutcome,
        started: Instant,
        trail: Vec<String>,
    ) -> CascadeResult {
        let latency_ms = started.elapsed().as_millis() as u64;

        let (draft_cost, draft_latency_ms) = match (&outcome.draft, outcome.answered_by_verifier) {
            (Some(draft), _) => (draft.cost, draft.latency_ms),
            (None, false) if decision.strategy == Strategy::DirectCheap => {
                (outcome.answer.cost, outcome.answer.latency_ms)
            }
            _ => (0.0, 0),
        };
        let (mut verifier_cost, verifier_latency_ms) = if outcome.answered_by_verifier {
            (outcome.answer.cost, outcome.answer.latency_ms)
        } else {
            (0.0, 0)
        };
        verifier_cost += outcome.speculative_verifier_cost;

        let total_tokens = outcome.answer.tokens_used.total
            + outcome
                .draft
                .as_ref()
                .filter(|_| outcome.answered_by_verifier)
                .map(|d| d.tokens_used.total)
                .unwrap_or(0);

        CascadeResult {
            request_id,
            content: outcome.answer.content.clone(),
            tool_calls: outcome.answer.tool_calls.clone(),
            model_used: outcome.answer.model.clone(),
            total_cost: draft_cost + verifier_cost,
            total_tokens,
            confidence: outcome.confidence,
            latency_ms,
            draft_accepted: outcome.draft_accepted,
            verifier_used: outcome.verifier_used,
            budget_forced: outcome.budget_forced,
            draft_cost,
            verifier_cost,
            draft_latency_ms,
            verifier_latency_ms,
            complexity: classification.complexity,
            domain: classification.domain,
            routing_strategy: decision.strategy,
            reason: decision.reason.clone(),
            trace: trail,
        }
    }

    /// Emit metrics and the decision-trace line for a finalized result.
    async fn publish(
        &self,
        result: &CascadeResult,
        decision: &RoutingDecision,
        q: Option<f64>,
        threshold_used: f64,
    ) {
        self.metrics
            .record_request(result.routing_strategy, result.domain);
        if result.draft_accepted {
            self.metrics.record_draft_accepted(result.domain);
        }
        self.metrics.record_cost(&result.model_used, result.total_cost);
        if result.draft_latency_ms > 0 {
            self.metrics
                .record_latency(LatencyStage::Draft, result.draft_latency_ms as f64);
        }
        if result.verifier_latency_ms > 0 {
            self.metrics
                .record_latency(LatencyStage::Verify, result.verifier_latency_ms as f64);
        }
        self.metrics
            .record_latency(LatencyStage::Total, result.latency_ms as f64);

        if let Some(trace) = &self.trace {
            let record = TraceRecord {
                request_id: result.request_id.clone(),
                timestamp: chrono::Utc::now(),
                complexity: result.complexity,
                domain: result.domain,
                strategy: result.routing_strategy,
                drafter: decision.drafter.clone(),
                verifier: decision.verifier.clone(),
                threshold: threshold_used,
                q,
                draft_accepted: result.draft_accepted,
                budget_forced: result.budget_forced,
                draft_cost: result.draft_cost,
                verifier_cost: result.verifier_cost,
                latency_ms: result.latency_ms,
                reason: result.reason.clone(),
            };
            if let Err(e) = trace.append(&record).await {
                tracing::warn!(error = %e, "decision trace write failed");
            }
        }
    }
}

/// Internal execution outcome, merged into a [`CascadeResult`] at finalize.
struct ExecOutcome {
    answer: ModelResponse,
    answered_by_verifier: bool,
    draft: Option<ModelResponse>,
    q: Option<f64>,
    effective_threshold: f64,
    draft_accepted: bool,
    verifier_used: bool,
    budget_forced: bool,
    confidence: f64,
    speculative_verifier_cost: f64,
}

impl ExecOutcome {
    fn with_speculative_cost(mut self, cost: f64) -> Self {
        self.speculative_verifier_cost = cost;
        self
    }
}

/// Word-overlap agreement between the draft and the verifier's answer. Tool
/// responses agree when they call the same tools in the same order.
fn responses_agree(draft: &ModelResponse, verification: &ModelResponse) -> bool {
    if !draft.tool_calls.is_empty() || !verification.tool_calls.is_empty() {
        return draft.tool_calls.len() == verification.tool_calls.len()
            && draft
                .tool_calls
                .iter()
                .zip(&verification.tool_calls)
                .all(|(a, b)| a.name == b.name);
    }

    let words = |text: &str| -> HashSet<String> {
        text.to_lowercase()
            .split_whitespace()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
            .filter(|w| !w.is_empty())
            .collect()
    };
    let a = words(&draft.content);
    let b = words(&verification.content);
    if a.is_empty() || b.is_empty() {
        return false;
    }
    let intersection = a.intersection(&b).count() as f64;
    let union = a.union(&b).count() as f64;
    intersection / union >= 0.5
}
