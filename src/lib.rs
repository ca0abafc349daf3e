//! CascadeFlow — cost-aware speculative cascade routing for LLM back ends.
//!
//! A caller submits a [`CascadeRequest`] (plain text or multi-turn history,
//! optionally with tool schemas); the [`CascadeAgent`] classifies it, layers
//! rule overrides on top, routes it to an execution strategy, and runs the
//! cascade: a cheap drafter answers first, a quality gate scores the draft,
//! and only rejected drafts escalate to the stronger verifier. The result
//! carries cost, latency, routing, and quality metadata.
//!
//! ```rust,ignore
//! let config = CascadeConfig::load(Path::new("cascade.toml"))?.with_builtin_domains();
//! let mut providers = ProviderRegistry::new();
//! providers.register(Arc::new(OpenAiCompatible::from_settings("openai", &settings)?));
//!
//! let agent = CascadeAgent::new(config, providers);
//! let result = agent.execute(CascadeRequest::text("What is the capital of France?")).await?;
//! assert!(result.draft_accepted);
//! ```
//!
//! The CLI/HTTP surface, concrete back-end protocols beyond the bundled
//! OpenAI-compatible adapter, and tool execution are external collaborators;
//! this crate owns the request-time decision pipeline only.

pub mod adaptive;
pub mod classify;
pub mod config;
pub mod error;
pub mod executor;
pub mod message;
pub mod metrics;
pub mod provider;
pub mod result;
pub mod router;
pub mod rules;
pub mod scorer;
pub mod tools;
pub mod trace;

pub use adaptive::AdaptiveController;
pub use classify::{Classification, Classifier, Complexity, Domain};
pub use config::{CascadeConfig, ModelSpec};
pub use error::{CascadeError, CascadeFailure, Stage};
pub use executor::{CascadeAgent, CascadeRequest};
pub use message::{Message, Prompt, Role};
pub use metrics::MetricsRegistry;
pub use provider::{
    CompletionOptions, ModelResponse, OpenAiCompatible, Provider, ProviderRegistry, TokenUsage,
};
pub use result::CascadeResult;
pub use router::{RoutingDecision, Strategy};
pub use rules::{RuleContext, RuleDecision, RuleEngine};
pub use scorer::{Embedder, QualityScorer, ScoreSource};
pub use tools::{ToolCall, ToolChoice, ToolSpec};
pub use trace::{DecisionTrace, TraceRecord};
