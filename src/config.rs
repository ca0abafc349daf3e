//! Typed configuration for the cascade core.
//!
//! Config is loaded once at startup (TOML or built programmatically) and
//! validated before any request runs. Invalid configs are rejected with a
//! clear error rather than silently falling back to defaults.
//!
//! # Example
//! ```toml
//! [[models]]
//! name           = "cheap"
//! provider       = "openai"
//! cost_per_1k    = 0.0005
//! supports_tools = true
//!
//! [[models]]
//! name           = "strong"
//! provider       = "openai"
//! cost_per_1k    = 0.005
//! quality_tier   = 5
//! supports_tools = true
//!
//! [defaults]
//! drafter   = "cheap"
//! verifier  = "strong"
//! threshold = 0.7
//!
//! [domains.medical]
//! require_verifier = true
//! threshold        = 0.95
//! ```

use std::{collections::HashMap, path::Path, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::classify::{Complexity, Domain};
use crate::error::CascadeError;
use crate::router::Strategy;

/// One entry of the model pool.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelSpec {
    /// Unique model name referenced throughout the config.
    pub name: String,

    /// Provider tag — resolved against the provider registry at run time.
    pub provider: String,

    /// Blended cost per 1K tokens in USD. Zero for local or free-tier backends.
    #[serde(default)]
    pub cost_per_1k: f64,

    /// Relative quality rank, higher is better. Used to pick verifiers from a
    /// constrained candidate set.
    #[serde(default)]
    pub quality_tier: Option<u8>,

    /// Relative speed rank, higher is faster.
    #[serde(default)]
    pub speed_tier: Option<u8>,

    /// Whether the model can emit structured tool calls.
    #[serde(default)]
    pub supports_tools: bool,
}

/// Global drafter/verifier defaults used when no domain override applies.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CascadeDefaults {
    pub drafter: String,
    pub verifier: String,

    #[serde(default = "defaults::threshold")]
    pub threshold: f64,

    #[serde(default = "defaults::max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "defaults::temperature")]
    pub temperature: f64,

    /// Issue drafter and verifier concurrently; the verifier is cancelled when
    /// the draft is accepted.
    #[serde(default)]
    pub parallel_speculative: bool,
}

/// Per-domain cascade behaviour.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DomainSettings {
    /// Drafter model override; falls back to the global default.
    #[serde(default)]
    pub drafter: Option<String>,

    /// Verifier model override; falls back to the global default.
    #[serde(default)]
    pub verifier: Option<String>,

    #[serde(default = "defaults::threshold")]
    pub threshold: f64,

    #[serde(default = "defaults::temperature")]
    pub temperature: f64,

    /// Complexity whitelist for cascading. A classified complexity outside the
    /// list routes direct to the verifier. `None` means no restriction.
    #[serde(default)]
    pub cascade_complexities: Option<Vec<Complexity>>,

    /// Always use the verifier, regardless of draft quality.
    #[serde(default)]
    pub require_verifier: bool,

    /// Let the adaptive controller move this domain's threshold.
    #[serde(default = "defaults::enabled")]
    pub adaptive_threshold: bool,

    #[serde(default = "defaults::enabled")]
    pub enabled: bool,
}

impl Default for DomainSettings {
    fn default() -> Self {
        Self {
            drafter: None,
            verifier: None,
            threshold: defaults::threshold(),
            temperature: defaults::temperature(),
            cascade_complexities: None,
            require_verifier: false,
            adaptive_threshold: true,
            enabled: true,
        }
    }
}

impl DomainSettings {
    /// Built-in settings for domains with well-known quality requirements.
    /// Model overrides stay unset — the pool is deployment-specific.
    pub fn builtin(domain: Domain) -> Option<Self> {
        let (threshold, temperature, require_verifier) = match domain {
            Domain::Code => (0.85, 0.2, false),
            Domain::Medical => (0.95, 0.1, true),
            Domain::Legal => (0.90, 0.2, false),
            Domain::Data => (0.80, 0.3, false),
            Domain::Math => (0.90, 0.1, false),
            Domain::Structured => (0.75, 0.2, false),
            Domain::General => (0.70, 0.7, false),
            _ => return None,
        };
        Some(Self {
            threshold,
            temperature,
            require_verifier,
            ..Self::default()
        })
    }
}

/// Cost/speed/quality optimization weights attached to a user tier.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OptimizationWeights {
    #[serde(default = "defaults::weight")]
    pub cost: f64,
    #[serde(default = "defaults::weight")]
    pub speed: f64,
    #[serde(default = "defaults::weight")]
    pub quality: f64,
}

impl Default for OptimizationWeights {
    fn default() -> Self {
        Self {
            cost: defaults::weight(),
            speed: defaults::weight(),
            quality: defaults::weight(),
        }
    }
}

/// User-tier constraints (allow/exclude/prefer lists plus budget and quality).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TierSettings {
    #[serde(default)]
    pub allowed_models: Vec<String>,
    #[serde(default)]
    pub excluded_models: Vec<String>,
    #[serde(default)]
    pub preferred_models: Vec<String>,
    #[serde(default)]
    pub quality_threshold: Option<f64>,
    #[serde(default)]
    pub max_budget: Option<f64>,
    #[serde(default)]
    pub optimization: OptimizationWeights,
}

/// Workflow overrides. `force_models` is strict: the request may only use
/// models on the list.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WorkflowSettings {
    #[serde(default)]
    pub force_models: Vec<String>,
    #[serde(default)]
    pub preferred_models: Vec<String>,
    #[serde(default)]
    pub excluded_models: Vec<String>,
    #[serde(default)]
    pub quality_threshold: Option<f64>,
    #[serde(default)]
    pub max_budget: Option<f64>,
}

/// Per-tenant hard constraints.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TenantSettings {
    #[serde(default)]
    pub allowed_models: Vec<String>,
    #[serde(default)]
    pub preferred_channel: Option<String>,
}

/// Channel → model-subset routing with failover.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ChannelRouting {
    /// Channel name → models it may use.
    #[serde(default)]
    pub models: HashMap<String, Vec<String>>,

    /// Channel name → alternate channel used when the channel has no models.
    #[serde(default)]
    pub failover: HashMap<String, String>,

    /// Channel name → forced strategy. `heartbeat` and `cron` default to
    /// `DirectCheap` even without an entry here.
    #[serde(default)]
    pub strategies: HashMap<String, Strategy>,
}

/// Adaptive threshold controller parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdaptiveSettings {
    #[serde(default = "defaults::target_acceptance_rate")]
    pub target_acceptance_rate: f64,

    #[serde(default = "defaults::window_size")]
    pub window_size: usize,

    #[serde(default = "defaults::adjustment_step")]
    pub adjustment_step: f64,

    #[serde(default = "defaults::min_samples")]
    pub min_samples: usize,

    #[serde(default = "defaults::hard_query_capacity")]
    pub hard_query_capacity: usize,

    #[serde(default = "defaults::hard_query_similarity")]
    pub hard_query_similarity: f64,
}

impl Default for AdaptiveSettings {
    fn default() -> Self {
        Self {
            target_acceptance_rate: defaults::target_acceptance_rate(),
            window_size: defaults::window_size(),
            adjustment_step: defaults::adjustment_step(),
            min_samples: defaults::min_samples(),
            hard_query_capacity: defaults::hard_query_capacity(),
            hard_query_similarity: defaults::hard_query_similarity(),
        }
    }
}

/// Per-call and overall deadlines, in milliseconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutSettings {
    #[serde(default = "defaults::draft_timeout_ms")]
    pub draft_ms: u64,
    #[serde(default = "defaults::verify_timeout_ms")]
    pub verify_ms: u64,
    #[serde(default = "defaults::total_timeout_ms")]
    pub total_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            draft_ms: defaults::draft_timeout_ms(),
            verify_ms: defaults::verify_timeout_ms(),
            total_ms: defaults::total_timeout_ms(),
        }
    }
}

/// Retry policy for transient provider errors.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrySettings {
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "defaults::base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "defaults::max_delay_ms")]
    pub max_delay_ms: u64,
    /// Jitter fraction applied to each delay, at most this share of the delay.
    #[serde(default = "defaults::jitter")]
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: defaults::max_attempts(),
            base_delay_ms: defaults::base_delay_ms(),
            max_delay_ms: defaults::max_delay_ms(),
            jitter: defaults::jitter(),
        }
    }
}

/// Decision-trace sink settings. `path = None` disables the trace.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TraceSettings {
    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default = "defaults::trace_max_file_size")]
    pub max_file_size: u64,

    #[serde(default = "defaults::trace_max_backups")]
    pub max_backups: u32,
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            path: None,
            max_file_size: defaults::trace_max_file_size(),
            max_backups: defaults::trace_max_backups(),
        }
    }
}

/// Provider credentials and endpoint, passed through to the provider
/// collaborator. Opaque to the core beyond validation that the env var name
/// is non-empty when set.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderSettings {
    pub base_url: String,

    /// Environment variable holding the API key. Keeps secrets out of config.
    #[serde(default)]
    pub api_key_env: Option<String>,

    #[serde(default = "defaults::provider_timeout_ms")]
    pub timeout_ms: u64,
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CascadeConfig {
    /// The model pool.
    pub models: Vec<ModelSpec>,

    pub defaults: CascadeDefaults,

    /// Domain-keyed overrides; keys are domain names (`code`, `medical`, …).
    #[serde(default)]
    pub domains: HashMap<String, DomainSettings>,

    #[serde(default)]
    pub tiers: HashMap<String, TierSettings>,

    #[serde(default)]
    pub workflows: HashMap<String, WorkflowSettings>,

    #[serde(default)]
    pub tenants: HashMap<String, TenantSettings>,

    #[serde(default)]
    pub channels: ChannelRouting,

    #[serde(default)]
    pub adaptive: AdaptiveSettings,

    #[serde(default)]
    pub timeouts: TimeoutSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub trace: TraceSettings,

    /// Provider tag → endpoint/credentials.
    #[serde(default)]
    pub providers: HashMap<String, ProviderSettings>,
}

impl CascadeConfig {
    pub fn load(path: &Path) -> Result<Self, CascadeError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CascadeError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, CascadeError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| CascadeError::Config(format!("parsing config TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Seed the domain map with the built-in settings for any domain the
    /// config does not mention explicitly.
    pub fn with_builtin_domains(mut self) -> Self {
        for domain in Domain::ALL {
            if let Some(builtin) = DomainSettings::builtin(domain) {
                self.domains
                    .entry(domain.as_str().to_string())
                    .or_insert(builtin);
            }
        }
        self
    }

    pub fn validate(&self) -> Result<(), CascadeError> {
        let ensure = |cond: bool, msg: String| -> Result<(), CascadeError> {
            if cond {
                Ok(())
            } else {
                Err(CascadeError::Config(msg))
            }
        };

        ensure(!self.models.is_empty(), "model pool is empty".into())?;
        let known = |name: &str| self.models.iter().any(|m| m.name == name);

        ensure(
            known(&self.defaults.drafter),
            format!("defaults.drafter `{}` is not in the model pool", self.defaults.drafter),
        )?;
        ensure(
            known(&self.defaults.verifier),
            format!("defaults.verifier `{}` is not in the model pool", self.defaults.verifier),
        )?;
        ensure(
            (0.0..=1.0).contains(&self.defaults.threshold),
            format!("defaults.threshold {} must be within [0, 1]", self.defaults.threshold),
        )?;

        for (name, domain) in &self.domains {
            ensure(
                Domain::parse(name).is_some(),
                format!("unknown domain `{name}` in [domains]"),
            )?;
            for model in domain.drafter.iter().chain(domain.verifier.iter()) {
                ensure(
                    known(model),
                    format!("domain `{name}` references unknown model `{model}`"),
                )?;
            }
            ensure(
                (0.0..=1.0).contains(&domain.threshold),
                format!("domain `{name}` threshold {} must be within [0, 1]", domain.threshold),
            )?;
            ensure(
                (0.0..=2.0).contains(&domain.temperature),
                format!("domain `{name}` temperature {} must be within [0, 2]", domain.temperature),
            )?;
        }

        for (name, tier) in &self.tiers {
            for model in tier
                .allowed_models
                .iter()
                .chain(&tier.excluded_models)
                .chain(&tier.preferred_models)
            {
                ensure(
                    known(model),
                    format!("tier `{name}` references unknown model `{model}`"),
                )?;
            }
        }

        for (name, workflow) in &self.workflows {
            for model in workflow
                .force_models
                .iter()
                .chain(&workflow.preferred_models)
                .chain(&workflow.excluded_models)
            {
                ensure(
                    known(model),
                    format!("workflow `{name}` references unknown model `{model}`"),
                )?;
            }
        }

        for (name, tenant) in &self.tenants {
            for model in &tenant.allowed_models {
                ensure(
                    known(model),
                    format!("tenant `{name}` references unknown model `{model}`"),
                )?;
            }
        }

        for (channel, models) in &self.channels.models {
            for model in models {
                ensure(
                    known(model),
                    format!("channel `{channel}` references unknown model `{model}`"),
                )?;
            }
        }
        for (channel, target) in &self.channels.failover {
            ensure(
                self.channels.models.contains_key(target),
                format!("channel `{channel}` fails over to undeclared channel `{target}`"),
            )?;
        }

        ensure(
            self.adaptive.window_size > 0 && self.adaptive.min_samples > 0,
            "adaptive window_size and min_samples must be positive".into(),
        )?;
        ensure(
            (0.0..=1.0).contains(&self.adaptive.target_acceptance_rate),
            "adaptive target_acceptance_rate must be within [0, 1]".into(),
        )?;

        Ok(())
    }

    /// Look up a pool model by name.
    pub fn model(&self, name: &str) -> Option<&ModelSpec> {
        self.models.iter().find(|m| m.name == name)
    }

    /// Domain settings for a classified domain, when configured and enabled.
    pub fn domain_settings(&self, domain: Domain) -> Option<&DomainSettings> {
        self.domains.get(domain.as_str()).filter(|d| d.enabled)
    }

    /// Models declaring tool support.
    pub fn tool_capable_models(&self) -> Vec<&ModelSpec> {
        self.models.iter().filter(|m| m.supports_tools).collect()
    }
}

mod defaults {
    pub fn threshold() -> f64 { 0.70 }
    pub fn max_tokens() -> u32 { 1000 }
    pub fn temperature() -> f64 { 0.7 }
    pub fn enabled() -> bool { true }
    pub fn weight() -> f64 { 1.0 / 3.0 }
    pub fn target_acceptance_rate() -> f64 { 0.55 }
    pub fn window_size() -> usize { 200 }
    pub fn adjustment_step() -> f64 { 0.01 }
    pub fn min_samples() -> usize { 30 }
    pub fn hard_query_capacity() -> usize { 500 }
    pub fn hard_query_similarity() -> f64 { 0.85 }
    pub fn draft_timeout_ms() -> u64 { 10_000 }
    pub fn verify_timeout_ms() -> u64 { 30_000 }
    pub fn total_timeout_ms() -> u64 { 45_000 }
    pub fn max_attempts() -> u32 { 3 }
    pub fn base_delay_ms() -> u64 { 1_000 }
    pub fn max_delay_ms() -> u64 { 30_000 }
    pub fn jitter() -> f64 { 0.10 }
    pub fn trace_max_file_size() -> u64 { 50 * 1024 * 1024 }
    pub fn trace_max_backups() -> u32 { 3 }
    pub fn provider_timeout_ms() -> u64 { 30_000 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> CascadeConfig {
        CascadeConfig::from_toml_str(
            r#"
            [[models]]
            name           = "cheap"
            provider       = "openai"
            cost_per_1k    = 0.0005
            supports_tools = true

            [[models]]
            name           = "strong"
            provider       = "openai"
            cost_per_1k    = 0.005
            quality_tier   = 5
            supports_tools = true

            [defaults]
            drafter   = "cheap"
            verifier  = "strong"
            threshold = 0.7
            "#,
        )
        .expect("minimal config should parse")
    }

    #[test]
    fn parse_example_config() {
        let content = include_str!("../config.example.toml");
        let config = CascadeConfig::from_toml_str(content).expect("example config should be valid");
        assert_eq!(config.defaults.drafter, "gpt-4o-mini");
        assert!(config.domain_settings(Domain::Medical).unwrap().require_verifier);
        assert_eq!(
            config.channels.strategies.get("slack"),
            Some(&crate::router::Strategy::Cascade)
        );
    }

    #[test]
    fn parse_minimal_config_and_defaults() {
        let config = minimal_config();
        assert_eq!(config.defaults.max_tokens, 1000);
        assert_eq!(config.timeouts.draft_ms, 10_000);
        assert_eq!(config.timeouts.verify_ms, 30_000);
        assert_eq!(config.timeouts.total_ms, 45_000);
        assert_eq!(config.adaptive.window_size, 200);
        assert_eq!(config.adaptive.min_samples, 30);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.trace.max_backups, 3);
        assert_eq!(config.trace.max_file_size, 50 * 1024 * 1024);
        assert!(config.trace.path.is_none());
    }

    #[test]
    fn validation_rejects_unknown_default_models() {
        let result = CascadeConfig::from_toml_str(
            r#"
            [[models]]
            name     = "cheap"
            provider = "openai"

            [defaults]
            drafter  = "cheap"
            verifier = "missing"
            "#,
        );
        assert!(matches!(result, Err(CascadeError::Config(_))));
    }

    #[test]
    fn validation_rejects_unknown_domain_name() {
        let result = CascadeConfig::from_toml_str(
            r#"
            [[models]]
            name     = "cheap"
            provider = "openai"

            [defaults]
            drafter  = "cheap"
            verifier = "cheap"

            [domains.astrology]
            threshold = 0.8
            "#,
        );
        assert!(matches!(result, Err(CascadeError::Config(_))));
    }

    #[test]
    fn validation_rejects_domain_with_unknown_model() {
        let result = CascadeConfig::from_toml_str(
            r#"
            [[models]]
            name     = "cheap"
            provider = "openai"

            [defaults]
            drafter  = "cheap"
            verifier = "cheap"

            [domains.code]
            drafter = "no-such-model"
            "#,
        );
        assert!(matches!(result, Err(CascadeError::Config(_))));
    }

    #[test]
    fn validation_rejects_out_of_range_threshold() {
        let result = CascadeConfig::from_toml_str(
            r#"
            [[models]]
            name     = "cheap"
            provider = "openai"

            [defaults]
            drafter   = "cheap"
            verifier  = "cheap"
            threshold = 1.5
            "#,
        );
        assert!(matches!(result, Err(CascadeError::Config(_))));
    }

    #[test]
    fn validation_rejects_dangling_channel_failover() {
        let result = CascadeConfig::from_toml_str(
            r#"
            [[models]]
            name     = "cheap"
            provider = "openai"

            [defaults]
            drafter  = "cheap"
            verifier = "cheap"

            [channels.failover]
            slack = "nowhere"
            "#,
        );
        assert!(matches!(result, Err(CascadeError::Config(_))));
    }

    #[test]
    fn builtin_domains_fill_gaps_but_never_override() {
        let config = CascadeConfig::from_toml_str(
            r#"
            [[models]]
            name     = "cheap"
            provider = "openai"

            [defaults]
            drafter  = "cheap"
            verifier = "cheap"

            [domains.medical]
            threshold        = 0.80
            require_verifier = false
            "#,
        )
        .unwrap()
        .with_builtin_domains();

        // Explicit config wins
        let medical = config.domain_settings(Domain::Medical).unwrap();
        assert!((medical.threshold - 0.80).abs() < f64::EPSILON);
        assert!(!medical.require_verifier);

        // Built-in fills the gap
        let code = config.domain_settings(Domain::Code).unwrap();
        assert!((code.threshold - 0.85).abs() < f64::EPSILON);

        // Domains without builtins stay unset
        assert!(config.domain_settings(Domain::Creative).is_none());
    }

    #[test]
    fn disabled_domain_is_invisible() {
        let config = CascadeConfig::from_toml_str(
            r#"
            [[models]]
            name     = "cheap"
            provider = "openai"

            [defaults]
            drafter  = "cheap"
            verifier = "cheap"

            [domains.code]
            enabled = false
            "#,
        )
        .unwrap();
        assert!(config.domain_settings(Domain::Code).is_none());
    }

    #[test]
    fn tool_capable_filter() {
        let config = CascadeConfig::from_toml_str(
            r#"
            [[models]]
            name           = "cheap"
            provider       = "openai"
            supports_tools = true

            [[models]]
            name     = "text-only"
            provider = "openai"

            [defaults]
            drafter  = "cheap"
            verifier = "text-only"
            "#,
        )
        .unwrap();
        let capable = config.tool_capable_models();
        assert_eq!(capable.len(), 1);
        assert_eq!(capable[0].name, "cheap");
    }

    #[test]
    fn cascade_complexities_parse_from_toml() {
        let config = CascadeConfig::from_toml_str(
            r#"
            [[models]]
            name     = "cheap"
            provider = "openai"

            [defaults]
            drafter  = "cheap"
            verifier = "cheap"

            [domains.code]
            cascade_complexities = ["trivial", "simple", "moderate"]
            "#,
        )
        .unwrap();
        let code = config.domain_settings(Domain::Code).unwrap();
        assert_eq!(
            code.cascade_complexities.as_deref(),
            Some(&[Complexity::Trivial, Complexity::Simple, Complexity::Moderate][..])
        );
    }
}
