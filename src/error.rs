//! Error taxonomy for the cascade core.
//!
//! Every failure surfaced to a caller carries a stable, machine-readable kind
//! code (see [`CascadeError::kind`]) plus a human-readable reason. Transient
//! provider failures and rate limits are the only kinds the executor recovers
//! from locally; everything else bubbles up.
//!
//! Request-path failures are wrapped in [`CascadeFailure`], which attaches the
//! request id, the executor stage, and any cost already incurred — provider
//! stack traces never reach the caller, but the stage and id always do.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Executor stage at which a request failed or is currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Classify,
    Route,
    Draft,
    Score,
    Verify,
    Finalize,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Classify => "classify",
            Self::Route => "route",
            Self::Draft => "draft",
            Self::Score => "score",
            Self::Verify => "verify",
            Self::Finalize => "finalize",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All error kinds the core can produce.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CascadeError {
    /// Invalid configuration. Fatal at startup.
    #[error("config error: {0}")]
    Config(String),

    /// Provider-level failure. `transient` distinguishes 5xx/network errors
    /// (retriable) from credential/permanent failures.
    #[error("provider `{provider}` error: {message}")]
    Provider {
        provider: String,
        message: String,
        transient: bool,
    },

    /// The model call itself failed (malformed response, refused generation).
    /// Retried once, then surfaced.
    #[error("model `{model}` on `{provider}` failed: {message}")]
    Model {
        model: String,
        provider: String,
        message: String,
    },

    /// HTTP 429 or provider quota. Retried up to the configured attempt cap,
    /// honouring `retry_after` when the backend supplied one.
    #[error("rate limited by `{provider}`: {message}")]
    RateLimit {
        provider: String,
        message: String,
        retry_after: Option<Duration>,
    },

    /// The remaining budget cannot cover the next outbound call.
    #[error("budget exceeded: needed {needed:.6} USD but only {remaining:.6} of {limit:.6} remains")]
    BudgetExceeded {
        needed: f64,
        remaining: f64,
        limit: f64,
    },

    /// Draft confidence fell below the effective threshold. Internal only —
    /// the executor converts this into an escalation, never a caller error.
    #[error("quality threshold not met: confidence {confidence:.2} < threshold {threshold:.2}")]
    QualityThreshold { confidence: f64, threshold: f64 },

    /// No executable routing decision could be produced.
    #[error("routing error: {0}")]
    Routing(String),

    /// Malformed caller input (empty prompt, bad tool schema, invalid tool call).
    #[error("validation error: {0}")]
    Validation(String),

    /// A per-call or overall deadline elapsed.
    #[error("timed out during {stage} after {elapsed_ms} ms")]
    Timeout { stage: Stage, elapsed_ms: u64 },

    /// The caller's cancellation token fired. Partial content is never
    /// returned; the wrapping [`CascadeFailure`] reports incurred cost.
    #[error("cancelled during {stage}")]
    Cancelled { stage: Stage },
}

impl CascadeError {
    /// Stable machine-readable kind code. Wire-level: never rename.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Provider { .. } => "provider",
            Self::Model { .. } => "model",
            Self::RateLimit { .. } => "rate_limit",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::QualityThreshold { .. } => "quality_threshold",
            Self::Routing(_) => "routing",
            Self::Validation(_) => "validation",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    /// Whether the executor may retry the failed call.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Provider { transient: true, .. } | Self::RateLimit { .. }
        )
    }

    /// Suggested wait before the next attempt, when the backend told us.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// A request-path failure: the error plus where it happened and what it cost.
#[derive(Debug, Clone, thiserror::Error)]
#[error("request {request_id} failed during {stage}: {error}")]
pub struct CascadeFailure {
    pub request_id: String,
    pub stage: Stage,
    #[source]
    pub error: CascadeError,
    /// Cost already incurred before the failure (draft cost on a failed
    /// verify, for example). Always reported, even on cancellation.
    pub cost_incurred: f64,
}

impl CascadeFailure {
    pub fn new(request_id: impl Into<String>, stage: Stage, error: CascadeError) -> Self {
        Self {
            request_id: request_id.into(),
            stage,
            error,
            cost_incurred: 0.0,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost_incurred = cost;
        self
    }

    /// Stable kind code of the underlying error.
    pub fn kind(&self) -> &'static str {
        self.error.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_codes_are_stable() {
        let cases: Vec<(CascadeError, &str)> = vec![
            (CascadeError::Config("x".into()), "config"),
            (
                CascadeError::Provider {
                    provider: "p".into(),
                    message: "m".into(),
                    transient: true,
                },
                "provider",
            ),
            (
                CascadeError::RateLimit {
                    provider: "p".into(),
                    message: "m".into(),
                    retry_after: None,
                },
                "rate_limit",
            ),
            (
                CascadeError::BudgetExceeded {
                    needed: 1.0,
                    remaining: 0.0,
                    limit: 0.5,
                },
                "budget_exceeded",
            ),
            (CascadeError::Routing("r".into()), "routing"),
            (CascadeError::Validation("v".into()), "validation"),
        ];
        for (err, code) in cases {
            assert_eq!(err.kind(), code);
        }
    }

    #[test]
    fn only_transient_provider_and_rate_limit_are_retryable() {
        assert!(CascadeError::Provider {
            provider: "p".into(),
            message: "502".into(),
            transient: true,
        }
        .is_retryable());
        assert!(CascadeError::RateLimit {
            provider: "p".into(),
            message: "429".into(),
            retry_after: Some(Duration::from_secs(2)),
        }
        .is_retryable());

        assert!(!CascadeError::Provider {
            provider: "p".into(),
            message: "bad key".into(),
            transient: false,
        }
        .is_retryable());
        assert!(!CascadeError::Validation("empty prompt".into()).is_retryable());
        assert!(!CascadeError::BudgetExceeded {
            needed: 0.1,
            remaining: 0.0,
            limit: 0.0,
        }
        .is_retryable());
    }

    #[test]
    fn failure_display_includes_request_id_and_stage() {
        let failure = CascadeFailure::new(
            "req-123",
            Stage::Verify,
            CascadeError::Timeout {
                stage: Stage::Verify,
                elapsed_ms: 30_000,
            },
        )
        .with_cost(0.002);

        let message = failure.to_string();
        assert!(message.contains("req-123"));
        assert!(message.contains("verify"));
        assert!((failure.cost_incurred - 0.002).abs() < f64::EPSILON);
    }

    #[test]
    fn rate_limit_exposes_retry_after() {
        let err = CascadeError::RateLimit {
            provider: "p".into(),
            message: "quota".into(),
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(CascadeError::Config("x".into()).retry_after(), None);
    }
}
