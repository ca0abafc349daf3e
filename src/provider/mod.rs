//! Provider abstraction: a uniform completion contract over N back ends.
//!
//! [`Provider`] is the single capability interface the executor consumes; a
//! [`ProviderRegistry`] keyed by provider tag replaces any adapter hierarchy.
//! Back ends that do not report logprobs get a deterministic fallback
//! estimate so the scorer always has a token-probability signal to blend.

pub mod openai;

pub use openai::OpenAiCompatible;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::LazyLock;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CascadeError;
use crate::message::Prompt;
use crate::tools::{ToolCall, ToolChoice, ToolSpec};

/// Why the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural completion (`stop` / `end_turn`).
    Stop,
    /// Output truncated at the token limit (`length` / `max_tokens`).
    Length,
    ContentFilter,
    ToolCalls,
    #[serde(untagged)]
    Other(String),
}

impl FinishReason {
    /// Normalize the finish-reason strings the common chat APIs emit.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "stop" | "end_turn" | "stop_sequence" => Self::Stop,
            "length" | "max_tokens" => Self::Length,
            "content_filter" => Self::ContentFilter,
            "tool_calls" | "tool_use" | "function_call" => Self::ToolCalls,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Token accounting for one completion. The split is optional — some back
/// ends only report a total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt: Option<u32>,
    #[serde(default)]
    pub completion: Option<u32>,
    pub total: u32,
}

impl TokenUsage {
    pub fn split(prompt: u32, completion: u32) -> Self {
        Self {
            prompt: Some(prompt),
            completion: Some(completion),
            total: prompt + completion,
        }
    }

    pub fn total_only(total: u32) -> Self {
        Self { prompt: None, completion: None, total }
    }
}

/// Standardized response from a back end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResponse {
    pub content: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    pub model: String,
    pub provider: String,
    pub tokens_used: TokenUsage,

    /// Cost in USD for this call. Zero-cost back ends always report 0.
    pub cost: f64,
    pub latency_ms: u64,
    pub finish_reason: FinishReason,

    /// Provider self-assessment in [0, 1]; may be a default.
    pub confidence: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_logprobs: Option<Vec<HashMap<String, f64>>>,

    /// Opaque pass-through from the back end.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, Value>,
}

impl ModelResponse {
    pub fn has_logprobs(&self) -> bool {
        self.logprobs.as_ref().is_some_and(|l| !l.is_empty())
    }

    /// Mean token probability `mean(exp(logprob_i))`, when logprobs exist.
    pub fn mean_token_probability(&self) -> Option<f64> {
        let logprobs = self.logprobs.as_ref()?;
        if logprobs.is_empty() {
            return None;
        }
        let sum: f64 = logprobs.iter().map(|lp| lp.exp()).sum();
        Some(sum / logprobs.len() as f64)
    }
}

/// Per-call generation options.
#[derive(Debug, Clone)]
pub struct CompletionOptions {
    pub max_tokens: u32,
    pub temperature: f64,
    pub system_prompt: Option<String>,
    pub tools: Vec<ToolSpec>,
    pub tool_choice: ToolChoice,
    pub logprobs: bool,
    pub top_logprobs: Option<u8>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            max_tokens: 1000,
            temperature: 0.7,
            system_prompt: None,
            tools: Vec::new(),
            tool_choice: ToolChoice::Auto,
            logprobs: false,
            top_logprobs: None,
        }
    }
}

/// The capability interface every back end adapter implements.
///
/// `complete` must either return a response with non-empty content (or tool
/// calls) or fail with a taxonomy error — never an empty success. The call is
/// cancelled by dropping its future; adapters must not detach work.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn complete(
        &self,
        prompt: &Prompt,
        model: &str,
        options: &CompletionOptions,
    ) -> Result<ModelResponse, CascadeError>;

    /// Whether the back end natively reports logprobs.
    fn supports_logprobs(&self) -> bool {
        false
    }

    /// Estimated cost in USD for a hypothetical call.
    fn estimate_cost(&self, prompt_tokens: u32, completion_tokens: u32, model: &str) -> f64;

    /// Provider tag used in the registry and in response metadata.
    fn name(&self) -> &str;
}

/// Registry keyed by provider tag.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, tag: &str) -> Result<Arc<dyn Provider>, CascadeError> {
        self.providers.get(tag).cloned().ok_or_else(|| {
            CascadeError::Routing(format!("no provider registered for tag `{tag}`"))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

static BPE: LazyLock<Option<tiktoken_rs::CoreBPE>> =
    LazyLock::new(|| tiktoken_rs::cl100k_base().ok());

/// Estimate the token count of a text for cost projection. Uses cl100k when
/// available, with a 4-chars-per-token fallback.
pub fn estimate_tokens(text: &str) -> u32 {
    match BPE.as_ref() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len() as u32,
        None => (text.len() / 4).max(1) as u32,
    }
}

/// Deterministic word/punctuation split used by the logprobs fallback.
pub fn simple_tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    for c in text.chars() {
        if c.is_alphanumeric() || c == '_' {
            word.push(c);
        } else {
            if !word.is_empty() {
                tokens.push(std::mem::take(&mut word));
            }
            if !c.is_whitespace() {
                tokens.push(c.to_string());
            }
        }
    }
    if !word.is_empty() {
        tokens.push(word);
    }
    tokens
}

/// Confidence estimate used when a back end reports no logprobs. Lower
/// temperature means higher confidence: `clamp(0.3, 0.95, base * (1.5 - T))`.
pub fn confidence_from_temperature(temperature: f64, base_confidence: f64) -> f64 {
    (base_confidence * (1.5 - temperature)).clamp(0.3, 0.95)
}

/// Fill estimated tokens/logprobs/top-logprobs into a response that lacks
/// them, so the returned arrays always have equal lengths and the actual
/// token occupies the top slot. Marks `metadata.has_logprobs = false`,
/// `metadata.estimated = true`.
pub fn apply_logprobs_fallback(
    response: &mut ModelResponse,
    temperature: f64,
    base_confidence: f64,
) {
    if response.tokens.is_none() {
        response.tokens = Some(simple_tokenize(&response.content));
    }
    let tokens = response.tokens.as_ref().expect("tokens just filled");

    let estimated = confidence_from_temperature(temperature, base_confidence);
    let logprob = estimated.ln();

    if response.logprobs.is_none() {
        response.logprobs = Some(vec![logprob; tokens.len()]);
        if response.confidence < 0.5 {
            response.confidence = estimated;
        }
    }

    if response.top_logprobs.is_none() {
        let logprobs = response.logprobs.as_ref().expect("logprobs just filled");
        let mut rng = rand::thread_rng();
        let mut top = Vec::with_capacity(tokens.len());
        for (token, lp) in tokens.iter().zip(logprobs) {
            let mut alternatives = HashMap::with_capacity(5);
            alternatives.insert(token.clone(), *lp);
            for j in 0..4u32 {
                let alt_token = if token.len() > 2 {
                    match j % 4 {
                        0 => flip_case(token),
                        1 => format!("{token}s"),
                        2 => format!("{token}."),
                        _ => format!(" {token}"),
                    }
                } else {
                    format!("<alt{j}>")
                };
                let alt_lp = lp - (j as f64 + 1.0) * 0.5 - rng.gen_range(0.0..0.3);
                // A synthesized variant may collide with the token itself
                // (case-flip of a digit run); the actual token keeps its slot.
                if alt_token != *token {
                    alternatives.insert(alt_token, alt_lp);
                }
            }
            top.push(alternatives);
        }
        response.top_logprobs = Some(top);
    }

    response
        .metadata
        .entry("has_logprobs".to_string())
        .or_insert(Value::Bool(false));
    response
        .metadata
        .entry("estimated".to_string())
        .or_insert(Value::Bool(true));
}

fn flip_case(token: &str) -> String {
    let mut chars = token.chars();
    match chars.next() {
        Some(first) if first.is_uppercase() => {
            first.to_lowercase().collect::<String>() + chars.as_str()
        }
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_reason_normalizes_wire_names() {
        assert_eq!(FinishReason::from_wire("stop"), FinishReason::Stop);
        assert_eq!(FinishReason::from_wire("end_turn"), FinishReason::Stop);
        assert_eq!(FinishReason::from_wire("max_tokens"), FinishReason::Length);
        assert_eq!(FinishReason::from_wire("tool_use"), FinishReason::ToolCalls);
        assert_eq!(
            FinishReason::from_wire("weird"),
            FinishReason::Other("weird".into())
        );
    }

    #[test]
    fn simple_tokenize_splits_words_and_punctuation() {
        assert_eq!(
            simple_tokenize("Hello, world! x_1"),
            vec!["Hello", ",", "world", "!", "x_1"]
        );
        assert!(simple_tokenize("").is_empty());
    }

    #[test]
    fn confidence_from_temperature_tracks_the_curve() {
        // temp 0.0 → 0.95 (clamped), temp 0.5 → 0.70, temp 1.0 → 0.35
        assert!((confidence_from_temperature(0.0, 0.7) - 0.95).abs() < 1e-9);
        assert!((confidence_from_temperature(0.5, 0.7) - 0.70).abs() < 1e-9);
        assert!((confidence_from_temperature(1.0, 0.7) - 0.35).abs() < 1e-9);
        // floor at 0.3
        assert!((confidence_from_temperature(1.5, 0.7) - 0.30).abs() < 1e-9);
    }

    #[test]
    fn fallback_fills_equal_length_arrays_with_actual_token_on_top() {
        let mut response = ModelResponse {
            content: "Paris is the capital.".into(),
            tool_calls: Vec::new(),
            model: "m".into(),
            provider: "p".into(),
            tokens_used: TokenUsage::total_only(5),
            cost: 0.0,
            latency_ms: 10,
            finish_reason: FinishReason::Stop,
            confidence: 0.0,
            tokens: None,
            logprobs: None,
            top_logprobs: None,
            metadata: serde_json::Map::new(),
        };
        apply_logprobs_fallback(&mut response, 0.3, 0.7);

        let tokens = response.tokens.as_ref().unwrap();
        let logprobs = response.logprobs.as_ref().unwrap();
        let top = response.top_logprobs.as_ref().unwrap();
        assert_eq!(tokens.len(), logprobs.len());
        assert_eq!(tokens.len(), top.len());

        for (token, (lp, alternatives)) in tokens.iter().zip(logprobs.iter().zip(top)) {
            // The actual token must hold the best logprob in its slot.
            let best = alternatives
                .values()
                .fold(f64::NEG_INFINITY, |acc, v| acc.max(*v));
            assert!((alternatives[token] - best).abs() < 1e-12);
            assert!((alternatives[token] - lp).abs() < 1e-12);
        }

        assert_eq!(response.metadata["has_logprobs"], Value::Bool(false));
        assert_eq!(response.metadata["estimated"], Value::Bool(true));
        assert!(response.confidence > 0.0);
    }

    #[test]
    fn mean_token_probability_is_mean_of_exp() {
        let mut response = ModelResponse {
            content: "x".into(),
            tool_calls: Vec::new(),
            model: "m".into(),
            provider: "p".into(),
            tokens_used: TokenUsage::total_only(1),
            cost: 0.0,
            latency_ms: 0,
            finish_reason: FinishReason::Stop,
            confidence: 0.5,
            tokens: None,
            logprobs: Some(vec![(0.8_f64).ln(), (0.6_f64).ln()]),
            top_logprobs: None,
            metadata: serde_json::Map::new(),
        };
        let mean = response.mean_token_probability().unwrap();
        assert!((mean - 0.7).abs() < 1e-9);

        response.logprobs = None;
        assert!(response.mean_token_probability().is_none());
    }

    #[test]
    fn model_response_serde_round_trip_preserves_key_fields() {
        let response = ModelResponse {
            content: "The capital of France is Paris.".into(),
            tool_calls: Vec::new(),
            model: "cheap".into(),
            provider: "openai".into(),
            tokens_used: TokenUsage::split(12, 8),
            cost: 0.00001,
            latency_ms: 120,
            finish_reason: FinishReason::Stop,
            confidence: 0.85,
            tokens: None,
            logprobs: None,
            top_logprobs: None,
            metadata: serde_json::Map::new(),
        };
        let json = serde_json::to_string(&response).unwrap();
        let reloaded: ModelResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(reloaded.content, response.content);
        assert_eq!(reloaded.tokens_used, response.tokens_used);
        assert!((reloaded.cost - response.cost).abs() < f64::EPSILON);
        assert!((reloaded.confidence - response.confidence).abs() < f64::EPSILON);
        assert_eq!(reloaded.finish_reason, FinishReason::Stop);
    }

    #[test]
    fn registry_resolves_by_tag() {
        let mut registry = ProviderRegistry::new();
        assert!(registry.is_empty());
        registry.register(Arc::new(testing::ScriptedProvider::new(
            "mock",
            0.001,
            vec![testing::ScriptedReply::text("hello world, a full reply")],
        )));
        assert!(registry.get("mock").is_ok());
        let err = registry.get("missing").err().unwrap();
        assert_eq!(err.kind(), "routing");
    }

    #[test]
    fn estimate_tokens_is_monotonic_in_length() {
        let short = estimate_tokens("hello");
        let long = estimate_tokens("hello world this is a much longer sentence with more tokens");
        assert!(long > short);
        assert!(short >= 1);
    }
}
