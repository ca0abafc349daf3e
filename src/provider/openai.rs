//! OpenAI-compatible chat-completions adapter.
//!
//! Covers any backend speaking the `/v1/chat/completions` protocol — OpenAI,
//! OpenRouter, LM Studio, vLLM, Groq, Ollama's compat endpoint, and others.
//! Error mapping follows the taxonomy: 401/403 are permanent provider errors,
//! 429 is a rate limit carrying `Retry-After` when present, 5xx and transport
//! failures are transient.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use reqwest::{header, Client, StatusCode};
use serde_json::{json, Value};

use super::{
    apply_logprobs_fallback, estimate_tokens, CompletionOptions, FinishReason, ModelResponse,
    Provider, TokenUsage,
};
use crate::config::ProviderSettings;
use crate::error::CascadeError;
use crate::message::{Prompt, Role};
use crate::tools::{ToolCall, ToolChoice};

/// Per-1K-token USD rates for one model, input/output split.
#[derive(Debug, Clone, Copy)]
pub struct CostRate {
    pub input: f64,
    pub output: f64,
}

impl CostRate {
    /// Blended per-token rate assuming the typical 30 % input / 70 % output mix.
    fn blended(&self) -> f64 {
        self.input * 0.3 + self.output * 0.7
    }
}

/// Adapter for any OpenAI-compatible backend.
pub struct OpenAiCompatible {
    name: String,
    client: Client,
    base_url: String,
    /// Model-name prefix → rate. Longest prefix wins, so `gpt-4o-mini` is
    /// checked before `gpt-4o`. Models without a rate are free (cost 0).
    rates: Vec<(String, CostRate)>,
    native_logprobs: bool,
}

impl OpenAiCompatible {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout_ms: u64,
    ) -> Result<Self, CascadeError> {
        let mut headers = header::HeaderMap::new();
        if let Some(key) = api_key {
            let value = header::HeaderValue::from_str(&format!("Bearer {key}")).map_err(|_| {
                CascadeError::Config(
                    "API key contains invalid Authorization header characters".into(),
                )
            })?;
            headers.insert(header::AUTHORIZATION, value);
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| CascadeError::Config(format!("building HTTP client: {e}")))?;

        Ok(Self {
            name: name.into(),
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            rates: Vec::new(),
            native_logprobs: false,
        })
    }

    /// Build from config settings, resolving the API key from the environment.
    pub fn from_settings(tag: &str, settings: &ProviderSettings) -> Result<Self, CascadeError> {
        let api_key = settings
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.is_empty());
        Self::new(tag, settings.base_url.clone(), api_key, settings.timeout_ms)
    }

    /// Register a per-model rate. Prefix-matched, longest prefix first.
    pub fn with_rate(mut self, model_prefix: &str, input: f64, output: f64) -> Self {
        self.rates.push((model_prefix.to_string(), CostRate { input, output }));
        self.rates.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        self
    }

    /// Declare that this backend returns real logprobs.
    pub fn with_native_logprobs(mut self, value: bool) -> Self {
        self.native_logprobs = value;
        self
    }

    fn rate_for(&self, model: &str) -> Option<CostRate> {
        self.rates
            .iter()
            .find(|(prefix, _)| model.starts_with(prefix.as_str()))
            .map(|(_, rate)| *rate)
    }

    fn build_messages(prompt: &Prompt, options: &CompletionOptions) -> Vec<Value> {
        let mut messages = Vec::new();
        if let Some(system) = &options.system_prompt {
            messages.push(json!({ "role": "system", "content": system }));
        }
        match prompt {
            Prompt::Text(text) => {
                messages.push(json!({ "role": "user", "content": text }));
            }
            Prompt::Messages(history) => {
                for message in history {
                    let role = match message.role {
                        Role::System => "system",
                        Role::User => "user",
                        Role::Assistant => "assistant",
                        Role::Tool => "tool",
                    };
                    messages.push(json!({ "role": role, "content": message.content }));
                }
            }
        }
        messages
    }

    fn build_payload(&self, prompt: &Prompt, model: &str, options: &CompletionOptions) -> Value {
        let mut payload = json!({
            "model": model,
            "messages": Self::build_messages(prompt, options),
            "max_tokens": options.max_tokens,
            "temperature": options.temperature,
        });
        let body = payload.as_object_mut().expect("payload is an object");

        if !options.tools.is_empty() {
            let tools: Vec<Value> = options
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body.insert("tools".into(), Value::Array(tools));
            let choice = match &options.tool_choice {
                ToolChoice::Auto => json!("auto"),
                ToolChoice::Required => json!("required"),
                ToolChoice::None => json!("none"),
                ToolChoice::Named(name) => {
                    json!({ "type": "function", "function": { "name": name } })
                }
            };
            body.insert("tool_choice".into(), choice);
        }

        if options.logprobs && self.native_logprobs {
            body.insert("logprobs".into(), Value::Bool(true));
            if let Some(top) = options.top_logprobs {
                body.insert("top_logprobs".into(), json!(top));
            }
        }

        payload
    }

    fn map_status_error(&self, status: StatusCode, body: &str, retry_after: Option<Duration>)
        -> CascadeError
    {
        let message = extract_api_error(body).unwrap_or_else(|| format!("HTTP {status}"));
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CascadeError::Provider {
                provider: self.name.clone(),
                message: format!("invalid credentials: {message}"),
                transient: false,
            },
            StatusCode::TOO_MANY_REQUESTS => CascadeError::RateLimit {
                provider: self.name.clone(),
                message,
                retry_after,
            },
            s if s.is_server_error() => CascadeError::Provider {
                provider: self.name.clone(),
                message,
                transient: true,
            },
            _ => CascadeError::Model {
                model: String::new(),
                provider: self.name.clone(),
                message,
            },
        }
    }

    fn parse_response(
        &self,
        body: Value,
        model: &str,
        latency_ms: u64,
        prompt_text: &str,
        options: &CompletionOptions,
    ) -> Result<ModelResponse, CascadeError> {
        let choice = body
            .pointer("/choices/0")
            .ok_or_else(|| CascadeError::Model {
                model: model.to_string(),
                provider: self.name.clone(),
                message: "response has no choices".into(),
            })?;

        let content = choice
            .pointer("/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let tool_calls = parse_tool_calls(choice)?;

        if content.trim().is_empty() && tool_calls.is_empty() {
            return Err(CascadeError::Model {
                model: model.to_string(),
                provider: self.name.clone(),
                message: "backend returned empty content".into(),
            });
        }

        let finish_reason = choice
            .get("finish_reason")
            .and_then(Value::as_str)
            .map(FinishReason::from_wire)
            .unwrap_or(FinishReason::Stop);

        let (usage, usage_reported) = match (
            body.pointer("/usage/prompt_tokens").and_then(Value::as_u64),
            body.pointer("/usage/completion_tokens").and_then(Value::as_u64),
        ) {
            (Some(p), Some(c)) => (TokenUsage::split(p as u32, c as u32), true),
            _ => {
                // Backend reported no usage: estimate a total.
                let total = estimate_tokens(prompt_text) + estimate_tokens(&content);
                (TokenUsage::total_only(total), false)
            }
        };

        // Split pricing when the backend reported the split, blended otherwise.
        let cost = if usage_reported {
            self.estimate_cost(
                usage.prompt.unwrap_or(0),
                usage.completion.unwrap_or(0),
                model,
            )
        } else {
            self.rate_for(model)
                .map(|rate| f64::from(usage.total) / 1000.0 * rate.blended())
                .unwrap_or(0.0)
        };

        let (tokens, logprobs, top_logprobs) = parse_logprobs(choice);
        let has_native_logprobs = logprobs.is_some();

        let mut response = ModelResponse {
            content,
            tool_calls,
            model: model.to_string(),
            provider: self.name.clone(),
            tokens_used: usage,
            cost,
            latency_ms,
            finish_reason,
            confidence: 0.0,
            tokens,
            logprobs,
            top_logprobs,
            metadata: serde_json::Map::new(),
        };

        if has_native_logprobs {
            response.confidence = response.mean_token_probability().unwrap_or(0.5);
            response
                .metadata
                .insert("has_logprobs".into(), Value::Bool(true));
        } else {
            apply_logprobs_fallback(&mut response, options.temperature, 0.7);
        }

        Ok(response)
    }
}

#[async_trait::async_trait]
impl Provider for OpenAiCompatible {
    async fn complete(
        &self,
        prompt: &Prompt,
        model: &str,
        options: &CompletionOptions,
    ) -> Result<ModelResponse, CascadeError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let payload = self.build_payload(prompt, model, options);

        let started = Instant::now();
        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| CascadeError::Provider {
                provider: self.name.clone(),
                message: format!("POST {url}: {e}"),
                transient: true,
            })?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);

        let text = response.text().await.map_err(|e| CascadeError::Provider {
            provider: self.name.clone(),
            message: format!("reading response body: {e}"),
            transient: true,
        })?;
        let latency_ms = started.elapsed().as_millis() as u64;

        if !status.is_success() {
            let mut err = self.map_status_error(status, &text, retry_after);
            if let CascadeError::Model { model: m, .. } = &mut err {
                *m = model.to_string();
            }
            return Err(err);
        }

        let body: Value = serde_json::from_str(&text).map_err(|e| CascadeError::Model {
            model: model.to_string(),
            provider: self.name.clone(),
            message: format!("parsing backend response as JSON: {e}"),
        })?;

        self.parse_response(body, model, latency_ms, &prompt.to_prompt_string(), options)
    }

    fn supports_logprobs(&self) -> bool {
        self.native_logprobs
    }

    fn estimate_cost(&self, prompt_tokens: u32, completion_tokens: u32, model: &str) -> f64 {
        match self.rate_for(model) {
            Some(rate) => {
                if prompt_tokens > 0 || completion_tokens > 0 {
                    f64::from(prompt_tokens) / 1000.0 * rate.input
                        + f64::from(completion_tokens) / 1000.0 * rate.output
                } else {
                    0.0
                }
            }
            // No configured rate: a local or free-tier backend.
            None => 0.0,
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Pull a human-usable message out of an OpenAI-style error body.
fn extract_api_error(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .pointer("/error/message")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn parse_tool_calls(choice: &Value) -> Result<Vec<ToolCall>, CascadeError> {
    let Some(raw_calls) = choice.pointer("/message/tool_calls").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };

    let mut calls = Vec::with_capacity(raw_calls.len());
    for raw in raw_calls {
        let name = raw
            .pointer("/function/name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let arguments = match raw.pointer("/function/arguments") {
            // The wire format double-encodes arguments as a JSON string.
            Some(Value::String(s)) => serde_json::from_str(s).unwrap_or(Value::Null),
            Some(other) => other.clone(),
            None => Value::Null,
        };
        calls.push(ToolCall {
            id: raw.get("id").and_then(Value::as_str).map(str::to_string),
            name,
            arguments,
        });
    }
    Ok(calls)
}

/// Extract OpenAI-format logprobs: `choices[0].logprobs.content[]`.
fn parse_logprobs(
    choice: &Value,
) -> (
    Option<Vec<String>>,
    Option<Vec<f64>>,
    Option<Vec<HashMap<String, f64>>>,
) {
    let Some(entries) = choice.pointer("/logprobs/content").and_then(Value::as_array) else {
        return (None, None, None);
    };
    if entries.is_empty() {
        return (None, None, None);
    }

    let mut tokens = Vec::with_capacity(entries.len());
    let mut logprobs = Vec::with_capacity(entries.len());
    let mut top = Vec::with_capacity(entries.len());

    for entry in entries {
        let token = entry.get("token").and_then(Value::as_str).unwrap_or_default();
        let logprob = entry.get("logprob").and_then(Value::as_f64).unwrap_or(0.0);
        tokens.push(token.to_string());
        logprobs.push(logprob);

        let mut alternatives = HashMap::new();
        if let Some(tops) = entry.get("top_logprobs").and_then(Value::as_array) {
            for alt in tops {
                if let (Some(t), Some(lp)) = (
                    alt.get("token").and_then(Value::as_str),
                    alt.get("logprob").and_then(Value::as_f64),
                ) {
                    alternatives.insert(t.to_string(), lp);
                }
            }
        }
        if alternatives.is_empty() {
            alternatives.insert(token.to_string(), logprob);
        }
        top.push(alternatives);
    }

    (Some(tokens), Some(logprobs), Some(top))
}
