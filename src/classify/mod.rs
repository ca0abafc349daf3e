//! Request classification: complexity, domain, and tool-call complexity.
//!
//! The classifier is the first stage of every request. It is pure — no model
//! calls — unless a semantic domain detector is plugged in, in which case the
//! semantic verdict replaces the keyword verdict whenever its confidence
//! clears the configured margin.

pub mod complexity;
pub mod domain;
pub mod tool_complexity;

pub use complexity::{Complexity, ComplexityEstimate};
pub use domain::{Domain, DomainDetection, DomainDetector};
pub use tool_complexity::ToolComplexityEstimate;

use crate::message::Prompt;
use crate::tools::ToolSpec;

/// Everything routing needs to know about one request.
#[derive(Debug, Clone)]
pub struct Classification {
    pub complexity: Complexity,
    pub complexity_confidence: f64,
    pub domain: Domain,
    pub domain_confidence: f64,
    /// Present only for tool-calling requests.
    pub tool_complexity: Option<Complexity>,
    pub multi_turn: bool,
    pub is_mcq: bool,
}

/// Pluggable semantic domain detector. When present its verdict replaces the
/// keyword scorer's unless the confidence falls below the margin.
pub trait SemanticDomainDetector: Send + Sync {
    fn detect(&self, query: &str) -> Option<(Domain, f64)>;
}

/// Front end combining the three analyzers.
pub struct Classifier {
    domains: DomainDetector,
    semantic: Option<Box<dyn SemanticDomainDetector>>,
    /// Minimum semantic confidence required to override the keyword verdict.
    semantic_margin: f64,
}

impl Default for Classifier {
    fn default() -> Self {
        Self {
            domains: DomainDetector::default(),
            semantic: None,
            semantic_margin: 0.6,
        }
    }
}

impl Classifier {
    pub fn new(domains: DomainDetector) -> Self {
        Self { domains, ..Self::default() }
    }

    pub fn with_semantic(
        mut self,
        detector: Box<dyn SemanticDomainDetector>,
        margin: f64,
    ) -> Self {
        self.semantic = Some(detector);
        self.semantic_margin = margin;
        self
    }

    /// Classify a prompt and its (possibly empty) tool list.
    pub fn classify(&self, prompt: &Prompt, tools: &[ToolSpec]) -> Classification {
        let query = prompt.last_user_message();
        let structural_multi_turn = prompt.is_multi_turn();

        let complexity = complexity::estimate(&query);
        let mut detection = self.domains.detect(&query, structural_multi_turn);

        if let Some(semantic) = &self.semantic {
            if let Some((domain, confidence)) = semantic.detect(&query) {
                if confidence >= self.semantic_margin {
                    tracing::debug!(
                        keyword = %detection.domain,
                        semantic = %domain,
                        confidence,
                        "semantic domain verdict replaces keyword verdict"
                    );
                    detection.domain = domain;
                    detection.confidence = confidence;
                }
            }
        }

        let tool_complexity = if tools.is_empty() {
            None
        } else {
            Some(tool_complexity::analyze(&query, tools, detection.multi_turn).level)
        };

        Classification {
            complexity: complexity.level,
            complexity_confidence: complexity.confidence,
            domain: detection.domain,
            domain_confidence: detection.confidence,
            tool_complexity,
            multi_turn: detection.multi_turn,
            is_mcq: detection.is_mcq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use serde_json::json;

    struct FixedSemantic(Domain, f64);
    impl SemanticDomainDetector for FixedSemantic {
        fn detect(&self, _query: &str) -> Option<(Domain, f64)> {
            Some((self.0, self.1))
        }
    }

    #[test]
    fn classify_plain_factual_query() {
        let c = Classifier::default().classify(
            &Prompt::text("What is the capital of France?"),
            &[],
        );
        assert_eq!(c.complexity, Complexity::Trivial);
        assert_eq!(c.domain, Domain::Factual);
        assert!(c.tool_complexity.is_none());
        assert!(!c.multi_turn);
    }

    #[test]
    fn tool_requests_get_a_tool_complexity() {
        let tools = vec![crate::tools::ToolSpec::new(
            "get_weather",
            "",
            json!({ "type": "object", "properties": { "location": { "type": "string" } } }),
        )];
        let c = Classifier::default().classify(&Prompt::text("What's the weather in Paris?"), &tools);
        assert!(c.tool_complexity.is_some());
    }

    #[test]
    fn multi_turn_history_is_flagged() {
        let prompt = Prompt::Messages(vec![
            Message::user("Book LAX to SEA next Tuesday"),
            Message::assistant("Sure."),
            Message::user("Make it two passengers"),
        ]);
        let c = Classifier::default().classify(&prompt, &[]);
        assert!(c.multi_turn);
    }

    #[test]
    fn semantic_verdict_wins_above_margin() {
        let classifier = Classifier::default()
            .with_semantic(Box::new(FixedSemantic(Domain::Legal, 0.9)), 0.6);
        let c = classifier.classify(&Prompt::text("What is the capital of France?"), &[]);
        assert_eq!(c.domain, Domain::Legal);
        assert!((c.domain_confidence - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn semantic_verdict_below_margin_is_ignored() {
        let classifier = Classifier::default()
            .with_semantic(Box::new(FixedSemantic(Domain::Legal, 0.3)), 0.6);
        let c = classifier.classify(&Prompt::text("What is the capital of France?"), &[]);
        assert_eq!(c.domain, Domain::Factual);
    }

    #[test]
    fn classification_operates_on_last_user_turn() {
        let prompt = Prompt::Messages(vec![
            Message::user("Tell me a story about dragons"),
            Message::assistant("Once upon a time..."),
            Message::user("What are the symptoms of diabetes?"),
        ]);
        let c = Classifier::default().classify(&prompt, &[]);
        // Multi-turn boosts conversation, but the medical signal from the last
        // user turn must survive into the verdict or the boost wins — either
        // way the creative first turn must not drive it.
        assert_ne!(c.domain, Domain::Creative);
    }
}
