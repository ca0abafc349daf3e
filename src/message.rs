//! Prompt and message model.
//!
//! Callers submit either a plain string or an ordered message history; the two
//! forms are interconvertible. Multi-turn detection feeds the domain detector
//! (conversation boost) and the tool-complexity analyzer.

use serde::{Deserialize, Serialize};

/// Chat role of a single message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into() }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// The caller's prompt: a bare string or a full message history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Prompt {
    Text(String),
    Messages(Vec<Message>),
}

impl Prompt {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(s) => s.trim().is_empty(),
            Self::Messages(m) => m.iter().all(|msg| msg.content.trim().is_empty()),
        }
    }

    /// Render a deterministic `Role: content` transcript. Used when a backend
    /// takes a single string, and for token estimation.
    pub fn to_prompt_string(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Messages(messages) => {
                let mut lines = Vec::with_capacity(messages.len());
                for message in messages {
                    let content = message.content.trim();
                    if !content.is_empty() {
                        lines.push(format!("{}: {}", capitalize(message.role.as_str()), content));
                    }
                }
                lines.join("\n")
            }
        }
    }

    /// The most recent user turn — the text classification operates on.
    /// Falls back to the last message, then to the raw text form.
    pub fn last_user_message(&self) -> String {
        match self {
            Self::Text(s) => s.trim().to_string(),
            Self::Messages(messages) => {
                for message in messages.iter().rev() {
                    if message.role == Role::User {
                        return message.content.trim().to_string();
                    }
                }
                messages
                    .last()
                    .map(|m| m.content.trim().to_string())
                    .unwrap_or_default()
            }
        }
    }

    /// Whether this prompt represents a multi-turn conversation: either two or
    /// more user turns in the history, or textual history markers in the flat
    /// form.
    pub fn is_multi_turn(&self) -> bool {
        match self {
            Self::Text(s) => is_multi_turn_text(s),
            Self::Messages(messages) => {
                let user_turns = messages.iter().filter(|m| m.role == Role::User).count();
                user_turns >= 2
            }
        }
    }
}

impl From<&str> for Prompt {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Prompt {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Vec<Message>> for Prompt {
    fn from(messages: Vec<Message>) -> Self {
        Self::Messages(messages)
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Detect multi-turn markers in a flat prompt string.
///
/// Three signal classes, any of which is sufficient:
/// - explicit history headers ("conversation history:", "prior context:", …)
/// - turn markers ("turn 1:", "[turn 2]")
/// - two or more user-style markers plus at least one assistant-style marker
pub fn is_multi_turn_text(prompt: &str) -> bool {
    if prompt.is_empty() {
        return false;
    }
    let lower = prompt.to_lowercase();

    const HISTORY_MARKERS: &[&str] = &[
        "previous conversation:",
        "conversation history:",
        "conversation so far:",
        "prior context:",
        "chat history:",
        "dialogue history:",
        "earlier in the conversation:",
    ];
    if HISTORY_MARKERS.iter().any(|m| lower.contains(m)) {
        return true;
    }

    const TURN_MARKERS: &[&str] = &["turn 1:", "turn 2:", "[turn 1]", "[turn 2]", "turn 1\n", "turn 2\n"];
    if TURN_MARKERS.iter().any(|m| lower.contains(m)) {
        return true;
    }

    const USER_MARKERS: &[&str] = &["user:", "human:", "question:"];
    const ASSISTANT_MARKERS: &[&str] = &["assistant:", "ai:", "answer:"];
    let user_count: usize = USER_MARKERS.iter().map(|m| lower.matches(m).count()).sum();
    let assistant_count: usize = ASSISTANT_MARKERS.iter().map(|m| lower.matches(m).count()).sum();
    if user_count >= 2 && assistant_count >= 1 {
        return true;
    }

    const CURRENT_TURN_MARKERS: &[&str] =
        &["current turn:", "current question:", "now answer:", "now respond:"];
    if user_count >= 1
        && assistant_count >= 1
        && CURRENT_TURN_MARKERS.iter().any(|m| lower.contains(m))
    {
        return true;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_prompt_round_trips_as_string() {
        let p = Prompt::text("What is the capital of France?");
        assert_eq!(p.to_prompt_string(), "What is the capital of France?");
        assert_eq!(p.last_user_message(), "What is the capital of France?");
        assert!(!p.is_multi_turn());
    }

    #[test]
    fn messages_render_deterministic_transcript() {
        let p = Prompt::Messages(vec![
            Message::system("You are terse."),
            Message::user("Book LAX to SEA next Tuesday"),
            Message::assistant("Sure."),
            Message::user("Make it two passengers"),
        ]);
        let rendered = p.to_prompt_string();
        assert_eq!(
            rendered,
            "System: You are terse.\nUser: Book LAX to SEA next Tuesday\nAssistant: Sure.\nUser: Make it two passengers"
        );
    }

    #[test]
    fn last_user_message_skips_assistant_turns() {
        let p = Prompt::Messages(vec![
            Message::user("first"),
            Message::assistant("reply"),
            Message::user("second"),
            Message::assistant("done"),
        ]);
        assert_eq!(p.last_user_message(), "second");
    }

    #[test]
    fn two_user_turns_is_multi_turn() {
        let p = Prompt::Messages(vec![
            Message::user("Book LAX to SEA"),
            Message::assistant("Sure."),
            Message::user("Two passengers"),
        ]);
        assert!(p.is_multi_turn());

        let single = Prompt::Messages(vec![Message::user("hello")]);
        assert!(!single.is_multi_turn());
    }

    #[test]
    fn history_markers_in_flat_text_are_multi_turn() {
        assert!(is_multi_turn_text(
            "Conversation history:\nUser: hi\nAssistant: hello\nUser: how are you?"
        ));
        assert!(is_multi_turn_text("Turn 1: hi\nTurn 2: and now?"));
        assert!(!is_multi_turn_text("Explain photosynthesis"));
    }

    #[test]
    fn user_assistant_pair_counting() {
        let text = "User: a\nAssistant: b\nUser: c";
        assert!(is_multi_turn_text(text));
        // One user marker alone is not enough
        assert!(!is_multi_turn_text("User: only one question here"));
    }

    #[test]
    fn empty_prompt_detection() {
        assert!(Prompt::text("   ").is_empty());
        assert!(Prompt::Messages(vec![]).is_empty());
        assert!(Prompt::Messages(vec![Message::user("  ")]).is_empty());
        assert!(!Prompt::text("x").is_empty());
    }

    #[test]
    fn prompt_serde_forms_are_interconvertible() {
        let text: Prompt = serde_json::from_str("\"plain question\"").unwrap();
        assert_eq!(text, Prompt::text("plain question"));

        let messages: Prompt = serde_json::from_str(
            r#"[{"role":"user","content":"hi"},{"role":"assistant","content":"hello"}]"#,
        )
        .unwrap();
        assert!(matches!(messages, Prompt::Messages(ref m) if m.len() == 2));
    }
}
