use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{MinbarError, Result};
use crate::gateway::{GenerationConfig, LlmGateway};

/// Hard budget on the tokens a context window may occupy.
pub const TOKEN_LIMIT: u64 = 200_000;

/// Roles carried by persisted messages and by window content blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
    Function,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Model => "model",
            Self::Function => "function",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = MinbarError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(Self::User),
            "model" => Ok(Self::Model),
            "function" => Ok(Self::Function),
            other => Err(MinbarError::invalid_input(format!("unknown role: {other}"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub args: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub name: String,
    pub response: serde_json::Value,
}

/// One part of a content block sent to the LLM.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text { text: String },
    FunctionCall { call: FunctionCall },
    FunctionResponse { response: FunctionResponse },
}

/// A role-tagged block of parts, the unit the LLM window is made of.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![Part::Text { text: text.into() }],
        }
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            parts: vec![Part::Text { text: text.into() }],
        }
    }

    pub fn model_call(call: FunctionCall) -> Self {
        Self {
            role: Role::Model,
            parts: vec![Part::FunctionCall { call }],
        }
    }

    pub fn user_response(response: FunctionResponse) -> Self {
        Self {
            role: Role::User,
            parts: vec![Part::FunctionResponse { response }],
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    #[default]
    Stop,
    MaxTokens,
    FunctionCall,
    Safety,
    Other,
}

/// What went into one LLM call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InferenceInput {
    Text { text: String },
    FunctionResponse { response: FunctionResponse },
}

/// What came out of one LLM call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InferenceOutput {
    Text { text: String },
    FunctionCall { call: FunctionCall },
}

/// One LLM call's input and output with its accounting.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Inference {
    pub input: InferenceInput,
    pub output: InferenceOutput,
    pub usage: TokenUsage,
    pub finish_reason: FinishReason,
}

/// One question/answer cycle. Holds one Inference when the model answered
/// directly, two when it called a tool first.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub turn: u64,
    pub inferences: Vec<Inference>,
    pub created_at: DateTime<Utc>,
}

impl Interaction {
    pub fn is_tool_augmented(&self) -> bool {
        self.inferences.len() > 1
    }

    /// The user text that opened this turn. None when the interaction
    /// carries no inferences, which a deserialized payload may.
    pub fn prompt(&self) -> Option<&str> {
        match &self.inferences.first()?.input {
            InferenceInput::Text { text } => Some(text),
            InferenceInput::FunctionResponse { .. } => Some(""),
        }
    }

    /// The model text that closed this turn.
    pub fn answer(&self) -> Option<&str> {
        match &self.inferences.last()?.output {
            InferenceOutput::Text { text } => Some(text),
            InferenceOutput::FunctionCall { .. } => Some(""),
        }
    }
}

/// A durable fact about the user, keyed by a stable kebab-case key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    pub key: String,
    pub content: String,
    pub updated_at: DateTime<Utc>,
}

/// A prior session's compressed history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub summary: String,
    pub last_accessed: DateTime<Utc>,
}

/// Per-(user,session) conversational state. Mutated only by appending the
/// newest Interaction.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextWindow {
    pub memories: Vec<Memory>,
    pub summaries: Vec<SessionSummary>,
    pub history: Vec<Interaction>,
    pub turns: u64,
}

impl ContextWindow {
    pub fn next_turn(&self) -> u64 {
        self.turns + 1
    }

    pub fn append(&mut self, interaction: Interaction) {
        self.turns = interaction.turn;
        self.history.push(interaction);
    }
}

/// Relative age for memory and summary blocks. Coarse on purpose.
pub fn humanize_from(now: DateTime<Utc>, then: DateTime<Utc>) -> String {
    let mut delta = now.signed_duration_since(then);
    if delta < chrono::Duration::zero() {
        delta = -delta;
    }
    let mins = delta.num_minutes();
    let hours = delta.num_hours();
    let days = delta.num_days();
    match () {
        _ if mins < 1 => "just now".to_string(),
        _ if mins < 60 => format!("{mins} minutes ago"),
        _ if hours < 24 => format!("{hours} hours ago"),
        _ if days < 7 => format!("{days} days ago"),
        _ if days < 30 => format!("{} weeks ago", days / 7),
        _ if days < 365 => format!("{} months ago", days / 30),
        _ => format!("{} years ago", days / 365),
    }
}

fn unroll_turn(interaction: &Interaction) -> Vec<Content> {
    let Some(first) = interaction.inferences.first() else {
        return Vec::new();
    };
    let mut blocks = vec![Content::user_text(interaction.prompt().unwrap_or_default())];

    if interaction.is_tool_augmented() {
        let second = &interaction.inferences[1];
        if let InferenceOutput::FunctionCall { call } = &first.output {
            blocks.push(Content::model_call(call.clone()));
        }
        if let InferenceInput::FunctionResponse { response } = &second.input {
            blocks.push(Content::user_response(response.clone()));
        }
        blocks.push(Content::model_text(interaction.answer().unwrap_or_default()));
    } else {
        blocks.push(Content::model_text(interaction.answer().unwrap_or_default()));
    }
    blocks
}

/// Assemble the content blocks for a window: memories, prior-session
/// summaries, then history unrolled per turn. While the whole candidate
/// exceeds [`TOKEN_LIMIT`], the oldest whole turn is dropped; if a single
/// turn still exceeds the budget the history is dropped entirely.
/// Memory and summary blocks are never dropped.
pub async fn build_context_window(
    gateway: &dyn LlmGateway,
    model: &str,
    config: &GenerationConfig,
    cw: &ContextWindow,
    now: DateTime<Utc>,
) -> Result<Vec<Content>> {
    let mut contents = Vec::new();

    if !cw.memories.is_empty() {
        let parts = cw
            .memories
            .iter()
            .map(|m| Part::Text {
                text: format!("As of {}, {}", humanize_from(now, m.updated_at), m.content),
            })
            .collect();
        contents.push(Content {
            role: Role::User,
            parts,
        });
    }

    if !cw.summaries.is_empty() {
        let parts = cw
            .summaries
            .iter()
            .map(|s| Part::Text {
                text: format!(
                    "Last Accessed: {} Summary: {}",
                    humanize_from(now, s.last_accessed),
                    s.summary
                ),
            })
            .collect();
        contents.push(Content {
            role: Role::User,
            parts,
        });
    }

    let mut turns: Vec<Vec<Content>> = cw.history.iter().map(unroll_turn).collect();

    loop {
        let mut candidate = contents.clone();
        for turn in &turns {
            candidate.extend(turn.iter().cloned());
        }

        let tokens = gateway.count_tokens(model, &candidate, config).await?;
        if tokens < TOKEN_LIMIT {
            return Ok(candidate);
        }

        if turns.len() > 1 {
            turns.remove(0);
        } else {
            return Ok(contents);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    pub(crate) fn plain_interaction(turn: u64, prompt: &str, answer: &str) -> Interaction {
        Interaction {
            turn,
            inferences: vec![Inference {
                input: InferenceInput::Text { text: prompt.into() },
                output: InferenceOutput::Text { text: answer.into() },
                usage: TokenUsage::default(),
                finish_reason: FinishReason::Stop,
            }],
            created_at: Utc::now(),
        }
    }

    pub(crate) fn tool_interaction(turn: u64, prompt: &str, answer: &str) -> Interaction {
        let call = FunctionCall {
            name: "search".into(),
            args: serde_json::json!({"query": prompt}),
        };
        let response = FunctionResponse {
            name: "search".into(),
            response: serde_json::json!({"documents": []}),
        };
        Interaction {
            turn,
            inferences: vec![
                Inference {
                    input: InferenceInput::Text { text: prompt.into() },
                    output: InferenceOutput::FunctionCall { call },
                    usage: TokenUsage::default(),
                    finish_reason: FinishReason::FunctionCall,
                },
                Inference {
                    input: InferenceInput::FunctionResponse { response },
                    output: InferenceOutput::Text { text: answer.into() },
                    usage: TokenUsage::default(),
                    finish_reason: FinishReason::Stop,
                },
            ],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn plain_turn_unrolls_to_two_blocks() {
        let blocks = unroll_turn(&plain_interaction(1, "hi", "hello"));
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].role, Role::User);
        assert_eq!(blocks[1].role, Role::Model);
    }

    #[test]
    fn tool_turn_unrolls_to_four_blocks() {
        let blocks = unroll_turn(&tool_interaction(1, "hi", "hello"));
        assert_eq!(blocks.len(), 4);
        let roles: Vec<Role> = blocks.iter().map(|b| b.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Model, Role::User, Role::Model]);
        assert!(matches!(blocks[1].parts[0], Part::FunctionCall { .. }));
        assert!(matches!(blocks[2].parts[0], Part::FunctionResponse { .. }));
    }

    #[test]
    fn append_advances_turn_counter() {
        let mut cw = ContextWindow::default();
        assert_eq!(cw.next_turn(), 1);
        cw.append(plain_interaction(1, "a", "b"));
        assert_eq!(cw.turns, 1);
        assert_eq!(cw.next_turn(), 2);
        assert_eq!(cw.history.len(), 1);
    }

    #[test]
    fn humanize_buckets() {
        let now = Utc::now();
        assert_eq!(humanize_from(now, now - Duration::seconds(20)), "just now");
        assert_eq!(humanize_from(now, now - Duration::minutes(5)), "5 minutes ago");
        assert_eq!(humanize_from(now, now - Duration::hours(3)), "3 hours ago");
        assert_eq!(humanize_from(now, now - Duration::days(2)), "2 days ago");
        assert_eq!(humanize_from(now, now - Duration::days(14)), "2 weeks ago");
        assert_eq!(humanize_from(now, now - Duration::days(90)), "3 months ago");
        assert_eq!(humanize_from(now, now - Duration::days(800)), "2 years ago");
    }

    #[test]
    fn humanize_is_symmetric_for_future_times() {
        let now = Utc::now();
        assert_eq!(humanize_from(now, now + Duration::minutes(5)), "5 minutes ago");
    }

    #[test]
    fn interaction_accessors() {
        let plain = plain_interaction(3, "question", "answer");
        assert_eq!(plain.prompt(), Some("question"));
        assert_eq!(plain.answer(), Some("answer"));
        assert!(!plain.is_tool_augmented());

        let tool = tool_interaction(4, "question", "answer");
        assert_eq!(tool.prompt(), Some("question"));
        assert_eq!(tool.answer(), Some("answer"));
        assert!(tool.is_tool_augmented());
    }

    #[test]
    fn empty_interaction_has_no_prompt_or_answer() {
        // "inferences": [] is valid JSON for a SyncPayload, so the
        // accessors must not index into an empty vec.
        let empty = Interaction {
            turn: 1,
            inferences: Vec::new(),
            created_at: Utc::now(),
        };
        assert_eq!(empty.prompt(), None);
        assert_eq!(empty.answer(), None);
        assert!(unroll_turn(&empty).is_empty());
    }

    #[test]
    fn window_serde_roundtrip() {
        let mut cw = ContextWindow::default();
        cw.memories.push(Memory {
            key: "prefers-arabic-citations".into(),
            content: "Prefers citations in Arabic".into(),
            updated_at: Utc::now(),
        });
        cw.append(tool_interaction(1, "q", "a"));
        let bytes = serde_json::to_vec(&cw).unwrap();
        let back: ContextWindow = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, cw);
    }
}
