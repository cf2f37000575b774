use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::window::{Content, FinishReason, FunctionCall, TokenUsage};

/// A tool the model may call, described in JSON Schema.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionDecl {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Per-call generation settings. System instructions and tool declarations
/// also participate in token counting.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub system: String,
    #[serde(default)]
    pub tools: Vec<FunctionDecl>,
    /// When set, the model must reply with JSON matching this schema.
    #[serde(default)]
    pub response_schema: Option<serde_json::Value>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

/// Events yielded by a streaming generation, in order: zero or more
/// deltas, at most one function call, then exactly one terminal
/// `Done` or `Error`.
#[derive(Clone, Debug)]
pub enum LlmEvent {
    TextDelta(String),
    FunctionCall(FunctionCall),
    Done {
        usage: TokenUsage,
        finish_reason: FinishReason,
    },
    Error(crate::MinbarError),
}

impl LlmEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error(_))
    }
}

pub type LlmStream = Pin<Box<dyn Stream<Item = LlmEvent> + Send>>;

/// A completed non-streaming generation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    pub usage: TokenUsage,
    pub finish_reason: FinishReason,
}

/// Seam to the model provider. The engine depends only on this trait;
/// tests script it with a mock.
#[async_trait]
pub trait LlmGateway: Send + Sync {
    async fn generate(
        &self,
        model: &str,
        contents: &[Content],
        config: &GenerationConfig,
    ) -> Result<Generation>;

    async fn stream(
        &self,
        model: &str,
        contents: &[Content],
        config: &GenerationConfig,
    ) -> Result<LlmStream>;

    async fn count_tokens(
        &self,
        model: &str,
        contents: &[Content],
        config: &GenerationConfig,
    ) -> Result<u64>;
}
