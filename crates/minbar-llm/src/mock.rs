use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;

use minbar_core::errors::{MinbarError, Result};
use minbar_core::gateway::{Generation, GenerationConfig, LlmEvent, LlmGateway, LlmStream};
use minbar_core::window::{Content, FinishReason, FunctionCall, TokenUsage};

/// Pre-programmed responses for deterministic testing without API calls.
pub enum MockResponse {
    /// Yield a sequence of events.
    Stream(Vec<LlmEvent>),
    /// Return an error from the call itself.
    Error(MinbarError),
    /// Wait a duration, then yield the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    /// A plain text answer streamed as two deltas.
    pub fn stream_text(text: &str) -> Self {
        let mid = text.len() / 2;
        let mid = (0..=mid).rev().find(|i| text.is_char_boundary(*i)).unwrap_or(0);
        let (a, b) = text.split_at(mid);
        let mut events = Vec::new();
        if !a.is_empty() {
            events.push(LlmEvent::TextDelta(a.to_string()));
        }
        if !b.is_empty() {
            events.push(LlmEvent::TextDelta(b.to_string()));
        }
        events.push(LlmEvent::Done {
            usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            },
            finish_reason: FinishReason::Stop,
        });
        Self::Stream(events)
    }

    /// A first-inference response that requests a tool.
    pub fn function_call(name: &str, args: serde_json::Value) -> Self {
        Self::Stream(vec![
            LlmEvent::FunctionCall(FunctionCall {
                name: name.to_string(),
                args,
            }),
            LlmEvent::Done {
                usage: TokenUsage {
                    prompt_tokens: 10,
                    completion_tokens: 3,
                    total_tokens: 13,
                },
                finish_reason: FinishReason::FunctionCall,
            },
        ])
    }

    /// A structured-output answer, as `generate` would return it.
    pub fn json(value: serde_json::Value) -> Self {
        Self::stream_text(&value.to_string())
    }

    /// A stream that opens fine but fails mid-flight.
    pub fn stream_error(error: MinbarError) -> Self {
        Self::Stream(vec![
            LlmEvent::TextDelta("part".into()),
            LlmEvent::Error(error),
        ])
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Gateway that returns pre-programmed responses in sequence. Token
/// counting is proportional to block count so eviction tests can steer it.
pub struct MockGateway {
    responses: Mutex<VecDeque<MockResponse>>,
    call_count: AtomicUsize,
    tokens_per_block: u64,
}

impl MockGateway {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            call_count: AtomicUsize::new(0),
            tokens_per_block: 10,
        }
    }

    pub fn with_tokens_per_block(mut self, tokens: u64) -> Self {
        self.tokens_per_block = tokens;
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    async fn next_response(&self) -> Result<Vec<LlmEvent>> {
        let call = self.call_count.fetch_add(1, Ordering::Relaxed);
        let response = self.responses.lock().pop_front().ok_or_else(|| {
            MinbarError::invalid_input(format!("MockGateway: no response configured for call {call}"))
        })?;

        let mut current = response;
        loop {
            match current {
                MockResponse::Stream(events) => return Ok(events),
                MockResponse::Error(e) => return Err(e),
                MockResponse::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    current = *inner;
                }
            }
        }
    }
}

#[async_trait]
impl LlmGateway for MockGateway {
    async fn generate(
        &self,
        _model: &str,
        _contents: &[Content],
        _config: &GenerationConfig,
    ) -> Result<Generation> {
        let events = self.next_response().await?;
        let mut text = String::new();
        let mut usage = TokenUsage::default();
        let mut finish_reason = FinishReason::Stop;
        for event in events {
            match event {
                LlmEvent::TextDelta(delta) => text.push_str(&delta),
                LlmEvent::Done {
                    usage: u,
                    finish_reason: f,
                } => {
                    usage = u;
                    finish_reason = f;
                }
                LlmEvent::Error(e) => return Err(e),
                LlmEvent::FunctionCall(_) => {}
            }
        }
        Ok(Generation {
            text,
            usage,
            finish_reason,
        })
    }

    async fn stream(
        &self,
        _model: &str,
        _contents: &[Content],
        _config: &GenerationConfig,
    ) -> Result<LlmStream> {
        let events = self.next_response().await?;
        Ok(Box::pin(stream::iter(events)))
    }

    async fn count_tokens(
        &self,
        _model: &str,
        contents: &[Content],
        _config: &GenerationConfig,
    ) -> Result<u64> {
        Ok(contents.len() as u64 * self.tokens_per_block)
    }
}
