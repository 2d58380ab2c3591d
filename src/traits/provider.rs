use async_trait::async_trait;
use serde_json::Value;

use super::Message;

/// Why the model stopped emitting output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Other,
}

/// Token usage statistics from an LLM API response.
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// One fully-specified provider call. The orchestrator owns budgeting, so
/// `max_tokens` and `thinking_budget` arrive here already computed.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    pub messages: Vec<Message>,
    /// Tool schemas in provider format; empty slice disables tools.
    pub tools: Vec<Value>,
    pub max_tokens: u32,
    /// Extended-thinking budget in tokens. None disables thinking.
    pub thinking_budget: Option<u32>,
}

/// The model's reply, preserving block order so the tool loop can replay
/// the assistant message verbatim into history.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub content: Vec<super::ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: TokenUsage,
}

impl ProviderResponse {
    /// Concatenated text blocks (thinking and tool blocks excluded).
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                super::ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Callback invoked with each streamed text fragment.
pub type StreamChunkFn = Box<dyn Fn(&str) + Send + Sync>;

/// Model provider — sends history + tool defs to an LLM, gets back a reply.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn chat(&self, req: &ChatRequest) -> anyhow::Result<ProviderResponse>;

    /// Streaming variant: text deltas are forwarded through `on_chunk` as
    /// they arrive; the finalized response is still returned in full.
    ///
    /// Default implementation degrades to a single non-streaming call and
    /// one synthetic chunk, for providers without a streaming endpoint.
    async fn chat_stream(
        &self,
        req: &ChatRequest,
        on_chunk: &StreamChunkFn,
    ) -> anyhow::Result<ProviderResponse> {
        let resp = self.chat(req).await?;
        let text = resp.text();
        if !text.is_empty() {
            on_chunk(&text);
        }
        Ok(resp)
    }
}
