use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::providers::ProviderError;
use crate::traits::{
    ChatRequest, ContentBlock, Message, MessageContent, ModelProvider, ProviderResponse,
    StopReason, StreamChunkFn, TokenUsage,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl AnthropicProvider {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn build_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(wire_message).collect();

        let mut body = json!({
            "model": req.model,
            "max_tokens": req.max_tokens,
            "messages": messages,
        });
        if !req.system.is_empty() {
            body["system"] = json!(req.system);
        }
        if !req.tools.is_empty() {
            body["tools"] = json!(req.tools);
        }
        if let Some(budget) = req.thinking_budget {
            body["thinking"] = json!({"type": "enabled", "budget_tokens": budget});
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }

    async fn post(&self, body: &Value) -> anyhow::Result<reqwest::Response> {
        let resp = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::network(&e))?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), &text, retry_after).into());
        }
        Ok(resp)
    }
}

/// Serialize one history message into the wire shape. Text and tool blocks
/// already match; images need the nested source object.
fn wire_message(msg: &Message) -> Value {
    let role = match msg.role {
        crate::traits::Role::User => "user",
        crate::traits::Role::Assistant => "assistant",
    };
    let content = match &msg.content {
        MessageContent::Text(t) => json!(t),
        MessageContent::Blocks(blocks) => {
            let wire: Vec<Value> = blocks
                .iter()
                .map(|b| match b {
                    ContentBlock::Text { text } => json!({"type": "text", "text": text}),
                    ContentBlock::Image { media_type, data } => json!({
                        "type": "image",
                        "source": {"type": "base64", "media_type": media_type, "data": data},
                    }),
                    ContentBlock::ToolUse { id, name, input } => {
                        json!({"type": "tool_use", "id": id, "name": name, "input": input})
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                    } => json!({
                        "type": "tool_result",
                        "tool_use_id": tool_use_id,
                        "content": content,
                    }),
                })
                .collect();
            json!(wire)
        }
    };
    json!({"role": role, "content": content})
}

fn parse_stop_reason(s: Option<&str>) -> StopReason {
    match s {
        Some("end_turn") | Some("stop_sequence") => StopReason::EndTurn,
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        _ => StopReason::Other,
    }
}

fn parse_content_blocks(data: &Value) -> Vec<ContentBlock> {
    let mut blocks = Vec::new();
    if let Some(arr) = data["content"].as_array() {
        for block in arr {
            match block["type"].as_str().unwrap_or("") {
                "text" => {
                    if let Some(t) = block["text"].as_str() {
                        blocks.push(ContentBlock::Text {
                            text: t.to_string(),
                        });
                    }
                }
                "tool_use" => {
                    blocks.push(ContentBlock::ToolUse {
                        id: block["id"].as_str().unwrap_or_default().to_string(),
                        name: block["name"].as_str().unwrap_or_default().to_string(),
                        input: block["input"].clone(),
                    });
                }
                // Thinking blocks are internal; they never re-enter history.
                _ => {}
            }
        }
    }
    blocks
}

fn parse_usage(data: &Value) -> TokenUsage {
    TokenUsage {
        input_tokens: data["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
        output_tokens: data["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
    }
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    async fn chat(&self, req: &ChatRequest) -> anyhow::Result<ProviderResponse> {
        let body = self.build_body(req, false);
        info!(model = %req.model, max_tokens = req.max_tokens, thinking = req.thinking_budget.is_some(), "LLM call");

        let resp = self.post(&body).await?;
        let text = resp.text().await.map_err(|e| ProviderError::network(&e))?;
        let data: Value = serde_json::from_str(&text)?;

        Ok(ProviderResponse {
            content: parse_content_blocks(&data),
            stop_reason: parse_stop_reason(data["stop_reason"].as_str()),
            usage: parse_usage(&data),
        })
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
        on_chunk: &StreamChunkFn,
    ) -> anyhow::Result<ProviderResponse> {
        let body = self.build_body(req, true);
        info!(model = %req.model, "LLM call (streaming)");

        let resp = self.post(&body).await?;
        let mut stream = resp.bytes_stream();

        let mut assembler = StreamAssembler::default();
        let mut pending = String::new();

        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| ProviderError::network(&e))?;
            pending.push_str(&String::from_utf8_lossy(&bytes));

            // SSE frames are newline-delimited; keep the trailing partial line.
            while let Some(idx) = pending.find('\n') {
                let line = pending[..idx].trim_end_matches('\r').to_string();
                pending.drain(..=idx);
                if let Some(payload) = line.strip_prefix("data: ") {
                    assembler.feed(payload, on_chunk)?;
                }
            }
        }

        Ok(assembler.finish())
    }
}

/// Accumulates SSE events into a final [`ProviderResponse`].
#[derive(Default)]
struct StreamAssembler {
    blocks: Vec<ContentBlock>,
    /// Partial JSON accumulating for tool_use inputs, indexed by block slot.
    partial_json: std::collections::HashMap<usize, String>,
    stop_reason: Option<StopReason>,
    usage: TokenUsage,
}

impl StreamAssembler {
    fn feed(&mut self, payload: &str, on_chunk: &StreamChunkFn) -> anyhow::Result<()> {
        let event: Value = match serde_json::from_str(payload) {
            Ok(v) => v,
            Err(_) => return Ok(()), // [DONE] markers and keep-alives
        };

        match event["type"].as_str().unwrap_or("") {
            "message_start" => {
                self.usage.input_tokens =
                    event["message"]["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32;
            }
            "content_block_start" => {
                let index = event["index"].as_u64().unwrap_or(0) as usize;
                let block = &event["content_block"];
                match block["type"].as_str().unwrap_or("") {
                    "text" => self.insert(index, ContentBlock::Text { text: String::new() }),
                    "tool_use" => {
                        self.insert(
                            index,
                            ContentBlock::ToolUse {
                                id: block["id"].as_str().unwrap_or_default().to_string(),
                                name: block["name"].as_str().unwrap_or_default().to_string(),
                                input: json!({}),
                            },
                        );
                        self.partial_json.insert(index, String::new());
                    }
                    _ => {}
                }
            }
            "content_block_delta" => {
                let index = event["index"].as_u64().unwrap_or(0) as usize;
                let delta = &event["delta"];
                match delta["type"].as_str().unwrap_or("") {
                    "text_delta" => {
                        if let Some(t) = delta["text"].as_str() {
                            on_chunk(t);
                            if let Some(ContentBlock::Text { text }) = self.blocks.get_mut(index) {
                                text.push_str(t);
                            }
                        }
                    }
                    "input_json_delta" => {
                        if let (Some(part), Some(buf)) =
                            (delta["partial_json"].as_str(), self.partial_json.get_mut(&index))
                        {
                            buf.push_str(part);
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                let index = event["index"].as_u64().unwrap_or(0) as usize;
                if let Some(buf) = self.partial_json.remove(&index) {
                    if let Some(ContentBlock::ToolUse { input, .. }) = self.blocks.get_mut(index) {
                        *input = serde_json::from_str(&buf).unwrap_or_else(|_| json!({}));
                    }
                }
            }
            "message_delta" => {
                if let Some(sr) = event["delta"]["stop_reason"].as_str() {
                    self.stop_reason = Some(parse_stop_reason(Some(sr)));
                }
                if let Some(out) = event["usage"]["output_tokens"].as_u64() {
                    self.usage.output_tokens = out as u32;
                }
            }
            "error" => {
                let msg = event["error"]["message"].as_str().unwrap_or("stream error");
                anyhow::bail!("stream error: {}", msg);
            }
            other => debug!(event = other, "ignoring stream event"),
        }
        Ok(())
    }

    fn insert(&mut self, index: usize, block: ContentBlock) {
        while self.blocks.len() <= index {
            self.blocks.push(ContentBlock::Text { text: String::new() });
        }
        self.blocks[index] = block;
    }

    fn finish(self) -> ProviderResponse {
        ProviderResponse {
            content: self
                .blocks
                .into_iter()
                .filter(|b| !matches!(b, ContentBlock::Text { text } if text.is_empty()))
                .collect(),
            stop_reason: self.stop_reason.unwrap_or(StopReason::EndTurn),
            usage: self.usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_message_flattens_text() {
        let v = wire_message(&Message::user("hi"));
        assert_eq!(v["role"], "user");
        assert_eq!(v["content"], "hi");
    }

    #[test]
    fn wire_message_expands_image_source() {
        let msg = Message {
            role: crate::traits::Role::User,
            content: MessageContent::Blocks(vec![ContentBlock::Image {
                media_type: "image/png".into(),
                data: "QUJD".into(),
            }]),
        };
        let v = wire_message(&msg);
        assert_eq!(v["content"][0]["source"]["type"], "base64");
        assert_eq!(v["content"][0]["source"]["media_type"], "image/png");
    }

    #[test]
    fn assembler_collects_text_and_tool_use() {
        let assembler = {
            let mut a = StreamAssembler::default();
            let noop: StreamChunkFn = Box::new(|_| {});
            a.feed(
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"text"}}"#,
                &noop,
            )
            .unwrap();
            a.feed(
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"let me check"}}"#,
                &noop,
            )
            .unwrap();
            a.feed(
                r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"tu_1","name":"read_file"}}"#,
                &noop,
            )
            .unwrap();
            a.feed(
                r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"path\":"}}"#,
                &noop,
            )
            .unwrap();
            a.feed(
                r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"\"a.md\"}"}}"#,
                &noop,
            )
            .unwrap();
            a.feed(r#"{"type":"content_block_stop","index":1}"#, &noop)
                .unwrap();
            a.feed(
                r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":9}}"#,
                &noop,
            )
            .unwrap();
            a
        };

        let resp = assembler.finish();
        assert_eq!(resp.stop_reason, StopReason::ToolUse);
        assert_eq!(resp.usage.output_tokens, 9);
        assert_eq!(resp.content.len(), 2);
        match &resp.content[1] {
            ContentBlock::ToolUse { id, name, input } => {
                assert_eq!(id, "tu_1");
                assert_eq!(name, "read_file");
                assert_eq!(input["path"], "a.md");
            }
            other => panic!("expected tool_use, got {:?}", other),
        }
    }
}
