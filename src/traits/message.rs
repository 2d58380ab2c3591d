use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who authored a message. The system prompt travels separately, so only
/// user and assistant appear in conversation history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A single block inside a structured message, mirroring the provider wire
/// shape so history can be replayed verbatim across tool-loop turns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        media_type: String,
        /// Base64 payload, already downloaded by the transport adapter.
        data: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

/// Message content: plain text for the common case, blocks for turns that
/// carry images or tool traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// One entry of per-conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Blocks(blocks),
        }
    }

    /// Build the user message that answers an assistant tool_use turn.
    /// `results` must be ordered like the originating tool_use blocks.
    pub fn tool_results(results: Vec<(String, String)>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Blocks(
                results
                    .into_iter()
                    .map(|(tool_use_id, content)| ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                    })
                    .collect(),
            ),
        }
    }

    /// All tool_use blocks in emission order. Empty for plain-text messages.
    pub fn tool_uses(&self) -> Vec<(&str, &str, &Value)> {
        match &self.content {
            MessageContent::Text(_) => Vec::new(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, name, input } => {
                        Some((id.as_str(), name.as_str(), input))
                    }
                    _ => None,
                })
                .collect(),
        }
    }

    /// Flatten content into displayable text (tool blocks summarized).
    /// Used for token estimation and log lines, never for the wire.
    pub fn content_as_text(&self) -> String {
        match &self.content {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .map(|b| match b {
                    ContentBlock::Text { text } => text.clone(),
                    ContentBlock::Image { .. } => "[image]".to_string(),
                    ContentBlock::ToolUse { name, input, .. } => {
                        format!("[tool_use {} {}]", name, input)
                    }
                    ContentBlock::ToolResult { content, .. } => content.clone(),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// True when `reply` carries tool_result blocks matching this message's
    /// tool_use blocks, id by id, in emission order.
    pub fn pairs_with_tool_results(&self, reply: &Message) -> bool {
        let uses = self.tool_uses();
        let results: Vec<&str> = match &reply.content {
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
                    _ => None,
                })
                .collect(),
            MessageContent::Text(_) => Vec::new(),
        };
        uses.len() == results.len() && uses.iter().map(|(id, _, _)| *id).eq(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_content_round_trips_through_serde() {
        let msg = Message::user("hello");
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.content_as_text(), "hello");
        assert_eq!(back.role, Role::User);
    }

    #[test]
    fn blocks_serialize_with_type_tags() {
        let msg = Message::assistant_blocks(vec![ContentBlock::ToolUse {
            id: "tu_9".into(),
            name: "web_search".into(),
            input: serde_json::json!({"query": "weather"}),
        }]);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["content"][0]["type"], "tool_use");
        assert_eq!(json["content"][0]["name"], "web_search");
    }

    #[test]
    fn tool_uses_preserves_emission_order() {
        let msg = Message::assistant_blocks(vec![
            ContentBlock::ToolUse {
                id: "a".into(),
                name: "one".into(),
                input: serde_json::json!({}),
            },
            ContentBlock::Text {
                text: "and".into(),
            },
            ContentBlock::ToolUse {
                id: "b".into(),
                name: "two".into(),
                input: serde_json::json!({}),
            },
        ]);
        let ids: Vec<&str> = msg.tool_uses().iter().map(|(id, _, _)| *id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
