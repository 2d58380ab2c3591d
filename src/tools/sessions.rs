//! Session tools: history inspection, model switching, compaction, and
//! pinned context. These stay separate verbs on purpose; no umbrella
//! manage_session dispatcher.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::session::{current_chat_id, ModelChoice, SessionStore};
use crate::traits::{Role, Tool};

fn ambient_chat() -> anyhow::Result<i64> {
    current_chat_id().ok_or_else(|| anyhow::anyhow!("no active conversation for this tool call"))
}

pub struct GetSessionLogTool {
    sessions: Arc<SessionStore>,
}

impl GetSessionLogTool {
    pub fn new(sessions: Arc<SessionStore>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Tool for GetSessionLogTool {
    fn name(&self) -> &str {
        "get_session_log"
    }

    fn description(&self) -> &str {
        "Show the recent message history of this conversation"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "count": {"type": "integer", "description": "How many recent messages (default 20)"}
            }
        })
    }

    async fn call(&self, input: Value) -> anyhow::Result<String> {
        let chat_id = ambient_chat()?;
        let count = input["count"].as_u64().unwrap_or(20) as usize;
        let history = self.sessions.history(chat_id).await;
        if history.is_empty() {
            return Ok("No history yet.".into());
        }
        let start = history.len().saturating_sub(count);
        Ok(history[start..]
            .iter()
            .map(|m| {
                let who = match m.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                format!("{}: {}", who, m.content_as_text())
            })
            .collect::<Vec<_>>()
            .join("\n"))
    }

    /// Logs keep their tail: the most recent exchanges matter most.
    fn compress(&self, result: String) -> String {
        let cap = self.result_cap();
        if result.chars().count() <= cap {
            return result;
        }
        let keep = cap * 8 / 10;
        let skip = result.chars().count() - keep;
        let tail: String = result.chars().skip(skip).collect();
        format!("... (earlier log truncated)\n{}", tail)
    }
}

pub struct SetModelTool {
    sessions: Arc<SessionStore>,
}

impl SetModelTool {
    pub fn new(sessions: Arc<SessionStore>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Tool for SetModelTool {
    fn name(&self) -> &str {
        "set_model"
    }

    fn description(&self) -> &str {
        "Switch this conversation's model tier (small / medium / large)"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "model": {"type": "string", "enum": ["small", "medium", "large"]}
            },
            "required": ["model"]
        })
    }

    async fn call(&self, input: Value) -> anyhow::Result<String> {
        let chat_id = ambient_chat()?;
        let requested = input["model"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: model"))?;
        let model = ModelChoice::parse(requested)
            .ok_or_else(|| anyhow::anyhow!("unknown model tier '{}'", requested))?;
        self.sessions.set_model(chat_id, model).await;
        Ok(format!("Model set to {}", model.name()))
    }
}

/// Produces the compaction summary for a chat; wired by the core so this
/// tool never owns the orchestrator.
pub type CompactFn = Arc<
    dyn Fn(i64) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send>> + Send + Sync,
>;

pub struct CompactHistoryTool {
    compact: CompactFn,
}

impl CompactHistoryTool {
    pub fn new(compact: CompactFn) -> Self {
        Self { compact }
    }
}

#[async_trait]
impl Tool for CompactHistoryTool {
    fn name(&self) -> &str {
        "compact_history"
    }

    fn description(&self) -> &str {
        "Summarize older history to free context space (recent messages kept verbatim)"
    }

    fn schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn call(&self, _input: Value) -> anyhow::Result<String> {
        let chat_id = ambient_chat()?;
        (self.compact)(chat_id).await
    }
}

pub struct PinContextTool {
    sessions: Arc<SessionStore>,
}

impl PinContextTool {
    pub fn new(sessions: Arc<SessionStore>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Tool for PinContextTool {
    fn name(&self) -> &str {
        "pin_context"
    }

    fn description(&self) -> &str {
        "Pin a note to this conversation; it survives compaction and is always visible"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "note": {"type": "string"}
            },
            "required": ["note"]
        })
    }

    async fn call(&self, input: Value) -> anyhow::Result<String> {
        let chat_id = ambient_chat()?;
        let note = input["note"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: note"))?;
        self.sessions.append_pinned(chat_id, note).await;
        Ok("Pinned.".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::with_current_chat;
    use crate::traits::Message;
    use std::time::Duration;

    #[tokio::test]
    async fn session_tools_use_ambient_chat() {
        let sessions = Arc::new(SessionStore::new(10, Duration::from_secs(3600)));
        sessions.append(5, Message::user("hello there")).await;

        let log_tool = GetSessionLogTool::new(sessions.clone());
        let out = with_current_chat(5, log_tool.call(json!({}))).await.unwrap();
        assert!(out.contains("user: hello there"));

        // Outside a bound turn the tool refuses.
        assert!(log_tool.call(json!({})).await.is_err());
    }

    #[tokio::test]
    async fn set_model_validates_tier() {
        let sessions = Arc::new(SessionStore::new(10, Duration::from_secs(3600)));
        let tool = SetModelTool::new(sessions.clone());
        let out = with_current_chat(1, tool.call(json!({"model": "large"}))).await.unwrap();
        assert!(out.contains("large"));
        assert_eq!(sessions.model(1).await, ModelChoice::Large);

        let err = with_current_chat(1, tool.call(json!({"model": "huge"}))).await;
        assert!(err.is_err());
    }

    #[test]
    fn log_compression_keeps_tail() {
        let sessions = Arc::new(SessionStore::new(10, Duration::from_secs(3600)));
        let tool = GetSessionLogTool::new(sessions);
        let long = (0..3000)
            .map(|i| format!("assistant: line {}", i))
            .collect::<Vec<_>>()
            .join("\n");
        let compressed = tool.compress(long);
        assert!(compressed.starts_with("... (earlier log truncated)"));
        assert!(compressed.contains("line 2999"));
    }
}
