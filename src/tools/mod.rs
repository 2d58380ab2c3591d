//! Tool catalog: registration, dispatch with per-tool timeouts, and
//! result compression. Dispatch never fails the caller — errors come
//! back as `Error: …` strings inside the tool_result.

mod agents;
mod exec;
mod files;
mod memory;
pub mod net_guard;
mod reminders;
mod scheduler;
mod sessions;
mod web_fetch;
mod web_search;

pub use agents::{AgentStatusTool, CancelAgentTool, SpawnAgentTool};
pub use exec::{CommandSessions, ExecTool, KillSessionTool, ListCommandSessionsTool};
pub use files::{CurrentTimeTool, ListDirectoryTool, ReadFileTool, WriteFileTool};
pub use memory::{CompleteOnboardingTool, SaveMemoryTool, SearchMemoryTool};
pub use reminders::{CancelReminderTool, ListRemindersTool, SetReminderTool};
pub use scheduler::{CancelScheduleTool, CreateScheduleTool, ListSchedulesTool};
pub use sessions::{CompactFn, CompactHistoryTool, GetSessionLogTool, PinContextTool, SetModelTool};
pub use web_fetch::WebFetchTool;
pub use web_search::{
    BraveSearchBackend, SearchBackend, UnconfiguredSearchBackend, WebSearchTool,
};

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::warn;

use crate::traits::Tool;

pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new(tools: Vec<Arc<dyn Tool>>) -> Self {
        Self { tools }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// Provider-format schemas for the request body.
    pub fn schemas(&self) -> Vec<Value> {
        self.tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name(),
                    "description": t.description(),
                    "input_schema": t.schema(),
                })
            })
            .collect()
    }

    /// One-line-per-tool summary for the system prompt.
    pub fn summary_table(&self) -> String {
        self.tools
            .iter()
            .map(|t| format!("- {}: {}", t.name(), t.description()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// A registry minus the named tools (used to stop background agents
    /// from spawning more background agents).
    pub fn without(&self, excluded: &[&str]) -> ToolRegistry {
        ToolRegistry {
            tools: self
                .tools
                .iter()
                .filter(|t| !excluded.contains(&t.name()))
                .cloned()
                .collect(),
        }
    }

    /// Dispatch by name under the tool's timeout. Unknown tools, errors,
    /// and timeouts all return `Error: …` strings; results beyond the
    /// tool's cap run through its compressor.
    pub async fn execute(&self, name: &str, input: Value) -> String {
        let Some(tool) = self.get(name) else {
            return format!(
                "Error: unknown tool '{}'. Available tools: [{}]",
                name,
                self.names().join(", ")
            );
        };

        let timeout = tool.timeout();
        match tokio::time::timeout(timeout, tool.call(input)).await {
            Ok(Ok(result)) => tool.compress(result),
            Ok(Err(e)) => {
                warn!(tool = name, "tool failed: {}", e);
                format!("Error: {}", e)
            }
            Err(_) => {
                warn!(tool = name, timeout_secs = timeout.as_secs(), "tool timed out");
                format!("Error: tool '{}' timed out after {}s", name, timeout.as_secs())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the input back"
        }
        fn schema(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }
        async fn call(&self, input: Value) -> anyhow::Result<String> {
            Ok(input["text"].as_str().unwrap_or_default().to_string())
        }
        fn result_cap(&self) -> usize {
            32
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "Sleeps past its own timeout"
        }
        fn schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn call(&self, _input: Value) -> anyhow::Result<String> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("never".into())
        }
        fn timeout(&self) -> Duration {
            Duration::from_millis(20)
        }
    }

    fn registry() -> ToolRegistry {
        ToolRegistry::new(vec![Arc::new(EchoTool), Arc::new(SlowTool)])
    }

    #[tokio::test]
    async fn dispatch_returns_result() {
        let out = registry().execute("echo", json!({"text": "hi"})).await;
        assert_eq!(out, "hi");
    }

    #[tokio::test]
    async fn unknown_tool_is_error_string() {
        let out = registry().execute("nope", json!({})).await;
        assert!(out.starts_with("Error: unknown tool"));
        assert!(out.contains("echo"));
    }

    #[tokio::test]
    async fn timeout_is_error_string() {
        let out = registry().execute("slow", json!({})).await;
        assert!(out.contains("timed out"));
        assert!(out.starts_with("Error:"));
    }

    #[tokio::test]
    async fn oversize_result_is_truncated() {
        let long = "x".repeat(200);
        let out = registry().execute("echo", json!({"text": long})).await;
        assert!(out.len() < 200);
        assert!(out.ends_with("(truncated)"));
    }

    #[test]
    fn without_excludes_named_tools() {
        let reduced = registry().without(&["slow"]);
        assert_eq!(reduced.names(), vec!["echo"]);
    }

    #[test]
    fn schemas_carry_input_schema() {
        let schemas = registry().schemas();
        assert_eq!(schemas[0]["name"], "echo");
        assert!(schemas[0]["input_schema"].is_object());
    }
}
