//! Background agent tools: spawn, inspect, cancel.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::agents::AgentManager;
use crate::session::current_chat_id;
use crate::traits::Tool;

fn ambient_chat() -> anyhow::Result<i64> {
    current_chat_id().ok_or_else(|| anyhow::anyhow!("no active conversation for this tool call"))
}

pub struct SpawnAgentTool {
    manager: AgentManager,
}

impl SpawnAgentTool {
    pub fn new(manager: AgentManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for SpawnAgentTool {
    fn name(&self) -> &str {
        "spawn_agent"
    }

    fn description(&self) -> &str {
        "Run a task in the background; the result is sent to this chat when done"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "What the background agent should accomplish, self-contained"
                }
            },
            "required": ["task"]
        })
    }

    async fn call(&self, input: Value) -> anyhow::Result<String> {
        let chat_id = ambient_chat()?;
        let task = input["task"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: task"))?;
        let id = self.manager.spawn(task, chat_id);
        Ok(format!(
            "Spawned background agent {}. I'll post the result here when it finishes.",
            id
        ))
    }
}

pub struct AgentStatusTool {
    manager: AgentManager,
}

impl AgentStatusTool {
    pub fn new(manager: AgentManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for AgentStatusTool {
    fn name(&self) -> &str {
        "agent_status"
    }

    fn description(&self) -> &str {
        "Status of background agents (all, or one by id)"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "id": {"type": "string", "description": "Agent id; omit to list all"}
            }
        })
    }

    async fn call(&self, input: Value) -> anyhow::Result<String> {
        if let Some(id) = input["id"].as_str() {
            let Some(agent) = self.manager.get(id) else {
                anyhow::bail!("no agent with id '{}'", id);
            };
            let mut out = format!(
                "{} [{}] — {}\nstarted: {}",
                agent.id,
                agent.status.name(),
                agent.task,
                agent.created_at.to_rfc3339()
            );
            if let Some(result) = &agent.result {
                out.push_str(&format!("\nresult: {}", result));
            }
            if let Some(error) = &agent.error {
                out.push_str(&format!("\nerror: {}", error));
            }
            return Ok(out);
        }

        let agents = self.manager.list();
        if agents.is_empty() {
            return Ok("No background agents.".into());
        }
        Ok(agents
            .iter()
            .map(|a| format!("{} [{}] — {}", a.id, a.status.name(), a.task))
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

pub struct CancelAgentTool {
    manager: AgentManager,
}

impl CancelAgentTool {
    pub fn new(manager: AgentManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for CancelAgentTool {
    fn name(&self) -> &str {
        "cancel_agent"
    }

    fn description(&self) -> &str {
        "Cancel a running background agent"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "id": {"type": "string"}
            },
            "required": ["id"]
        })
    }

    async fn call(&self, input: Value) -> anyhow::Result<String> {
        let id = input["id"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: id"))?;
        if self.manager.cancel(id) {
            Ok(format!("Cancelled agent {}", id))
        } else {
            Ok(format!("Agent {} is not running (or does not exist)", id))
        }
    }
}
