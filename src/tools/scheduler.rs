//! Schedule management tools. The owning conversation comes from the
//! ambient chat binding, never from tool arguments.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::scheduler::SchedulerEngine;
use crate::session::current_chat_id;
use crate::traits::Tool;

fn ambient_chat() -> anyhow::Result<i64> {
    current_chat_id().ok_or_else(|| anyhow::anyhow!("no active conversation for this tool call"))
}

pub struct CreateScheduleTool {
    engine: Arc<SchedulerEngine>,
}

impl CreateScheduleTool {
    pub fn new(engine: Arc<SchedulerEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Tool for CreateScheduleTool {
    fn name(&self) -> &str {
        "schedule_task"
    }

    fn description(&self) -> &str {
        "Schedule a recurring or one-time task (cron or natural language)"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "description": "Short label for the job"},
                "schedule": {
                    "type": "string",
                    "description": "When to run: a 5-field cron expression or a phrase like 'every day at 9am', '평일 오후 6시', 'in 2 hours'"
                },
                "message": {
                    "type": "string",
                    "description": "The turn to run when the job fires, phrased as a user request"
                }
            },
            "required": ["name", "schedule", "message"]
        })
    }

    async fn call(&self, input: Value) -> anyhow::Result<String> {
        let chat_id = ambient_chat()?;
        let name = input["name"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: name"))?;
        let schedule = input["schedule"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: schedule"))?;
        let message = input["message"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: message"))?;

        let job = self.engine.create_job(chat_id, name, schedule, message)?;
        Ok(format!(
            "Scheduled '{}' (id {}). Next run: {}",
            job.name,
            job.id,
            job.next_run
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".into())
        ))
    }
}

pub struct ListSchedulesTool {
    engine: Arc<SchedulerEngine>,
}

impl ListSchedulesTool {
    pub fn new(engine: Arc<SchedulerEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Tool for ListSchedulesTool {
    fn name(&self) -> &str {
        "list_scheduled_tasks"
    }

    fn description(&self) -> &str {
        "List scheduled tasks for this conversation"
    }

    fn schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn call(&self, _input: Value) -> anyhow::Result<String> {
        let chat_id = ambient_chat()?;
        let jobs: Vec<_> = self
            .engine
            .list_jobs()
            .into_iter()
            .filter(|j| j.chat_id == chat_id)
            .collect();
        if jobs.is_empty() {
            return Ok("No scheduled tasks.".into());
        }
        Ok(jobs
            .iter()
            .map(|j| {
                format!(
                    "{} — '{}' [{}] runs={} next={}",
                    j.id,
                    j.name,
                    if j.enabled { "on" } else { "off" },
                    j.run_count,
                    j.next_run
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "—".into())
                )
            })
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

pub struct CancelScheduleTool {
    engine: Arc<SchedulerEngine>,
}

impl CancelScheduleTool {
    pub fn new(engine: Arc<SchedulerEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Tool for CancelScheduleTool {
    fn name(&self) -> &str {
        "cancel_scheduled_task"
    }

    fn description(&self) -> &str {
        "Cancel a scheduled task by id"
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
        if self.engine.cancel_job(id)? {
            Ok(format!("Cancelled scheduled task {}", id))
        } else {
            Ok(format!("No scheduled task with id {}", id))
        }
    }
}
