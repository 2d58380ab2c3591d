//! Reminder tools: one-shot and recurring timed notifications.

use async_trait::async_trait;
use chrono::Utc;
use chrono_tz::Tz;
use serde_json::{json, Value};

use crate::reminders::ReminderStore;
use crate::scheduler::{parse_natural, NaturalSchedule};
use crate::session::current_chat_id;
use crate::traits::Tool;

fn ambient_chat() -> anyhow::Result<i64> {
    current_chat_id().ok_or_else(|| anyhow::anyhow!("no active conversation for this tool call"))
}

pub struct SetReminderTool {
    store: ReminderStore,
    timezone: Tz,
}

impl SetReminderTool {
    pub fn new(store: ReminderStore, timezone: Tz) -> Self {
        Self { store, timezone }
    }
}

#[async_trait]
impl Tool for SetReminderTool {
    fn name(&self) -> &str {
        "set_reminder"
    }

    fn description(&self) -> &str {
        "Set a reminder; one-shot ('in 20 minutes', 'tomorrow at 9am') or recurring ('every day at 22:00')"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": {"type": "string"},
                "when": {
                    "type": "string",
                    "description": "When to remind: natural phrase, 'YYYY-MM-DD HH:MM', or cron"
                }
            },
            "required": ["message", "when"]
        })
    }

    async fn call(&self, input: Value) -> anyhow::Result<String> {
        let chat_id = ambient_chat()?;
        let message = input["message"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: message"))?;
        let when = input["when"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: when"))?;

        match parse_natural(when, Utc::now(), self.timezone)? {
            NaturalSchedule::At(at) => {
                let reminder = self.store.create_one_shot(chat_id, message, at).await?;
                Ok(format!(
                    "Reminder {} set for {}",
                    reminder.id,
                    at.with_timezone(&self.timezone).format("%Y-%m-%d %H:%M %Z")
                ))
            }
            NaturalSchedule::Cron(expr) => {
                let reminder = self.store.create_recurring(chat_id, message, &expr).await?;
                Ok(format!(
                    "Recurring reminder {} set ({}), next at {}",
                    reminder.id,
                    expr,
                    reminder
                        .scheduled_at
                        .with_timezone(&self.timezone)
                        .format("%Y-%m-%d %H:%M %Z")
                ))
            }
        }
    }
}

pub struct ListRemindersTool {
    store: ReminderStore,
}

impl ListRemindersTool {
    pub fn new(store: ReminderStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for ListRemindersTool {
    fn name(&self) -> &str {
        "list_reminders"
    }

    fn description(&self) -> &str {
        "List pending reminders for this conversation"
    }

    fn schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn call(&self, _input: Value) -> anyhow::Result<String> {
        let chat_id = ambient_chat()?;
        let reminders = self.store.list(Some(chat_id));
        if reminders.is_empty() {
            return Ok("No pending reminders.".into());
        }
        Ok(reminders
            .iter()
            .map(|r| {
                format!(
                    "{} — {} at {}{}",
                    r.id,
                    r.message,
                    r.scheduled_at.to_rfc3339(),
                    if r.recurring { " (recurring)" } else { "" }
                )
            })
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

pub struct CancelReminderTool {
    store: ReminderStore,
}

impl CancelReminderTool {
    pub fn new(store: ReminderStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for CancelReminderTool {
    fn name(&self) -> &str {
        "cancel_reminder"
    }

    fn description(&self) -> &str {
        "Cancel a pending reminder by id"
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
        if self.store.cancel(id).await? {
            Ok(format!("Cancelled reminder {}", id))
        } else {
            Ok(format!("No reminder with id {}", id))
        }
    }
}
