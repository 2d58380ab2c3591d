//! Memory tools: hybrid retrieval over the chunk index and explicit
//! remember-this writes into the daily log / long-term memory file.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use crate::memory::{FusionMode, MemoryStore, SearchFilters};
use crate::traits::Tool;
use crate::workspace::{WorkspaceFile, WorkspaceStore};

pub struct SearchMemoryTool {
    store: Arc<MemoryStore>,
    fusion: FusionMode,
}

impl SearchMemoryTool {
    pub fn new(store: Arc<MemoryStore>, fusion: FusionMode) -> Self {
        Self { store, fusion }
    }
}

#[async_trait]
impl Tool for SearchMemoryTool {
    fn name(&self) -> &str {
        "search_memory"
    }

    fn description(&self) -> &str {
        "Search past conversations and notes (semantic + keyword)"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "top_k": {"type": "integer", "description": "Max results (default 5)"},
                "max_age_days": {
                    "type": "integer",
                    "description": "Only consider chunks newer than this many days"
                },
                "sources": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Restrict to these source files (by stem)"
                }
            },
            "required": ["query"]
        })
    }

    async fn call(&self, input: Value) -> anyhow::Result<String> {
        let query = input["query"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: query"))?;
        let top_k = input["top_k"].as_u64().unwrap_or(5).clamp(1, 20) as usize;
        let filters = SearchFilters {
            max_age_days: input["max_age_days"].as_i64(),
            sources: input["sources"].as_array().map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            }),
        };

        let hits = self
            .store
            .hybrid_search(query, top_k, 0.3, self.fusion, &filters)
            .await?;
        if hits.is_empty() {
            return Ok(format!("No memory matches for '{}'", query));
        }
        Ok(hits
            .iter()
            .map(|h| format!("[{} · score {:.3}]\n{}", h.source, h.score, h.text.trim()))
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}

pub struct SaveMemoryTool {
    workspace: Arc<WorkspaceStore>,
    store: Arc<MemoryStore>,
}

impl SaveMemoryTool {
    pub fn new(workspace: Arc<WorkspaceStore>, store: Arc<MemoryStore>) -> Self {
        Self { workspace, store }
    }
}

#[async_trait]
impl Tool for SaveMemoryTool {
    fn name(&self) -> &str {
        "save_memory"
    }

    fn description(&self) -> &str {
        "Record something worth remembering (daily log, or MEMORY.md for long-term)"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": {"type": "string"},
                "long_term": {
                    "type": "boolean",
                    "description": "Append to curated long-term memory instead of today's log",
                    "default": false
                }
            },
            "required": ["content"]
        })
    }

    async fn call(&self, input: Value) -> anyhow::Result<String> {
        let content = input["content"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: content"))?;

        if input["long_term"].as_bool().unwrap_or(false) {
            let current = self
                .workspace
                .load()
                .await
                .long_memory
                .unwrap_or_default();
            let updated = if current.is_empty() {
                format!("{}\n", content.trim_end())
            } else {
                format!("{}\n\n{}\n", current.trim_end(), content.trim_end())
            };
            self.workspace
                .save(WorkspaceFile::LongMemory, &updated)
                .await?;
            return Ok("Saved to long-term memory.".into());
        }

        self.workspace.append_daily_log(content).await?;

        // Reindex today's log so the note is retrievable immediately.
        let today = Utc::now().format("%Y-%m-%d").to_string();
        if let Some((date, text)) = self
            .workspace
            .list_recent_daily(1)
            .await
            .into_iter()
            .next()
        {
            let _ = self
                .store
                .ingest_file(&date.format("%Y-%m-%d").to_string(), &text, Utc::now())
                .await;
        }
        Ok(format!("Noted in the daily log ({}).", today))
    }
}

/// Removes BOOTSTRAP.md once onboarding has finished, switching the
/// system prompt back to the persona stack.
pub struct CompleteOnboardingTool {
    workspace: Arc<WorkspaceStore>,
}

impl CompleteOnboardingTool {
    pub fn new(workspace: Arc<WorkspaceStore>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for CompleteOnboardingTool {
    fn name(&self) -> &str {
        "complete_onboarding"
    }

    fn description(&self) -> &str {
        "Finish onboarding: delete BOOTSTRAP.md after the persona files are written"
    }

    fn schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn call(&self, _input: Value) -> anyhow::Result<String> {
        if self.workspace.load().await.onboarding.is_none() {
            return Ok("Onboarding is already complete.".into());
        }
        self.workspace.remove(WorkspaceFile::Onboarding).await?;
        Ok("Onboarding complete; BOOTSTRAP.md removed.".into())
    }
}
