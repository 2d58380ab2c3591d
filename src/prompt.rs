//! System prompt assembly. Section order is fixed so prompt caching and
//! tests stay stable across turns.

use std::sync::Arc;

use chrono::Utc;
use chrono_tz::Tz;

use crate::memory::{MemoryStore, SearchFilters};
use crate::session::SessionStore;
use crate::traits::{Message, MessageContent, Role};
use crate::workspace::{Workspace, WorkspaceStore};

/// Memory lookup parameters for prompt injection.
const MEMORY_TOP_K: usize = 3;
const MEMORY_MIN_SCORE: f64 = 0.4;
const MEMORY_QUERY_MAX_CHARS: usize = 500;

const IDENTITY_PREAMBLE: &str = "You are a persistent personal assistant reachable over chat. \
You have a durable workspace of markdown files that define who you are, what you know about \
the user, and how you operate. Treat those files as your memory and personality; update them \
through your tools when you learn something durable.";

const MESSAGING_GUIDANCE: &str = "Keep replies conversational and chat-sized. Use tools when \
they get you facts you don't have; never invent tool output. When a tool fails, say what \
failed and move on. Multiple tool calls in one turn run in parallel.";

const HEARTBEAT_GUIDANCE: &str = "Some turns are synthesized heartbeats rather than real user \
messages. On a heartbeat, check HEARTBEAT.md and your reminders; if nothing needs the user's \
attention, reply with exactly HEARTBEAT_OK and nothing else.";

pub struct PromptBuilder {
    workspace: Arc<WorkspaceStore>,
    sessions: Arc<SessionStore>,
    memory: Arc<MemoryStore>,
    timezone: Tz,
    tool_summary: String,
}

impl PromptBuilder {
    pub fn new(
        workspace: Arc<WorkspaceStore>,
        sessions: Arc<SessionStore>,
        memory: Arc<MemoryStore>,
        timezone: Tz,
        tool_summary: String,
    ) -> Self {
        Self {
            workspace,
            sessions,
            memory,
            timezone,
            tool_summary,
        }
    }

    /// Assemble the system prompt for one turn of `chat_id`.
    pub async fn build(&self, chat_id: i64) -> String {
        let ws = self.workspace.load_cached().await;
        let history = self.sessions.history(chat_id).await;
        let pinned = self.sessions.pinned(chat_id).await;
        let recent_daily = self.workspace.recent_daily_for_prompt().await;
        let memory_hits = self.memory_snippets(&history).await;
        self.render(&ws, pinned, recent_daily, memory_hits)
    }

    fn render(
        &self,
        ws: &Workspace,
        pinned: Option<String>,
        recent_daily: Option<String>,
        memory_hits: Option<String>,
    ) -> String {
        let now = Utc::now().with_timezone(&self.timezone);
        let mut sections: Vec<String> = Vec::new();

        sections.push(IDENTITY_PREAMBLE.to_string());
        sections.push(format!("# Available tools\n{}", self.tool_summary));
        sections.push(MESSAGING_GUIDANCE.to_string());
        sections.push(format!(
            "Workspace directory: {}",
            self.workspace.root().display()
        ));
        sections.push(format!(
            "Current date/time: {} ({})",
            now.format("%Y-%m-%d %H:%M %A"),
            self.timezone.name()
        ));
        sections.push(HEARTBEAT_GUIDANCE.to_string());
        sections.push(format!(
            "Runtime: adjutant v{} on {}",
            env!("CARGO_PKG_VERSION"),
            std::env::consts::OS
        ));

        if let Some(onboarding) = &ws.onboarding {
            // Onboarding replaces the persona stack until it completes.
            sections.push(format!("# Onboarding\n{}", onboarding));
        } else {
            if let Some(identity) = &ws.identity {
                sections.push(format!("# Identity\n{}", identity));
            }
            if let Some(persona) = &ws.persona {
                sections.push(format!("# Persona\n{}", persona));
            }
            if let Some(user) = &ws.user {
                sections.push(format!("# About the user\n{}", user));
            }
            if let Some(rules) = &ws.rules {
                sections.push(format!("# Operating rules\n{}", rules));
            }
            if let Some(tools_notes) = &ws.tools_notes {
                sections.push(format!("# Tool notes\n{}", tools_notes));
            }
            if let Some(pinned) = pinned {
                sections.push(format!("# Pinned context\n{}", pinned));
            }
            if let Some(daily) = recent_daily {
                sections.push(format!("# Recent daily log\n{}", daily));
            }
            if let Some(hits) = memory_hits {
                sections.push(format!("# Possibly relevant older memory\n{}", hits));
            }
            if let Some(long_memory) = &ws.long_memory {
                sections.push(format!("# Long-term memory\n{}", long_memory));
            }
        }

        if !ws.truncated.is_empty() {
            sections.push(format!(
                "Note: these files were truncated at their size caps: {}",
                ws.truncated.join(", ")
            ));
        }

        sections.join("\n\n")
    }

    /// Vector lookup seeded from the last three user messages.
    async fn memory_snippets(&self, history: &[Message]) -> Option<String> {
        let mut recent: Vec<String> = history
            .iter()
            .rev()
            .filter(|m| m.role == Role::User && matches!(m.content, MessageContent::Text(_)))
            .take(3)
            .map(|m| m.content_as_text())
            .collect();
        // Collected newest-first; flip back to conversation order.
        recent.reverse();
        let query: String = recent.join("\n").chars().take(MEMORY_QUERY_MAX_CHARS).collect();
        if query.trim().is_empty() {
            return None;
        }

        let hits = self
            .memory
            .search_text(
                &query,
                MEMORY_TOP_K,
                MEMORY_MIN_SCORE,
                &SearchFilters::default(),
            )
            .await;
        if hits.is_empty() {
            return None;
        }
        Some(
            hits.iter()
                .map(|h| format!("[{}] {}", h.source, h.text.trim()))
                .collect::<Vec<_>>()
                .join("\n\n"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::EmbeddingEngine;
    use crate::workspace::WorkspaceFile;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::time::Duration;

    async fn builder(dir: &tempfile::TempDir) -> PromptBuilder {
        let workspace = Arc::new(WorkspaceStore::new(dir.path().to_path_buf()));
        let sessions = Arc::new(SessionStore::new(10, Duration::from_secs(3600)));
        let engine = Arc::new(EmbeddingEngine::new(dir.path().join("cache.json")));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let memory = Arc::new(
            MemoryStore::with_pool(pool, engine, 20, 500).await.unwrap(),
        );
        PromptBuilder::new(
            workspace,
            sessions,
            memory,
            "UTC".parse().unwrap(),
            "- read_file: Read a file".to_string(),
        )
    }

    #[tokio::test]
    async fn sections_appear_in_fixed_order() {
        let dir = tempfile::tempdir().unwrap();
        let b = builder(&dir).await;
        b.workspace.save(WorkspaceFile::Identity, "I am Ada").await.unwrap();
        b.workspace.save(WorkspaceFile::Persona, "warm, direct").await.unwrap();
        b.workspace.save(WorkspaceFile::LongMemory, "user runs marathons").await.unwrap();

        let prompt = b.build(1).await;
        let identity = prompt.find("# Identity").unwrap();
        let persona = prompt.find("# Persona").unwrap();
        let long_mem = prompt.find("# Long-term memory").unwrap();
        let tools = prompt.find("# Available tools").unwrap();
        assert!(tools < identity);
        assert!(identity < persona);
        assert!(persona < long_mem);
        assert!(prompt.contains("HEARTBEAT_OK"));
        assert!(prompt.contains("read_file"));
    }

    #[tokio::test]
    async fn onboarding_replaces_persona_stack() {
        let dir = tempfile::tempdir().unwrap();
        let b = builder(&dir).await;
        b.workspace.save(WorkspaceFile::Onboarding, "ask for a name").await.unwrap();
        b.workspace.save(WorkspaceFile::Persona, "should not appear").await.unwrap();

        let prompt = b.build(1).await;
        assert!(prompt.contains("# Onboarding"));
        assert!(!prompt.contains("should not appear"));
    }

    #[tokio::test]
    async fn pinned_context_is_injected() {
        let dir = tempfile::tempdir().unwrap();
        let b = builder(&dir).await;
        b.sessions.append_pinned(9, "calls the user 'Sam'").await;
        let prompt = b.build(9).await;
        assert!(prompt.contains("# Pinned context"));
        assert!(prompt.contains("calls the user 'Sam'"));
    }

    #[tokio::test]
    async fn truncation_warning_lists_files() {
        let dir = tempfile::tempdir().unwrap();
        let b = builder(&dir).await;
        b.workspace
            .save(WorkspaceFile::Identity, &"x".repeat(5000))
            .await
            .unwrap();
        let prompt = b.build(1).await;
        assert!(prompt.contains("truncated at their size caps"));
        assert!(prompt.contains("IDENTITY.md"));
    }
}
