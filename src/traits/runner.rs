use async_trait::async_trait;

/// Runs one synthesized user turn through the orchestrator on behalf of
/// schedules, heartbeats, and briefings. Implemented by the daemon core;
/// injected so those subsystems never own the conversation pipeline.
#[async_trait]
pub trait TurnRunner: Send + Sync {
    /// Execute `message` as if the user had typed it in `chat_id`,
    /// returning the assistant's final text.
    async fn run_turn(&self, chat_id: i64, message: &str) -> anyhow::Result<String>;
}
