use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

/// Tool trait — everything the registry needs to advertise, dispatch,
/// bound, and compress a tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema for the tool's input object (provider `input_schema`).
    fn schema(&self) -> Value;

    /// Execute with already-parsed JSON input, returning result text.
    /// Errors are formatted into the tool_result by the registry; they
    /// never abort the turn.
    async fn call(&self, input: Value) -> anyhow::Result<String>;

    /// Per-tool execution deadline enforced by the registry.
    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    /// Maximum result length in chars before compression kicks in.
    fn result_cap(&self) -> usize {
        10_000
    }

    /// Shrink an over-cap result. The default hard-truncates; tools with
    /// structure worth preserving (search results, listings, logs)
    /// override this.
    fn compress(&self, result: String) -> String {
        let cap = self.result_cap();
        if result.chars().count() <= cap {
            return result;
        }
        let truncated: String = result.chars().take(cap).collect();
        format!("{}... (truncated)", truncated)
    }
}
