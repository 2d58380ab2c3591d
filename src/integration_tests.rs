//! End-to-end scenarios across the orchestrator, registry, and stores,
//! using a scripted provider in place of the real LLM.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::orchestrator::{Orchestrator, ThinkingLevel, MAX_ITERATIONS};
use crate::testing::{rate_limited, text_response, tool_use_response, ScriptedProvider};
use crate::tools::{ReadFileTool, ToolRegistry};
use crate::traits::{ContentBlock, Message, MessageContent, Role, Tool};

use async_trait::async_trait;

fn orchestrator_with(
    provider: Arc<ScriptedProvider>,
    registry: ToolRegistry,
) -> Orchestrator {
    Orchestrator::new(
        provider,
        Arc::new(registry),
        Default::default(),
        200_000,
    )
}

struct SleepTool {
    name: &'static str,
    sleep: Duration,
    timeout: Duration,
}

#[async_trait]
impl Tool for SleepTool {
    fn name(&self) -> &str {
        self.name
    }
    fn description(&self) -> &str {
        "test tool"
    }
    fn schema(&self) -> Value {
        json!({"type": "object"})
    }
    async fn call(&self, _input: Value) -> anyhow::Result<String> {
        tokio::time::sleep(self.sleep).await;
        Ok(format!("{} finished", self.name))
    }
    fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Scenario: one read_file tool_use followed by a final text. The turn
/// returns the text, records one summary, and the working history ends
/// with a matched assistant/user pair.
#[tokio::test]
async fn tool_use_loop_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::write(dir.path().join("MEMORY.md"), "user likes espresso")
        .await
        .unwrap();

    let provider = ScriptedProvider::new(vec![
        Ok(tool_use_response(vec![(
            "tu_1",
            "read_file",
            json!({"path": "MEMORY.md"}),
        )])),
        Ok(text_response("They like espresso.")),
    ]);
    let registry = ToolRegistry::new(vec![Arc::new(ReadFileTool::new(dir.path().to_path_buf()))]);
    let orch = orchestrator_with(provider.clone(), registry);

    let history = vec![Message::user("what coffee do I like?")];
    let outcome = orch
        .chat(&history, "system", "test-model", ThinkingLevel::Off)
        .await
        .unwrap();

    assert_eq!(outcome.text, "They like espresso.");
    assert_eq!(outcome.tools_used.len(), 1);
    assert_eq!(outcome.tools_used[0].name, "read_file");
    assert!(outcome.tools_used[0].output.contains("espresso"));

    // Working history replay: assistant tool_use then user tool_result,
    // ids matched in order.
    assert_eq!(outcome.loop_messages.len(), 2);
    let assistant = &outcome.loop_messages[0];
    let results = &outcome.loop_messages[1];
    assert_eq!(assistant.role, Role::Assistant);
    assert_eq!(results.role, Role::User);
    assert!(assistant.pairs_with_tool_results(results));

    // The second provider call saw the tool_result in its messages.
    let requests = provider.requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    let last = requests[1].messages.last().unwrap();
    match &last.content {
        MessageContent::Blocks(blocks) => match &blocks[0] {
            ContentBlock::ToolResult { tool_use_id, content } => {
                assert_eq!(tool_use_id, "tu_1");
                assert!(content.contains("espresso"));
            }
            other => panic!("expected tool_result, got {:?}", other),
        },
        other => panic!("expected blocks, got {:?}", other),
    }
}

/// Scenario: two parallel tool calls, one past its timeout. Both result
/// blocks appear in emission order; the slow one is an error string; the
/// loop continues to the final text.
#[tokio::test]
async fn parallel_tool_timeout_keeps_order() {
    let provider = ScriptedProvider::new(vec![
        Ok(tool_use_response(vec![
            ("tu_slow", "slow", json!({})),
            ("tu_fast", "fast", json!({})),
        ])),
        Ok(text_response("handled both")),
    ]);
    let registry = ToolRegistry::new(vec![
        Arc::new(SleepTool {
            name: "slow",
            sleep: Duration::from_secs(10),
            timeout: Duration::from_millis(50),
        }),
        Arc::new(SleepTool {
            name: "fast",
            sleep: Duration::from_millis(1),
            timeout: Duration::from_secs(5),
        }),
    ]);
    let orch = orchestrator_with(provider.clone(), registry);

    let outcome = orch
        .chat(
            &[Message::user("run both")],
            "system",
            "test-model",
            ThinkingLevel::Off,
        )
        .await
        .unwrap();

    assert_eq!(outcome.text, "handled both");

    let requests = provider.requests.lock().unwrap();
    let last = requests[1].messages.last().unwrap();
    let MessageContent::Blocks(blocks) = &last.content else {
        panic!("expected blocks");
    };
    assert_eq!(blocks.len(), 2);
    match (&blocks[0], &blocks[1]) {
        (
            ContentBlock::ToolResult {
                tool_use_id: slow_id,
                content: slow,
            },
            ContentBlock::ToolResult {
                tool_use_id: fast_id,
                content: fast,
            },
        ) => {
            assert_eq!(slow_id, "tu_slow");
            assert_eq!(fast_id, "tu_fast");
            assert!(slow.starts_with("Error:"), "slow result: {}", slow);
            assert!(slow.contains("timed out"));
            assert_eq!(fast, "fast finished");
        }
        other => panic!("expected two tool_results, got {:?}", other),
    }
}

/// Scenario: two 429s with Retry-After: 2, then success. Exactly three
/// attempts, each mandatory wait honored (virtual time), payload
/// delivered.
#[tokio::test(start_paused = true)]
async fn retry_honors_retry_after_on_429() {
    let provider = ScriptedProvider::new(vec![
        Err(rate_limited(2)),
        Err(rate_limited(2)),
        Ok(text_response("finally")),
    ]);
    let registry = ToolRegistry::new(vec![]);
    let orch = orchestrator_with(provider.clone(), registry);

    let start = tokio::time::Instant::now();
    let outcome = orch
        .chat(
            &[Message::user("hi")],
            "system",
            "test-model",
            ThinkingLevel::Off,
        )
        .await
        .unwrap();

    assert_eq!(outcome.text, "finally");
    assert_eq!(provider.request_count(), 3);
    // Two sleeps of at least 2s each.
    assert!(start.elapsed() >= Duration::from_secs(4));
}

/// The loop gives up with a fixed reply once the iteration cap trips.
#[tokio::test]
async fn tool_loop_terminates_at_iteration_cap() {
    let steps: Vec<anyhow::Result<_>> = (0..MAX_ITERATIONS + 2)
        .map(|_| Ok(tool_use_response(vec![("tu_loop", "fast", json!({}))])))
        .collect();
    let provider = ScriptedProvider::new(steps);
    let registry = ToolRegistry::new(vec![Arc::new(SleepTool {
        name: "fast",
        sleep: Duration::from_millis(1),
        timeout: Duration::from_secs(5),
    })]);
    let orch = orchestrator_with(provider.clone(), registry);

    let outcome = orch
        .chat(
            &[Message::user("loop forever")],
            "system",
            "test-model",
            ThinkingLevel::Off,
        )
        .await
        .unwrap();

    assert!(outcome.text.contains("too many tool calls"));
    // Initial request + MAX_ITERATIONS continuations.
    assert_eq!(provider.request_count(), MAX_ITERATIONS + 1);
    assert_eq!(outcome.tools_used.len(), MAX_ITERATIONS);
}

/// Streaming falls back to the loop on tool_use and forwards the final
/// text through the chunk callback.
#[tokio::test]
async fn stream_falls_back_to_loop_on_tool_use() {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::write(dir.path().join("USER.md"), "name: Sam")
        .await
        .unwrap();

    let provider = ScriptedProvider::new(vec![
        Ok(tool_use_response(vec![(
            "tu_1",
            "read_file",
            json!({"path": "USER.md"}),
        )])),
        Ok(text_response("Your name is Sam.")),
    ]);
    let registry = ToolRegistry::new(vec![Arc::new(ReadFileTool::new(dir.path().to_path_buf()))]);
    let orch = orchestrator_with(provider, registry);

    let chunks: Arc<std::sync::Mutex<Vec<String>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = chunks.clone();
    let outcome = orch
        .chat_stream(
            &[Message::user("what's my name?")],
            "system",
            "test-model",
            ThinkingLevel::Off,
            Box::new(move |chunk| sink.lock().unwrap().push(chunk.to_string())),
        )
        .await
        .unwrap();

    assert_eq!(outcome.text, "Your name is Sam.");
    assert_eq!(outcome.tools_used.len(), 1);
    let chunks = chunks.lock().unwrap();
    assert!(chunks.iter().any(|c| c.contains("Sam")));
}

/// Thinking budgets reach the wire on the first call and are dropped on
/// tool-loop continuations.
#[tokio::test]
async fn thinking_disabled_on_continuation_turns() {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::write(dir.path().join("a.md"), "content").await.unwrap();

    let provider = ScriptedProvider::new(vec![
        Ok(tool_use_response(vec![(
            "tu_1",
            "read_file",
            json!({"path": "a.md"}),
        )])),
        Ok(text_response("done")),
    ]);
    let registry = ToolRegistry::new(vec![Arc::new(ReadFileTool::new(dir.path().to_path_buf()))]);
    let orch = orchestrator_with(provider.clone(), registry);

    orch.chat(
        &[Message::user("go")],
        "system",
        "test-model",
        ThinkingLevel::Medium,
    )
    .await
    .unwrap();

    let requests = provider.requests.lock().unwrap();
    assert!(requests[0].thinking_budget.is_some());
    assert!(requests[1].thinking_budget.is_none());
}
