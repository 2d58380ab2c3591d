//! The tool-use loop: drives the LLM through multi-turn tool calls with
//! parallel execution, budget computation, retry, and a streaming
//! variant that falls back to the loop when tools come into play.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::providers::{with_retry, ProviderError, RetryPolicy};
use crate::tokens;
use crate::tools::ToolRegistry;
use crate::traits::{
    ChatRequest, ContentBlock, Message, ModelProvider, ProviderResponse, StopReason,
    StreamChunkFn,
};

pub const MAX_ITERATIONS: usize = 10;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const FIXED_MAX_TOKENS: u32 = 8192;
const MIN_THINKING_BUDGET: u32 = 1024;

const TOO_MANY_TOOL_CALLS_REPLY: &str =
    "I made too many tool calls in a row working on this and stopped before finishing. \
     Ask me to continue if you want me to keep going.";

/// Extended-thinking effort. Ratio scales against max_tokens; cap is the
/// absolute ceiling per level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThinkingLevel {
    Off,
    Low,
    #[default]
    Medium,
    High,
}

impl ThinkingLevel {
    fn params(&self) -> Option<(f64, u32)> {
        match self {
            Self::Off => None,
            Self::Low => Some((0.3, 5_000)),
            Self::Medium => Some((0.5, 10_000)),
            Self::High => Some((0.7, 20_000)),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "off" => Some(Self::Off),
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

/// Short record of one tool call, kept for transcripts and debugging.
#[derive(Debug, Clone)]
pub struct ToolSummary {
    pub name: String,
    pub input: String,
    pub output: String,
}

#[derive(Debug)]
pub struct ChatOutcome {
    pub text: String,
    pub tools_used: Vec<ToolSummary>,
    /// Tool-loop messages generated this turn (assistant tool_use +
    /// user tool_result pairs), in order, for history replay.
    pub loop_messages: Vec<Message>,
}

/// Token budgets for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    pub max_tokens: u32,
    pub thinking_budget: Option<u32>,
}

/// Compute max_tokens and the thinking budget for a request against a
/// model with context window `window` and an estimated input of
/// `input_tokens`.
pub fn compute_budget(window: u32, input_tokens: u32, thinking: ThinkingLevel) -> Budget {
    let Some((ratio, cap)) = thinking.params() else {
        return Budget {
            max_tokens: FIXED_MAX_TOKENS,
            thinking_budget: None,
        };
    };

    let headroom = window.saturating_sub(input_tokens);
    let max_tokens = ((headroom as f64) * 0.3).floor() as u32;
    let max_tokens = max_tokens.max(4096);

    let budget = cap
        .min((max_tokens as f64 * ratio).floor() as u32)
        .min(max_tokens.saturating_sub(1024));
    Budget {
        max_tokens,
        thinking_budget: (budget >= MIN_THINKING_BUDGET).then_some(budget),
    }
}

pub struct Orchestrator {
    provider: Arc<dyn ModelProvider>,
    registry: Arc<ToolRegistry>,
    retry: RetryPolicy,
    context_windows: HashMap<String, u32>,
    default_window: u32,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        registry: Arc<ToolRegistry>,
        context_windows: HashMap<String, u32>,
        default_window: u32,
    ) -> Self {
        Self {
            provider,
            registry,
            retry: RetryPolicy::default(),
            context_windows,
            default_window,
        }
    }

    fn window_for(&self, model: &str) -> u32 {
        self.context_windows
            .get(model)
            .copied()
            .unwrap_or(self.default_window)
    }

    fn request(
        &self,
        model: &str,
        system: &str,
        messages: Vec<Message>,
        thinking: ThinkingLevel,
    ) -> ChatRequest {
        let input_estimate =
            (tokens::estimate(system) + tokens::estimate_messages(&messages)) as u32;
        let budget = compute_budget(self.window_for(model), input_estimate, thinking);
        ChatRequest {
            model: model.to_string(),
            system: system.to_string(),
            messages,
            tools: self.registry.schemas(),
            max_tokens: budget.max_tokens,
            thinking_budget: budget.thinking_budget,
        }
    }

    async fn call_provider(&self, req: &ChatRequest) -> anyhow::Result<ProviderResponse> {
        with_retry(self.retry, "llm", || async move {
            match tokio::time::timeout(REQUEST_TIMEOUT, self.provider.chat(req)).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::timeout(REQUEST_TIMEOUT.as_secs()).into()),
            }
        })
        .await
    }

    /// One full conversational turn: submit, run requested tools in
    /// parallel, feed results back, repeat until the model settles on
    /// text (or the iteration cap trips).
    pub async fn chat(
        &self,
        history: &[Message],
        system: &str,
        model: &str,
        thinking: ThinkingLevel,
    ) -> anyhow::Result<ChatOutcome> {
        let req = self.request(model, system, history.to_vec(), thinking);
        let first = self.call_provider(&req).await?;
        self.finish_turn(first, history.to_vec(), system, model).await
    }

    /// Continue from an initial response, iterating the tool loop.
    async fn finish_turn(
        &self,
        mut response: ProviderResponse,
        mut working: Vec<Message>,
        system: &str,
        model: &str,
    ) -> anyhow::Result<ChatOutcome> {
        let mut summaries: Vec<ToolSummary> = Vec::new();
        let mut loop_messages: Vec<Message> = Vec::new();
        let mut iterations = 0usize;

        while response.stop_reason == StopReason::ToolUse {
            iterations += 1;
            if iterations > MAX_ITERATIONS {
                warn!(model, iterations, "tool loop hit iteration cap");
                return Ok(ChatOutcome {
                    text: TOO_MANY_TOOL_CALLS_REPLY.to_string(),
                    tools_used: summaries,
                    loop_messages,
                });
            }

            let calls: Vec<(String, String, Value)> = response
                .content
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, name, input } => {
                        Some((id.clone(), name.clone(), input.clone()))
                    }
                    _ => None,
                })
                .collect();
            if calls.is_empty() {
                // Provider said tool_use but sent no tool blocks; treat
                // as a final answer rather than looping forever.
                break;
            }

            info!(
                model,
                iteration = iterations,
                tools = ?calls.iter().map(|(_, n, _)| n.as_str()).collect::<Vec<_>>(),
                "executing tool calls"
            );

            // Parallel fan-out; join_all preserves emission order.
            let results = futures::future::join_all(
                calls
                    .iter()
                    .map(|(_, name, input)| self.registry.execute(name, input.clone())),
            )
            .await;

            for ((_, name, input), output) in calls.iter().zip(&results) {
                summaries.push(ToolSummary {
                    name: name.clone(),
                    input: clip(&input.to_string(), 200),
                    output: clip(output, 500),
                });
            }

            // Assistant message goes back verbatim, then the ordered
            // tool_result blocks keyed by the original ids.
            let assistant = Message {
                role: crate::traits::Role::Assistant,
                content: crate::traits::MessageContent::Blocks(response.content.clone()),
            };
            let result_msg = Message::tool_results(
                calls
                    .iter()
                    .map(|(id, _, _)| id.clone())
                    .zip(results)
                    .collect(),
            );
            debug_assert!(assistant.pairs_with_tool_results(&result_msg));

            working.push(assistant.clone());
            working.push(result_msg.clone());
            loop_messages.push(assistant);
            loop_messages.push(result_msg);

            // Continuations disable thinking: providers reject thinking
            // blocks on tool-result turns.
            let req = self.request(model, system, working.clone(), ThinkingLevel::Off);
            response = self.call_provider(&req).await?;
        }

        debug!(model, iterations, "turn complete");
        Ok(ChatOutcome {
            text: response.text(),
            tools_used: summaries,
            loop_messages,
        })
    }

    /// Streaming variant. Text chunks flow through `on_chunk` as they
    /// arrive. If the stream ends in tool_use, the non-streaming loop
    /// finishes the turn (its final text is forwarded as one chunk).
    /// Errors before the first chunk retry like non-streaming ones;
    /// errors after bytes flowed return the partial buffer instead.
    pub async fn chat_stream(
        &self,
        history: &[Message],
        system: &str,
        model: &str,
        thinking: ThinkingLevel,
        on_chunk: StreamChunkFn,
    ) -> anyhow::Result<ChatOutcome> {
        let req = self.request(model, system, history.to_vec(), thinking);

        let buffer: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
        let on_chunk = Arc::new(on_chunk);
        let cb: StreamChunkFn = {
            let buffer = buffer.clone();
            let on_chunk = on_chunk.clone();
            Box::new(move |chunk: &str| {
                buffer
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push_str(chunk);
                (*on_chunk)(chunk);
            })
        };

        let mut attempt = 0u32;
        let mut delay = Duration::from_secs(1);
        let first = loop {
            attempt += 1;
            match tokio::time::timeout(REQUEST_TIMEOUT, self.provider.chat_stream(&req, &cb)).await
            {
                Ok(Ok(resp)) => break resp,
                Ok(Err(e)) => {
                    let delivered = !buffer
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .is_empty();
                    if delivered {
                        // Bytes already reached the user; no retry.
                        let partial = buffer.lock().unwrap_or_else(|e| e.into_inner()).clone();
                        warn!("stream failed mid-flight, returning partial: {}", e);
                        return Ok(ChatOutcome {
                            text: format!(
                                "{}\n\n[The response was cut short by a connection error.]",
                                partial
                            ),
                            tools_used: Vec::new(),
                            loop_messages: Vec::new(),
                        });
                    }
                    if attempt > self.retry.max_retries || !crate::providers::is_transient(&e) {
                        return Err(e);
                    }
                    warn!(attempt, "stream failed before first chunk, retrying: {}", e);
                    tokio::time::sleep(delay.min(self.retry.max_delay)).await;
                    delay = delay.saturating_mul(self.retry.factor);
                }
                Err(_) => {
                    let delivered = !buffer
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .is_empty();
                    if delivered {
                        let partial = buffer.lock().unwrap_or_else(|e| e.into_inner()).clone();
                        return Ok(ChatOutcome {
                            text: format!("{}\n\n[The response timed out mid-stream.]", partial),
                            tools_used: Vec::new(),
                            loop_messages: Vec::new(),
                        });
                    }
                    if attempt > self.retry.max_retries {
                        return Err(ProviderError::timeout(REQUEST_TIMEOUT.as_secs()).into());
                    }
                    tokio::time::sleep(delay.min(self.retry.max_delay)).await;
                    delay = delay.saturating_mul(self.retry.factor);
                }
            }
        };

        if first.stop_reason == StopReason::ToolUse {
            let outcome = self
                .finish_turn(first, history.to_vec(), system, model)
                .await?;
            if !outcome.text.is_empty() {
                (*on_chunk)(&outcome.text);
            }
            return Ok(outcome);
        }

        Ok(ChatOutcome {
            text: first.text(),
            tools_used: Vec::new(),
            loop_messages: Vec::new(),
        })
    }

    /// Ask the model for a compaction summary of older history.
    pub async fn summarize_history(
        &self,
        history: &[Message],
        model: &str,
    ) -> anyhow::Result<String> {
        let transcript: String = history
            .iter()
            .map(|m| {
                format!(
                    "{}: {}",
                    match m.role {
                        crate::traits::Role::User => "user",
                        crate::traits::Role::Assistant => "assistant",
                    },
                    clip(&m.content_as_text(), 800)
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let req = ChatRequest {
            model: model.to_string(),
            system: "Summarize the conversation excerpt for long-term context. Keep decisions, \
                     facts, open threads, and user preferences. Be dense and factual."
                .to_string(),
            messages: vec![Message::user(transcript)],
            tools: Vec::new(),
            max_tokens: 1024,
            thinking_budget: None,
        };
        let resp = self.call_provider(&req).await?;
        Ok(resp.text())
    }
}

fn clip(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars).collect();
        format!("{}…", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_off_is_fixed() {
        let b = compute_budget(200_000, 50_000, ThinkingLevel::Off);
        assert_eq!(b.max_tokens, FIXED_MAX_TOKENS);
        assert_eq!(b.thinking_budget, None);
    }

    #[test]
    fn budget_scales_with_headroom() {
        // (200k - 100k) * 0.3 = 30k; medium: min(10k, 15k, 28976) = 10k.
        let b = compute_budget(200_000, 100_000, ThinkingLevel::Medium);
        assert_eq!(b.max_tokens, 30_000);
        assert_eq!(b.thinking_budget, Some(10_000));
    }

    #[test]
    fn budget_floors_at_4096() {
        let b = compute_budget(10_000, 9_500, ThinkingLevel::High);
        assert_eq!(b.max_tokens, 4096);
        // high: min(20k, 2867, 3072) = 2867.
        assert_eq!(b.thinking_budget, Some(2867));
    }

    #[test]
    fn tiny_thinking_budget_disables_thinking() {
        // low ratio on the floor: min(5000, 1228, 3072) = 1228 -> kept;
        // shrink further via level cap interplay is impossible, so check
        // the sub-minimum case directly with a tiny window.
        let b = compute_budget(200_000, 199_000, ThinkingLevel::Low);
        assert_eq!(b.max_tokens, 4096);
        assert_eq!(b.thinking_budget, Some(1228));

        // A budget under 1024 disables thinking entirely.
        let degenerate = Budget {
            max_tokens: 4096,
            thinking_budget: (800 >= MIN_THINKING_BUDGET).then_some(800),
        };
        assert_eq!(degenerate.thinking_budget, None);
    }

    #[test]
    fn thinking_level_parses() {
        assert_eq!(ThinkingLevel::parse("high"), Some(ThinkingLevel::High));
        assert_eq!(ThinkingLevel::parse("OFF"), Some(ThinkingLevel::Off));
        assert_eq!(ThinkingLevel::parse("max"), None);
    }

    #[test]
    fn clip_respects_char_boundaries() {
        assert_eq!(clip("hello", 10), "hello");
        assert_eq!(clip("hello world", 5), "hello…");
        assert_eq!(clip("안녕하세요 반갑습니다", 5), "안녕하세요…");
    }
}
