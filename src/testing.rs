//! Test doubles shared by unit and integration tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::providers::ProviderError;
use crate::traits::{
    ChatRequest, ContentBlock, ModelProvider, ProviderResponse, StopReason, TokenUsage,
};

/// A provider that replays a script of responses/errors and records
/// every request it receives.
pub struct ScriptedProvider {
    steps: Mutex<VecDeque<anyhow::Result<ProviderResponse>>>,
    pub requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    pub fn new(steps: Vec<anyhow::Result<ProviderResponse>>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn chat(&self, req: &ChatRequest) -> anyhow::Result<ProviderResponse> {
        self.requests.lock().unwrap().push(req.clone());
        self.steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(text_response("script exhausted")))
    }
}

pub fn text_response(text: &str) -> ProviderResponse {
    ProviderResponse {
        content: vec![ContentBlock::Text {
            text: text.to_string(),
        }],
        stop_reason: StopReason::EndTurn,
        usage: TokenUsage::default(),
    }
}

pub fn tool_use_response(calls: Vec<(&str, &str, Value)>) -> ProviderResponse {
    ProviderResponse {
        content: calls
            .into_iter()
            .map(|(id, name, input)| ContentBlock::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input,
            })
            .collect(),
        stop_reason: StopReason::ToolUse,
        usage: TokenUsage::default(),
    }
}

pub fn rate_limited(retry_after_secs: u64) -> anyhow::Error {
    ProviderError::from_status(429, "rate limited", Some(retry_after_secs)).into()
}
