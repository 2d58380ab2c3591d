//! Fetch a URL and hand back readable text. Every hop (including
//! redirects) is re-validated against the SSRF guard.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::net_guard::validate_url;
use crate::traits::Tool;

const DEFAULT_MAX_CHARS: usize = 8_000;

/// HTTP client with SSRF-checked redirects, shared by the URL tools.
pub fn build_guarded_client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(30))
        .redirect(reqwest::redirect::Policy::custom(|attempt| {
            if validate_url(attempt.url().as_str()).is_err() {
                attempt.stop()
            } else if attempt.previous().len() >= 10 {
                attempt.stop()
            } else {
                attempt.follow()
            }
        }))
        .user_agent("Mozilla/5.0 (X11; Linux x86_64; rv:142.0) Gecko/20100101 Firefox/142.0")
        .build()
        .expect("failed to build HTTP client")
}

pub struct WebFetchTool {
    client: Client,
}

impl WebFetchTool {
    pub fn new() -> Self {
        Self {
            client: build_guarded_client(),
        }
    }
}

impl Default for WebFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch a URL and extract its readable content as markdown"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": "The http(s) URL to fetch"},
                "max_chars": {
                    "type": "integer",
                    "description": "Maximum characters to return (default 8000)"
                }
            },
            "required": ["url"]
        })
    }

    async fn call(&self, input: Value) -> anyhow::Result<String> {
        let url = input["url"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: url"))?;
        let max_chars = input["max_chars"]
            .as_u64()
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_CHARS)
            .clamp(1, self.result_cap());

        if let Err(reason) = validate_url(url) {
            anyhow::bail!("request blocked: {}", reason);
        }

        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Ok(format!("Error fetching {}: HTTP {}", url, resp.status()));
        }
        let html = resp.text().await?;
        let text = htmd::convert(&html).unwrap_or(html);

        let mut result = format!("Content from {}:\n\n", url);
        if text.chars().count() > max_chars {
            let head: String = text.chars().take(max_chars).collect();
            result.push_str(&head);
            result.push_str("\n\n[Truncated]");
        } else {
            result.push_str(&text);
        }
        Ok(result)
    }
}
