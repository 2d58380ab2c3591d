//! Web search behind a pluggable backend. The tool owns formatting and
//! compression; the backend owns the vendor API.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::traits::Tool;

#[derive(Debug, Clone)]
pub struct SearchResultEntry {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// Narrow seam to the search vendor (API key lives behind it).
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, query: &str, count: usize) -> anyhow::Result<Vec<SearchResultEntry>>;
}

pub struct WebSearchTool {
    backend: std::sync::Arc<dyn SearchBackend>,
}

impl WebSearchTool {
    pub fn new(backend: std::sync::Arc<dyn SearchBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web and return the top results"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "count": {
                    "type": "integer",
                    "description": "How many results to request (default 8, max 20)"
                }
            },
            "required": ["query"]
        })
    }

    async fn call(&self, input: Value) -> anyhow::Result<String> {
        let query = input["query"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: query"))?;
        let count = input["count"].as_u64().unwrap_or(8).clamp(1, 20) as usize;

        let results = self.backend.search(query, count).await?;
        if results.is_empty() {
            return Ok(format!("No results for '{}'", query));
        }

        Ok(results
            .iter()
            .enumerate()
            .map(|(i, r)| format!("{}. {}\n   {}\n   {}", i + 1, r.title, r.url, r.snippet))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    /// Keep the first 5 numbered entries verbatim, count the rest.
    fn compress(&self, result: String) -> String {
        if result.chars().count() <= self.result_cap() {
            return result;
        }
        let mut kept = Vec::new();
        let mut entries = 0usize;
        let mut omitted = 0usize;
        for line in result.lines() {
            let is_entry_start = line
                .split_once('.')
                .map(|(n, _)| n.chars().all(|c| c.is_ascii_digit()) && !n.is_empty())
                .unwrap_or(false);
            if is_entry_start {
                entries += 1;
            }
            if entries <= 5 {
                kept.push(line);
            } else if is_entry_start {
                omitted += 1;
            }
        }
        format!("{}\n({} more omitted)", kept.join("\n"), omitted)
    }
}

/// Brave Search API backend. Key comes from the `search-api-key` slot.
pub struct BraveSearchBackend {
    client: reqwest::Client,
    api_key: String,
}

impl BraveSearchBackend {
    pub fn new(api_key: &str) -> Self {
        Self {
            client: super::web_fetch::build_guarded_client(),
            api_key: api_key.to_string(),
        }
    }
}

#[async_trait]
impl SearchBackend for BraveSearchBackend {
    async fn search(&self, query: &str, count: usize) -> anyhow::Result<Vec<SearchResultEntry>> {
        let resp = self
            .client
            .get("https://api.search.brave.com/res/v1/web/search")
            .query(&[("q", query), ("count", &count.to_string())])
            .header("X-Subscription-Token", &self.api_key)
            .header("Accept", "application/json")
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("search API returned HTTP {}", resp.status());
        }
        let data: Value = resp.json().await?;
        let results = data["web"]["results"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .take(count)
                    .map(|r| SearchResultEntry {
                        title: r["title"].as_str().unwrap_or("(untitled)").to_string(),
                        url: r["url"].as_str().unwrap_or_default().to_string(),
                        snippet: r["description"].as_str().unwrap_or_default().to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(results)
    }
}

/// Placeholder when no search key is configured; the tool surfaces a
/// clear error instead of silently returning nothing.
pub struct UnconfiguredSearchBackend;

#[async_trait]
impl SearchBackend for UnconfiguredSearchBackend {
    async fn search(&self, _query: &str, _count: usize) -> anyhow::Result<Vec<SearchResultEntry>> {
        anyhow::bail!("web search is not configured (set the search-api-key secret)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct FixedBackend {
        count: usize,
    }

    #[async_trait]
    impl SearchBackend for FixedBackend {
        async fn search(
            &self,
            query: &str,
            count: usize,
        ) -> anyhow::Result<Vec<SearchResultEntry>> {
            Ok((0..count.min(self.count))
                .map(|i| SearchResultEntry {
                    title: format!("Result {} for {}", i + 1, query),
                    url: format!("https://example.com/{}", i + 1),
                    snippet: "snippet text ".repeat(40),
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn formats_numbered_results() {
        let tool = WebSearchTool::new(Arc::new(FixedBackend { count: 3 }));
        let out = tool.call(json!({"query": "rust lang", "count": 3})).await.unwrap();
        assert!(out.starts_with("1. Result 1"));
        assert!(out.contains("3. Result 3"));
    }

    #[tokio::test]
    async fn compression_keeps_first_five_entries() {
        let tool = WebSearchTool::new(Arc::new(FixedBackend { count: 20 }));
        let raw = tool.call(json!({"query": "q", "count": 20})).await.unwrap();
        let compressed = tool.compress(raw);
        assert!(compressed.contains("5. Result 5"));
        assert!(!compressed.contains("6. Result 6"));
        assert!(compressed.ends_with("(15 more omitted)"));
    }

    #[tokio::test]
    async fn empty_results_say_so() {
        let tool = WebSearchTool::new(Arc::new(FixedBackend { count: 0 }));
        let out = tool.call(json!({"query": "nothing"})).await.unwrap();
        assert!(out.contains("No results"));
    }
}
