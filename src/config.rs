use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub provider: ProviderConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub exec: ExecConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    /// Secret slot name resolved at startup; never the key itself.
    #[serde(default = "default_api_key_slot")]
    pub api_key_slot: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub models: ModelsConfig,
    /// Context window used for token budgeting, keyed by model id.
    /// Models not listed fall back to `default_context_window`.
    #[serde(default)]
    pub context_windows: HashMap<String, u32>,
    #[serde(default = "default_context_window")]
    pub default_context_window: u32,
}

fn default_api_key_slot() -> String {
    "llm-api-key".to_string()
}

fn default_base_url() -> String {
    "https://api.anthropic.com/v1".to_string()
}

fn default_context_window() -> u32 {
    200_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelsConfig {
    #[serde(default = "default_small_model")]
    pub small: String,
    #[serde(default = "default_medium_model")]
    pub medium: String,
    #[serde(default = "default_large_model")]
    pub large: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            small: default_small_model(),
            medium: default_medium_model(),
            large: default_large_model(),
        }
    }
}

fn default_small_model() -> String {
    "claude-3-5-haiku-latest".to_string()
}
fn default_medium_model() -> String {
    "claude-sonnet-4-5".to_string()
}
fn default_large_model() -> String {
    "claude-opus-4-1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkspaceConfig {
    /// Workspace root; `~` expands to the user home.
    #[serde(default = "default_workspace_dir")]
    pub dir: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            dir: default_workspace_dir(),
            timezone: default_timezone(),
        }
    }
}

fn default_workspace_dir() -> String {
    "~/.adjutant".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl WorkspaceConfig {
    pub fn resolved_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.dir).into_owned())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// One-shot jobs missed by less than this fire once on restore.
    #[serde(default = "default_grace_secs")]
    pub startup_grace_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            startup_grace_secs: default_grace_secs(),
        }
    }
}

fn default_tick_secs() -> u64 {
    30
}
fn default_grace_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    #[serde(default = "default_session_cap")]
    pub max_sessions: usize,
    #[serde(default = "default_session_ttl_hours")]
    pub ttl_hours: u64,
    #[serde(default = "default_compact_threshold")]
    pub compact_token_threshold: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_session_cap(),
            ttl_hours: default_session_ttl_hours(),
            compact_token_threshold: default_compact_threshold(),
        }
    }
}

fn default_session_cap() -> usize {
    100
}
fn default_session_ttl_hours() -> u64 {
    24
}
fn default_compact_threshold() -> usize {
    60_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct MemoryConfig {
    #[serde(default = "default_min_chunk_chars")]
    pub min_chunk_chars: usize,
    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,
    /// "rrf" or "weighted"
    #[serde(default = "default_fusion")]
    pub fusion: String,
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f64,
    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            min_chunk_chars: default_min_chunk_chars(),
            max_chunk_chars: default_max_chunk_chars(),
            fusion: default_fusion(),
            vector_weight: default_vector_weight(),
            keyword_weight: default_keyword_weight(),
        }
    }
}

fn default_min_chunk_chars() -> usize {
    20
}
fn default_max_chunk_chars() -> usize {
    500
}
fn default_fusion() -> String {
    "rrf".to_string()
}
fn default_vector_weight() -> f64 {
    0.7
}
fn default_keyword_weight() -> f64 {
    0.3
}

#[derive(Debug, Deserialize, Clone)]
pub struct HeartbeatConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_heartbeat_minutes")]
    pub interval_minutes: u64,
    /// Chat that receives heartbeat output when the model decides to speak.
    #[serde(default)]
    pub chat_id: Option<i64>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: default_heartbeat_minutes(),
            chat_id: None,
        }
    }
}

fn default_heartbeat_minutes() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExecConfig {
    #[serde(default = "default_allowed_binaries")]
    pub allowed_binaries: Vec<String>,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            allowed_binaries: default_allowed_binaries(),
        }
    }
}

fn default_allowed_binaries() -> Vec<String> {
    [
        "ls", "cat", "head", "tail", "echo", "date", "whoami", "pwd", "find", "wc", "grep",
        "tree", "file", "stat", "uname", "df", "du", "ps", "which", "env", "printenv", "sort",
        "uniq", "diff", "uptime",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

/// Resolve a named secret slot. The OS credential service fronts this in
/// packaged builds; the env fallback (`ADJUTANT_LLM_API_KEY` for
/// `llm-api-key`) keeps dev and CI setups simple.
pub fn resolve_secret(slot: &str) -> anyhow::Result<String> {
    let env_name = format!("ADJUTANT_{}", slot.replace('-', "_").to_uppercase());
    if let Ok(v) = std::env::var(&env_name) {
        if !v.trim().is_empty() {
            return Ok(v);
        }
    }
    anyhow::bail!(
        "Secret '{}' not found. Set {} or store it in the OS keychain.",
        slot,
        env_name
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let cfg: AppConfig = toml::from_str("[provider]\n").unwrap();
        assert_eq!(cfg.sessions.max_sessions, 100);
        assert_eq!(cfg.scheduler.tick_secs, 30);
        assert_eq!(cfg.memory.min_chunk_chars, 20);
        assert_eq!(cfg.memory.max_chunk_chars, 500);
        assert_eq!(cfg.provider.default_context_window, 200_000);
    }

    #[test]
    fn secret_slot_resolves_from_env() {
        std::env::set_var("ADJUTANT_TEST_SLOT", "sk-123");
        assert_eq!(resolve_secret("test-slot").unwrap(), "sk-123");
        std::env::remove_var("ADJUTANT_TEST_SLOT");
        assert!(resolve_secret("test-slot").is_err());
    }
}
