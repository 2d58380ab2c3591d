//! Per-user workspace: the persona/memory markdown files the daemon reads
//! on every prompt build, plus the dated daily-memory directory.

use std::path::{Path, PathBuf};

use chrono::{Duration as ChronoDuration, Local, NaiveDate};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Appended when a file is cut at its size cap.
pub const TRUNCATION_MARKER: &str = "\n\n[truncated: file exceeds size cap]";

/// Daily log files get their own cap, trimmed section-wise.
const DAILY_CAP: usize = 4_000;

/// The fixed set of persona/memory files, with per-file char caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceFile {
    /// AGENTS.md — operating rules.
    Rules,
    /// BOOTSTRAP.md — onboarding prompt, deleted after completion.
    Onboarding,
    /// IDENTITY.md — name/emoji.
    Identity,
    /// SOUL.md — persona/tone.
    Persona,
    /// USER.md — user facts.
    User,
    /// TOOLS.md — tool-usage notes.
    ToolsNotes,
    /// HEARTBEAT.md — periodic checklist.
    Heartbeat,
    /// MEMORY.md — curated long-term memory.
    LongMemory,
}

impl WorkspaceFile {
    pub fn file_name(&self) -> &'static str {
        match self {
            WorkspaceFile::Rules => "AGENTS.md",
            WorkspaceFile::Onboarding => "BOOTSTRAP.md",
            WorkspaceFile::Identity => "IDENTITY.md",
            WorkspaceFile::Persona => "SOUL.md",
            WorkspaceFile::User => "USER.md",
            WorkspaceFile::ToolsNotes => "TOOLS.md",
            WorkspaceFile::Heartbeat => "HEARTBEAT.md",
            WorkspaceFile::LongMemory => "MEMORY.md",
        }
    }

    /// Char cap applied on load. None = unlimited.
    pub fn cap(&self) -> Option<usize> {
        match self {
            WorkspaceFile::Rules => Some(8_000),
            WorkspaceFile::Onboarding => None,
            WorkspaceFile::Identity => Some(2_000),
            WorkspaceFile::Persona => Some(4_000),
            WorkspaceFile::User => Some(3_000),
            WorkspaceFile::ToolsNotes => Some(3_000),
            WorkspaceFile::Heartbeat => Some(2_000),
            WorkspaceFile::LongMemory => Some(6_000),
        }
    }
}

/// Snapshot of all workspace files; missing files stay None.
#[derive(Debug, Clone, Default)]
pub struct Workspace {
    pub rules: Option<String>,
    pub onboarding: Option<String>,
    pub identity: Option<String>,
    pub persona: Option<String>,
    pub user: Option<String>,
    pub tools_notes: Option<String>,
    pub heartbeat: Option<String>,
    pub long_memory: Option<String>,
    /// Files that were cut at their cap during this load.
    pub truncated: Vec<&'static str>,
}

pub struct WorkspaceStore {
    root: PathBuf,
    cache: RwLock<Option<(std::time::Instant, Workspace)>>,
}

impl WorkspaceStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            cache: RwLock::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn memory_dir(&self) -> PathBuf {
        self.root.join("memory")
    }

    fn path_for(&self, file: WorkspaceFile) -> PathBuf {
        self.root.join(file.file_name())
    }

    /// Load every workspace file in one parallel fan-out.
    pub async fn load(&self) -> Workspace {
        let read = |file: WorkspaceFile| async move {
            let raw = tokio::fs::read_to_string(self.path_for(file)).await.ok()?;
            Some((raw, file))
        };

        let (rules, onboarding, identity, persona, user, tools_notes, heartbeat, long_memory) = tokio::join!(
            read(WorkspaceFile::Rules),
            read(WorkspaceFile::Onboarding),
            read(WorkspaceFile::Identity),
            read(WorkspaceFile::Persona),
            read(WorkspaceFile::User),
            read(WorkspaceFile::ToolsNotes),
            read(WorkspaceFile::Heartbeat),
            read(WorkspaceFile::LongMemory),
        );

        let mut truncated: Vec<&'static str> = Vec::new();
        let mut apply = |loaded: Option<(String, WorkspaceFile)>| -> Option<String> {
            let (raw, file) = loaded?;
            let (text, cut) = cap_content(&raw, file.cap());
            if cut {
                truncated.push(file.file_name());
            }
            Some(text)
        };

        let rules = apply(rules);
        let onboarding = apply(onboarding);
        let identity = apply(identity);
        let persona = apply(persona);
        let user = apply(user);
        let tools_notes = apply(tools_notes);
        let heartbeat = apply(heartbeat);
        let long_memory = apply(long_memory);

        let ws = Workspace {
            rules,
            onboarding,
            identity,
            persona,
            user,
            tools_notes,
            heartbeat,
            long_memory,
            truncated,
        };

        *self.cache.write().await = Some((std::time::Instant::now(), ws.clone()));
        ws
    }

    /// Cached snapshot if fresh (≤ 5 s), otherwise a full reload. Prompt
    /// builds during a tool loop hit this several times per turn.
    pub async fn load_cached(&self) -> Workspace {
        if let Some((at, ws)) = self.cache.read().await.as_ref() {
            if at.elapsed() < std::time::Duration::from_secs(5) {
                return ws.clone();
            }
        }
        self.load().await
    }

    /// Write a workspace file atomically (temp + rename).
    pub async fn save(&self, file: WorkspaceFile, content: &str) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.path_for(file);
        atomic_write(&path, content).await?;
        *self.cache.write().await = None;
        Ok(())
    }

    /// Remove a workspace file (used when onboarding completes).
    pub async fn remove(&self, file: WorkspaceFile) -> anyhow::Result<()> {
        let path = self.path_for(file);
        if path.exists() {
            tokio::fs::remove_file(&path).await?;
        }
        *self.cache.write().await = None;
        Ok(())
    }

    /// Append a timestamped section to today's daily log.
    pub async fn append_daily_log(&self, content: &str) -> anyhow::Result<()> {
        let dir = self.memory_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}.md", Local::now().format("%Y-%m-%d")));
        let stamp = Local::now().format("%H:%M");
        let section = format!("## {}\n{}\n\n", stamp, content.trim_end());

        let mut existing = tokio::fs::read_to_string(&path).await.unwrap_or_default();
        existing.push_str(&section);
        atomic_write(&path, &existing).await
    }

    /// Daily logs for the last `days` days (most recent last), each capped
    /// by trimming oldest `## HH:MM` sections first.
    pub async fn list_recent_daily(&self, days: u32) -> Vec<(NaiveDate, String)> {
        let today = Local::now().date_naive();
        let mut out = Vec::new();
        for back in (0..days).rev() {
            let date = today - ChronoDuration::days(back as i64);
            let path = self.memory_dir().join(format!("{}.md", date.format("%Y-%m-%d")));
            match tokio::fs::read_to_string(&path).await {
                Ok(raw) => out.push((date, cap_daily(&raw, DAILY_CAP))),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), "daily log read failed: {}", e),
            }
        }
        out
    }

    /// Today + yesterday concatenated for the system prompt.
    pub async fn recent_daily_for_prompt(&self) -> Option<String> {
        let logs = self.list_recent_daily(2).await;
        if logs.is_empty() {
            return None;
        }
        Some(
            logs.iter()
                .map(|(date, text)| format!("### {}\n{}", date, text.trim_end()))
                .collect::<Vec<_>>()
                .join("\n\n"),
        )
    }
}

async fn atomic_write(path: &Path, content: &str) -> anyhow::Result<()> {
    let tmp = path.with_extension("md.tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    debug!(path = %path.display(), bytes = content.len(), "workspace write");
    Ok(())
}

/// Apply a char cap, preferring to cut at the last paragraph break within
/// [cap·0.7, cap]. Returns (text, was_truncated).
pub fn cap_content(raw: &str, cap: Option<usize>) -> (String, bool) {
    let cap = match cap {
        Some(c) => c,
        None => return (raw.to_string(), false),
    };
    let chars: Vec<char> = raw.chars().collect();
    if chars.len() <= cap {
        return (raw.to_string(), false);
    }

    let floor = (cap as f64 * 0.7) as usize;
    let head: String = chars[..cap].iter().collect();
    let cut_at = head
        .rfind("\n\n")
        .filter(|&idx| head[..idx].chars().count() >= floor);

    let mut text = match cut_at {
        Some(idx) => head[..idx].to_string(),
        None => head,
    };
    text.push_str(TRUNCATION_MARKER);
    (text, true)
}

/// Cap a daily log by dropping its oldest `## HH:MM` sections first.
fn cap_daily(raw: &str, cap: usize) -> String {
    if raw.chars().count() <= cap {
        return raw.to_string();
    }

    // Split into sections keyed by "## " headers; preamble counts as one.
    let mut sections: Vec<String> = Vec::new();
    let mut current = String::new();
    for line in raw.lines() {
        if line.starts_with("## ") && !current.is_empty() {
            sections.push(std::mem::take(&mut current));
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.is_empty() {
        sections.push(current);
    }

    // Drop from the front until the remainder fits.
    let mut start = 0;
    while start < sections.len().saturating_sub(1) {
        let total: usize = sections[start..].iter().map(|s| s.chars().count()).sum();
        if total <= cap {
            break;
        }
        start += 1;
    }

    let mut text = sections[start..].concat();
    if start > 0 {
        text = format!("[{} earlier sections trimmed]\n{}", start, text);
    }
    // A single oversized section still needs a hard cut.
    let (text, _) = cap_content(&text, Some(cap));
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn under_cap_passes_through() {
        let (text, cut) = cap_content("short", Some(100));
        assert_eq!(text, "short");
        assert!(!cut);
    }

    #[test]
    fn cuts_at_paragraph_break_inside_window() {
        let raw = format!("{}\n\n{}", "a".repeat(80), "b".repeat(80));
        let (text, cut) = cap_content(&raw, Some(100));
        assert!(cut);
        assert!(text.starts_with(&"a".repeat(80)));
        assert!(!text.contains('b'));
        assert!(text.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn falls_back_to_hard_cut_without_break() {
        let raw = "x".repeat(200);
        let (text, cut) = cap_content(&raw, Some(100));
        assert!(cut);
        assert_eq!(
            text.chars().count(),
            100 + TRUNCATION_MARKER.chars().count()
        );
    }

    #[test]
    fn paragraph_break_before_window_floor_is_ignored() {
        // Break at 10 chars, floor at 70: too early, expect hard cut.
        let raw = format!("{}\n\n{}", "a".repeat(10), "b".repeat(200));
        let (text, cut) = cap_content(&raw, Some(100));
        assert!(cut);
        assert!(text.contains('b'));
    }

    #[test]
    fn daily_cap_trims_oldest_sections_first() {
        let raw = format!(
            "## 09:00\n{}\n## 12:00\n{}\n## 15:00\n{}\n",
            "a".repeat(50),
            "b".repeat(50),
            "c".repeat(50)
        );
        let capped = cap_daily(&raw, 80);
        assert!(!capped.contains("09:00"));
        assert!(capped.contains("15:00"));
        assert!(capped.contains("sections trimmed"));
    }

    #[tokio::test]
    async fn load_missing_files_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(dir.path().to_path_buf());
        let ws = store.load().await;
        assert!(ws.identity.is_none());
        assert!(ws.rules.is_none());
        assert!(ws.truncated.is_empty());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(dir.path().to_path_buf());
        store
            .save(WorkspaceFile::Identity, "# Ada\nemoji: sparkles")
            .await
            .unwrap();
        let ws = store.load().await;
        assert_eq!(ws.identity.as_deref(), Some("# Ada\nemoji: sparkles"));
    }

    #[tokio::test]
    async fn daily_log_appends_sections() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(dir.path().to_path_buf());
        store.append_daily_log("met with the team").await.unwrap();
        store.append_daily_log("shipped the release").await.unwrap();
        let logs = store.list_recent_daily(1).await;
        assert_eq!(logs.len(), 1);
        assert!(logs[0].1.contains("met with the team"));
        assert!(logs[0].1.contains("shipped the release"));
    }
}
