//! Workspace file tools: read, write, list, and the clock.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use chrono_tz::Tz;
use serde_json::{json, Value};

use crate::traits::Tool;

/// Resolve a path argument against the workspace root and confine it
/// there. Relative paths land inside the workspace; absolute paths must
/// already be inside it.
fn resolve_in_workspace(root: &Path, path: &str) -> anyhow::Result<PathBuf> {
    let expanded = shellexpand::tilde(path).into_owned();
    let candidate = PathBuf::from(&expanded);
    let joined = if candidate.is_absolute() {
        candidate
    } else {
        root.join(candidate)
    };
    let normalized = joined.to_string_lossy().to_string();
    if normalized.contains("/../") || normalized.ends_with("/..") {
        anyhow::bail!("path traversal detected: {}", path);
    }
    let root_str = root.to_string_lossy();
    if !joined.starts_with(root) && !normalized.starts_with(root_str.as_ref()) {
        anyhow::bail!("path '{}' is outside the workspace", path);
    }
    Ok(joined)
}

pub struct ReadFileTool {
    root: PathBuf,
}

impl ReadFileTool {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file from the workspace"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to the workspace root (or absolute inside it)"
                }
            },
            "required": ["path"]
        })
    }

    async fn call(&self, input: Value) -> anyhow::Result<String> {
        let path = input["path"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: path"))?;
        let resolved = resolve_in_workspace(&self.root, path)?;
        let content = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| anyhow::anyhow!("cannot read '{}': {}", path, e))?;
        Ok(content)
    }

    /// Files keep their head: the opening of a document carries the
    /// structure the model needs.
    fn compress(&self, result: String) -> String {
        let cap = self.result_cap();
        if result.chars().count() <= cap {
            return result;
        }
        let keep = cap * 8 / 10;
        let head: String = result.chars().take(keep).collect();
        format!("{}\n... (truncated, file continues)", head)
    }
}

pub struct WriteFileTool {
    root: PathBuf,
}

impl WriteFileTool {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write or overwrite a file in the workspace"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "content": {"type": "string"},
                "append": {
                    "type": "boolean",
                    "description": "Append instead of overwrite",
                    "default": false
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn call(&self, input: Value) -> anyhow::Result<String> {
        let path = input["path"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: path"))?;
        let content = input["content"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: content"))?;
        let resolved = resolve_in_workspace(&self.root, path)?;

        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if input["append"].as_bool().unwrap_or(false) {
            let mut existing = tokio::fs::read_to_string(&resolved).await.unwrap_or_default();
            existing.push_str(content);
            tokio::fs::write(&resolved, existing).await?;
        } else {
            tokio::fs::write(&resolved, content).await?;
        }
        Ok(format!("Wrote {} bytes to {}", content.len(), path))
    }
}

pub struct ListDirectoryTool {
    root: PathBuf,
}

impl ListDirectoryTool {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl Tool for ListDirectoryTool {
    fn name(&self) -> &str {
        "list_directory"
    }

    fn description(&self) -> &str {
        "List a workspace directory (folders first, marked with a trailing /)"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory relative to the workspace root; defaults to the root"
                }
            }
        })
    }

    async fn call(&self, input: Value) -> anyhow::Result<String> {
        let path = input["path"].as_str().unwrap_or(".");
        let resolved = resolve_in_workspace(&self.root, path)?;

        let mut reader = tokio::fs::read_dir(&resolved)
            .await
            .map_err(|e| anyhow::anyhow!("cannot list '{}': {}", path, e))?;
        let mut folders = Vec::new();
        let mut files = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                folders.push(format!("{}/", name));
            } else {
                files.push(name);
            }
        }
        folders.sort();
        files.sort();

        if folders.is_empty() && files.is_empty() {
            return Ok(format!("{} is empty", path));
        }
        Ok(folders
            .into_iter()
            .chain(files)
            .collect::<Vec<_>>()
            .join("\n"))
    }

    /// Folders always survive compression; the file list keeps its head
    /// and tail around an omission marker.
    fn compress(&self, result: String) -> String {
        let cap = self.result_cap();
        if result.chars().count() <= cap {
            return result;
        }
        let (folders, files): (Vec<&str>, Vec<&str>) =
            result.lines().partition(|l| l.ends_with('/'));

        let mut out: Vec<String> = folders.iter().map(|s| s.to_string()).collect();
        let budget = cap.saturating_sub(out.iter().map(|s| s.len() + 1).sum::<usize>());
        let keep_each = (budget / 2).saturating_sub(40).max(200);

        let mut head = Vec::new();
        let mut used = 0;
        for f in &files {
            if used + f.len() + 1 > keep_each {
                break;
            }
            used += f.len() + 1;
            head.push(f.to_string());
        }
        let mut tail = Vec::new();
        used = 0;
        for f in files.iter().rev() {
            if used + f.len() + 1 > keep_each {
                break;
            }
            used += f.len() + 1;
            tail.push(f.to_string());
        }
        tail.reverse();

        let omitted = files.len().saturating_sub(head.len() + tail.len());
        out.extend(head);
        if omitted > 0 {
            out.push(format!("... ({} files omitted)", omitted));
        }
        out.extend(tail);
        out.join("\n")
    }
}

pub struct CurrentTimeTool {
    timezone: Tz,
}

impl CurrentTimeTool {
    pub fn new(timezone: Tz) -> Self {
        Self { timezone }
    }
}

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Current date and time in the configured timezone"
    }

    fn schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn call(&self, _input: Value) -> anyhow::Result<String> {
        let now = Utc::now().with_timezone(&self.timezone);
        Ok(format!(
            "{} ({})",
            now.format("%Y-%m-%d %H:%M:%S %A"),
            self.timezone.name()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_write_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let write = WriteFileTool::new(root.clone());
        let read = ReadFileTool::new(root);

        write
            .call(json!({"path": "notes/todo.md", "content": "- buy milk\n"}))
            .await
            .unwrap();
        let out = read.call(json!({"path": "notes/todo.md"})).await.unwrap();
        assert_eq!(out, "- buy milk\n");
    }

    #[tokio::test]
    async fn append_mode_extends_file() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let write = WriteFileTool::new(root.clone());
        write
            .call(json!({"path": "log.md", "content": "one\n"}))
            .await
            .unwrap();
        write
            .call(json!({"path": "log.md", "content": "two\n", "append": true}))
            .await
            .unwrap();
        let read = ReadFileTool::new(root);
        assert_eq!(read.call(json!({"path": "log.md"})).await.unwrap(), "one\ntwo\n");
    }

    #[tokio::test]
    async fn escapes_outside_workspace_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let read = ReadFileTool::new(dir.path().to_path_buf());
        assert!(read.call(json!({"path": "/etc/passwd"})).await.is_err());
        assert!(read.call(json!({"path": "../../etc/passwd"})).await.is_err());
    }

    #[tokio::test]
    async fn list_directory_marks_folders() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir(dir.path().join("memory")).await.unwrap();
        tokio::fs::write(dir.path().join("USER.md"), "x").await.unwrap();
        let tool = ListDirectoryTool::new(dir.path().to_path_buf());
        let out = tool.call(json!({})).await.unwrap();
        assert!(out.contains("memory/"));
        assert!(out.contains("USER.md"));
    }

    #[test]
    fn list_compression_keeps_folders_and_ends() {
        let tool = ListDirectoryTool::new(PathBuf::from("/tmp"));
        let mut lines = vec!["alpha/".to_string(), "beta/".to_string()];
        for i in 0..2000 {
            lines.push(format!("file-{:04}.txt", i));
        }
        let compressed = tool.compress(lines.join("\n"));
        assert!(compressed.contains("alpha/"));
        assert!(compressed.contains("beta/"));
        assert!(compressed.contains("files omitted"));
        assert!(compressed.contains("file-0000.txt"));
        assert!(compressed.contains("file-1999.txt"));
        assert!(compressed.chars().count() < lines.join("\n").chars().count());
    }

    #[test]
    fn read_compression_keeps_head() {
        let tool = ReadFileTool::new(PathBuf::from("/tmp"));
        let long = "line one is important\n".repeat(2000);
        let compressed = tool.compress(long.clone());
        assert!(compressed.starts_with("line one"));
        assert!(compressed.ends_with("(truncated, file continues)"));
        assert!(compressed.chars().count() <= tool.result_cap() + 64);
    }
}
