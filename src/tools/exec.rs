//! Shell command tool: whitelist-gated foreground execution plus
//! detached background sessions with ring-buffered output.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use crate::traits::Tool;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_TIMEOUT_SECS: u64 = 60;
const RING_BUFFER_LINES: usize = 1000;
const SESSION_TTL: Duration = Duration::from_secs(3600);
const GC_INTERVAL: Duration = Duration::from_secs(600);

/// Binaries that never run, whatever the whitelist says.
const BLOCKED_BINARIES: &[&str] = &[
    "rm", "rmdir", "mkfs", "dd", "shutdown", "reboot", "halt", "poweroff", "init", "kill",
    "killall", "pkill", "sudo", "su", "doas", "chmod", "chown", "chgrp", "mv", "ln", "shred",
    "fdisk", "parted", "mount", "umount", "truncate", "useradd", "userdel", "passwd",
];

/// Environment the child is allowed to see.
const SAFE_ENV: &[&str] = &["PATH", "HOME", "USER", "LANG", "TERM"];

/// Signals the command tools can deliver to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
    Int,
    Hup,
}

impl Signal {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().trim_start_matches("SIG").trim_start_matches("sig") {
            "TERM" | "term" | "15" => Some(Self::Term),
            "KILL" | "kill" | "9" => Some(Self::Kill),
            "INT" | "int" | "2" => Some(Self::Int),
            "HUP" | "hup" | "1" => Some(Self::Hup),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Term => "SIGTERM",
            Self::Kill => "SIGKILL",
            Self::Int => "SIGINT",
            Self::Hup => "SIGHUP",
        }
    }

    #[cfg(unix)]
    fn raw(&self) -> i32 {
        match self {
            Self::Term => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
            Self::Int => libc::SIGINT,
            Self::Hup => libc::SIGHUP,
        }
    }

    /// Deliver to the session's process group, falling back to the lone
    /// pid when the group is already gone. False when nothing could be
    /// signalled (dead process, or a platform without kill(2)).
    #[cfg(unix)]
    fn deliver(&self, pid: u32) -> bool {
        if pid == 0 {
            return false;
        }
        let pid = pid as i32;
        [-pid, pid]
            .iter()
            .any(|target| unsafe { libc::kill(*target, self.raw()) } == 0)
    }

    #[cfg(not(unix))]
    fn deliver(&self, _pid: u32) -> bool {
        false
    }
}

/// Make the spawned child the leader of a fresh process group, so group
/// signals reach everything it forks.
#[cfg(unix)]
fn detach_into_own_group(cmd: &mut tokio::process::Command) {
    // setpgid runs in the child between fork and exec and is
    // async-signal-safe.
    unsafe {
        cmd.pre_exec(|| match libc::setpgid(0, 0) {
            0 => Ok(()),
            _ => Err(std::io::Error::last_os_error()),
        });
    }
}

#[cfg(not(unix))]
fn detach_into_own_group(_cmd: &mut tokio::process::Command) {}

/// Escalating shutdown for a timed-out foreground command: TERM with a
/// grace period, then KILL. The runtime's kill handle is the fallback
/// when signalling fails outright.
async fn shutdown_child(pid: u32, child: &mut tokio::process::Child, grace: Duration) {
    let steps = [(Signal::Term, grace), (Signal::Kill, Duration::from_secs(1))];
    for (signal, wait) in steps {
        if !signal.deliver(pid) {
            let _ = child.start_kill();
        }
        if tokio::time::timeout(wait, child.wait()).await.is_ok() {
            return;
        }
    }
}

/// A detached background command with captured output.
struct BgSession {
    command: String,
    pid: u32,
    started: Instant,
    finished: Arc<Mutex<Option<(Instant, i32)>>>,
    buffer: Arc<Mutex<VecDeque<String>>>,
}

/// In-process map of background command sessions, GC-swept hourly.
#[derive(Clone, Default)]
pub struct CommandSessions {
    inner: Arc<Mutex<HashMap<String, BgSession>>>,
}

impl CommandSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Periodic sweep removing finished sessions past the TTL.
    pub fn spawn_gc(&self) {
        let sessions = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(GC_INTERVAL).await;
                let mut map = sessions.inner.lock().unwrap_or_else(|e| e.into_inner());
                map.retain(|id, s| {
                    let done = s.finished.lock().unwrap_or_else(|e| e.into_inner());
                    let expired = done
                        .map(|(at, _)| at.elapsed() > SESSION_TTL)
                        .unwrap_or(false);
                    if expired {
                        info!(session = %id, "background command session reaped");
                    }
                    !expired
                });
            }
        });
    }

    fn insert(&self, id: String, session: BgSession) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, session);
    }

    fn snapshot(&self) -> Vec<(String, String, u32, bool, Duration)> {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.iter()
            .map(|(id, s)| {
                let done = s.finished.lock().unwrap_or_else(|e| e.into_inner()).is_some();
                (
                    id.clone(),
                    s.command.clone(),
                    s.pid,
                    done,
                    s.started.elapsed(),
                )
            })
            .collect()
    }

    fn tail(&self, id: &str, lines: usize) -> Option<String> {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let session = map.get(id)?;
        let buffer = session.buffer.lock().unwrap_or_else(|e| e.into_inner());
        let tail: Vec<String> = buffer
            .iter()
            .rev()
            .take(lines)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        Some(tail.join("\n"))
    }

    fn kill(&self, id: &str, signal: Signal) -> Option<bool> {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.get(id).map(|s| signal.deliver(s.pid))
    }
}

/// Policy check for one command line. `allowed` holds permitted binary
/// names; chains joined by `&&`, `||`, `;` are validated segment-wise.
pub fn validate_command(command: &str, allowed: &[String]) -> Result<(), String> {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return Err("empty command".into());
    }
    for forbidden in ['>', '<', '`', '(', ')', '\n'] {
        if trimmed.contains(forbidden) {
            return Err(format!("operator '{}' is not allowed", forbidden));
        }
    }
    for forbidden in ["$(", "${"] {
        if trimmed.contains(forbidden) {
            return Err(format!("substitution '{}' is not allowed", forbidden));
        }
    }

    // Chains are fine when every segment independently passes. After
    // consuming && / || / ; any leftover pipe or ampersand is a pipeline
    // or daemonization attempt.
    let segments = split_chain(trimmed);
    for segment in segments {
        let segment = segment.trim();
        if segment.is_empty() {
            return Err("empty command segment in chain".into());
        }
        if segment.contains('|') || segment.contains('&') {
            return Err("pipelines and background operators are not allowed".into());
        }
        let words = shell_words::split(segment).map_err(|e| format!("unparseable command: {}", e))?;
        let Some(binary) = words.first() else {
            return Err("empty command segment in chain".into());
        };
        let base = Path::new(binary)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(binary);
        if BLOCKED_BINARIES.contains(&base) {
            return Err(format!("'{}' is blocked as destructive", base));
        }
        if !allowed.iter().any(|a| a == base) {
            return Err(format!(
                "'{}' is not in the allowed binary list",
                base
            ));
        }
    }
    Ok(())
}

fn split_chain(command: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut rest = command;
    loop {
        let next = ["&&", "||", ";"]
            .iter()
            .filter_map(|sep| rest.find(sep).map(|i| (i, sep.len())))
            .min_by_key(|(i, _)| *i);
        match next {
            Some((idx, len)) => {
                segments.push(&rest[..idx]);
                rest = &rest[idx + len..];
            }
            None => {
                segments.push(rest);
                return segments;
            }
        }
    }
}

/// Working directory must stay inside the workspace or the temp dir.
fn validate_working_dir(dir: &str, workspace_root: &Path) -> Result<PathBuf, String> {
    let expanded = shellexpand::tilde(dir).into_owned();
    let path = PathBuf::from(&expanded);
    let canonical = path
        .canonicalize()
        .map_err(|e| format!("working_dir '{}': {}", dir, e))?;
    let tmp = std::env::temp_dir();
    let workspace_ok = workspace_root
        .canonicalize()
        .map(|ws| canonical.starts_with(&ws))
        .unwrap_or(false);
    if workspace_ok
        || canonical.starts_with(&tmp)
        || canonical.starts_with("/tmp")
        || canonical.starts_with("/private/tmp")
    {
        Ok(canonical)
    } else {
        Err(format!(
            "working_dir must be inside the workspace or /tmp, got '{}'",
            dir
        ))
    }
}

pub struct ExecTool {
    allowed: Vec<String>,
    workspace_root: PathBuf,
    sessions: CommandSessions,
}

impl ExecTool {
    pub fn new(allowed: Vec<String>, workspace_root: PathBuf, sessions: CommandSessions) -> Self {
        Self {
            allowed,
            workspace_root,
            sessions,
        }
    }

    async fn run_foreground(
        &self,
        command: &str,
        dir: Option<PathBuf>,
        timeout_secs: u64,
    ) -> anyhow::Result<String> {
        let mut cmd = base_command(command, dir.as_deref(), &self.workspace_root);
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);
        detach_into_own_group(&mut cmd);

        let start = Instant::now();
        let mut child = cmd.spawn()?;
        let pid = child.id().unwrap_or(0);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("failed to capture stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("failed to capture stderr"))?;
        let stdout_task = tokio::spawn(read_to_end(stdout));
        let stderr_task = tokio::spawn(read_to_end(stderr));

        let status = match tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait())
            .await
        {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => anyhow::bail!("command failed to execute: {}", e),
            Err(_) => {
                shutdown_child(pid, &mut child, Duration::from_secs(2)).await;
                stdout_task.abort();
                stderr_task.abort();
                anyhow::bail!("command timed out after {}s", timeout_secs);
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        let mut text = format!(
            "$ {} (exit: {}, {}ms)\n",
            command,
            status.code().unwrap_or(-1),
            start.elapsed().as_millis()
        );
        if !stdout.trim().is_empty() {
            text.push('\n');
            text.push_str(&stdout);
        }
        if !stderr.trim().is_empty() {
            text.push_str("\n--- stderr ---\n");
            text.push_str(&stderr);
        }
        Ok(text)
    }

    fn run_background(&self, command: &str, dir: Option<PathBuf>) -> anyhow::Result<String> {
        let mut cmd = base_command(command, dir.as_deref(), &self.workspace_root);
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        detach_into_own_group(&mut cmd);

        let mut child = cmd.spawn()?;
        let pid = child.id().unwrap_or(0);
        let session_id = format!("bg-{}", &uuid::Uuid::new_v4().simple().to_string()[..6]);

        let buffer: Arc<Mutex<VecDeque<String>>> = Arc::new(Mutex::new(VecDeque::new()));
        let finished: Arc<Mutex<Option<(Instant, i32)>>> = Arc::new(Mutex::new(None));

        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, buffer.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, buffer.clone());
        }

        {
            let finished = finished.clone();
            tokio::spawn(async move {
                let code = child
                    .wait()
                    .await
                    .ok()
                    .and_then(|s| s.code())
                    .unwrap_or(-1);
                *finished.lock().unwrap_or_else(|e| e.into_inner()) = Some((Instant::now(), code));
            });
        }

        self.sessions.insert(
            session_id.clone(),
            BgSession {
                command: command.to_string(),
                pid,
                started: Instant::now(),
                finished,
                buffer,
            },
        );

        info!(session = %session_id, pid, "background command started");
        Ok(format!(
            "Started background session '{}' (pid {}). Use list_command_sessions / kill_session to manage it.",
            session_id, pid
        ))
    }
}

fn base_command(
    command: &str,
    dir: Option<&Path>,
    workspace_root: &Path,
) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd.current_dir(dir.unwrap_or(workspace_root));
    cmd.env_clear();
    for key in SAFE_ENV {
        if let Ok(value) = std::env::var(key) {
            cmd.env(key, value);
        }
    }
    cmd
}

async fn read_to_end(stream: impl tokio::io::AsyncRead + Unpin) -> String {
    use tokio::io::AsyncReadExt;
    let mut reader = stream;
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

fn spawn_line_reader(
    stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    buffer: Arc<Mutex<VecDeque<String>>>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut buf = buffer.lock().unwrap_or_else(|e| e.into_inner());
            if buf.len() >= RING_BUFFER_LINES {
                buf.pop_front();
            }
            buf.push_back(line);
        }
    });
}

#[async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str {
        "exec_command"
    }

    fn description(&self) -> &str {
        "Run a whitelisted shell command in the workspace, optionally in the background"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Command to run. Only whitelisted binaries; no redirection or substitution. Chains with && / || / ; are allowed."
                },
                "working_dir": {
                    "type": "string",
                    "description": "Working directory (workspace subtree or /tmp). Defaults to the workspace root."
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Foreground timeout in seconds (default 30, max 60)"
                },
                "background": {
                    "type": "boolean",
                    "description": "Detach and capture output in a session buffer",
                    "default": false
                }
            },
            "required": ["command"]
        })
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(MAX_TIMEOUT_SECS)
    }

    async fn call(&self, input: Value) -> anyhow::Result<String> {
        let command = input["command"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: command"))?;

        if let Err(reason) = validate_command(command, &self.allowed) {
            anyhow::bail!("command rejected: {}", reason);
        }

        let dir = match input["working_dir"].as_str() {
            Some(d) => Some(
                validate_working_dir(d, &self.workspace_root)
                    .map_err(|e| anyhow::anyhow!("{}", e))?,
            ),
            None => None,
        };

        if input["background"].as_bool().unwrap_or(false) {
            return self.run_background(command, dir);
        }

        let timeout_secs = input["timeout_secs"]
            .as_u64()
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
            .min(MAX_TIMEOUT_SECS);
        self.run_foreground(command, dir, timeout_secs).await
    }
}

pub struct ListCommandSessionsTool {
    sessions: CommandSessions,
}

impl ListCommandSessionsTool {
    pub fn new(sessions: CommandSessions) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Tool for ListCommandSessionsTool {
    fn name(&self) -> &str {
        "list_command_sessions"
    }

    fn description(&self) -> &str {
        "List background command sessions and their recent output"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": {
                    "type": "string",
                    "description": "Show the output tail of one session instead of the overview"
                },
                "lines": {
                    "type": "integer",
                    "description": "How many tail lines to include (default 50)"
                }
            }
        })
    }

    async fn call(&self, input: Value) -> anyhow::Result<String> {
        if let Some(id) = input["session_id"].as_str() {
            let lines = input["lines"].as_u64().unwrap_or(50) as usize;
            return match self.sessions.tail(id, lines) {
                Some(tail) if tail.is_empty() => Ok(format!("Session '{}': no output yet", id)),
                Some(tail) => Ok(tail),
                None => anyhow::bail!("no such session '{}'", id),
            };
        }

        let sessions = self.sessions.snapshot();
        if sessions.is_empty() {
            return Ok("No background command sessions.".into());
        }
        Ok(sessions
            .into_iter()
            .map(|(id, command, pid, done, age)| {
                format!(
                    "{} [{}] pid={} age={}s cmd: {}",
                    id,
                    if done { "finished" } else { "running" },
                    pid,
                    age.as_secs(),
                    command
                )
            })
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

pub struct KillSessionTool {
    sessions: CommandSessions,
}

impl KillSessionTool {
    pub fn new(sessions: CommandSessions) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Tool for KillSessionTool {
    fn name(&self) -> &str {
        "kill_session"
    }

    fn description(&self) -> &str {
        "Send a signal to a background command session (group first, then pid)"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": {"type": "string"},
                "signal": {
                    "type": "string",
                    "description": "SIGTERM (default), SIGKILL, SIGINT, or SIGHUP"
                }
            },
            "required": ["session_id"]
        })
    }

    async fn call(&self, input: Value) -> anyhow::Result<String> {
        let id = input["session_id"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: session_id"))?;
        let requested = input["signal"].as_str().unwrap_or("SIGTERM");
        let signal = Signal::parse(requested).ok_or_else(|| {
            anyhow::anyhow!(
                "unknown signal '{}'; use SIGTERM, SIGKILL, SIGINT, or SIGHUP",
                requested
            )
        })?;
        match self.sessions.kill(id, signal) {
            Some(true) => Ok(format!("Sent {} to session '{}'", signal.name(), id)),
            Some(false) => Ok(format!(
                "Session '{}' found but signalling failed (already exited?)",
                id
            )),
            None => anyhow::bail!("no such session '{}'", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed() -> Vec<String> {
        ["ls", "echo", "cat", "sleep", "pwd"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn signal_parsing_accepts_common_forms() {
        assert_eq!(Signal::parse("SIGTERM"), Some(Signal::Term));
        assert_eq!(Signal::parse("sigkill"), Some(Signal::Kill));
        assert_eq!(Signal::parse("INT"), Some(Signal::Int));
        assert_eq!(Signal::parse("9"), Some(Signal::Kill));
        assert_eq!(Signal::parse("hup"), Some(Signal::Hup));
        assert_eq!(Signal::parse("SIGSTOP"), None);
        assert_eq!(Signal::parse(""), None);
    }

    #[test]
    fn accepts_whitelisted_commands() {
        assert!(validate_command("ls -la", &allowed()).is_ok());
        assert!(validate_command("echo hello world", &allowed()).is_ok());
    }

    #[test]
    fn rejects_rm_rf_root() {
        let err = validate_command("rm -rf /", &allowed()).unwrap_err();
        assert!(err.contains("destructive") || err.contains("not in the allowed"));
    }

    #[test]
    fn rejects_destructive_even_if_whitelisted() {
        let mut list = allowed();
        list.push("rm".to_string());
        assert!(validate_command("rm -rf /tmp/x", &list).is_err());
    }

    #[test]
    fn rejects_redirection_and_substitution() {
        assert!(validate_command("echo hi > /etc/passwd", &allowed()).is_err());
        assert!(validate_command("cat < secret", &allowed()).is_err());
        assert!(validate_command("echo `whoami`", &allowed()).is_err());
        assert!(validate_command("echo $(whoami)", &allowed()).is_err());
        assert!(validate_command("echo ${HOME}", &allowed()).is_err());
        assert!(validate_command("echo (subshell)", &allowed()).is_err());
        assert!(validate_command("echo a\nls", &allowed()).is_err());
    }

    #[test]
    fn chains_validate_each_segment() {
        assert!(validate_command("ls && echo ok", &allowed()).is_ok());
        assert!(validate_command("ls ; pwd ; echo done", &allowed()).is_ok());
        assert!(validate_command("ls && curl http://x", &allowed()).is_err());
        assert!(validate_command("ls && ", &allowed()).is_err());
    }

    #[test]
    fn rejects_unlisted_binaries() {
        assert!(validate_command("python3 -c 'x'", &allowed()).is_err());
    }

    #[test]
    fn working_dir_confinement() {
        let dir = tempfile::tempdir().unwrap();
        let ws = dir.path();
        // Temp dirs live under the system temp root, so they pass.
        assert!(validate_working_dir(ws.to_str().unwrap(), ws).is_ok());
        assert!(validate_working_dir("/etc", ws).is_err());
        assert!(validate_working_dir("/does/not/exist", ws).is_err());
    }

    #[tokio::test]
    async fn foreground_runs_and_reports_exit() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ExecTool::new(allowed(), dir.path().to_path_buf(), CommandSessions::new());
        let out = tool
            .call(json!({"command": "echo adjutant"}))
            .await
            .unwrap();
        assert!(out.contains("exit: 0"));
        assert!(out.contains("adjutant"));
    }

    #[tokio::test]
    async fn foreground_timeout_kills_child() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ExecTool::new(allowed(), dir.path().to_path_buf(), CommandSessions::new());
        let result = tool
            .call(json!({"command": "sleep 30", "timeout_secs": 1}))
            .await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn background_session_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = CommandSessions::new();
        let tool = ExecTool::new(allowed(), dir.path().to_path_buf(), sessions.clone());
        let out = tool
            .call(json!({"command": "echo background-line", "background": true}))
            .await
            .unwrap();
        assert!(out.contains("bg-"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let snapshot = sessions.snapshot();
        assert_eq!(snapshot.len(), 1);
        let id = snapshot[0].0.clone();
        let tail = sessions.tail(&id, 10).unwrap();
        assert!(tail.contains("background-line"));
    }

    #[tokio::test]
    async fn kill_session_unknown_id_errors() {
        let sessions = CommandSessions::new();
        let tool = KillSessionTool::new(sessions);
        assert!(tool.call(json!({"session_id": "bg-zzz"})).await.is_err());
    }
}
