//! Heartbeat and briefing loops: periodic synthesized turns through the
//! orchestrator. A heartbeat whose reply is the HEARTBEAT_OK sentinel is
//! suppressed; anything else reaches the user.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::traits::{SendFn, TurnRunner};
use crate::workspace::WorkspaceStore;

/// Sentinel the model emits when a heartbeat needs no user-visible output.
pub const HEARTBEAT_OK: &str = "HEARTBEAT_OK";

const HEARTBEAT_PROMPT: &str = "Heartbeat check: go through HEARTBEAT.md and your pending \
reminders and schedules. If something needs the user's attention, write them a short message \
about it. Otherwise reply with exactly HEARTBEAT_OK.";

/// Runtime snapshot of one periodic loop, for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct LoopSnapshot {
    pub name: String,
    pub last_run_at: Option<String>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

#[derive(Default)]
pub struct LoopTelemetry {
    loops: Mutex<HashMap<String, LoopSnapshot>>,
}

impl LoopTelemetry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn mark(&self, name: &str, error: Option<String>) {
        let mut loops = self.loops.lock().unwrap_or_else(|e| e.into_inner());
        let entry = loops.entry(name.to_string()).or_insert_with(|| LoopSnapshot {
            name: name.to_string(),
            last_run_at: None,
            last_error: None,
            consecutive_failures: 0,
        });
        entry.last_run_at = Some(Utc::now().to_rfc3339());
        match error {
            Some(e) => {
                entry.consecutive_failures += 1;
                entry.last_error = Some(e);
            }
            None => {
                entry.consecutive_failures = 0;
                entry.last_error = None;
            }
        }
    }

    pub fn snapshots(&self) -> Vec<LoopSnapshot> {
        let loops = self.loops.lock().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<LoopSnapshot> = loops.values().cloned().collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }
}

pub struct HeartbeatLoop {
    runner: Arc<dyn TurnRunner>,
    send: SendFn,
    workspace: Arc<WorkspaceStore>,
    telemetry: Arc<LoopTelemetry>,
    chat_id: i64,
    interval: Duration,
}

impl HeartbeatLoop {
    pub fn new(
        runner: Arc<dyn TurnRunner>,
        send: SendFn,
        workspace: Arc<WorkspaceStore>,
        telemetry: Arc<LoopTelemetry>,
        chat_id: i64,
        interval: Duration,
    ) -> Self {
        Self {
            runner,
            send,
            workspace,
            telemetry,
            chat_id,
            interval,
        }
    }

    pub fn spawn(self) {
        tokio::spawn(async move {
            info!(interval_secs = self.interval.as_secs(), "heartbeat loop started");
            loop {
                tokio::time::sleep(self.interval).await;
                let error = self.beat().await.err().map(|e| e.to_string());
                if let Some(e) = &error {
                    error!("heartbeat failed: {}", e);
                }
                self.telemetry.mark("heartbeat", error);
            }
        });
    }

    async fn beat(&self) -> anyhow::Result<()> {
        // No checklist file, nothing to check.
        if self.workspace.load_cached().await.heartbeat.is_none() {
            return Ok(());
        }

        let reply = self.runner.run_turn(self.chat_id, HEARTBEAT_PROMPT).await?;
        if should_suppress_heartbeat(&reply) {
            return Ok(());
        }
        (self.send)(self.chat_id, reply).await
    }
}

/// The sentinel (possibly wrapped in whitespace or quotes) means silence.
pub fn should_suppress_heartbeat(reply: &str) -> bool {
    let trimmed = reply.trim().trim_matches(['"', '\'', '`']);
    trimmed.is_empty() || trimmed == HEARTBEAT_OK
}

/// Per-chat morning briefing configuration (briefing.json).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BriefingConfig {
    pub chat_id: i64,
    pub enabled: bool,
    /// Local wall-clock fire time, "HH:MM".
    pub time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    pub timezone: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BriefingDocument {
    configs: Vec<BriefingConfig>,
}

pub struct BriefingLoop {
    runner: Arc<dyn TurnRunner>,
    send: SendFn,
    path: PathBuf,
    telemetry: Arc<LoopTelemetry>,
    fired: Mutex<HashMap<i64, NaiveDate>>,
}

impl BriefingLoop {
    pub fn new(
        runner: Arc<dyn TurnRunner>,
        send: SendFn,
        path: PathBuf,
        telemetry: Arc<LoopTelemetry>,
    ) -> Self {
        Self {
            runner,
            send,
            path,
            telemetry,
            fired: Mutex::new(HashMap::new()),
        }
    }

    pub fn spawn(self) {
        tokio::spawn(async move {
            info!("briefing loop started");
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                let error = self.tick().await.err().map(|e| e.to_string());
                if let Some(e) = &error {
                    warn!("briefing tick failed: {}", e);
                }
                self.telemetry.mark("briefing", error);
            }
        });
    }

    async fn tick(&self) -> anyhow::Result<()> {
        let configs = self.load_configs().await;
        for config in configs.iter().filter(|c| c.enabled) {
            let Ok(tz) = config.timezone.parse::<Tz>() else {
                warn!(chat_id = config.chat_id, tz = %config.timezone, "bad briefing timezone");
                continue;
            };
            let local = Utc::now().with_timezone(&tz);
            let now_hhmm = local.format("%H:%M").to_string();
            if now_hhmm != config.time {
                continue;
            }

            let today = local.date_naive();
            {
                let mut fired = self.fired.lock().unwrap_or_else(|e| e.into_inner());
                if fired.get(&config.chat_id) == Some(&today) {
                    continue;
                }
                fired.insert(config.chat_id, today);
            }

            let prompt = match &config.city {
                Some(city) => format!(
                    "Send the morning briefing: today's weather in {}, anything on the calendar, \
                     pending reminders, and one thing worth knowing today.",
                    city
                ),
                None => "Send the morning briefing: anything on the calendar, pending \
                         reminders, and one thing worth knowing today."
                    .to_string(),
            };
            info!(chat_id = config.chat_id, "sending briefing");
            let reply = self.runner.run_turn(config.chat_id, &prompt).await?;
            if !reply.trim().is_empty() {
                (self.send)(config.chat_id, reply).await?;
            }
        }
        Ok(())
    }

    async fn load_configs(&self) -> Vec<BriefingConfig> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => serde_json::from_str::<BriefingDocument>(&raw)
                .map(|d| d.configs)
                .unwrap_or_else(|e| {
                    warn!("briefing config unreadable: {}", e);
                    Vec::new()
                }),
            Err(_) => Vec::new(),
        }
    }
}
