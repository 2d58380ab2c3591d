//! Daemon assembly: builds every subsystem, wires the circular
//! references through a deferred runner handle, and drives turns.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono_tz::Tz;
use tracing::{info, warn};

use crate::agents::{AgentJobFn, AgentManager};
use crate::config::{resolve_secret, AppConfig};
use crate::heartbeat::{BriefingLoop, HeartbeatLoop, LoopTelemetry};
use crate::memory::{EmbeddingEngine, FusionMode, MemoryStore};
use crate::orchestrator::{Orchestrator, ThinkingLevel};
use crate::prompt::PromptBuilder;
use crate::providers::AnthropicProvider;
use crate::reminders::ReminderStore;
use crate::scheduler::{CronJobStore, SchedulerEngine};
use crate::session::{with_current_chat, ModelChoice, SessionStore, KEEP_ON_COMPACT};
use crate::tokens;
use crate::tools::{self, CommandSessions, ToolRegistry};
use crate::traits::{send_fn_for, ChatTransport, Message, ModelProvider, TurnRunner};
use crate::warmup::Warmup;
use crate::workspace::WorkspaceStore;

/// Breaks the cycle Daemon → tools/scheduler → TurnRunner → Daemon.
/// The weak reference is set once the daemon Arc exists.
pub struct DeferredRunner {
    daemon: OnceLock<Weak<Daemon>>,
}

impl DeferredRunner {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            daemon: OnceLock::new(),
        })
    }

    fn bind(&self, daemon: &Arc<Daemon>) {
        self.daemon
            .set(Arc::downgrade(daemon))
            .unwrap_or_else(|_| panic!("DeferredRunner bound twice"));
    }

    fn get(&self) -> anyhow::Result<Arc<Daemon>> {
        self.daemon
            .get()
            .and_then(|w| w.upgrade())
            .ok_or_else(|| anyhow::anyhow!("daemon is shutting down"))
    }
}

#[async_trait]
impl TurnRunner for DeferredRunner {
    async fn run_turn(&self, chat_id: i64, message: &str) -> anyhow::Result<String> {
        self.get()?.run_turn(chat_id, message).await
    }
}

pub struct Daemon {
    sessions: Arc<SessionStore>,
    orchestrator: Arc<Orchestrator>,
    /// Orchestrator with the agent tools removed, for background agents.
    agent_orchestrator: Arc<Orchestrator>,
    prompt: Arc<PromptBuilder>,
    transport: Arc<dyn ChatTransport>,
    telemetry: Arc<LoopTelemetry>,
    warmup: Arc<Warmup>,
    models: crate::config::ModelsConfig,
    compact_threshold: usize,
    turn_locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl Daemon {
    /// Build and start every subsystem. Fatal only on missing secrets or
    /// an unusable workspace root.
    pub async fn start(
        config: AppConfig,
        transport: Arc<dyn ChatTransport>,
    ) -> anyhow::Result<Arc<Self>> {
        let root = config.workspace.resolved_dir();
        std::fs::create_dir_all(&root)
            .map_err(|e| anyhow::anyhow!("workspace root {} unusable: {}", root.display(), e))?;
        let timezone: Tz = config
            .workspace
            .timezone
            .parse()
            .map_err(|_| anyhow::anyhow!("unknown timezone '{}'", config.workspace.timezone))?;

        let api_key = resolve_secret(&config.provider.api_key_slot)?;
        let provider: Arc<dyn ModelProvider> =
            Arc::new(AnthropicProvider::new(&config.provider.base_url, &api_key));

        let workspace = Arc::new(WorkspaceStore::new(root.clone()));
        let engine = Arc::new(EmbeddingEngine::new(
            workspace.memory_dir().join(".embedding-cache.json"),
        ));
        let memory = Arc::new(
            MemoryStore::open(
                &workspace.memory_dir().join(".vector-store.db"),
                engine.clone(),
                config.memory.min_chunk_chars,
                config.memory.max_chunk_chars,
            )
            .await?,
        );
        let sessions = Arc::new(SessionStore::new(
            config.sessions.max_sessions,
            Duration::from_secs(config.sessions.ttl_hours * 3600),
        ));

        let send = send_fn_for(transport.clone());
        let runner = DeferredRunner::new();

        let scheduler = Arc::new(SchedulerEngine::new(
            Arc::new(CronJobStore::new(root.join("cron-jobs.json"))),
            runner.clone(),
            send.clone(),
            Duration::from_secs(config.scheduler.tick_secs),
            Duration::from_secs(config.scheduler.startup_grace_secs),
            timezone,
        ));
        let reminders = ReminderStore::new(root.join("reminders.json"), send.clone(), timezone);

        let agent_job: AgentJobFn = {
            let runner = runner.clone();
            Arc::new(move |task| {
                let runner = runner.clone();
                Box::pin(async move { runner.get()?.run_isolated(&task).await })
            })
        };
        let agents = AgentManager::new(agent_job, send.clone());

        let compact: tools::CompactFn = {
            let runner = runner.clone();
            Arc::new(move |chat_id| {
                let runner = runner.clone();
                Box::pin(async move { runner.get()?.compact_chat(chat_id).await })
            })
        };

        let fusion = fusion_mode(&config);
        let command_sessions = CommandSessions::new();
        let search_backend: Arc<dyn tools::SearchBackend> = match resolve_secret("search-api-key")
        {
            Ok(key) => Arc::new(tools::BraveSearchBackend::new(&key)),
            Err(_) => {
                info!("search-api-key not set; web_search will report itself unconfigured");
                Arc::new(tools::UnconfiguredSearchBackend)
            }
        };

        let registry = Arc::new(ToolRegistry::new(vec![
            Arc::new(tools::ReadFileTool::new(root.clone())),
            Arc::new(tools::WriteFileTool::new(root.clone())),
            Arc::new(tools::ListDirectoryTool::new(root.clone())),
            Arc::new(tools::CurrentTimeTool::new(timezone)),
            Arc::new(tools::ExecTool::new(
                config.exec.allowed_binaries.clone(),
                root.clone(),
                command_sessions.clone(),
            )),
            Arc::new(tools::ListCommandSessionsTool::new(command_sessions.clone())),
            Arc::new(tools::KillSessionTool::new(command_sessions.clone())),
            Arc::new(tools::WebFetchTool::new()),
            Arc::new(tools::WebSearchTool::new(search_backend)),
            Arc::new(tools::SearchMemoryTool::new(memory.clone(), fusion)),
            Arc::new(tools::SaveMemoryTool::new(workspace.clone(), memory.clone())),
            Arc::new(tools::CompleteOnboardingTool::new(workspace.clone())),
            Arc::new(tools::CreateScheduleTool::new(scheduler.clone())),
            Arc::new(tools::ListSchedulesTool::new(scheduler.clone())),
            Arc::new(tools::CancelScheduleTool::new(scheduler.clone())),
            Arc::new(tools::SetReminderTool::new(reminders.clone(), timezone)),
            Arc::new(tools::ListRemindersTool::new(reminders.clone())),
            Arc::new(tools::CancelReminderTool::new(reminders.clone())),
            Arc::new(tools::SpawnAgentTool::new(agents.clone())),
            Arc::new(tools::AgentStatusTool::new(agents.clone())),
            Arc::new(tools::CancelAgentTool::new(agents.clone())),
            Arc::new(tools::GetSessionLogTool::new(sessions.clone())),
            Arc::new(tools::SetModelTool::new(sessions.clone())),
            Arc::new(tools::CompactHistoryTool::new(compact)),
            Arc::new(tools::PinContextTool::new(sessions.clone())),
        ]));

        let orchestrator = Arc::new(Orchestrator::new(
            provider.clone(),
            registry.clone(),
            config.provider.context_windows.clone(),
            config.provider.default_context_window,
        ));
        let agent_orchestrator = Arc::new(Orchestrator::new(
            provider,
            Arc::new(registry.without(&["spawn_agent", "cancel_agent", "agent_status"])),
            config.provider.context_windows.clone(),
            config.provider.default_context_window,
        ));

        let prompt = Arc::new(PromptBuilder::new(
            workspace.clone(),
            sessions.clone(),
            memory.clone(),
            timezone,
            registry.summary_table(),
        ));

        let telemetry = LoopTelemetry::new();
        let warmup = Arc::new(Warmup::new(engine, workspace.clone(), memory.clone()));

        let daemon = Arc::new(Daemon {
            sessions,
            orchestrator,
            agent_orchestrator,
            prompt,
            transport: transport.clone(),
            telemetry: telemetry.clone(),
            warmup: warmup.clone(),
            models: config.provider.models.clone(),
            compact_threshold: config.sessions.compact_token_threshold,
            turn_locks: Mutex::new(HashMap::new()),
        });
        runner.bind(&daemon);

        // Background machinery.
        scheduler.spawn();
        reminders.restore().await;
        agents.spawn_sweep();
        command_sessions.spawn_gc();
        if config.heartbeat.enabled {
            if let Some(chat_id) = config.heartbeat.chat_id {
                HeartbeatLoop::new(
                    runner.clone(),
                    send.clone(),
                    workspace.clone(),
                    telemetry.clone(),
                    chat_id,
                    Duration::from_secs(config.heartbeat.interval_minutes * 60),
                )
                .spawn();
            } else {
                warn!("heartbeat enabled but no chat_id configured; skipping");
            }
        }
        BriefingLoop::new(runner, send, root.join("briefing.json"), telemetry).spawn();

        // Warmup runs in the background; first turns just see it cold.
        {
            let warmup = warmup.clone();
            tokio::spawn(async move {
                warmup.warmup().await;
            });
        }

        info!(workspace = %root.display(), "daemon started");
        Ok(daemon)
    }

    fn model_id(&self, choice: ModelChoice) -> &str {
        match choice {
            ModelChoice::Small => &self.models.small,
            ModelChoice::Medium => &self.models.medium,
            ModelChoice::Large => &self.models.large,
        }
    }

    fn turn_lock(&self, chat_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.turn_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(chat_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Handle a user message from the transport: one serialized turn,
    /// streaming the reply out as it forms.
    pub async fn handle_incoming(&self, chat_id: i64, text: &str) -> anyhow::Result<()> {
        let lock = self.turn_lock(chat_id);
        let _turn = lock.lock().await;

        with_current_chat(chat_id, async move {
            let daemon = self;
            let _ = daemon.transport.send_typing(chat_id).await;
            daemon.maybe_autocompact(chat_id).await;

            daemon.sessions.append(chat_id, Message::user(text)).await;
            let history = daemon.sessions.history(chat_id).await;
            let system = daemon.prompt.build(chat_id).await;
            let model = daemon.model_id(daemon.sessions.model(chat_id).await).to_string();

            let outcome = daemon
                .orchestrator
                .chat_stream(
                    &history,
                    &system,
                    &model,
                    ThinkingLevel::Medium,
                    Box::new(|_chunk| {}),
                )
                .await;

            match outcome {
                Ok(outcome) => {
                    for msg in &outcome.loop_messages {
                        daemon.sessions.append(chat_id, msg.clone()).await;
                    }
                    daemon
                        .sessions
                        .append(chat_id, Message::assistant(outcome.text.clone()))
                        .await;
                    if !outcome.tools_used.is_empty() {
                        info!(
                            chat_id,
                            tools = ?outcome.tools_used.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
                            "turn used tools"
                        );
                    }
                    daemon.transport.send_message(chat_id, &outcome.text).await
                }
                Err(e) => {
                    let friendly = e
                        .downcast_ref::<crate::providers::ProviderError>()
                        .map(|pe| pe.user_message())
                        .unwrap_or_else(|| format!("Something went wrong: {}", e));
                    daemon.transport.send_message(chat_id, &friendly).await
                }
            }
        })
        .await
    }

    /// Synthesized turn for schedules, heartbeats, and briefings.
    async fn run_turn(&self, chat_id: i64, message: &str) -> anyhow::Result<String> {
        let lock = self.turn_lock(chat_id);
        let _turn = lock.lock().await;

        let message = message.to_string();
        with_current_chat(chat_id, async move {
            let daemon = self;
            daemon
                .sessions
                .append(chat_id, Message::user(message.clone()))
                .await;
            let history = daemon.sessions.history(chat_id).await;
            let system = daemon.prompt.build(chat_id).await;
            let model = daemon.model_id(daemon.sessions.model(chat_id).await).to_string();

            let outcome = daemon
                .orchestrator
                .chat(&history, &system, &model, ThinkingLevel::Off)
                .await?;
            for msg in &outcome.loop_messages {
                daemon.sessions.append(chat_id, msg.clone()).await;
            }
            daemon
                .sessions
                .append(chat_id, Message::assistant(outcome.text.clone()))
                .await;
            Ok(outcome.text)
        })
        .await
    }

    /// Isolated call for background agents: fresh history, no session,
    /// reduced tool surface.
    async fn run_isolated(&self, task: &str) -> anyhow::Result<String> {
        let system = "You are a background task agent. Complete the task below using tools as \
                      needed, then reply with a concise result the assistant can forward.";
        let history = vec![Message::user(task)];
        let outcome = self
            .agent_orchestrator
            .chat(&history, system, &self.models.medium, ThinkingLevel::Off)
            .await?;
        Ok(outcome.text)
    }

    /// Summarize-and-trim history for one chat.
    pub async fn compact_chat(&self, chat_id: i64) -> anyhow::Result<String> {
        let history = self.sessions.history(chat_id).await;
        if history.len() <= KEEP_ON_COMPACT {
            return Ok("History is already compact.".into());
        }
        let older = &history[..history.len() - KEEP_ON_COMPACT];
        let summary = self
            .orchestrator
            .summarize_history(older, &self.models.small)
            .await?;
        self.sessions.compact(chat_id, vec![summary]).await;
        Ok(format!(
            "Compacted {} older messages into a summary.",
            older.len()
        ))
    }

    async fn maybe_autocompact(&self, chat_id: i64) {
        let history = self.sessions.history(chat_id).await;
        if tokens::estimate_messages(&history) > self.compact_threshold {
            info!(chat_id, "history over token threshold, compacting");
            if let Err(e) = self.compact_chat(chat_id).await {
                warn!(chat_id, "auto-compaction failed: {}", e);
            }
        }
    }

    /// Health line for status surfaces.
    pub fn health(&self) -> String {
        let loops = self
            .telemetry
            .snapshots()
            .into_iter()
            .map(|s| {
                format!(
                    "{}: {}",
                    s.name,
                    if s.consecutive_failures > 0 {
                        format!("{} consecutive failures", s.consecutive_failures)
                    } else {
                        "ok".to_string()
                    }
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "warmup: {}; loops: {}",
            self.warmup.status(),
            if loops.is_empty() {
                "none yet"
            } else {
                loops.as_str()
            }
        )
    }
}

fn fusion_mode(config: &AppConfig) -> FusionMode {
    match config.memory.fusion.as_str() {
        "weighted" => FusionMode::Weighted {
            vector: config.memory.vector_weight,
            keyword: config.memory.keyword_weight,
        },
        _ => FusionMode::Rrf,
    }
}
