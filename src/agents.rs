//! Background agents: fire-and-forget LLM tasks that report back to the
//! conversation that spawned them. Cancellable, TTL-swept.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::traits::SendFn;

const SWEEP_INTERVAL: Duration = Duration::from_secs(600);
const MAX_AGENT_AGE: chrono::Duration = chrono::Duration::hours(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl AgentStatus {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentTask {
    pub id: String,
    pub task: String,
    pub chat_id: i64,
    pub status: AgentStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub error: Option<String>,
}

/// The isolated LLM call a background agent runs. Supplied by the core
/// so the manager never owns the orchestrator.
pub type AgentJobFn = Arc<
    dyn Fn(String) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send>> + Send + Sync,
>;

struct Inner {
    agents: Mutex<HashMap<String, AgentTask>>,
    cancel_tokens: Mutex<HashMap<String, CancellationToken>>,
    job: AgentJobFn,
    send: SendFn,
}

#[derive(Clone)]
pub struct AgentManager {
    inner: Arc<Inner>,
}

impl AgentManager {
    pub fn new(job: AgentJobFn, send: SendFn) -> Self {
        Self {
            inner: Arc::new(Inner {
                agents: Mutex::new(HashMap::new()),
                cancel_tokens: Mutex::new(HashMap::new()),
                job,
                send,
            }),
        }
    }

    /// Launch a background agent. Returns its id immediately.
    pub fn spawn(&self, task: &str, chat_id: i64) -> String {
        let id = format!("agent-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let token = CancellationToken::new();

        {
            let mut agents = self.inner.agents.lock().unwrap_or_else(|e| e.into_inner());
            agents.insert(
                id.clone(),
                AgentTask {
                    id: id.clone(),
                    task: task.to_string(),
                    chat_id,
                    status: AgentStatus::Running,
                    created_at: Utc::now(),
                    completed_at: None,
                    result: None,
                    error: None,
                },
            );
        }
        {
            let mut tokens = self
                .inner
                .cancel_tokens
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            tokens.insert(id.clone(), token.clone());
        }

        let manager = self.clone();
        let agent_id = id.clone();
        let task_text = task.to_string();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = token.cancelled() => None,
                result = (manager.inner.job)(task_text) => Some(result),
            };

            match outcome {
                None => {
                    // Cancelled: status was already flipped; late results
                    // are discarded by construction.
                    info!(agent = %agent_id, "agent cancelled mid-flight");
                }
                Some(Ok(result)) => {
                    manager.finish(&agent_id, AgentStatus::Completed, Some(result.clone()), None);
                    manager
                        .deliver(
                            &agent_id,
                            chat_id,
                            format!("Background task finished.\n\n{}", result),
                        )
                        .await;
                }
                Some(Err(e)) => {
                    let msg = e.to_string();
                    manager.finish(&agent_id, AgentStatus::Failed, None, Some(msg.clone()));
                    manager
                        .deliver(&agent_id, chat_id, format!("Background task failed: {}", msg))
                        .await;
                }
            }

            let mut tokens = manager
                .inner
                .cancel_tokens
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            tokens.remove(&agent_id);
        });

        info!(agent = %id, chat_id, "background agent spawned");
        id
    }

    /// Cancel a running agent; its eventual result is discarded.
    pub fn cancel(&self, id: &str) -> bool {
        let flipped = {
            let mut agents = self.inner.agents.lock().unwrap_or_else(|e| e.into_inner());
            match agents.get_mut(id) {
                Some(agent) if agent.status == AgentStatus::Running => {
                    agent.status = AgentStatus::Cancelled;
                    agent.completed_at = Some(Utc::now());
                    true
                }
                _ => false,
            }
        };
        if flipped {
            let tokens = self
                .inner
                .cancel_tokens
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(token) = tokens.get(id) {
                token.cancel();
            }
        }
        flipped
    }

    pub fn get(&self, id: &str) -> Option<AgentTask> {
        self.inner
            .agents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn list(&self) -> Vec<AgentTask> {
        let mut all: Vec<AgentTask> = self
            .inner
            .agents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        all.sort_by_key(|a| a.created_at);
        all
    }

    /// Periodic sweep: drop terminal agents an hour after completion and
    /// reap agents stuck in running for over an hour.
    pub fn spawn_sweep(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                manager.sweep(Utc::now());
            }
        });
    }

    fn sweep(&self, now: DateTime<Utc>) {
        let stuck: Vec<String> = {
            let agents = self.inner.agents.lock().unwrap_or_else(|e| e.into_inner());
            agents
                .values()
                .filter(|a| a.status == AgentStatus::Running && now - a.created_at > MAX_AGENT_AGE)
                .map(|a| a.id.clone())
                .collect()
        };
        for id in stuck {
            warn!(agent = %id, "reaping stuck agent");
            self.cancel(&id);
            let mut agents = self.inner.agents.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(agent) = agents.get_mut(&id) {
                agent.status = AgentStatus::Failed;
                agent.error = Some("reaped after exceeding max lifetime".into());
            }
        }

        let mut agents = self.inner.agents.lock().unwrap_or_else(|e| e.into_inner());
        agents.retain(|_, a| match a.completed_at {
            Some(done) => now - done <= MAX_AGENT_AGE,
            None => true,
        });
    }

    fn finish(&self, id: &str, status: AgentStatus, result: Option<String>, error: Option<String>) {
        let mut agents = self.inner.agents.lock().unwrap_or_else(|e| e.into_inner());
        let Some(agent) = agents.get_mut(id) else {
            return;
        };
        // A cancel that raced completion wins; the result is dropped.
        if agent.status != AgentStatus::Running {
            return;
        }
        agent.status = status;
        agent.completed_at = Some(Utc::now());
        agent.result = result;
        agent.error = error;
    }

    async fn deliver(&self, id: &str, chat_id: i64, text: String) {
        // Suppress delivery when the agent was cancelled between finish
        // and here.
        let cancelled = self
            .get(id)
            .map(|a| a.status == AgentStatus::Cancelled)
            .unwrap_or(true);
        if cancelled {
            return;
        }
        if let Err(e) = (self.inner.send)(chat_id, text).await {
            warn!(agent = %id, "agent result delivery failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collecting_send() -> (SendFn, Arc<Mutex<Vec<(i64, String)>>>) {
        let sent: Arc<Mutex<Vec<(i64, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let inner = sent.clone();
        let send: SendFn = Arc::new(move |chat_id, text| {
            let inner = inner.clone();
            Box::pin(async move {
                inner.lock().unwrap().push((chat_id, text));
                Ok(())
            })
        });
        (send, sent)
    }

    fn quick_job(reply: &'static str) -> AgentJobFn {
        Arc::new(move |_task| Box::pin(async move { Ok(reply.to_string()) }))
    }

    fn slow_job() -> AgentJobFn {
        Arc::new(|_task| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok("late".to_string())
            })
        })
    }

    #[tokio::test]
    async fn completed_agent_reports_back() {
        let (send, sent) = collecting_send();
        let manager = AgentManager::new(quick_job("researched the topic"), send);
        let id = manager.spawn("research something", 42);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let agent = manager.get(&id).unwrap();
        assert_eq!(agent.status, AgentStatus::Completed);
        assert_eq!(agent.result.as_deref(), Some("researched the topic"));
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 42);
        assert!(sent[0].1.contains("researched the topic"));
    }

    #[tokio::test]
    async fn failed_agent_reports_error() {
        let (send, sent) = collecting_send();
        let job: AgentJobFn =
            Arc::new(|_| Box::pin(async { anyhow::bail!("provider unavailable") }));
        let manager = AgentManager::new(job, send);
        let id = manager.spawn("doomed", 7);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.get(&id).unwrap().status, AgentStatus::Failed);
        assert!(sent.lock().unwrap()[0].1.contains("failed"));
    }

    #[tokio::test]
    async fn cancelled_agent_discards_result() {
        let (send, sent) = collecting_send();
        let manager = AgentManager::new(slow_job(), send);
        let id = manager.spawn("long haul", 1);

        assert!(manager.cancel(&id));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(manager.get(&id).unwrap().status, AgentStatus::Cancelled);
        assert!(sent.lock().unwrap().is_empty());
        // Second cancel is a no-op.
        assert!(!manager.cancel(&id));
    }

    #[tokio::test]
    async fn status_transitions_only_leave_running() {
        let (send, _) = collecting_send();
        let manager = AgentManager::new(quick_job("done"), send);
        let id = manager.spawn("t", 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Completed agents cannot be cancelled.
        assert!(!manager.cancel(&id));
        assert_eq!(manager.get(&id).unwrap().status, AgentStatus::Completed);
    }

    #[tokio::test]
    async fn sweep_reaps_stuck_and_old_agents() {
        let (send, _) = collecting_send();
        let manager = AgentManager::new(slow_job(), send);
        let stuck_id = manager.spawn("stuck", 1);

        // Backdate the running agent past the lifetime cap.
        {
            let mut agents = manager.inner.agents.lock().unwrap();
            agents.get_mut(&stuck_id).unwrap().created_at =
                Utc::now() - chrono::Duration::hours(2);
        }
        manager.sweep(Utc::now());
        assert_eq!(manager.get(&stuck_id).unwrap().status, AgentStatus::Failed);

        // Terminal agents age out of the map entirely.
        {
            let mut agents = manager.inner.agents.lock().unwrap();
            agents.get_mut(&stuck_id).unwrap().completed_at =
                Some(Utc::now() - chrono::Duration::hours(2));
        }
        manager.sweep(Utc::now());
        assert!(manager.get(&stuck_id).is_none());
    }
}
