//! Per-conversation state: message history, active model, pinned context.
//! Sessions are process-owned and evicted by TTL or LRU cap. The ambient
//! current-conversation binding lets tools discover their chat without
//! threading an id through every call.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::debug;

use crate::traits::Message;

/// Abstract model tiers; concrete model ids live in config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelChoice {
    Small,
    #[default]
    Medium,
    Large,
}

impl ModelChoice {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "small" => Some(Self::Small),
            "medium" => Some(Self::Medium),
            "large" => Some(Self::Large),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }
}

/// Number of trailing messages kept verbatim through compaction.
pub const KEEP_ON_COMPACT: usize = 4;
/// Upper bound on summary messages produced by compaction.
pub const MAX_SUMMARY_CHUNKS: usize = 3;

#[derive(Debug, Default)]
struct Session {
    history: Vec<Message>,
    model: ModelChoice,
    pinned: String,
    last_accessed: Option<Instant>,
}

pub struct SessionStore {
    sessions: RwLock<HashMap<i64, Session>>,
    max_sessions: usize,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(max_sessions: usize, ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
            ttl,
        }
    }

    pub async fn history(&self, chat_id: i64) -> Vec<Message> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.entry(chat_id).or_default();
        session.last_accessed = Some(Instant::now());
        session.history.clone()
    }

    pub async fn append(&self, chat_id: i64, message: Message) {
        let mut sessions = self.sessions.write().await;
        let session = sessions.entry(chat_id).or_default();
        session.history.push(message);
        session.last_accessed = Some(Instant::now());
        drop(sessions);
        self.evict().await;
    }

    pub async fn model(&self, chat_id: i64) -> ModelChoice {
        self.sessions
            .read()
            .await
            .get(&chat_id)
            .map(|s| s.model)
            .unwrap_or_default()
    }

    pub async fn set_model(&self, chat_id: i64, model: ModelChoice) {
        let mut sessions = self.sessions.write().await;
        let session = sessions.entry(chat_id).or_default();
        session.model = model;
        session.last_accessed = Some(Instant::now());
    }

    /// Add a note to the pinned context. Pinned context survives history
    /// compaction and always reaches the system prompt.
    pub async fn append_pinned(&self, chat_id: i64, note: &str) {
        let mut sessions = self.sessions.write().await;
        let session = sessions.entry(chat_id).or_default();
        if !session.pinned.is_empty() {
            session.pinned.push('\n');
        }
        session.pinned.push_str(note.trim());
        session.last_accessed = Some(Instant::now());
    }

    pub async fn pinned(&self, chat_id: i64) -> Option<String> {
        self.sessions
            .read()
            .await
            .get(&chat_id)
            .filter(|s| !s.pinned.is_empty())
            .map(|s| s.pinned.clone())
    }

    /// Replace all but the last [`KEEP_ON_COMPACT`] messages with
    /// assistant-authored summaries. Pinned context is untouched.
    pub async fn compact(&self, chat_id: i64, summaries: Vec<String>) {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(&chat_id) else {
            return;
        };
        if session.history.len() <= KEEP_ON_COMPACT {
            return;
        }
        let dropped = session.history.len() - KEEP_ON_COMPACT;
        let tail = session
            .history
            .split_off(session.history.len() - KEEP_ON_COMPACT);
        let mut new_history: Vec<Message> = summaries
            .into_iter()
            .take(MAX_SUMMARY_CHUNKS)
            .map(|s| Message::assistant(format!("[Summary of earlier conversation]\n{}", s)))
            .collect();
        new_history.extend(tail);
        session.history = new_history;
        debug!(chat_id, dropped, "history compacted");
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Remove sessions past TTL, then trim LRU down to the cap.
    async fn evict(&self) {
        let mut sessions = self.sessions.write().await;
        let ttl = self.ttl;
        sessions.retain(|_, s| {
            s.last_accessed
                .map(|at| at.elapsed() < ttl)
                .unwrap_or(false)
        });

        while sessions.len() > self.max_sessions {
            let oldest = sessions
                .iter()
                .min_by_key(|(_, s)| s.last_accessed.unwrap_or_else(Instant::now))
                .map(|(id, _)| *id);
            match oldest {
                Some(id) => {
                    sessions.remove(&id);
                    debug!(chat_id = id, "session evicted (LRU)");
                }
                None => break,
            }
        }
    }
}

tokio::task_local! {
    static CURRENT_CHAT: i64;
}

/// Run `fut` with `chat_id` bound as the ambient current conversation.
/// The binding is task-local, so concurrent turns in different
/// conversations never observe each other.
pub async fn with_current_chat<F: Future>(chat_id: i64, fut: F) -> F::Output {
    CURRENT_CHAT.scope(chat_id, fut).await
}

/// The ambient conversation id, if any. Tools call this instead of
/// receiving a chat id argument.
pub fn current_chat_id() -> Option<i64> {
    CURRENT_CHAT.try_with(|id| *id).ok()
}
