//! Timed notifications that survive restart. One-shots use a single
//! timer; delays beyond the representable horizon fall back to a daily
//! recheck that re-arms once the remainder fits. Recurring reminders
//! ride a cron expression.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::scheduler::CronExpr;
use crate::traits::SendFn;

/// Single-fire timers cap out around 2^31 ms (~24.8 days) on the usual
/// platforms; anything longer takes the daily-recheck path.
const MAX_TIMER: Duration = Duration::from_secs(24 * 24 * 3600);
const RECHECK_INTERVAL: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reminder {
    pub id: String,
    pub chat_id: i64,
    pub message: String,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub recurring: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron_expr: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ReminderDocument {
    reminders: Vec<Reminder>,
}

struct Inner {
    path: PathBuf,
    send: SendFn,
    timezone: Tz,
    entries: Mutex<Vec<Reminder>>,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct ReminderStore {
    inner: Arc<Inner>,
}

impl ReminderStore {
    pub fn new(path: PathBuf, send: SendFn, timezone: Tz) -> Self {
        Self {
            inner: Arc::new(Inner {
                path,
                send,
                timezone,
                entries: Mutex::new(Vec::new()),
                timers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Load persisted reminders, drop expired one-shots, arm the rest.
    pub async fn restore(&self) {
        let loaded: Vec<Reminder> = match tokio::fs::read_to_string(&self.inner.path).await {
            Ok(raw) => match serde_json::from_str::<ReminderDocument>(&raw) {
                Ok(doc) => doc.reminders,
                Err(e) => {
                    warn!("reminders file unreadable, starting empty: {}", e);
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!("reminders read failed: {}", e);
                Vec::new()
            }
        };

        let now = Utc::now();
        let mut kept = Vec::new();
        for mut reminder in loaded {
            if reminder.recurring {
                // Recompute the next occurrence from the cron schedule.
                if let Some(next) = self.next_recurrence(&reminder, now) {
                    reminder.scheduled_at = next;
                    kept.push(reminder);
                } else {
                    warn!(id = %reminder.id, "recurring reminder has no next occurrence, dropping");
                }
            } else if reminder.scheduled_at > now {
                kept.push(reminder);
            } else {
                info!(id = %reminder.id, "dropping one-shot reminder missed while offline");
            }
        }

        {
            let mut entries = self.inner.entries.lock().unwrap_or_else(|e| e.into_inner());
            *entries = kept.clone();
        }
        let _ = self.persist().await;
        for reminder in kept {
            self.arm(reminder);
        }
    }

    /// Create and arm a one-shot reminder.
    pub async fn create_one_shot(
        &self,
        chat_id: i64,
        message: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<Reminder> {
        if at <= Utc::now() {
            anyhow::bail!("reminder time is in the past");
        }
        let reminder = Reminder {
            id: short_id(),
            chat_id,
            message: message.to_string(),
            scheduled_at: at,
            created_at: Utc::now(),
            recurring: false,
            cron_expr: None,
        };
        self.insert(reminder.clone()).await?;
        self.arm(reminder.clone());
        Ok(reminder)
    }

    /// Create and arm a recurring reminder on a cron expression.
    pub async fn create_recurring(
        &self,
        chat_id: i64,
        message: &str,
        cron_expr: &str,
    ) -> anyhow::Result<Reminder> {
        let expr = CronExpr::parse(cron_expr)?;
        let next = expr
            .next_after(Utc::now(), self.inner.timezone)
            .ok_or_else(|| anyhow::anyhow!("cron '{}' never fires", cron_expr))?;
        let reminder = Reminder {
            id: short_id(),
            chat_id,
            message: message.to_string(),
            scheduled_at: next,
            created_at: Utc::now(),
            recurring: true,
            cron_expr: Some(cron_expr.to_string()),
        };
        self.insert(reminder.clone()).await?;
        self.arm(reminder.clone());
        Ok(reminder)
    }

    pub fn list(&self, chat_id: Option<i64>) -> Vec<Reminder> {
        let entries = self.inner.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .filter(|r| chat_id.map(|c| r.chat_id == c).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub async fn cancel(&self, id: &str) -> anyhow::Result<bool> {
        let removed = {
            let mut entries = self.inner.entries.lock().unwrap_or_else(|e| e.into_inner());
            let before = entries.len();
            entries.retain(|r| r.id != id);
            entries.len() != before
        };
        if removed {
            if let Some(handle) = self
                .inner
                .timers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(id)
            {
                handle.abort();
            }
            self.persist().await?;
        }
        Ok(removed)
    }

    /// Arm the in-process timer for a reminder.
    fn arm(&self, reminder: Reminder) {
        let store = self.clone();
        let id = reminder.id.clone();
        let handle = tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let delay = (reminder.scheduled_at - now)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                if delay > MAX_TIMER {
                    // Too far out for one timer: recheck daily until the
                    // remaining delay becomes representable.
                    tokio::time::sleep(RECHECK_INTERVAL).await;
                    continue;
                }
                tokio::time::sleep(delay).await;
                break;
            }
            store.fire(reminder).await;
        });
        self.inner
            .timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, handle);
    }

    /// Deliver the reminder. It counts as fired only once the send call
    /// returns; a crash before that leaves it persisted for re-delivery.
    fn fire(&self, reminder: Reminder) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let store = self.clone();
        Box::pin(async move { store.fire_inner(reminder).await })
    }

    async fn fire_inner(&self, reminder: Reminder) {
        let text = format!("⏰ Reminder: {}", reminder.message);
        if let Err(e) = (self.inner.send)(reminder.chat_id, text).await {
            warn!(id = %reminder.id, "reminder delivery failed, keeping it armed: {}", e);
            // Retry in a minute rather than dropping the reminder.
            let store = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                store.fire(reminder).await;
            });
            return;
        }

        if reminder.recurring {
            if let Some(next) = self.next_recurrence(&reminder, Utc::now()) {
                let mut updated = reminder.clone();
                updated.scheduled_at = next;
                {
                    let mut entries =
                        self.inner.entries.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some(slot) = entries.iter_mut().find(|r| r.id == reminder.id) {
                        *slot = updated.clone();
                    }
                }
                let _ = self.persist().await;
                self.arm(updated);
                return;
            }
        }

        // One-shot (or exhausted recurrence): remove after delivery.
        {
            let mut entries = self.inner.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.retain(|r| r.id != reminder.id);
        }
        self.inner
            .timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&reminder.id);
        let _ = self.persist().await;
    }

    fn next_recurrence(&self, reminder: &Reminder, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let expr = CronExpr::parse(reminder.cron_expr.as_deref()?).ok()?;
        expr.next_after(now, self.inner.timezone)
    }

    async fn insert(&self, reminder: Reminder) -> anyhow::Result<()> {
        {
            let mut entries = self.inner.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.push(reminder);
        }
        self.persist().await
    }

    async fn persist(&self) -> anyhow::Result<()> {
        let doc = {
            let entries = self.inner.entries.lock().unwrap_or_else(|e| e.into_inner());
            ReminderDocument {
                reminders: entries.clone(),
            }
        };
        if let Some(parent) = self.inner.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.inner.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_string_pretty(&doc)?).await?;
        tokio::fs::rename(&tmp, &self.inner.path).await?;
        Ok(())
    }
}

fn short_id() -> String {
    format!("rem-{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}
