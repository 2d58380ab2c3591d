//! Durable cron-job store: one JSON document guarded by an advisory lock
//! file, written via temp + atomic rename so readers never observe a
//! partial file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::cron::CronExpr;

const STORE_VERSION: u32 = 1;
const LOCK_RETRIES: u32 = 100;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(50);
const LOCK_STALE_AFTER: Duration = Duration::from_secs(5);

/// When a job fires. Exactly one kind per job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Schedule {
    /// One-shot at an absolute instant.
    At { at: DateTime<Utc> },
    /// Fixed interval, optionally anchored at a start instant.
    #[serde(rename_all = "camelCase")]
    Every {
        interval_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        start: Option<DateTime<Utc>>,
    },
    /// Cron expression evaluated in a named timezone.
    Cron { expression: String, timezone: String },
}

/// What a job does when it fires.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum JobPayload {
    /// Inject a synthesized user turn into the owning conversation.
    AgentTurn { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    pub id: String,
    pub chat_id: i64,
    pub name: String,
    pub schedule: Schedule,
    pub payload: JobPayload,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub run_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_runs: Option<u32>,
}

impl CronJob {
    pub fn new(chat_id: i64, name: &str, schedule: Schedule, payload: JobPayload) -> Self {
        let now = Utc::now();
        let mut job = Self {
            id: uuid::Uuid::new_v4().to_string(),
            chat_id,
            name: name.to_string(),
            schedule,
            payload,
            enabled: true,
            created_at: now,
            last_run: None,
            next_run: None,
            run_count: 0,
            max_runs: None,
        };
        job.next_run = job.compute_next_run(now);
        job
    }

    /// Next fire instant strictly after `now`, or None when terminal.
    pub fn compute_next_run(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.schedule {
            Schedule::At { at } => (*at > now).then_some(*at),
            Schedule::Every { interval_ms, start } => {
                let interval = ChronoDuration::milliseconds(*interval_ms as i64);
                if interval <= ChronoDuration::zero() {
                    return None;
                }
                let anchor = start.unwrap_or(self.created_at);
                if anchor > now {
                    return Some(anchor);
                }
                let elapsed = now - anchor;
                let periods = elapsed.num_milliseconds() / interval.num_milliseconds() + 1;
                Some(anchor + interval * periods as i32)
            }
            Schedule::Cron {
                expression,
                timezone,
            } => {
                let expr = CronExpr::parse(expression).ok()?;
                let tz: Tz = timezone.parse().ok()?;
                expr.next_after(now, tz)
            }
        }
    }

    fn is_one_shot(&self) -> bool {
        matches!(self.schedule, Schedule::At { .. })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct JobsDocument {
    version: u32,
    jobs: Vec<CronJob>,
}

pub struct CronJobStore {
    path: PathBuf,
}

impl CronJobStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Read all jobs. A corrupt or missing file is an empty store.
    pub fn load(&self) -> Vec<CronJob> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => match serde_json::from_str::<JobsDocument>(&raw) {
                Ok(doc) => doc.jobs,
                Err(e) => {
                    warn!(path = %self.path.display(), "cron store unreadable, treating as empty: {}", e);
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!(path = %self.path.display(), "cron store read failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Read-modify-write under the advisory lock. `f` gets the job list;
    /// its return value is passed through.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut Vec<CronJob>) -> R) -> anyhow::Result<R> {
        let _guard = LockGuard::acquire(&self.path);

        let mut jobs = self.load();
        let out = f(&mut jobs);

        let doc = JobsDocument {
            version: STORE_VERSION,
            jobs,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&doc)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(out)
    }

    pub fn add(&self, job: CronJob) -> anyhow::Result<()> {
        self.mutate(|jobs| jobs.push(job))
    }

    pub fn remove(&self, id: &str) -> anyhow::Result<bool> {
        self.mutate(|jobs| {
            let before = jobs.len();
            jobs.retain(|j| j.id != id);
            jobs.len() != before
        })
    }

    /// Jobs ready to fire at `now`.
    pub fn due_jobs(&self, now: DateTime<Utc>) -> Vec<CronJob> {
        self.load()
            .into_iter()
            .filter(|j| {
                j.enabled
                    && j.next_run.map(|n| n <= now).unwrap_or(false)
                    && j.max_runs.map(|m| j.run_count < m).unwrap_or(true)
            })
            .collect()
    }

    /// Record one execution. Guarded by the caller's observed run_count
    /// so a duplicate call for the same firing is a no-op.
    pub fn mark_executed(
        &self,
        id: &str,
        observed_run_count: u32,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.mutate(|jobs| {
            let Some(job) = jobs.iter_mut().find(|j| j.id == id) else {
                return;
            };
            if job.run_count != observed_run_count {
                debug!(id, "mark_executed skipped: already recorded");
                return;
            }
            job.run_count += 1;
            job.last_run = Some(now);

            let exhausted = job.max_runs.map(|m| job.run_count >= m).unwrap_or(false);
            if exhausted || job.is_one_shot() {
                job.enabled = false;
                job.next_run = None;
            } else {
                job.next_run = job.compute_next_run(now);
                if job.next_run.is_none() {
                    job.enabled = false;
                }
            }
        })
    }

    /// Recompute stale next_runs after a restart. Returns one-shot jobs
    /// that were missed but fall inside the grace window — the caller
    /// fires those once.
    pub fn restore(&self, now: DateTime<Utc>, grace: Duration) -> anyhow::Result<Vec<CronJob>> {
        self.mutate(|jobs| {
            let mut fire_now = Vec::new();
            jobs.retain_mut(|job| {
                if !job.enabled {
                    return true;
                }
                let stale = job.next_run.map(|n| n <= now).unwrap_or(true);
                if !stale {
                    return true;
                }
                if job.is_one_shot() {
                    let missed_by = job
                        .next_run
                        .map(|n| now - n)
                        .unwrap_or_else(|| ChronoDuration::days(999));
                    let grace = ChronoDuration::from_std(grace).unwrap_or_else(|_| ChronoDuration::zero());
                    if missed_by >= ChronoDuration::zero() && missed_by <= grace {
                        fire_now.push(job.clone());
                    }
                    // Fired-or-expired one-shots don't survive restore.
                    return false;
                }
                job.next_run = job.compute_next_run(now);
                if job.next_run.is_none() {
                    job.enabled = false;
                }
                true
            });
            fire_now
        })
    }
}

/// Advisory lock: exclusive-create of a sibling `.lock` file. Stale locks
/// (mtime > 5 s) are deleted; after all retries we proceed with a warning
/// rather than deadlock.
struct LockGuard {
    path: PathBuf,
    acquired: bool,
}

impl LockGuard {
    fn acquire(store_path: &Path) -> Self {
        let path = store_path.with_extension("json.lock");
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        for _ in 0..LOCK_RETRIES {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => {
                    return Self {
                        path,
                        acquired: true,
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(&path) {
                        warn!(lock = %path.display(), "removing stale cron store lock");
                        let _ = std::fs::remove_file(&path);
                        continue;
                    }
                    std::thread::sleep(LOCK_RETRY_DELAY);
                }
                Err(e) => {
                    warn!(lock = %path.display(), "lock create failed: {}", e);
                    std::thread::sleep(LOCK_RETRY_DELAY);
                }
            }
        }

        warn!(lock = %path.display(), "lock not acquired after 5s, proceeding unlocked");
        Self {
            path,
            acquired: false,
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.acquired {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn lock_is_stale(path: &Path) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(|mtime| {
            mtime
                .elapsed()
                .map(|age| age > LOCK_STALE_AFTER)
                .unwrap_or(false)
        })
        .unwrap_or(false)
}
