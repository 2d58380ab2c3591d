//! Tick-driven job scheduler: parses schedules (cron or natural
//! language), persists jobs, and fires due payloads through the
//! orchestrator.

pub mod cron;
pub mod nl;
mod store;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use chrono_tz::Tz;
use tracing::{error, info, warn};

pub use cron::CronExpr;
pub use nl::{parse_natural, NaturalSchedule};
pub use store::{CronJob, CronJobStore, JobPayload, Schedule};

use crate::traits::{SendFn, TurnRunner};

pub struct SchedulerEngine {
    store: Arc<CronJobStore>,
    runner: Arc<dyn TurnRunner>,
    send: SendFn,
    tick_interval: Duration,
    startup_grace: Duration,
    timezone: Tz,
}

impl SchedulerEngine {
    pub fn new(
        store: Arc<CronJobStore>,
        runner: Arc<dyn TurnRunner>,
        send: SendFn,
        tick_interval: Duration,
        startup_grace: Duration,
        timezone: Tz,
    ) -> Self {
        Self {
            store,
            runner,
            send,
            tick_interval,
            startup_grace,
            timezone,
        }
    }

    /// Create a job from a schedule phrase (cron or natural language).
    pub fn create_job(
        &self,
        chat_id: i64,
        name: &str,
        phrase: &str,
        message: &str,
    ) -> anyhow::Result<CronJob> {
        let schedule = match parse_natural(phrase, Utc::now(), self.timezone)? {
            NaturalSchedule::Cron(expression) => Schedule::Cron {
                expression,
                timezone: self.timezone.name().to_string(),
            },
            NaturalSchedule::At(at) => Schedule::At { at },
        };
        let job = CronJob::new(
            chat_id,
            name,
            schedule,
            JobPayload::AgentTurn {
                message: message.to_string(),
            },
        );
        if job.next_run.is_none() {
            anyhow::bail!("schedule '{}' never fires", phrase);
        }
        self.store.add(job.clone())?;
        info!(job = %job.name, next_run = ?job.next_run, "scheduled");
        Ok(job)
    }

    pub fn list_jobs(&self) -> Vec<CronJob> {
        self.store.load()
    }

    pub fn cancel_job(&self, id: &str) -> anyhow::Result<bool> {
        self.store.remove(id)
    }

    /// Restore persisted jobs and start the tick loop.
    pub fn spawn(self: Arc<Self>) {
        tokio::spawn(async move {
            match self.store.restore(Utc::now(), self.startup_grace) {
                Ok(missed) => {
                    for job in missed {
                        info!(job = %job.name, "firing one-shot missed within grace window");
                        self.fire(job);
                    }
                }
                Err(e) => error!("scheduler restore failed: {}", e),
            }

            loop {
                tokio::time::sleep(self.tick_interval).await;
                if let Err(e) = self.tick().await {
                    error!("scheduler tick error: {}", e);
                }
            }
        });
        info!("scheduler engine spawned");
    }

    /// One tick: collect due jobs, record the firing, fan out payloads.
    /// Recording before execution keeps at-most-once between ticks even
    /// when a payload outlives the tick interval.
    async fn tick(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        for job in self.store.due_jobs(now) {
            self.store.mark_executed(&job.id, job.run_count, now)?;
            self.fire(job);
        }
        Ok(())
    }

    fn fire(&self, job: CronJob) {
        let runner = self.runner.clone();
        let send = self.send.clone();
        tokio::spawn(async move {
            execute_payload(&job, runner, send).await;
        });
    }
}

/// Run one job payload. Failures are logged; the job stays on schedule.
async fn execute_payload(job: &CronJob, runner: Arc<dyn TurnRunner>, send: SendFn) {
    match &job.payload {
        JobPayload::AgentTurn { message } => {
            info!(job = %job.name, chat_id = job.chat_id, "executing scheduled turn");
            match runner.run_turn(job.chat_id, message).await {
                Ok(reply) => {
                    if reply.trim().is_empty() {
                        return;
                    }
                    if let Err(e) = send(job.chat_id, reply).await {
                        warn!(job = %job.name, "scheduled reply delivery failed: {}", e);
                    }
                }
                Err(e) => error!(job = %job.name, "scheduled turn failed: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct RecordingRunner {
        turns: Mutex<Vec<(i64, String)>>,
    }

    #[async_trait]
    impl TurnRunner for RecordingRunner {
        async fn run_turn(&self, chat_id: i64, message: &str) -> anyhow::Result<String> {
            self.turns
                .lock()
                .unwrap()
                .push((chat_id, message.to_string()));
            Ok(format!("done: {}", message))
        }
    }

    fn engine(dir: &tempfile::TempDir) -> (Arc<SchedulerEngine>, Arc<RecordingRunner>, Arc<Mutex<Vec<(i64, String)>>>) {
        let store = Arc::new(CronJobStore::new(dir.path().join("cron-jobs.json")));
        let runner = Arc::new(RecordingRunner {
            turns: Mutex::new(Vec::new()),
        });
        let sent: Arc<Mutex<Vec<(i64, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let sent_clone = sent.clone();
        let send: SendFn = Arc::new(move |chat_id, text| {
            let sent = sent_clone.clone();
            Box::pin(async move {
                sent.lock().unwrap().push((chat_id, text));
                Ok(())
            })
        });
        let engine = Arc::new(SchedulerEngine::new(
            store,
            runner.clone(),
            send,
            Duration::from_secs(30),
            Duration::from_secs(300),
            "UTC".parse().unwrap(),
        ));
        (engine, runner, sent)
    }

    #[tokio::test]
    async fn create_job_from_natural_phrase() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _, _) = engine(&dir);
        let job = engine
            .create_job(5, "standup", "weekdays at 9am", "post the standup summary")
            .unwrap();
        assert!(matches!(job.schedule, Schedule::Cron { .. }));
        assert_eq!(engine.list_jobs().len(), 1);
    }

    #[tokio::test]
    async fn create_job_rejects_gibberish() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _, _) = engine(&dir);
        assert!(engine.create_job(5, "x", "whenever", "msg").is_err());
        assert!(engine.list_jobs().is_empty());
    }

    #[tokio::test]
    async fn tick_fires_due_job_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, runner, sent) = engine(&dir);

        let job = CronJob::new(
            9,
            "now",
            Schedule::At {
                at: Utc::now() + chrono::Duration::milliseconds(5),
            },
            JobPayload::AgentTurn {
                message: "check the weather".into(),
            },
        );
        engine.store.add(job).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.tick().await.unwrap();
        // Second tick sees the job already marked executed.
        engine.tick().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(runner.turns.lock().unwrap().len(), 1);
        assert_eq!(
            runner.turns.lock().unwrap()[0],
            (9, "check the weather".to_string())
        );
        assert_eq!(sent.lock().unwrap().len(), 1);
        assert!(sent.lock().unwrap()[0].1.contains("done"));
    }

    #[tokio::test]
    async fn payload_failure_keeps_job_scheduled() {
        struct FailingRunner;
        #[async_trait]
        impl TurnRunner for FailingRunner {
            async fn run_turn(&self, _chat_id: i64, _message: &str) -> anyhow::Result<String> {
                anyhow::bail!("model unavailable")
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CronJobStore::new(dir.path().join("cron-jobs.json")));
        let send: SendFn = Arc::new(|_, _| Box::pin(async { Ok(()) }));
        let engine = Arc::new(SchedulerEngine::new(
            store.clone(),
            Arc::new(FailingRunner),
            send,
            Duration::from_secs(30),
            Duration::from_secs(300),
            "UTC".parse().unwrap(),
        ));

        let mut job = CronJob::new(
            1,
            "recurring",
            Schedule::Cron {
                expression: "* * * * *".into(),
                timezone: "UTC".into(),
            },
            JobPayload::AgentTurn {
                message: "m".into(),
            },
        );
        job.next_run = Some(Utc::now() - chrono::Duration::seconds(1));
        store.add(job).unwrap();

        engine.tick().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let jobs = store.load();
        assert_eq!(jobs[0].run_count, 1);
        assert!(jobs[0].enabled);
        assert!(jobs[0].next_run.unwrap() > Utc::now());
    }
}
