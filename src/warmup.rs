//! One-shot parallel preload of the expensive singletons: embedding
//! model, workspace cache, and the memory chunk index. Idempotent;
//! concurrent callers share the same run.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::memory::{EmbeddingEngine, MemoryStore};
use crate::workspace::WorkspaceStore;

#[derive(Debug, Clone, Default)]
pub struct WarmupReport {
    pub embedding_ms: u128,
    pub workspace_ms: u128,
    pub memory_ms: u128,
    pub total_ms: u128,
    /// Individual failures; warmup itself never fails the daemon.
    pub errors: Vec<String>,
}

pub struct Warmup {
    once: OnceCell<WarmupReport>,
    engine: Arc<EmbeddingEngine>,
    workspace: Arc<WorkspaceStore>,
    memory: Arc<MemoryStore>,
}

impl Warmup {
    pub fn new(
        engine: Arc<EmbeddingEngine>,
        workspace: Arc<WorkspaceStore>,
        memory: Arc<MemoryStore>,
    ) -> Self {
        Self {
            once: OnceCell::new(),
            engine,
            workspace,
            memory,
        }
    }

    pub fn is_warm(&self) -> bool {
        self.once.initialized()
    }

    /// Status line for health reporting.
    pub fn status(&self) -> String {
        match self.once.get() {
            Some(report) if report.errors.is_empty() => {
                format!("warm ({} ms)", report.total_ms)
            }
            Some(report) => format!(
                "warm with {} error(s): {}",
                report.errors.len(),
                report.errors.join("; ")
            ),
            None => "cold".to_string(),
        }
    }

    /// Run the preload once; later calls return the cached report.
    pub async fn warmup(&self) -> WarmupReport {
        self.once
            .get_or_init(|| async {
                let start = Instant::now();
                let mut report = WarmupReport::default();

                let embed = async {
                    let t = Instant::now();
                    let result = self.engine.preload().await;
                    (t.elapsed().as_millis(), result)
                };
                let workspace = async {
                    let t = Instant::now();
                    self.workspace.load().await;
                    (t.elapsed().as_millis(), Ok::<(), anyhow::Error>(()))
                };
                let memory = async {
                    let t = Instant::now();
                    let result = self
                        .memory
                        .ingest_directory(&self.workspace.memory_dir())
                        .await
                        .map(|_| ());
                    (t.elapsed().as_millis(), result)
                };

                // Settle all three; a failure degrades, never aborts.
                let ((embedding_ms, embed_res), (workspace_ms, ws_res), (memory_ms, mem_res)) =
                    tokio::join!(embed, workspace, memory);

                report.embedding_ms = embedding_ms;
                report.workspace_ms = workspace_ms;
                report.memory_ms = memory_ms;
                for (label, result) in [
                    ("embedding", embed_res),
                    ("workspace", ws_res),
                    ("memory", mem_res),
                ] {
                    if let Err(e) = result {
                        warn!("warmup: {} preload failed: {}", label, e);
                        report.errors.push(format!("{}: {}", label, e));
                    }
                }
                report.total_ms = start.elapsed().as_millis();
                info!(
                    total_ms = report.total_ms as u64,
                    errors = report.errors.len(),
                    "warmup complete"
                );
                report
            })
            .await
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn warmup_fixture(dir: &tempfile::TempDir) -> Warmup {
        let engine = Arc::new(EmbeddingEngine::new(dir.path().join("cache.json")));
        let workspace = Arc::new(WorkspaceStore::new(dir.path().to_path_buf()));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let memory = Arc::new(
            MemoryStore::with_pool(pool, engine.clone(), 20, 500)
                .await
                .unwrap(),
        );
        Warmup::new(engine, workspace, memory)
    }

    // Workspace + memory preloads run for real; the embedding model
    // load is exercised only in environments that have it. The report
    // shape and idempotence are what these tests pin down.
    #[tokio::test]
    async fn warmup_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let warmup = warmup_fixture(&dir).await;
        assert!(!warmup.is_warm());
        assert_eq!(warmup.status(), "cold");

        let first = warmup.warmup().await;
        assert!(warmup.is_warm());
        let second = warmup.warmup().await;
        assert_eq!(first.total_ms, second.total_ms);
        assert_eq!(first.errors.len(), second.errors.len());
    }
}
