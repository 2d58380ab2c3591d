//! Local embedding generation with two caches: an LRU for query strings
//! and a persistent chunk-hash → vector cache that survives restarts.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use futures::StreamExt;
use tokio::sync::OnceCell;
use tokio::task;
use tracing::{info, warn};

pub const EMBEDDING_DIM: usize = 384;

const QUERY_CACHE_CAP: usize = 100;
const MAX_INPUT_CHARS: usize = 512;
const BATCH_CONCURRENCY: usize = 5;

/// Cosine similarity. On unit-normalized inputs this is just the dot
/// product; pass `normalized = false` to divide by magnitudes.
pub fn cosine(a: &[f32], b: &[f32], normalized: bool) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    if normalized {
        return dot;
    }
    let na: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let nb: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// Exact-string LRU for query embeddings.
struct QueryLru {
    map: HashMap<String, Vec<f32>>,
    order: VecDeque<String>,
}

impl QueryLru {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, key: &str) -> Option<Vec<f32>> {
        let hit = self.map.get(key).cloned();
        if hit.is_some() {
            self.order.retain(|k| k != key);
            self.order.push_back(key.to_string());
        }
        hit
    }

    fn put(&mut self, key: String, value: Vec<f32>) {
        if self.map.insert(key.clone(), value).is_none() {
            self.order.push_back(key);
            while self.order.len() > QUERY_CACHE_CAP {
                if let Some(old) = self.order.pop_front() {
                    self.map.remove(&old);
                }
            }
        } else {
            self.order.retain(|k| k != &key);
            self.order.push_back(key);
        }
    }
}

pub struct EmbeddingEngine {
    model: OnceCell<Arc<TextEmbedding>>,
    query_cache: Mutex<QueryLru>,
    /// chunk hash → vector, persisted as JSON next to the chunk index.
    disk_cache: Mutex<HashMap<String, Vec<f32>>>,
    disk_cache_path: PathBuf,
    disk_dirty: AtomicBool,
}

impl EmbeddingEngine {
    pub fn new(disk_cache_path: PathBuf) -> Self {
        Self {
            model: OnceCell::new(),
            query_cache: Mutex::new(QueryLru::new()),
            disk_cache: Mutex::new(HashMap::new()),
            disk_cache_path,
            disk_dirty: AtomicBool::new(false),
        }
    }

    /// Load the model and the persistent cache. First call may take
    /// seconds (model download/mmap); concurrent callers share the load.
    pub async fn preload(&self) -> anyhow::Result<()> {
        self.get_model().await?;

        match tokio::fs::read_to_string(&self.disk_cache_path).await {
            Ok(raw) => match serde_json::from_str::<HashMap<String, Vec<f32>>>(&raw) {
                Ok(map) => {
                    info!(entries = map.len(), "embedding cache loaded");
                    *self.disk_cache.lock().unwrap_or_else(|e| e.into_inner()) = map;
                }
                Err(e) => warn!("embedding cache unreadable, starting empty: {}", e),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("embedding cache read failed: {}", e),
        }
        Ok(())
    }

    async fn get_model(&self) -> anyhow::Result<Arc<TextEmbedding>> {
        let model = self
            .model
            .get_or_try_init(|| async {
                info!("loading embedding model (first call)");
                let model = task::spawn_blocking(|| {
                    let mut options = InitOptions::default();
                    options.model_name = EmbeddingModel::AllMiniLML6V2;
                    options.show_download_progress = false;
                    TextEmbedding::try_new(options)
                })
                .await??;
                Ok::<_, anyhow::Error>(Arc::new(model))
            })
            .await?;
        Ok(model.clone())
    }

    /// Embed one string. Output is unit-normalized, EMBEDDING_DIM wide.
    /// Empty input maps to the zero vector without touching the model.
    pub async fn embed(&self, text: &str, use_cache: bool) -> anyhow::Result<Vec<f32>> {
        let normalized = normalize_input(text);
        if normalized.is_empty() {
            return Ok(vec![0.0; EMBEDDING_DIM]);
        }

        if use_cache {
            let mut cache = self.query_cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(hit) = cache.get(&normalized) {
                return Ok(hit);
            }
        }

        let vector = self.embed_raw(normalized.clone()).await?;

        if use_cache {
            let mut cache = self.query_cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.put(normalized, vector.clone());
        }
        Ok(vector)
    }

    /// Embed many strings with bounded concurrency, preserving order.
    /// Never consults the query cache.
    pub async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let results: Vec<anyhow::Result<Vec<f32>>> = futures::stream::iter(
            texts
                .iter()
                .map(|t| {
                    let normalized = normalize_input(t);
                    async move {
                        if normalized.is_empty() {
                            Ok(vec![0.0; EMBEDDING_DIM])
                        } else {
                            self.embed_raw(normalized).await
                        }
                    }
                }),
        )
        .buffered(BATCH_CONCURRENCY)
        .collect()
        .await;

        results.into_iter().collect()
    }

    /// Embedding for an indexed chunk, served from the persistent cache
    /// when the hash is known.
    pub async fn embed_chunk(&self, hash: &str, text: &str) -> anyhow::Result<Vec<f32>> {
        {
            let cache = self.disk_cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(hit) = cache.get(hash) {
                return Ok(hit.clone());
            }
        }
        let vector = self.embed(text, false).await?;
        {
            let mut cache = self.disk_cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.insert(hash.to_string(), vector.clone());
        }
        self.disk_dirty.store(true, Ordering::Relaxed);
        Ok(vector)
    }

    /// Persist the chunk-hash cache if it changed since the last flush.
    pub async fn flush(&self) -> anyhow::Result<()> {
        if !self.disk_dirty.swap(false, Ordering::Relaxed) {
            return Ok(());
        }
        let snapshot = {
            let cache = self.disk_cache.lock().unwrap_or_else(|e| e.into_inner());
            serde_json::to_string(&*cache)?
        };
        if let Some(parent) = self.disk_cache_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.disk_cache_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, snapshot).await?;
        tokio::fs::rename(&tmp, &self.disk_cache_path).await?;
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.model.initialized()
    }

    async fn embed_raw(&self, text: String) -> anyhow::Result<Vec<f32>> {
        let model = self.get_model().await?;
        let vector = task::spawn_blocking(move || {
            let embeddings = model.embed(vec![text], None)?;
            Ok::<Vec<f32>, anyhow::Error>(embeddings.into_iter().next().unwrap_or_default())
        })
        .await??;
        Ok(unit_normalize(vector))
    }
}

fn normalize_input(text: &str) -> String {
    let trimmed = text.trim();
    trimmed.chars().take(MAX_INPUT_CHARS).collect()
}

fn unit_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_dot_equivalence_on_unit_vectors() {
        let a = unit_normalize(vec![1.0, 2.0, 3.0]);
        let b = unit_normalize(vec![3.0, 2.0, 1.0]);
        let fast = cosine(&a, &b, true);
        let slow = cosine(&a, &b, false);
        assert!((fast - slow).abs() < 1e-6);
        assert!((-1.0..=1.0).contains(&fast));
    }

    #[test]
    fn unit_normalize_produces_unit_length() {
        let v = unit_normalize(vec![0.3, -4.0, 12.0]);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn zero_vector_survives_normalization() {
        let v = unit_normalize(vec![0.0; 4]);
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn input_normalization_trims_and_bounds() {
        assert_eq!(normalize_input("  hi  "), "hi");
        let long = "x".repeat(1000);
        assert_eq!(normalize_input(&long).chars().count(), MAX_INPUT_CHARS);
    }

    #[test]
    fn query_lru_evicts_least_recently_used() {
        let mut lru = QueryLru::new();
        for i in 0..QUERY_CACHE_CAP + 10 {
            lru.put(format!("q{}", i), vec![i as f32]);
        }
        assert!(lru.get("q0").is_none());
        assert!(lru.get(&format!("q{}", QUERY_CACHE_CAP + 9)).is_some());

        // Touching an entry protects it from the next eviction round.
        let survivor = format!("q{}", 10);
        assert!(lru.get(&survivor).is_some());
        for i in 0..QUERY_CACHE_CAP - 1 {
            lru.put(format!("fresh{}", i), vec![i as f32]);
        }
        assert!(lru.get(&survivor).is_some());
    }

    #[tokio::test]
    async fn empty_input_embeds_to_zero_vector() {
        let dir = tempfile::tempdir().unwrap();
        let engine = EmbeddingEngine::new(dir.path().join(".embedding-cache.json"));
        let v = engine.embed("", true).await.unwrap();
        assert_eq!(v.len(), EMBEDDING_DIM);
        assert!(v.iter().all(|x| *x == 0.0));
    }
}
