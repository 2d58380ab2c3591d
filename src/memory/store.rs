//! Chunk index: SQLite table for vectors + FTS5 companion for keywords,
//! fused into hybrid search with graceful degradation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use super::chunker::{chunk_markdown, MemoryChunk};
use super::embeddings::{cosine, EmbeddingEngine};

const EMBED_TIMEOUT: Duration = Duration::from_secs(3);
const SEARCH_TIMEOUT: Duration = Duration::from_secs(5);
const RESULT_CACHE_TTL: Duration = Duration::from_secs(60);
const RESULT_CACHE_CAP: usize = 100;
const RRF_K: f64 = 60.0;

/// One search result. Score semantics depend on the search that produced
/// it: cosine for semantic, bm25 (lower = better) for keyword, fused
/// score for hybrid.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub source: String,
    pub text: String,
    pub score: f64,
    pub vector_score: Option<f64>,
    pub keyword_score: Option<f64>,
    pub rrf_score: Option<f64>,
}

/// Optional narrowing applied to any search.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub max_age_days: Option<i64>,
    pub sources: Option<Vec<String>>,
}

/// How hybrid search merges the two ranked lists.
#[derive(Debug, Clone, Copy)]
pub enum FusionMode {
    Rrf,
    Weighted { vector: f64, keyword: f64 },
}

pub struct MemoryStore {
    pool: SqlitePool,
    engine: Arc<EmbeddingEngine>,
    min_chunk_chars: usize,
    max_chunk_chars: usize,
    result_cache: Mutex<HashMap<String, (Instant, Vec<SearchHit>)>>,
}

impl MemoryStore {
    pub async fn open(
        db_path: &std::path::Path,
        engine: Arc<EmbeddingEngine>,
        min_chunk_chars: usize,
        max_chunk_chars: usize,
    ) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self::with_pool(pool, engine, min_chunk_chars, max_chunk_chars).await?;
        Ok(store)
    }

    pub async fn with_pool(
        pool: SqlitePool,
        engine: Arc<EmbeddingEngine>,
        min_chunk_chars: usize,
        max_chunk_chars: usize,
    ) -> anyhow::Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chunks (
                hash TEXT PRIMARY KEY,
                chunk_id TEXT NOT NULL,
                source TEXT NOT NULL,
                text TEXT NOT NULL,
                embedding BLOB,
                mtime INTEGER NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(source)")
            .execute(&pool)
            .await?;
        sqlx::query(
            "CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts
             USING fts5(text, hash UNINDEXED, source UNINDEXED)",
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            engine,
            min_chunk_chars,
            max_chunk_chars,
            result_cache: Mutex::new(HashMap::new()),
        })
    }

    pub async fn chunk_count(&self) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n"))
    }

    /// Chunk a markdown source and upsert it, removing chunks whose text
    /// disappeared from the file. Unchanged hashes keep their embedding.
    pub async fn ingest_file(
        &self,
        source: &str,
        content: &str,
        mtime: DateTime<Utc>,
    ) -> anyhow::Result<usize> {
        let chunks = chunk_markdown(
            source,
            content,
            mtime,
            self.min_chunk_chars,
            self.max_chunk_chars,
        );

        let keep: Vec<String> = chunks.iter().map(|c| c.hash.clone()).collect();
        let existing: Vec<String> =
            sqlx::query("SELECT hash FROM chunks WHERE source = ?")
                .bind(source)
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .map(|r| r.get::<String, _>("hash"))
                .collect();
        for stale in existing.iter().filter(|h| !keep.contains(*h)) {
            self.delete_by_hash(stale).await?;
        }

        let count = chunks.len();
        self.upsert_chunks(&chunks).await?;
        debug!(source, chunks = count, "ingested");
        Ok(count)
    }

    /// Ingest every markdown file in a directory (daily logs and any
    /// other notes; dotfiles and non-markdown are skipped).
    pub async fn ingest_directory(&self, dir: &std::path::Path) -> anyhow::Result<usize> {
        let mut total = 0usize;
        let mut reader = match tokio::fs::read_dir(dir).await {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !name.ends_with(".md") {
                continue;
            }
            let source = name.trim_end_matches(".md").to_string();
            let content = match tokio::fs::read_to_string(entry.path()).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(file = %name, "skipping unreadable memory file: {}", e);
                    continue;
                }
            };
            let mtime = entry
                .metadata()
                .await
                .ok()
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(Utc::now);
            total += self.ingest_file(&source, &content, mtime).await?;
        }
        self.ensure_embeddings().await?;
        Ok(total)
    }

    /// Insert chunks idempotently, keyed by content hash.
    pub async fn upsert_chunks(&self, chunks: &[MemoryChunk]) -> anyhow::Result<()> {
        for chunk in chunks {
            let inserted = sqlx::query(
                "INSERT INTO chunks (hash, chunk_id, source, text, embedding, mtime)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(hash) DO UPDATE SET mtime = excluded.mtime",
            )
            .bind(&chunk.hash)
            .bind(&chunk.id)
            .bind(&chunk.source)
            .bind(&chunk.text)
            .bind(chunk.embedding.as_ref().map(|e| serde_json::to_vec(e).unwrap_or_default()))
            .bind(chunk.timestamp.timestamp())
            .execute(&self.pool)
            .await?;

            // Mirror into FTS only on first insert; the text for a given
            // hash never changes.
            if inserted.rows_affected() > 0 {
                let present =
                    sqlx::query("SELECT COUNT(*) AS n FROM chunks_fts WHERE hash = ?")
                        .bind(&chunk.hash)
                        .fetch_one(&self.pool)
                        .await?
                        .get::<i64, _>("n");
                if present == 0 {
                    sqlx::query("INSERT INTO chunks_fts (text, hash, source) VALUES (?, ?, ?)")
                        .bind(&chunk.text)
                        .bind(&chunk.hash)
                        .bind(&chunk.source)
                        .execute(&self.pool)
                        .await?;
                }
            }
        }
        Ok(())
    }

    pub async fn delete_by_source(&self, source: &str) -> anyhow::Result<u64> {
        sqlx::query("DELETE FROM chunks_fts WHERE source = ?")
            .bind(source)
            .execute(&self.pool)
            .await?;
        let res = sqlx::query("DELETE FROM chunks WHERE source = ?")
            .bind(source)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    async fn delete_by_hash(&self, hash: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM chunks_fts WHERE hash = ?")
            .bind(hash)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE hash = ?")
            .bind(hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Generate and write through embeddings for rows that lack one.
    pub async fn ensure_embeddings(&self) -> anyhow::Result<usize> {
        let rows = sqlx::query("SELECT hash, text FROM chunks WHERE embedding IS NULL")
            .fetch_all(&self.pool)
            .await?;
        if rows.is_empty() {
            return Ok(0);
        }
        info!(missing = rows.len(), "generating chunk embeddings");
        let mut done = 0usize;
        for row in rows {
            let hash: String = row.get("hash");
            let text: String = row.get("text");
            match self.engine.embed_chunk(&hash, &text).await {
                Ok(vector) => {
                    sqlx::query("UPDATE chunks SET embedding = ? WHERE hash = ?")
                        .bind(serde_json::to_vec(&vector)?)
                        .bind(&hash)
                        .execute(&self.pool)
                        .await?;
                    done += 1;
                }
                Err(e) => warn!(hash = %hash, "embedding failed: {}", e),
            }
        }
        self.engine.flush().await?;
        Ok(done)
    }

    /// Cosine search over stored vectors. Rows still missing embeddings
    /// are filled in on demand first.
    pub async fn search(
        &self,
        query_vec: &[f32],
        top_k: usize,
        min_score: f64,
        filters: &SearchFilters,
    ) -> anyhow::Result<Vec<SearchHit>> {
        let cache_key = result_cache_key(query_vec, top_k, min_score, filters);
        if let Some(hits) = self.cached_result(&cache_key) {
            return Ok(hits);
        }

        self.ensure_embeddings().await?;

        let mut sql = String::from(
            "SELECT chunk_id, hash, source, text, embedding, mtime FROM chunks
             WHERE embedding IS NOT NULL",
        );
        let mut binds: Vec<String> = Vec::new();
        apply_filters(&mut sql, &mut binds, filters);

        let mut query = sqlx::query(&sql);
        for b in &binds {
            query = query.bind(b);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut hits: Vec<SearchHit> = rows
            .into_iter()
            .filter_map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let embedding: Vec<f32> = serde_json::from_slice(&blob).ok()?;
                let score = cosine(query_vec, &embedding, true);
                if score < min_score {
                    return None;
                }
                Some(SearchHit {
                    id: row.get("chunk_id"),
                    source: row.get("source"),
                    text: row.get("text"),
                    score,
                    vector_score: Some(score),
                    keyword_score: None,
                    rrf_score: None,
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);

        self.store_result(cache_key, hits.clone());
        Ok(hits)
    }

    /// FTS5 keyword search, bm25-ranked (lower = better). Short CJK
    /// queries that tokenize poorly fall back to substring matching.
    pub async fn search_keyword(
        &self,
        query: &str,
        top_k: usize,
        filters: &SearchFilters,
    ) -> anyhow::Result<Vec<SearchHit>> {
        let tokens = tokenize(query);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        if needs_substring_fallback(query, &tokens) {
            return self.search_substring(query.trim(), top_k, filters).await;
        }

        let match_expr = tokens
            .iter()
            .map(|t| format!("\"{}\"", t.replace('"', "")))
            .collect::<Vec<_>>()
            .join(" OR ");

        let mut sql = String::from(
            "SELECT c.chunk_id, c.source, c.text, bm25(chunks_fts) AS score
             FROM chunks_fts
             JOIN chunks c ON c.hash = chunks_fts.hash
             WHERE chunks_fts MATCH ?",
        );
        let mut binds: Vec<String> = vec![match_expr];
        apply_filters_aliased(&mut sql, &mut binds, filters, "c");
        sql.push_str(" ORDER BY score ASC LIMIT ");
        sql.push_str(&top_k.to_string());

        let mut q = sqlx::query(&sql);
        for b in &binds {
            q = q.bind(b);
        }
        let rows = q.fetch_all(&self.pool).await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let score: f64 = row.get("score");
                SearchHit {
                    id: row.get("chunk_id"),
                    source: row.get("source"),
                    text: row.get("text"),
                    score,
                    vector_score: None,
                    keyword_score: Some(score),
                    rrf_score: None,
                }
            })
            .collect())
    }

    async fn search_substring(
        &self,
        needle: &str,
        top_k: usize,
        filters: &SearchFilters,
    ) -> anyhow::Result<Vec<SearchHit>> {
        let mut sql = String::from(
            "SELECT chunk_id, source, text, mtime FROM chunks WHERE text LIKE ?",
        );
        let mut binds: Vec<String> = vec![format!("%{}%", needle.replace('%', ""))];
        apply_filters(&mut sql, &mut binds, filters);
        sql.push_str(" LIMIT ");
        sql.push_str(&top_k.to_string());

        let mut q = sqlx::query(&sql);
        for b in &binds {
            q = q.bind(b);
        }
        let rows = q.fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|row| SearchHit {
                id: row.get("chunk_id"),
                source: row.get("source"),
                text: row.get("text"),
                score: 0.0,
                vector_score: None,
                keyword_score: Some(0.0),
                rrf_score: None,
            })
            .collect())
    }

    /// Semantic search from query text: embed (LRU-cached) then rank.
    /// Degrades to empty on embed failure or timeout.
    pub async fn search_text(
        &self,
        query: &str,
        top_k: usize,
        min_score: f64,
        filters: &SearchFilters,
    ) -> Vec<SearchHit> {
        let query_vec = match tokio::time::timeout(EMBED_TIMEOUT, self.engine.embed(query, true))
            .await
        {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                warn!("query embedding failed: {}", e);
                return Vec::new();
            }
            Err(_) => {
                warn!("query embedding timed out");
                return Vec::new();
            }
        };
        match tokio::time::timeout(
            SEARCH_TIMEOUT,
            self.search(&query_vec, top_k, min_score, filters),
        )
        .await
        {
            Ok(Ok(hits)) => hits,
            Ok(Err(e)) => {
                warn!("vector search failed: {}", e);
                Vec::new()
            }
            Err(_) => Vec::new(),
        }
    }

    /// Hybrid search: semantic + keyword under bounded timeouts, merged
    /// by RRF or weighted sum. Either side failing degrades to the other.
    pub async fn hybrid_search(
        &self,
        query: &str,
        top_k: usize,
        min_score: f64,
        mode: FusionMode,
        filters: &SearchFilters,
    ) -> anyhow::Result<Vec<SearchHit>> {
        let query_vec = match tokio::time::timeout(EMBED_TIMEOUT, self.engine.embed(query, true))
            .await
        {
            Ok(Ok(v)) => Some(v),
            Ok(Err(e)) => {
                warn!("query embedding failed: {}", e);
                None
            }
            Err(_) => {
                warn!("query embedding timed out");
                None
            }
        };

        self.hybrid_search_with_vec(query, query_vec.as_deref(), top_k, min_score, mode, filters)
            .await
    }

    async fn hybrid_search_with_vec(
        &self,
        query: &str,
        query_vec: Option<&[f32]>,
        top_k: usize,
        min_score: f64,
        mode: FusionMode,
        filters: &SearchFilters,
    ) -> anyhow::Result<Vec<SearchHit>> {
        let fetch = top_k * 2;

        let semantic = async {
            match query_vec {
                Some(v) => {
                    match tokio::time::timeout(
                        SEARCH_TIMEOUT,
                        self.search(v, fetch, min_score, filters),
                    )
                    .await
                    {
                        Ok(Ok(hits)) => hits,
                        Ok(Err(e)) => {
                            warn!("vector search failed: {}", e);
                            Vec::new()
                        }
                        Err(_) => {
                            warn!("vector search timed out");
                            Vec::new()
                        }
                    }
                }
                None => Vec::new(),
            }
        };
        let keyword = async {
            match tokio::time::timeout(
                SEARCH_TIMEOUT,
                self.search_keyword(query, fetch, filters),
            )
            .await
            {
                Ok(Ok(hits)) => hits,
                Ok(Err(e)) => {
                    warn!("keyword search failed: {}", e);
                    Vec::new()
                }
                Err(_) => {
                    warn!("keyword search timed out");
                    Vec::new()
                }
            }
        };

        let (vector_hits, keyword_hits) = tokio::join!(semantic, keyword);
        if vector_hits.is_empty() && keyword_hits.is_empty() {
            return Ok(Vec::new());
        }

        let mut fused = match mode {
            FusionMode::Rrf => fuse_rrf(vector_hits, keyword_hits),
            FusionMode::Weighted { vector, keyword } => {
                fuse_weighted(vector_hits, keyword_hits, vector, keyword)
            }
        };
        fused.truncate(top_k);
        Ok(fused)
    }

    fn cached_result(&self, key: &str) -> Option<Vec<SearchHit>> {
        let cache = self.result_cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.get(key).and_then(|(at, hits)| {
            (at.elapsed() < RESULT_CACHE_TTL).then(|| hits.clone())
        })
    }

    fn store_result(&self, key: String, hits: Vec<SearchHit>) {
        let mut cache = self.result_cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.retain(|_, (at, _)| at.elapsed() < RESULT_CACHE_TTL);
        if cache.len() >= RESULT_CACHE_CAP {
            // Over cap with nothing expired: drop the oldest entry.
            if let Some(oldest) = cache
                .iter()
                .max_by_key(|(_, (at, _))| at.elapsed())
                .map(|(k, _)| k.clone())
            {
                cache.remove(&oldest);
            }
        }
        cache.insert(key, (Instant::now(), hits));
    }
}

/// Dedup key: source plus the first 100 chars of text.
fn dedup_key(hit: &SearchHit) -> (String, String) {
    (
        hit.source.clone(),
        hit.text.chars().take(100).collect::<String>(),
    )
}

/// Reciprocal rank fusion with k = 60. Equal sums tie-break on keyword
/// rank (then vector rank) so ordering stays deterministic.
fn fuse_rrf(vector_hits: Vec<SearchHit>, keyword_hits: Vec<SearchHit>) -> Vec<SearchHit> {
    struct Fused {
        hit: SearchHit,
        score: f64,
        keyword_rank: usize,
        vector_rank: usize,
    }
    let mut merged: HashMap<(String, String), Fused> = HashMap::new();

    for (rank, hit) in vector_hits.into_iter().enumerate() {
        let contribution = 1.0 / (RRF_K + rank as f64 + 1.0);
        let entry = merged.entry(dedup_key(&hit)).or_insert_with(|| Fused {
            hit: hit.clone(),
            score: 0.0,
            keyword_rank: usize::MAX,
            vector_rank: usize::MAX,
        });
        entry.hit.vector_score = hit.vector_score.or(entry.hit.vector_score);
        entry.vector_rank = entry.vector_rank.min(rank);
        entry.score += contribution;
    }
    for (rank, hit) in keyword_hits.into_iter().enumerate() {
        let contribution = 1.0 / (RRF_K + rank as f64 + 1.0);
        let entry = merged.entry(dedup_key(&hit)).or_insert_with(|| Fused {
            hit: hit.clone(),
            score: 0.0,
            keyword_rank: usize::MAX,
            vector_rank: usize::MAX,
        });
        entry.hit.keyword_score = hit.keyword_score.or(entry.hit.keyword_score);
        entry.keyword_rank = entry.keyword_rank.min(rank);
        entry.score += contribution;
    }

    let mut fused: Vec<Fused> = merged.into_values().collect();
    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.keyword_rank.cmp(&b.keyword_rank))
            .then(a.vector_rank.cmp(&b.vector_rank))
    });
    fused
        .into_iter()
        .map(|f| {
            let mut h = f.hit;
            h.rrf_score = Some(f.score);
            h.score = f.score;
            h
        })
        .collect()
}

/// Weighted fusion: cosine used directly, bm25 min-max normalized so the
/// best keyword hit scores 1.
fn fuse_weighted(
    vector_hits: Vec<SearchHit>,
    keyword_hits: Vec<SearchHit>,
    vector_weight: f64,
    keyword_weight: f64,
) -> Vec<SearchHit> {
    let bm25: Vec<f64> = keyword_hits.iter().filter_map(|h| h.keyword_score).collect();
    let max_bm = bm25.iter().cloned().fold(f64::MIN, f64::max);
    let min_bm = bm25.iter().cloned().fold(f64::MAX, f64::min);
    let normalize = |s: f64| -> f64 {
        if (max_bm - min_bm).abs() < f64::EPSILON {
            1.0
        } else {
            (max_bm - s) / (max_bm - min_bm)
        }
    };

    let mut merged: HashMap<(String, String), SearchHit> = HashMap::new();
    for hit in vector_hits {
        let key = dedup_key(&hit);
        let entry = merged.entry(key).or_insert_with(|| hit.clone());
        entry.vector_score = hit.vector_score.or(entry.vector_score);
    }
    for hit in keyword_hits {
        let key = dedup_key(&hit);
        let entry = merged.entry(key).or_insert_with(|| hit.clone());
        entry.keyword_score = hit.keyword_score.or(entry.keyword_score);
    }

    let mut out: Vec<SearchHit> = merged
        .into_values()
        .map(|mut h| {
            let v = h.vector_score.unwrap_or(0.0).max(0.0);
            let k = h.keyword_score.map(normalize).unwrap_or(0.0);
            h.score = vector_weight * v + keyword_weight * k;
            h
        })
        .collect();
    out.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    out
}

/// Words of unicode letters/digits; Hangul ranges count as letters.
fn tokenize(query: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for c in query.chars() {
        if c.is_alphanumeric() {
            current.push(c.to_lowercase().next().unwrap_or(c));
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn is_cjk(c: char) -> bool {
    matches!(
        c as u32,
        0x1100..=0x11FF | 0x3130..=0x318F | 0xAC00..=0xD7A3  // Hangul
        | 0x3040..=0x30FF                                     // Kana
        | 0x4E00..=0x9FFF                                     // CJK ideographs
    )
}

/// Short CJK inputs tokenize into fragments FTS cannot match well;
/// substring search does better there.
fn needs_substring_fallback(query: &str, tokens: &[String]) -> bool {
    let trimmed = query.trim();
    trimmed.chars().any(is_cjk) && trimmed.chars().count() <= 4 && tokens.len() <= 1
}

fn apply_filters(sql: &mut String, binds: &mut Vec<String>, filters: &SearchFilters) {
    apply_filters_aliased(sql, binds, filters, "")
}

fn apply_filters_aliased(
    sql: &mut String,
    binds: &mut Vec<String>,
    filters: &SearchFilters,
    alias: &str,
) {
    let prefix = if alias.is_empty() {
        String::new()
    } else {
        format!("{}.", alias)
    };
    if let Some(days) = filters.max_age_days {
        let cutoff = Utc::now().timestamp() - days * 86_400;
        sql.push_str(&format!(" AND {}mtime >= {}", prefix, cutoff));
    }
    if let Some(sources) = &filters.sources {
        if !sources.is_empty() {
            let placeholders = vec!["?"; sources.len()].join(", ");
            sql.push_str(&format!(" AND {}source IN ({})", prefix, placeholders));
            binds.extend(sources.iter().cloned());
        }
    }
}

fn result_cache_key(
    query_vec: &[f32],
    top_k: usize,
    min_score: f64,
    filters: &SearchFilters,
) -> String {
    let head: Vec<String> = query_vec
        .iter()
        .take(10)
        .map(|v| format!("{:.3}", v))
        .collect();
    format!(
        "{}|k{}|s{:.2}|a{:?}|src{:?}",
        head.join(","),
        top_k,
        min_score,
        filters.max_age_days,
        filters.sources
    )
}
