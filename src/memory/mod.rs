mod chunker;
mod embeddings;
mod store;

pub use chunker::{chunk_markdown, MemoryChunk};
pub use embeddings::{cosine, EmbeddingEngine, EMBEDDING_DIM};
pub use store::{FusionMode, MemoryStore, SearchFilters, SearchHit};
