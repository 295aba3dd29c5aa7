//! Document ingestion - load, split, embed and index uploaded files
//!
//! Every document's vectors live under its namespace. Chunk ids are derived
//! from the namespace and chunk position, so running the pipeline twice for
//! the same document overwrites its vectors instead of duplicating them.
pub mod embedder;
pub mod loader;
pub mod pipeline;
pub mod splitter;
pub mod vector_index;

pub use embedder::{Embedder, HttpEmbedder};
pub use pipeline::LocalPipeline;
pub use splitter::RecursiveSplitter;
pub use vector_index::{SqliteVectorIndex, VectorRecord};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub content: String,
    /// 1-based page the chunk was cut from.
    pub page: u32,
    /// Position within the whole document, starting at 0.
    pub index: usize,
}

#[derive(Debug, Clone)]
pub struct LoadedDocument {
    pub chunks: Vec<Chunk>,
    pub page_count: usize,
}

/// Chunk returned by a similarity search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub content: String,
    pub page: u32,
    pub score: f32,
}

/// Receives pipeline progress as a fraction between 0.0 and 1.0.
pub type ProgressSink = dyn Fn(f32) + Send + Sync;

#[async_trait]
pub trait IngestionPipeline: Send + Sync {
    async fn load_and_split(&self, path: &Path) -> anyhow::Result<LoadedDocument>;

    /// Embeds and stores `chunks` under `namespace`, replacing whatever the
    /// namespace held before. Returns the number of vectors stored.
    async fn upsert(&self, namespace: &str, chunks: &[Chunk], progress: &ProgressSink) -> anyhow::Result<usize>;

    async fn delete_namespace(&self, namespace: &str) -> anyhow::Result<usize>;
}

/// Similarity search over one document's namespace.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, namespace: &str, query: &str, top_k: usize) -> anyhow::Result<Vec<ScoredChunk>>;
}
