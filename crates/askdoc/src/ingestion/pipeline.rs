//! Local ingestion pipeline: file loader, splitter, HTTP embedder, SQLite index
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::embedder::Embedder;
use super::loader::load_pages;
use super::splitter::RecursiveSplitter;
use super::vector_index::{SqliteVectorIndex, VectorRecord};
use super::{Chunk, IngestionPipeline, LoadedDocument, ProgressSink, Retriever, ScoredChunk};

/// Chunks embedded and written per round; progress is reported after each.
const UPSERT_BATCH_SIZE: usize = 32;

pub struct LocalPipeline {
    splitter: RecursiveSplitter,
    embedder: Arc<dyn Embedder>,
    index: Arc<SqliteVectorIndex>,
}

impl LocalPipeline {
    pub fn new(splitter: RecursiveSplitter, embedder: Arc<dyn Embedder>, index: Arc<SqliteVectorIndex>) -> Self {
        Self { splitter, embedder, index }
    }

    pub fn index(&self) -> &Arc<SqliteVectorIndex> {
        &self.index
    }
}

#[async_trait]
impl IngestionPipeline for LocalPipeline {
    async fn load_and_split(&self, path: &Path) -> anyhow::Result<LoadedDocument> {
        let pages = load_pages(path).await?;
        let chunks = self.splitter.split_pages(&pages);
        debug!(
            "Split {} into {} chunk(s) across {} page(s)",
            path.display(),
            chunks.len(),
            pages.len()
        );
        Ok(LoadedDocument {
            chunks,
            page_count: pages.len(),
        })
    }

    async fn upsert(&self, namespace: &str, chunks: &[Chunk], progress: &ProgressSink) -> anyhow::Result<usize> {
        let total = chunks.len();
        let mut stored = 0;

        for batch in chunks.chunks(UPSERT_BATCH_SIZE) {
            let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
            let embeddings = self.embedder.embed(&texts).await?;
            let records: Vec<VectorRecord> = batch
                .iter()
                .zip(embeddings)
                .map(|(chunk, embedding)| VectorRecord::new(namespace, chunk, embedding))
                .collect();
            stored += self.index.upsert(&records, self.embedder.model_name())?;
            progress(stored as f32 / total as f32);
        }

        self.index.truncate_namespace(namespace, total)?;
        info!("Indexed {} chunk(s) under namespace {}", stored, namespace);
        Ok(stored)
    }

    async fn delete_namespace(&self, namespace: &str) -> anyhow::Result<usize> {
        let removed = self.index.delete_namespace(namespace)?;
        info!("Deleted {} vector(s) from namespace {}", removed, namespace);
        Ok(removed)
    }
}

#[async_trait]
impl Retriever for LocalPipeline {
    async fn retrieve(&self, namespace: &str, query: &str, top_k: usize) -> anyhow::Result<Vec<ScoredChunk>> {
        let mut embeddings = self.embedder.embed(&[query.to_string()]).await?;
        let query_embedding = embeddings
            .pop()
            .ok_or_else(|| anyhow::anyhow!("Embedding endpoint returned no vector for the query"))?;
        self.index.query(namespace, &query_embedding, top_k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Embeds text as (length, vowel count) so results are predictable.
    struct ShapeEmbedder;

    #[async_trait]
    impl Embedder for ShapeEmbedder {
        fn model_name(&self) -> &str {
            "shape"
        }

        async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    let vowels = t.chars().filter(|c| "aeiou".contains(*c)).count();
                    vec![t.len() as f32, vowels as f32]
                })
                .collect())
        }
    }

    fn pipeline() -> LocalPipeline {
        LocalPipeline::new(
            RecursiveSplitter::new(40, 0),
            Arc::new(ShapeEmbedder),
            Arc::new(SqliteVectorIndex::open_in_memory().unwrap()),
        )
    }

    fn chunks(count: usize) -> Vec<Chunk> {
        (0..count)
            .map(|i| Chunk {
                content: format!("chunk number {}", i),
                page: 1,
                index: i,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_load_and_split_text_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "A first paragraph of notes.\n\nA second paragraph of notes.").unwrap();

        let loaded = pipeline().load_and_split(&path).await.unwrap();
        assert_eq!(loaded.page_count, 1);
        assert_eq!(loaded.chunks.len(), 2);
    }

    #[tokio::test]
    async fn test_upsert_reports_progress_and_is_repeatable() {
        let pipeline = pipeline();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = Arc::clone(&seen);
            move |p: f32| seen.lock().unwrap().push(p)
        };

        assert_eq!(pipeline.upsert("U1::a_pdf", &chunks(40), &sink).await.unwrap(), 40);
        assert_eq!(pipeline.upsert("U1::a_pdf", &chunks(40), &sink).await.unwrap(), 40);
        assert_eq!(pipeline.index().count("U1::a_pdf").unwrap(), 40);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.last().copied(), Some(1.0));
        assert!(seen.windows(2).take(1).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_shorter_rerun_drops_stale_chunks() {
        let pipeline = pipeline();
        pipeline.upsert("ns", &chunks(10), &|_: f32| {}).await.unwrap();
        pipeline.upsert("ns", &chunks(4), &|_: f32| {}).await.unwrap();
        assert_eq!(pipeline.index().count("ns").unwrap(), 4);
    }

    #[tokio::test]
    async fn test_retrieve_and_delete() {
        let pipeline = pipeline();
        pipeline.upsert("ns", &chunks(3), &|_: f32| {}).await.unwrap();

        let hits = pipeline.retrieve("ns", "chunk number 1", 2).await.unwrap();
        assert_eq!(hits.len(), 2);

        assert_eq!(pipeline.delete_namespace("ns").await.unwrap(), 3);
        assert!(pipeline.retrieve("ns", "anything", 2).await.unwrap().is_empty());
    }
}
