//! Namespace-partitioned vector storage with cosine similarity search
use chrono::Utc;
use rusqlite::params;
use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::{Chunk, ScoredChunk};
use crate::record_store::{format_timestamp, migrate, migration::Migrations, open_file_pool, open_memory_pool, SqliteConn, SqlitePool};

const VECTOR_MIGRATIONS: Migrations = &[(1, include_str!("migrations/001_vectors.sql"))];

#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: String,
    pub namespace: String,
    pub chunk_index: usize,
    pub page: u32,
    pub content: String,
    pub embedding: Vec<f32>,
}

impl VectorRecord {
    pub fn new(namespace: &str, chunk: &Chunk, embedding: Vec<f32>) -> Self {
        Self {
            id: chunk_id(namespace, chunk.index),
            namespace: namespace.to_string(),
            chunk_index: chunk.index,
            page: chunk.page,
            content: chunk.content.clone(),
            embedding,
        }
    }
}

/// Stable id of a chunk position within a namespace.
pub fn chunk_id(namespace: &str, chunk_index: usize) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(namespace.as_bytes());
    hasher.update(&[0]);
    hasher.update(&(chunk_index as u64).to_le_bytes());
    hasher.finalize().to_hex().to_string()
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    let denom = norm_a * norm_b;
    if denom < f32::EPSILON { 0.0 } else { dot / denom }
}

pub struct SqliteVectorIndex {
    pool: SqlitePool,
}

impl SqliteVectorIndex {
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        info!("Opening vector index at: {}", db_path.display());
        let pool = open_file_pool(db_path, 4)?;
        migrate(&pool, VECTOR_MIGRATIONS)?;
        Ok(Self { pool: Arc::new(pool) })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let pool = open_memory_pool()?;
        migrate(&pool, VECTOR_MIGRATIONS)?;
        Ok(Self { pool: Arc::new(pool) })
    }

    fn get_conn(&self) -> anyhow::Result<SqliteConn> {
        self.pool.get().map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    /// Inserts or overwrites records by id.
    pub fn upsert(&self, records: &[VectorRecord], embedding_model: &str) -> anyhow::Result<usize> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let now = format_timestamp(Utc::now());
        {
            let mut stmt = tx.prepare(
                "INSERT INTO vectors (id, namespace, chunk_index, page, content, embedding, embedding_model, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                    page = excluded.page,
                    content = excluded.content,
                    embedding = excluded.embedding,
                    embedding_model = excluded.embedding_model,
                    updated_at = excluded.updated_at",
            )?;
            for record in records {
                let embedding_bytes = bincode::serialize(&record.embedding)?;
                stmt.execute(params![
                    record.id,
                    record.namespace,
                    record.chunk_index as i64,
                    record.page,
                    record.content,
                    embedding_bytes,
                    embedding_model,
                    now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(records.len())
    }

    /// Drops chunks at positions `keep..`, left over from a longer earlier run.
    pub fn truncate_namespace(&self, namespace: &str, keep: usize) -> anyhow::Result<usize> {
        let conn = self.get_conn()?;
        let removed = conn.execute(
            "DELETE FROM vectors WHERE namespace = ?1 AND chunk_index >= ?2",
            params![namespace, keep as i64],
        )?;
        if removed > 0 {
            debug!("Removed {} stale vector(s) from namespace {}", removed, namespace);
        }
        Ok(removed)
    }

    pub fn delete_namespace(&self, namespace: &str) -> anyhow::Result<usize> {
        let conn = self.get_conn()?;
        Ok(conn.execute("DELETE FROM vectors WHERE namespace = ?1", [namespace])?)
    }

    pub fn count(&self, namespace: &str) -> anyhow::Result<usize> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM vectors WHERE namespace = ?1",
            [namespace],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Linear scan of the namespace, best matches first.
    pub fn query(&self, namespace: &str, query_embedding: &[f32], top_k: usize) -> anyhow::Result<Vec<ScoredChunk>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT page, content, embedding FROM vectors WHERE namespace = ?1",
        )?;
        let mut rows = stmt.query([namespace])?;

        let mut matches = Vec::new();
        while let Some(row) = rows.next()? {
            let embedding_bytes: Vec<u8> = row.get(2)?;
            let embedding: Vec<f32> = bincode::deserialize(&embedding_bytes)
                .map_err(|e| anyhow::anyhow!("Deserialization error: {}", e))?;
            matches.push(ScoredChunk {
                page: row.get(0)?,
                content: row.get(1)?,
                score: cosine_similarity(query_embedding, &embedding),
            });
        }

        matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        matches.truncate(top_k);
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(index: usize, content: &str) -> Chunk {
        Chunk {
            content: content.to_string(),
            page: 1,
            index,
        }
    }

    #[test]
    fn test_chunk_ids_are_stable_and_distinct() {
        assert_eq!(chunk_id("U1::a_pdf", 0), chunk_id("U1::a_pdf", 0));
        assert_ne!(chunk_id("U1::a_pdf", 0), chunk_id("U1::a_pdf", 1));
        assert_ne!(chunk_id("U1::a_pdf", 0), chunk_id("U1::b_pdf", 0));
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_reupsert_overwrites() {
        let index = SqliteVectorIndex::open_in_memory().unwrap();
        let records = vec![
            VectorRecord::new("ns", &chunk(0, "a"), vec![1.0, 0.0]),
            VectorRecord::new("ns", &chunk(1, "b"), vec![0.0, 1.0]),
        ];
        index.upsert(&records, "m").unwrap();
        index.upsert(&records, "m").unwrap();
        assert_eq!(index.count("ns").unwrap(), 2);
    }

    #[test]
    fn test_query_ranks_within_namespace() {
        let index = SqliteVectorIndex::open_in_memory().unwrap();
        index
            .upsert(
                &[
                    VectorRecord::new("ns", &chunk(0, "east"), vec![1.0, 0.0]),
                    VectorRecord::new("ns", &chunk(1, "north"), vec![0.0, 1.0]),
                    VectorRecord::new("ns", &chunk(2, "north-east"), vec![0.7, 0.7]),
                    VectorRecord::new("other", &chunk(0, "elsewhere"), vec![1.0, 0.0]),
                ],
                "m",
            )
            .unwrap();

        let results = index.query("ns", &[1.0, 0.1], 2).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].content, "east");
        assert_eq!(results[1].content, "north-east");
    }

    #[test]
    fn test_truncate_and_delete_namespace() {
        let index = SqliteVectorIndex::open_in_memory().unwrap();
        let records: Vec<_> = (0..5)
            .map(|i| VectorRecord::new("ns", &chunk(i, "x"), vec![1.0]))
            .collect();
        index.upsert(&records, "m").unwrap();

        assert_eq!(index.truncate_namespace("ns", 3).unwrap(), 2);
        assert_eq!(index.count("ns").unwrap(), 3);
        assert_eq!(index.delete_namespace("ns").unwrap(), 3);
        assert_eq!(index.count("ns").unwrap(), 0);
    }
}
