//! Fakes shared by unit tests across modules
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::cache_store::HistoryCache;
use crate::ingestion::{Chunk, IngestionPipeline, LoadedDocument, ProgressSink, Retriever, ScoredChunk};
use crate::notify::{ProgressEvent, ProgressNotifier};
use crate::record_store::{Document, Message, NewDocument, RecordStore, User};

/// Pipeline that produces a fixed number of pages and chunks and can be
/// scripted to fail the next upserts.
pub struct FakePipeline {
    page_count: usize,
    chunk_count: usize,
    upsert_failures: Mutex<VecDeque<String>>,
    upsert_calls: AtomicUsize,
    deleted: Mutex<Vec<String>>,
    passages: Vec<ScoredChunk>,
}

impl FakePipeline {
    pub fn new(page_count: usize, chunk_count: usize) -> Self {
        Self {
            page_count,
            chunk_count,
            upsert_failures: Mutex::new(VecDeque::new()),
            upsert_calls: AtomicUsize::new(0),
            deleted: Mutex::new(Vec::new()),
            passages: vec![ScoredChunk {
                content: "Revenue grew 12% in Q3.".to_string(),
                page: 4,
                score: 0.9,
            }],
        }
    }

    /// The next upserts fail with these messages, in order.
    pub fn fail_next_upserts<I, S>(&self, messages: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.upsert_failures
            .lock()
            .unwrap()
            .extend(messages.into_iter().map(Into::into));
    }

    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    pub fn deleted_namespaces(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl IngestionPipeline for FakePipeline {
    async fn load_and_split(&self, _path: &Path) -> anyhow::Result<LoadedDocument> {
        let chunks = (0..self.chunk_count)
            .map(|index| Chunk {
                content: format!("chunk {}", index),
                page: (index * self.page_count / self.chunk_count.max(1)) as u32 + 1,
                index,
            })
            .collect();
        Ok(LoadedDocument {
            chunks,
            page_count: self.page_count,
        })
    }

    async fn upsert(&self, _namespace: &str, chunks: &[Chunk], progress: &ProgressSink) -> anyhow::Result<usize> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        let failure = self.upsert_failures.lock().unwrap().pop_front();
        if let Some(message) = failure {
            return Err(anyhow::anyhow!(message));
        }
        progress(0.5);
        progress(1.0);
        Ok(chunks.len())
    }

    async fn delete_namespace(&self, namespace: &str) -> anyhow::Result<usize> {
        self.deleted.lock().unwrap().push(namespace.to_string());
        Ok(self.chunk_count)
    }
}

#[async_trait]
impl Retriever for FakePipeline {
    async fn retrieve(&self, _namespace: &str, _query: &str, top_k: usize) -> anyhow::Result<Vec<ScoredChunk>> {
        Ok(self.passages.iter().take(top_k).cloned().collect())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<(String, ProgressEvent)>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<(String, ProgressEvent)> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProgressNotifier for RecordingNotifier {
    async fn notify(&self, target: &str, event: ProgressEvent) {
        self.events.lock().unwrap().push((target.to_string(), event));
    }
}

/// Cache whose every operation fails.
pub struct FailingCache;

#[async_trait]
impl HistoryCache for FailingCache {
    async fn get(&self, _session_id: &str) -> anyhow::Result<Option<Vec<Message>>> {
        Err(anyhow::anyhow!("cache unavailable"))
    }

    async fn append(&self, _session_id: &str, _messages: &[Message]) -> anyhow::Result<()> {
        Err(anyhow::anyhow!("cache unavailable"))
    }

    async fn replace(&self, _session_id: &str, _messages: Vec<Message>) -> anyhow::Result<()> {
        Err(anyhow::anyhow!("cache unavailable"))
    }

    async fn clear(&self, _session_id: &str) -> anyhow::Result<()> {
        Err(anyhow::anyhow!("cache unavailable"))
    }
}

pub fn memory_records() -> Arc<RecordStore> {
    Arc::new(RecordStore::open_in_memory().unwrap())
}

/// Creates user `external_id` with a pending document for `original_name`.
pub fn seed_document(records: &RecordStore, external_id: &str, original_name: &str) -> (User, Document) {
    let user = records.users.ensure_user(external_id, None).unwrap();
    let document = records
        .documents
        .create_document(NewDocument {
            user_id: user.id.clone(),
            filename: format!("{}-{}", uuid::Uuid::new_v4().simple(), original_name),
            original_name: original_name.to_string(),
            mime_type: "application/pdf".to_string(),
            size_bytes: 2048,
            namespace: crate::utils::document_namespace(external_id, original_name),
            path: format!("uploads/{}", original_name),
        })
        .unwrap();
    (user, document)
}
