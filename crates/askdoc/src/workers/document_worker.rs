//! Document ingestion worker
//!
//! Drives one uploaded document through `pending -> processing -> indexed |
//! failed`, indexes its chunks under the document namespace and opens the
//! first chat session once the document is searchable.
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use validator::Validate;

use crate::ingestion::{Chunk, IngestionPipeline};
use crate::job_queue::Job;
use crate::notify::{ProgressEvent, ProgressNotifier};
use crate::record_store::{Document, DocumentStatus, NewSession, RecordStore, Session, StoreError};
use crate::utils::truncate_chars;
use crate::worker_pool::{BaseWorker, Worker};

pub const DOCUMENT_WORKER_NAME: &str = "document-worker";
pub const DOCUMENT_QUEUE_NAME: &str = "document-queue";
pub const DEFAULT_DOCUMENT_CONCURRENCY: usize = 2;

const MAX_DOCUMENT_ERROR_CHARS: usize = 2000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DocumentJob {
    #[validate(length(min = 1))]
    pub document_id: String,
    /// Where progress events go, typically a client socket id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_target: Option<String>,
}

impl DocumentJob {
    pub fn new(document_id: impl Into<String>, notify_target: Option<String>) -> Self {
        Self {
            document_id: document_id.into(),
            notify_target,
        }
    }
}

pub type DocumentBaseWorker = BaseWorker<DocumentWorker>;

pub struct DocumentWorker {
    records: Arc<RecordStore>,
    pipeline: Arc<dyn IngestionPipeline>,
    notifier: Arc<dyn ProgressNotifier>,
    concurrency: usize,
}

impl DocumentWorker {
    pub fn new(
        records: Arc<RecordStore>,
        pipeline: Arc<dyn IngestionPipeline>,
        notifier: Arc<dyn ProgressNotifier>,
        concurrency: usize,
    ) -> Self {
        Self {
            records,
            pipeline,
            notifier,
            concurrency,
        }
    }

    /// Title of the session opened for a freshly indexed document.
    pub fn session_title(original_name: &str) -> String {
        format!("Chat about {}", original_name)
    }

    fn ensure_initial_session(&self, document: &Document) -> anyhow::Result<Session> {
        let (session, created) = self.records.sessions.create_initial_session(NewSession {
            user_id: document.user_id.clone(),
            document_id: document.id.clone(),
            title: Self::session_title(&document.original_name),
        })?;
        if !created {
            info!(document_id = %document.id, session_id = %session.id, "Reusing existing session");
        }
        Ok(session)
    }

    async fn notify(&self, target: Option<&str>, event: ProgressEvent) {
        if let Some(target) = target {
            self.notifier.notify(target, event).await;
        }
    }

    /// Everything after the `processing` write. Any error here leaves the
    /// document `failed`.
    async fn ingest(&self, document: &mut Document, target: Option<&str>) -> anyhow::Result<Session> {
        self.notify(target, ProgressEvent::started(&document.id)).await;

        let loaded = self.pipeline.load_and_split(Path::new(&document.path)).await?;
        info!(
            document_id = %document.id,
            pages = loaded.page_count,
            chunks = loaded.chunks.len(),
            "Document loaded and split"
        );

        self.upsert_with_progress(document, &loaded.chunks, target).await?;

        document.status = DocumentStatus::Indexed;
        document.error = None;
        document.processed_at = Some(Utc::now());
        document.page_count = Some(loaded.page_count as i64);
        document.chunk_count = Some(loaded.chunks.len() as i64);
        self.records.documents.save_document(document)?;

        self.ensure_initial_session(document)
    }

    async fn upsert_with_progress(
        &self,
        document: &Document,
        chunks: &[Chunk],
        target: Option<&str>,
    ) -> anyhow::Result<usize> {
        let Some(target) = target else {
            return self.pipeline.upsert(&document.namespace, chunks, &|_: f32| {}).await;
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<f32>();
        let notifier = Arc::clone(&self.notifier);
        let document_id = document.id.clone();
        let target = target.to_string();
        let forwarder = tokio::spawn(async move {
            while let Some(progress) = rx.recv().await {
                notifier
                    .notify(&target, ProgressEvent::progress(&document_id, progress))
                    .await;
            }
        });

        let sink = move |progress: f32| {
            let _ = tx.send(progress);
        };
        let result = self.pipeline.upsert(&document.namespace, chunks, &sink).await;
        drop(sink);

        if let Err(e) = forwarder.await {
            warn!(document_id = %document.id, "Progress forwarder ended abnormally: {}", e);
        }
        result
    }

    fn mark_failed(&self, document: &mut Document, err: &anyhow::Error) {
        document.status = DocumentStatus::Failed;
        document.error = Some(truncate_chars(&format!("{:#}", err), MAX_DOCUMENT_ERROR_CHARS).into_owned());
        if let Err(e) = self.records.documents.save_document(document) {
            error!(document_id = %document.id, "Failed to record document failure: {}", e);
        }
    }
}

#[async_trait]
impl Worker for DocumentWorker {
    type Payload = DocumentJob;

    fn name(&self) -> &str {
        DOCUMENT_WORKER_NAME
    }

    fn queue_name(&self) -> &str {
        DOCUMENT_QUEUE_NAME
    }

    fn concurrency(&self) -> usize {
        self.concurrency
    }

    async fn process(&self, job: &Job, payload: DocumentJob) -> anyhow::Result<()> {
        let document_id = payload.document_id.as_str();
        let target = payload.notify_target.as_deref();

        // A missing row may just not be visible yet; the retry covers it.
        let mut document = self
            .records
            .documents
            .get_document(document_id)?
            .ok_or_else(|| StoreError::not_found("document", document_id))?;

        info!(
            job_id = job.id,
            document_id,
            attempt = job.attempts_made,
            status = %document.status,
            "Processing document"
        );

        if document.status == DocumentStatus::Indexed {
            let session = self.ensure_initial_session(&document)?;
            self.notify(target, ProgressEvent::completed(&document.id, &session.id)).await;
            return Ok(());
        }

        document.status = DocumentStatus::Processing;
        self.records.documents.save_document(&mut document)?;

        match self.ingest(&mut document, target).await {
            Ok(session) => {
                info!(
                    job_id = job.id,
                    document_id,
                    session_id = %session.id,
                    "Document indexed"
                );
                self.notify(target, ProgressEvent::completed(&document.id, &session.id)).await;
                Ok(())
            }
            Err(e) => {
                error!(job_id = job.id, document_id, "Document processing failed: {:#}", e);
                self.mark_failed(&mut document, &e);
                Err(e)
            }
        }
    }
}
