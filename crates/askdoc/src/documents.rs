//! Document uploads, listing and deletion
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::ingestion::IngestionPipeline;
use crate::job_queue::QueueError;
use crate::record_store::{Document, DocumentStatus, NewDocument, RecordStore, StoreError};
use crate::utils::{document_namespace, truncate_chars};
use crate::workers::{DocumentBaseWorker, DocumentJob};

pub const PDF_MIME_TYPE: &str = "application/pdf";
pub const MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;
const MAX_FILENAME_CHARS: usize = 255;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("a document with this name already exists (namespace '{namespace}')")]
    AlreadyExists { namespace: String, existing: Box<Document> },

    #[error("only PDF files are allowed, got '{0}'")]
    UnsupportedType(String),

    #[error("file is {0} bytes, the limit is 10 MiB")]
    TooLarge(u64),

    #[error("document '{0}' not found")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to enqueue ingestion job: {0}")]
    Queue(#[from] QueueError),

    #[error("upload i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Name an upload is stored under: `<timestamp>-<base><ext>`, at most 255
/// characters. Only the base name is shortened.
pub fn stored_filename(original_name: &str, now: DateTime<Utc>) -> String {
    let file_name = Path::new(original_name)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| original_name.to_string());
    let (base, ext) = match file_name.rfind('.') {
        Some(dot) if dot > 0 => file_name.split_at(dot),
        _ => (file_name.as_str(), ""),
    };
    let prefix = format!("{}-", now.format("%Y-%m-%d-%H-%M-%S"));
    let available = MAX_FILENAME_CHARS.saturating_sub(prefix.chars().count() + ext.chars().count());
    format!("{}{}{}", prefix, truncate_chars(base, available), ext)
}

/// A file already written to the upload directory.
#[derive(Debug, Clone)]
pub struct StoredUpload {
    pub external_user_id: String,
    pub email: Option<String>,
    pub original_name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub mime_type: String,
    pub notify_target: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UploadReceipt {
    pub document: Document,
    pub job_id: i64,
}

pub struct DocumentService {
    records: Arc<RecordStore>,
    pipeline: Arc<dyn IngestionPipeline>,
    ingest: Arc<DocumentBaseWorker>,
    upload_dir: PathBuf,
}

impl DocumentService {
    pub fn new(
        records: Arc<RecordStore>,
        pipeline: Arc<dyn IngestionPipeline>,
        ingest: Arc<DocumentBaseWorker>,
        upload_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            records,
            pipeline,
            ingest,
            upload_dir: upload_dir.into(),
        }
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    /// Copies a local file into the upload directory under its stored name.
    pub async fn store_file(&self, source: &Path, original_name: &str) -> Result<(PathBuf, u64), UploadError> {
        tokio::fs::create_dir_all(&self.upload_dir).await?;
        let target = self.upload_dir.join(stored_filename(original_name, Utc::now()));
        let size = tokio::fs::copy(source, &target).await?;
        Ok((target, size))
    }

    /// Registers a stored upload and queues it for ingestion.
    ///
    /// A namespace collision returns the existing document and queues
    /// nothing. A rejected upload's file is removed.
    pub async fn upload(&self, upload: StoredUpload) -> Result<UploadReceipt, UploadError> {
        info!(
            user = %upload.external_user_id,
            filename = %upload.original_name,
            size = upload.size_bytes,
            "Processing document upload"
        );
        if upload.mime_type != PDF_MIME_TYPE {
            remove_file_logged(&upload.path).await;
            return Err(UploadError::UnsupportedType(upload.mime_type));
        }
        if upload.size_bytes > MAX_UPLOAD_BYTES {
            remove_file_logged(&upload.path).await;
            return Err(UploadError::TooLarge(upload.size_bytes));
        }

        let user = self
            .records
            .users
            .ensure_user(&upload.external_user_id, upload.email.as_deref())?;
        let namespace = document_namespace(&upload.external_user_id, &upload.original_name);
        let filename = upload
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let created = self.records.documents.create_document(NewDocument {
            user_id: user.id,
            filename,
            original_name: upload.original_name.clone(),
            mime_type: upload.mime_type,
            size_bytes: upload.size_bytes as i64,
            namespace: namespace.clone(),
            path: upload.path.to_string_lossy().into_owned(),
        });
        let mut document = match created {
            Ok(document) => document,
            Err(StoreError::DuplicateNamespace(namespace)) => {
                warn!(namespace = %namespace, "Document with same namespace already exists");
                remove_file_logged(&upload.path).await;
                let existing = self
                    .records
                    .documents
                    .get_document_by_namespace(&namespace)?
                    .ok_or_else(|| StoreError::DuplicateNamespace(namespace.clone()))?;
                return Err(UploadError::AlreadyExists {
                    namespace,
                    existing: Box::new(existing),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let job = DocumentJob::new(&document.id, upload.notify_target);
        let job_id = match self.ingest.add_job(&job, None) {
            Ok(job_id) => job_id,
            Err(e) => {
                error!(document_id = %document.id, "Failed to enqueue ingestion job: {}", e);
                document.status = DocumentStatus::Failed;
                document.error = Some(format!("failed to enqueue ingestion job: {}", e));
                if let Err(save_error) = self.records.documents.save_document(&mut document) {
                    error!(document_id = %document.id, "Failed to record enqueue failure: {}", save_error);
                }
                return Err(e.into());
            }
        };

        info!(document_id = %document.id, job_id, namespace = %namespace, "Document queued for ingestion");
        Ok(UploadReceipt { document, job_id })
    }

    pub fn list(&self, user_id: &str) -> Result<Vec<Document>, UploadError> {
        Ok(self.records.documents.list_documents_for_user(user_id)?)
    }

    pub fn get(&self, document_id: &str, user_id: &str) -> Result<Document, UploadError> {
        self.records
            .documents
            .get_document_for_owner(document_id, user_id)?
            .ok_or_else(|| UploadError::NotFound(document_id.to_string()))
    }

    /// Removes the stored file, the namespace vectors and the record.
    ///
    /// Only the record deletion can fail the call.
    pub async fn delete(&self, document_id: &str, user_id: &str) -> Result<(), UploadError> {
        let document = self.get(document_id, user_id)?;
        info!(document_id, namespace = %document.namespace, "Deleting document");

        remove_file_logged(Path::new(&document.path)).await;
        match self.pipeline.delete_namespace(&document.namespace).await {
            Ok(removed) => info!(document_id, namespace = %document.namespace, removed, "Deleted vectors"),
            Err(e) => error!(document_id, namespace = %document.namespace, "Vector deletion failed: {:#}", e),
        }

        self.records.documents.delete_document(document_id)?;
        info!(document_id, "Document deleted");
        Ok(())
    }
}

async fn remove_file_logged(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        error!(path = %path.display(), "File deletion failed: {}", e);
    }
}
