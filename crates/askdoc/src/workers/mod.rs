//! Job types processed by the worker pool
pub mod document_worker;

pub use document_worker::{DocumentBaseWorker, DocumentJob, DocumentWorker, DOCUMENT_QUEUE_NAME, DOCUMENT_WORKER_NAME};
