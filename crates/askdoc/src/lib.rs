// askdoc/crates/askdoc/src/lib.rs

pub mod cache_store;
pub mod chat;
pub mod config;
pub mod documents;
pub mod ingestion;
pub mod job_queue;
pub mod metrics;
pub mod notify;
pub mod record_store;
pub mod shared_state;
pub mod telemetry;
pub mod utils;
pub mod worker_pool;
pub mod worker_server;
pub mod workers;

#[cfg(test)]
mod test_support;

// Public API exports
pub use config::Config;
pub use shared_state::AppState;
pub use worker_server::run_worker_server;

pub use cache_store::{HistoryCache, MokaHistoryCache};
pub use chat::{AnswerChain, ChatError, ChatHistorySync, ChatReply, ChatService, RagChain};
pub use documents::{DocumentService, StoredUpload, UploadError, UploadReceipt};
pub use ingestion::{IngestionPipeline, LocalPipeline, Retriever};
pub use job_queue::{Job, JobOptions, JobStore, Queue, UnrecoverableError};
pub use notify::{BroadcastNotifier, ProgressEvent, ProgressNotifier};
pub use record_store::{Document, DocumentStatus, Message, RecordStore, Session, StoreError};
pub use worker_pool::{BaseWorker, Worker, WorkerManager};
pub use workers::{DocumentJob, DocumentWorker};
