//! Application state: every store, worker and service wired from one [`Config`]
//!
//! Worker and chat processes build the same state over the same files, so a
//! document indexed by the worker is searchable from chat right away and a
//! cached chat history is seen by every process.
use std::sync::Arc;
use tracing::info;

use crate::cache_store::{HistoryCache, MokaHistoryCache, SqliteHistoryCache};
use crate::chat::{ChatHistorySync, ChatService, RagChain};
use crate::config::Config;
use crate::documents::DocumentService;
use crate::ingestion::{HttpEmbedder, LocalPipeline, RecursiveSplitter, SqliteVectorIndex};
use crate::job_queue::JobStore;
use crate::notify::BroadcastNotifier;
use crate::record_store::RecordStore;
use crate::worker_pool::{Consumer, WorkerManager};
use crate::workers::{DocumentBaseWorker, DocumentWorker};

pub struct AppState {
    pub config: Arc<Config>,
    pub records: Arc<RecordStore>,
    pub jobs: Arc<JobStore>,
    pub pipeline: Arc<LocalPipeline>,
    pub notifier: Arc<BroadcastNotifier>,
    pub worker_manager: Arc<WorkerManager>,
    pub document_worker: Arc<DocumentBaseWorker>,
    pub history: Arc<ChatHistorySync>,
    pub chat: Arc<ChatService>,
    pub documents: Arc<DocumentService>,
}

impl AppState {
    /// Opens the record, queue, vector and history cache databases named by `config`.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        info!("Initializing application state");
        let records = Arc::new(RecordStore::open(&config.db_path)?);
        let jobs = Arc::new(JobStore::open(&config.queue_db_path)?);
        let vectors = Arc::new(SqliteVectorIndex::open(&config.vector_db_path)?);
        let cache = Arc::new(SqliteHistoryCache::open(&config.cache_db_path, config.chat_history_ttl())?);
        Ok(Self::assemble(config, records, jobs, vectors, cache))
    }

    /// Same wiring over in-memory databases, with a process-local history cache.
    pub fn in_memory(config: Config) -> anyhow::Result<Self> {
        let records = Arc::new(RecordStore::open_in_memory()?);
        let jobs = Arc::new(JobStore::open_in_memory()?);
        let vectors = Arc::new(SqliteVectorIndex::open_in_memory()?);
        let cache = Arc::new(MokaHistoryCache::new(
            config.chat_history_ttl(),
            config.chat_cache_capacity,
        ));
        Ok(Self::assemble(config, records, jobs, vectors, cache))
    }

    fn assemble(
        config: Config,
        records: Arc<RecordStore>,
        jobs: Arc<JobStore>,
        vectors: Arc<SqliteVectorIndex>,
        cache: Arc<dyn HistoryCache>,
    ) -> Self {
        let config = Arc::new(config);

        let embedder = Arc::new(HttpEmbedder::new(
            config.backend_url.clone(),
            config.embedding_model.clone(),
            config.llm_timeout(),
        ));
        let pipeline = Arc::new(LocalPipeline::new(
            RecursiveSplitter::new(config.chunk_size, config.chunk_overlap),
            embedder,
            vectors,
        ));
        let notifier = Arc::new(BroadcastNotifier::default());

        let worker_manager = Arc::new(WorkerManager::from_config(Arc::clone(&jobs), &config));
        let document_worker = Arc::new(DocumentBaseWorker::new(
            DocumentWorker::new(
                Arc::clone(&records),
                pipeline.clone(),
                notifier.clone(),
                config.document_worker_concurrency,
            ),
            Arc::clone(&jobs),
        ));

        let history = Arc::new(
            ChatHistorySync::new(
                Arc::clone(&records),
                cache,
                config.chat_rehydrate_on_miss,
                config.chat_history_window,
            )
            .with_handle_idle(config.chat_history_ttl()),
        );
        let chain = Arc::new(RagChain::new(
            config.backend_url.clone(),
            config.chat_model.clone(),
            config.llm_timeout(),
            pipeline.clone(),
            config.retrieval_top_k,
        ));
        let chat = Arc::new(ChatService::new(Arc::clone(&records), Arc::clone(&history), chain));
        let documents = Arc::new(DocumentService::new(
            Arc::clone(&records),
            pipeline.clone(),
            Arc::clone(&document_worker),
            config.upload_dir.clone(),
        ));

        Self {
            config,
            records,
            jobs,
            pipeline,
            notifier,
            worker_manager,
            document_worker,
            history,
            chat,
            documents,
        }
    }

    /// Registers the document worker with the manager. Does not start it.
    pub fn initialize_workers(&self) -> anyhow::Result<Arc<Consumer>> {
        Ok(self.document_worker.initialize(&self.worker_manager)?)
    }
}
