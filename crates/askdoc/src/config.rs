// askdoc/crates/askdoc/src/config.rs

use anyhow::Result;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub queue_db_path: PathBuf,
    pub vector_db_path: PathBuf,
    pub cache_db_path: PathBuf,
    pub upload_dir: PathBuf,
    pub chat_history_ttl_seconds: u64,
    pub chat_cache_capacity: u64,
    pub chat_rehydrate_on_miss: bool,
    pub chat_history_window: usize,
    pub queue_poll_interval_ms: u64,
    pub queue_stalled_timeout_seconds: u64,
    pub document_worker_concurrency: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub backend_url: String,
    pub embedding_model: String,
    pub chat_model: String,
    pub llm_timeout_seconds: u64,
    pub retrieval_top_k: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        let config = Self {
            db_path: env::var("ASKDOC_DB_PATH")
                .unwrap_or_else(|_| "./data/askdoc.db".into())
                .into(),
            queue_db_path: env::var("ASKDOC_QUEUE_DB_PATH")
                .unwrap_or_else(|_| "./data/queue.db".into())
                .into(),
            vector_db_path: env::var("ASKDOC_VECTOR_DB_PATH")
                .unwrap_or_else(|_| "./data/vectors.db".into())
                .into(),
            cache_db_path: env::var("ASKDOC_CACHE_DB_PATH")
                .unwrap_or_else(|_| "./data/chat-cache.db".into())
                .into(),
            upload_dir: env::var("UPLOAD_DIR").unwrap_or_else(|_| "uploads".into()).into(),
            chat_history_ttl_seconds: env::var("CHAT_HISTORY_TTL_SECONDS")
                .unwrap_or_else(|_| "604800".into())
                .parse()?,
            chat_cache_capacity: env::var("CHAT_CACHE_CAPACITY")
                .unwrap_or_else(|_| "10000".into())
                .parse()?,
            chat_rehydrate_on_miss: env::var("CHAT_REHYDRATE_ON_MISS")
                .unwrap_or_else(|_| "true".into())
                .parse()?,
            chat_history_window: env::var("CHAT_HISTORY_WINDOW")
                .unwrap_or_else(|_| "50".into())
                .parse()?,
            queue_poll_interval_ms: env::var("QUEUE_POLL_INTERVAL_MS")
                .unwrap_or_else(|_| "500".into())
                .parse()?,
            queue_stalled_timeout_seconds: env::var("QUEUE_STALLED_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| "300".into())
                .parse()?,
            document_worker_concurrency: env::var("DOCUMENT_WORKER_CONCURRENCY")
                .unwrap_or_else(|_| "2".into())
                .parse()?,
            chunk_size: env::var("CHUNK_SIZE").unwrap_or_else(|_| "512".into()).parse()?,
            chunk_overlap: env::var("CHUNK_OVERLAP").unwrap_or_else(|_| "64".into()).parse()?,
            backend_url: env::var("LLM_BACKEND_URL").unwrap_or_else(|_| "http://127.0.0.1:8081".into()),
            embedding_model: env::var("EMBEDDING_MODEL").unwrap_or_else(|_| "local-embed".into()),
            chat_model: env::var("CHAT_MODEL").unwrap_or_else(|_| "local-llm".into()),
            llm_timeout_seconds: env::var("LLM_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| "600".into())
                .parse()?,
            retrieval_top_k: env::var("RETRIEVAL_TOP_K").unwrap_or_else(|_| "4".into()).parse()?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings that would leave a worker idle or the splitter looping.
    pub fn validate(&self) -> Result<()> {
        if self.document_worker_concurrency == 0 {
            return Err(anyhow::anyhow!("DOCUMENT_WORKER_CONCURRENCY must be at least 1"));
        }
        if self.chunk_size == 0 {
            return Err(anyhow::anyhow!("CHUNK_SIZE must be at least 1"));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(anyhow::anyhow!(
                "CHUNK_OVERLAP ({}) must be smaller than CHUNK_SIZE ({})",
                self.chunk_overlap,
                self.chunk_size
            ));
        }
        if self.chat_history_ttl_seconds == 0 {
            return Err(anyhow::anyhow!("CHAT_HISTORY_TTL_SECONDS must be positive"));
        }
        if !(self.backend_url.starts_with("http://") || self.backend_url.starts_with("https://")) {
            return Err(anyhow::anyhow!("LLM_BACKEND_URL must be an http(s) URL, got {}", self.backend_url));
        }
        Ok(())
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- Record Store: {}", self.db_path.display());
        info!("- Job Queue: {}", self.queue_db_path.display());
        info!("- Vector Index: {}", self.vector_db_path.display());
        info!("- History Cache: {}", self.cache_db_path.display());
        info!("- Upload Dir: {}", self.upload_dir.display());
        info!("- Chat History TTL: {}s", self.chat_history_ttl_seconds);
        info!("- Chat Cache Capacity: {}", self.chat_cache_capacity);
        info!("- Rehydrate On Miss: {}", self.chat_rehydrate_on_miss);
        info!("- Queue Poll Interval: {}ms", self.queue_poll_interval_ms);
        info!("- Stalled Job Timeout: {}s", self.queue_stalled_timeout_seconds);
        info!("- Document Worker Concurrency: {}", self.document_worker_concurrency);
        info!("- Chunking: {} chars, {} overlap", self.chunk_size, self.chunk_overlap);
        info!("- Backend URL: {}", self.backend_url);
        info!("- Models: embed={}, chat={}", self.embedding_model, self.chat_model);
    }

    pub fn chat_history_ttl(&self) -> Duration {
        Duration::from_secs(self.chat_history_ttl_seconds)
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms)
    }

    pub fn stalled_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_stalled_timeout_seconds)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_seconds)
    }
}

#[cfg(test)]
pub(crate) fn create_test_config() -> Config {
    Config {
        db_path: "./data/test-askdoc.db".into(),
        queue_db_path: "./data/test-queue.db".into(),
        vector_db_path: "./data/test-vectors.db".into(),
        cache_db_path: "./data/test-chat-cache.db".into(),
        upload_dir: "uploads".into(),
        chat_history_ttl_seconds: 604800,
        chat_cache_capacity: 1000,
        chat_rehydrate_on_miss: true,
        chat_history_window: 50,
        queue_poll_interval_ms: 20,
        queue_stalled_timeout_seconds: 300,
        document_worker_concurrency: 2,
        chunk_size: 512,
        chunk_overlap: 64,
        backend_url: "http://127.0.0.1:8081".to_string(),
        embedding_model: "local-embed".to_string(),
        chat_model: "local-llm".to_string(),
        llm_timeout_seconds: 60,
        retrieval_top_k: 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_creation() {
        let config = create_test_config();
        assert_eq!(config.document_worker_concurrency, 2);
        assert_eq!(config.chunk_size, 512);
        assert_eq!(config.chunk_overlap, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_history_ttl_is_seven_days() {
        let config = create_test_config();
        assert_eq!(config.chat_history_ttl(), Duration::from_secs(7 * 24 * 3600));
    }

    #[test]
    fn test_duration_helpers() {
        let config = create_test_config();
        assert_eq!(config.queue_poll_interval(), Duration::from_millis(20));
        assert_eq!(config.stalled_timeout(), Duration::from_secs(300));
        assert_eq!(config.llm_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_overlap_must_be_smaller_than_chunk() {
        let mut config = create_test_config();
        config.chunk_overlap = config.chunk_size;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = create_test_config();
        config.document_worker_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backend_url_must_be_http() {
        let mut config = create_test_config();
        config.backend_url = "127.0.0.1:8081".to_string();
        assert!(config.validate().is_err());
    }
}
