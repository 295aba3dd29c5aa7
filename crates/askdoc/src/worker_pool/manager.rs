use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use super::consumer::{Consumer, ConsumerEvent, ConsumerSettings};
use super::ProcessorFn;
use crate::config::Config;
use crate::job_queue::{FailOutcome, JobStore};

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("worker '{0}' is already registered")]
    DuplicateName(String),

    #[error("worker '{0}' needs a concurrency of at least 1")]
    InvalidConcurrency(String),
}

pub struct WorkerConfig {
    pub name: String,
    pub queue_name: String,
    pub processor: ProcessorFn,
    pub concurrency: usize,
}

/// Registry of named workers.
///
/// Built once at startup and shared by reference. Every worker consumes one
/// queue from the shared job store.
pub struct WorkerManager {
    store: Arc<JobStore>,
    poll_interval: Duration,
    stalled_timeout: Duration,
    stalled_check_interval: Duration,
    workers: DashMap<String, Arc<Consumer>>,
}

impl WorkerManager {
    pub fn new(store: Arc<JobStore>, poll_interval: Duration, stalled_timeout: Duration) -> Self {
        Self {
            store,
            poll_interval,
            stalled_timeout,
            stalled_check_interval: (stalled_timeout / 4).max(Duration::from_millis(50)),
            workers: DashMap::new(),
        }
    }

    pub fn from_config(store: Arc<JobStore>, config: &Config) -> Self {
        Self::new(store, config.queue_poll_interval(), config.stalled_timeout())
    }

    pub fn job_store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Creates the consumer for `config` and attaches the logging observers.
    pub fn register_worker(&self, config: WorkerConfig) -> Result<Arc<Consumer>, RegistrationError> {
        if config.concurrency == 0 {
            return Err(RegistrationError::InvalidConcurrency(config.name));
        }

        match self.workers.entry(config.name.clone()) {
            Entry::Occupied(_) => {
                error!(worker = %config.name, "Worker already registered");
                Err(RegistrationError::DuplicateName(config.name))
            }
            Entry::Vacant(slot) => {
                let consumer = Arc::new(Consumer::new(
                    config.name.clone(),
                    config.queue_name.clone(),
                    Arc::clone(&self.store),
                    config.processor,
                    ConsumerSettings {
                        concurrency: config.concurrency,
                        poll_interval: self.poll_interval,
                        stalled_timeout: self.stalled_timeout,
                        stalled_check_interval: self.stalled_check_interval,
                    },
                ));
                consumer.on_event(Arc::new(log_event));
                slot.insert(Arc::clone(&consumer));
                info!(
                    worker = %config.name,
                    queue = %config.queue_name,
                    concurrency = config.concurrency,
                    "Worker registered"
                );
                Ok(consumer)
            }
        }
    }

    /// Starts every registered worker that is not running yet.
    pub fn start_all(&self) -> usize {
        let started = self.consumers().iter().filter(|consumer| consumer.start()).count();
        info!(started, total = self.workers.len(), "Started workers");
        started
    }

    /// Closes every worker, waiting for in-flight jobs.
    pub async fn stop_all(&self) {
        let consumers = self.consumers();
        futures::future::join_all(consumers.iter().map(|consumer| consumer.close())).await;
        info!(stopped = consumers.len(), "All workers stopped");
    }

    pub fn get_worker(&self, name: &str) -> Option<Arc<Consumer>> {
        self.workers.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn worker_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workers.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    fn consumers(&self) -> Vec<Arc<Consumer>> {
        self.workers.iter().map(|entry| Arc::clone(entry.value())).collect()
    }
}

fn log_event(event: &ConsumerEvent) {
    match event {
        ConsumerEvent::Completed { worker, job_id } => {
            info!(worker = %worker, job_id, "Job completed");
        }
        ConsumerEvent::Failed { worker, job_id, error, outcome: FailOutcome::Retrying { attempts_made, delay } } => {
            warn!(
                worker = %worker,
                job_id,
                attempts_made,
                retry_in_ms = delay.as_millis() as u64,
                "Job attempt failed: {}",
                error
            );
        }
        ConsumerEvent::Failed { worker, job_id, error, outcome: FailOutcome::Failed { attempts_made } } => {
            error!(worker = %worker, job_id, attempts_made, "Job failed: {}", error);
        }
        ConsumerEvent::Failed { worker, job_id, error, outcome: FailOutcome::LeaseLost } => {
            warn!(worker = %worker, job_id, "Job failed after its lease was lost: {}", error);
        }
        ConsumerEvent::Error { worker, error } => {
            error!(worker = %worker, "Worker error: {}", error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_queue::{Job, JobOptions, JobState, Queue};
    use futures::FutureExt;
    use serde_json::json;

    fn manager() -> WorkerManager {
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        WorkerManager::new(store, Duration::from_millis(10), Duration::from_secs(60))
    }

    fn noop_config(name: &str, queue: &str) -> WorkerConfig {
        WorkerConfig {
            name: name.to_string(),
            queue_name: queue.to_string(),
            processor: Arc::new(|_job: Job| async { Ok::<(), anyhow::Error>(()) }.boxed()),
            concurrency: 2,
        }
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let manager = manager();
        manager.register_worker(noop_config("document-worker", "document-queue")).unwrap();

        let err = manager
            .register_worker(noop_config("document-worker", "other-queue"))
            .err()
            .unwrap();
        assert!(matches!(err, RegistrationError::DuplicateName(name) if name == "document-worker"));
        assert_eq!(manager.worker_names(), vec!["document-worker".to_string()]);
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let manager = manager();
        let mut config = noop_config("w", "q");
        config.concurrency = 0;
        assert!(matches!(
            manager.register_worker(config),
            Err(RegistrationError::InvalidConcurrency(_))
        ));
    }

    #[test]
    fn test_get_worker_lookup() {
        let manager = manager();
        manager.register_worker(noop_config("a", "qa")).unwrap();

        let worker = manager.get_worker("a").unwrap();
        assert_eq!(worker.queue_name(), "qa");
        assert_eq!(worker.concurrency(), 2);
        assert!(manager.get_worker("b").is_none());
    }

    #[tokio::test]
    async fn test_start_all_is_idempotent_and_stop_all_closes() {
        let manager = manager();
        manager.register_worker(noop_config("a", "qa")).unwrap();
        manager.register_worker(noop_config("b", "qb")).unwrap();

        assert_eq!(manager.start_all(), 2);
        assert_eq!(manager.start_all(), 0);
        assert!(manager.get_worker("a").unwrap().is_running());

        manager.stop_all().await;
        assert!(!manager.get_worker("a").unwrap().is_running());
        assert!(!manager.get_worker("b").unwrap().is_running());
    }

    #[tokio::test]
    async fn test_registered_worker_processes_its_queue_only() {
        let manager = manager();
        let consumer = manager.register_worker(noop_config("a", "qa")).unwrap();
        let qa = Queue::new("qa", Arc::clone(manager.job_store()), JobOptions::default());
        let qb = Queue::new("qb", Arc::clone(manager.job_store()), JobOptions::default());

        let a_job = qa.add("a", &json!({}), None).unwrap();
        let b_job = qb.add("b", &json!({}), None).unwrap();
        assert_eq!(consumer.drain().await.unwrap(), 1);

        assert_eq!(qa.get_job(a_job).unwrap().unwrap().state, JobState::Completed);
        assert_eq!(qb.get_job(b_job).unwrap().unwrap().state, JobState::Waiting);
    }
}
