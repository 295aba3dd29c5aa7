//! Worker capability and the base wiring shared by every job type
use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use validator::Validate;

use super::consumer::Consumer;
use super::manager::{RegistrationError, WorkerConfig, WorkerManager};
use super::ProcessorFn;
use crate::job_queue::{Backoff, Job, JobOptions, JobStore, KeepJobs, Queue, QueueError, QueueResult, UnrecoverableError};

const DAY_SECS: u64 = 24 * 3600;

/// Queue defaults for every worker: three attempts with exponential backoff
/// from one second, and bounded retention of finished jobs.
pub fn default_job_options() -> JobOptions {
    JobOptions {
        attempts: 3,
        backoff: Some(Backoff::Exponential { delay_ms: 1000 }),
        delay_ms: 0,
        remove_on_complete: Some(KeepJobs::new(1000, DAY_SECS)),
        remove_on_fail: Some(KeepJobs::new(5000, DAY_SECS)),
    }
}

/// One kind of background job: where it is queued and how it is processed.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    type Payload: Serialize + DeserializeOwned + Validate + Send + Sync + 'static;

    fn name(&self) -> &str;

    fn queue_name(&self) -> &str;

    fn concurrency(&self) -> usize {
        1
    }

    fn default_job_options(&self) -> JobOptions {
        default_job_options()
    }

    /// An `Err` fails this attempt; the queue decides whether to retry.
    async fn process(&self, job: &Job, payload: Self::Payload) -> anyhow::Result<()>;
}

/// Decodes and validates a job payload. Failures are unrecoverable: a
/// malformed payload will not parse any better on the next attempt.
pub fn decode_payload<P>(job: &Job) -> Result<P, UnrecoverableError>
where
    P: DeserializeOwned + Validate,
{
    let payload: P = serde_json::from_value(job.payload.clone())
        .map_err(|e| UnrecoverableError(format!("malformed payload for job {}: {}", job.id, e)))?;
    payload
        .validate()
        .map_err(|e| UnrecoverableError(format!("invalid payload for job {}: {}", job.id, e)))?;
    Ok(payload)
}

/// Couples a [`Worker`] to its queue and registers it with a manager.
pub struct BaseWorker<W: Worker> {
    worker: Arc<W>,
    queue: Queue,
    initialized: AtomicBool,
}

impl<W: Worker> BaseWorker<W> {
    pub fn new(worker: W, store: Arc<JobStore>) -> Self {
        let queue = Queue::new(worker.queue_name(), store, worker.default_job_options());
        Self {
            worker: Arc::new(worker),
            queue,
            initialized: AtomicBool::new(false),
        }
    }

    pub fn worker(&self) -> &Arc<W> {
        &self.worker
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Validates and enqueues a job. `options` replaces the queue defaults.
    pub fn add_job(&self, payload: &W::Payload, options: Option<JobOptions>) -> QueueResult<i64> {
        payload
            .validate()
            .map_err(|e| QueueError::InvalidPayload(e.to_string()))?;
        self.queue.add(self.worker.name(), payload, options)
    }

    /// Registers the worker with `manager`. Later calls return the consumer
    /// registered by the first one.
    pub fn initialize(&self, manager: &WorkerManager) -> Result<Arc<Consumer>, RegistrationError> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            if let Some(consumer) = manager.get_worker(self.worker.name()) {
                return Ok(consumer);
            }
        }

        let config = WorkerConfig {
            name: self.worker.name().to_string(),
            queue_name: self.worker.queue_name().to_string(),
            processor: self.processor(),
            concurrency: self.worker.concurrency(),
        };
        match manager.register_worker(config) {
            Ok(consumer) => {
                info!(worker = %self.worker.name(), "Worker initialized");
                Ok(consumer)
            }
            Err(e) => {
                self.initialized.store(false, Ordering::SeqCst);
                error!(worker = %self.worker.name(), "Failed to initialize worker: {}", e);
                Err(e)
            }
        }
    }

    fn processor(&self) -> ProcessorFn {
        let worker = Arc::clone(&self.worker);
        Arc::new(move |job: Job| {
            let worker = Arc::clone(&worker);
            async move {
                let payload = decode_payload::<W::Payload>(&job)?;
                worker.process(&job, payload).await
            }
            .boxed()
        })
    }
}
