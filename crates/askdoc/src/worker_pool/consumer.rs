//! Queue consumer - runs a processor over one queue with bounded concurrency
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use super::ProcessorFn;
use crate::job_queue::{FailOutcome, JobStore, UnrecoverableError};
use crate::metrics;

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub concurrency: usize,
    /// Idle wait between claim attempts on an empty queue.
    pub poll_interval: Duration,
    /// A lease older than this is considered abandoned.
    pub stalled_timeout: Duration,
    pub stalled_check_interval: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_interval: Duration::from_millis(500),
            stalled_timeout: Duration::from_secs(300),
            stalled_check_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ConsumerEvent {
    Completed {
        worker: String,
        job_id: i64,
    },
    Failed {
        worker: String,
        job_id: i64,
        error: String,
        outcome: FailOutcome,
    },
    /// Consumer-level failure outside any job (queue unreachable, etc.).
    Error {
        worker: String,
        error: String,
    },
}

pub type EventObserver = Arc<dyn Fn(&ConsumerEvent) + Send + Sync>;

struct ConsumerInner {
    name: String,
    queue: String,
    store: Arc<JobStore>,
    processor: ProcessorFn,
    settings: ConsumerSettings,
    observers: RwLock<Vec<EventObserver>>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

/// Pulls jobs from one queue and feeds them to a processor.
///
/// `concurrency` polling loops run as tokio tasks, plus one task that
/// reclaims stalled leases. Closing waits for in-flight jobs to finish.
pub struct Consumer {
    inner: Arc<ConsumerInner>,
    running: Mutex<Option<Running>>,
}

impl Consumer {
    pub fn new(
        name: impl Into<String>,
        queue: impl Into<String>,
        store: Arc<JobStore>,
        processor: ProcessorFn,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(ConsumerInner {
                name: name.into(),
                queue: queue.into(),
                store,
                processor,
                settings,
                observers: RwLock::new(Vec::new()),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn queue_name(&self) -> &str {
        &self.inner.queue
    }

    pub fn concurrency(&self) -> usize {
        self.inner.settings.concurrency
    }

    pub fn on_event(&self, observer: EventObserver) {
        match self.inner.observers.write() {
            Ok(mut observers) => observers.push(observer),
            Err(poisoned) => poisoned.into_inner().push(observer),
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_running().is_some()
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawns the polling loops. Returns `false` if already running.
    pub fn start(&self) -> bool {
        let mut running = self.lock_running();
        if running.is_some() {
            debug!(worker = %self.inner.name, "Worker already running");
            return false;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();
        for slot in 0..self.inner.settings.concurrency {
            let inner = Arc::clone(&self.inner);
            let worker_id = format!("{}:{}:{}", inner.name, slot, &uuid::Uuid::new_v4().simple().to_string()[..8]);
            tasks.spawn(poll_loop(inner, worker_id, shutdown_rx.clone()));
        }
        tasks.spawn(stalled_loop(Arc::clone(&self.inner), shutdown_rx));

        *running = Some(Running { shutdown, tasks });
        info!(
            worker = %self.inner.name,
            queue = %self.inner.queue,
            concurrency = self.inner.settings.concurrency,
            "Worker started"
        );
        true
    }

    /// Signals the loops to stop and waits for in-flight jobs.
    pub async fn close(&self) {
        let running = self.lock_running().take();
        let Some(Running { shutdown, mut tasks }) = running else {
            return;
        };
        let _ = shutdown.send(true);
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(worker = %self.inner.name, "Worker task ended abnormally: {}", e);
            }
        }
        info!(worker = %self.inner.name, "Worker closed");
    }

    /// Claims and processes at most one ready job on the calling task.
    ///
    /// Returns whether a job was processed.
    pub async fn process_next(&self) -> anyhow::Result<bool> {
        let worker_id = format!("{}:inline", self.inner.name);
        self.inner.process_next(&worker_id).await
    }

    /// Processes ready jobs until the queue has none left.
    pub async fn drain(&self) -> anyhow::Result<usize> {
        let mut processed = 0;
        while self.process_next().await? {
            processed += 1;
        }
        Ok(processed)
    }
}

impl ConsumerInner {
    fn emit(&self, event: ConsumerEvent) {
        let observers = match self.observers.read() {
            Ok(observers) => observers.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for observer in observers {
            observer(&event);
        }
    }

    async fn process_next(&self, worker_id: &str) -> anyhow::Result<bool> {
        let Some(job) = self.store.claim(&self.queue, worker_id)? else {
            return Ok(false);
        };
        let job_id = job.id;

        metrics::job_started(&self.queue);
        let result = AssertUnwindSafe((self.processor)(job))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(anyhow::anyhow!("processor panicked")));
        metrics::job_finished(&self.queue);

        match result {
            Ok(()) => {
                if !self.store.complete(job_id, worker_id)? {
                    metrics::record_job(&self.queue, "lease_lost");
                    return Ok(true);
                }
                metrics::record_job(&self.queue, "completed");
                self.emit(ConsumerEvent::Completed {
                    worker: self.name.clone(),
                    job_id,
                });
            }
            Err(err) => {
                let unrecoverable = err.downcast_ref::<UnrecoverableError>().is_some();
                let message = format!("{:#}", err);
                let outcome = self.store.fail(job_id, worker_id, &message, unrecoverable)?;
                let label = match outcome {
                    FailOutcome::Retrying { .. } => "retrying",
                    FailOutcome::Failed { .. } => "failed",
                    FailOutcome::LeaseLost => {
                        metrics::record_job(&self.queue, "lease_lost");
                        return Ok(true);
                    }
                };
                metrics::record_job(&self.queue, label);
                self.emit(ConsumerEvent::Failed {
                    worker: self.name.clone(),
                    job_id,
                    error: message,
                    outcome,
                });
            }
        }
        Ok(true)
    }
}

async fn poll_loop(inner: Arc<ConsumerInner>, worker_id: String, mut shutdown: watch::Receiver<bool>) {
    debug!(worker = %worker_id, "Polling loop started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        match inner.process_next(&worker_id).await {
            Ok(true) => continue,
            Ok(false) => {}
            Err(e) => inner.emit(ConsumerEvent::Error {
                worker: inner.name.clone(),
                error: format!("{:#}", e),
            }),
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(inner.settings.poll_interval) => {}
        }
    }
    debug!(worker = %worker_id, "Polling loop stopped");
}

async fn stalled_loop(inner: Arc<ConsumerInner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(inner.settings.stalled_check_interval) => {
                if let Err(e) = inner.store.reclaim_stalled(&inner.queue, inner.settings.stalled_timeout) {
                    inner.emit(ConsumerEvent::Error {
                        worker: inner.name.clone(),
                        error: format!("stalled job check failed: {}", e),
                    });
                }
            }
        }
    }
}
