//! Job queue - durable, at-least-once delivery with retries and retention
//!
//! Jobs live in SQLite so they survive restarts. A job is claimed by one
//! consumer at a time; a consumer that dies leaves a stale lease that
//! [`JobStore::reclaim_stalled`] turns back into a waiting job.
pub mod options;
pub mod store;

pub use options::{Backoff, JobOptions, KeepJobs};
pub use store::JobStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid job payload: {0}")]
    InvalidPayload(String),

    #[error("job {0} not found")]
    NotFound(i64),

    #[error("corrupt job row: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Returned by a processor to fail its job without spending further attempts.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct UnrecoverableError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Claimable once `available_at` has passed; "delayed" before that.
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "waiting" => Ok(Self::Waiting),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(QueueError::Corrupt(format!("unknown job state '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub queue: String,
    pub name: String,
    pub payload: serde_json::Value,
    pub options: JobOptions,
    pub state: JobState,
    /// Attempts started so far, including the one in progress.
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub available_at: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying { attempts_made: u32, delay: Duration },
    Failed { attempts_made: u32 },
    /// The caller no longer held the job's lease; nothing was written.
    LeaseLost,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Producer handle for one named queue, carrying that queue's default options.
#[derive(Clone)]
pub struct Queue {
    name: String,
    store: Arc<JobStore>,
    default_options: JobOptions,
}

impl Queue {
    pub fn new(name: impl Into<String>, store: Arc<JobStore>, default_options: JobOptions) -> Self {
        Self {
            name: name.into(),
            store,
            default_options,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_options(&self) -> &JobOptions {
        &self.default_options
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Enqueues `payload`. `options`, when given, replaces the queue defaults.
    pub fn add<T: Serialize>(
        &self,
        job_name: &str,
        payload: &T,
        options: Option<JobOptions>,
    ) -> QueueResult<i64> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| QueueError::InvalidPayload(e.to_string()))?;
        let options = options.unwrap_or_else(|| self.default_options.clone());
        match self.store.enqueue(&self.name, job_name, &payload, &options) {
            Ok(job_id) => {
                info!(queue = %self.name, job_id, job_name, "Job added to queue");
                Ok(job_id)
            }
            Err(e) => {
                error!(queue = %self.name, job_name, "Failed to add job to queue: {}", e);
                Err(e)
            }
        }
    }

    pub fn counts(&self) -> QueueResult<QueueCounts> {
        self.store.counts(&self.name)
    }

    pub fn get_job(&self, job_id: i64) -> QueueResult<Option<Job>> {
        self.store.get_job(job_id)
    }

    pub fn promote_delayed(&self) -> QueueResult<usize> {
        self.store.promote_delayed(&self.name)
    }
}
