//! Worker pool - named queue consumers and their registry
pub mod consumer;
pub mod manager;
pub mod worker;

pub use consumer::{Consumer, ConsumerEvent, ConsumerSettings, EventObserver};
pub use manager::{RegistrationError, WorkerConfig, WorkerManager};
pub use worker::{decode_payload, default_job_options, BaseWorker, Worker};

use futures::future::BoxFuture;
use std::sync::Arc;

use crate::job_queue::Job;

/// Processing function bound to a queue. An `Err` fails the attempt.
pub type ProcessorFn = Arc<dyn Fn(Job) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
