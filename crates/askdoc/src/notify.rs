//! Best-effort progress notifications for document processing
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ProgressEvent {
    ProcessingStarted {
        document_id: String,
        timestamp: DateTime<Utc>,
    },
    ProcessingProgress {
        document_id: String,
        /// Fraction of the pipeline done, 0.0 to 1.0.
        progress: f32,
        timestamp: DateTime<Utc>,
    },
    ProcessingCompleted {
        document_id: String,
        session_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl ProgressEvent {
    pub fn started(document_id: &str) -> Self {
        Self::ProcessingStarted {
            document_id: document_id.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn progress(document_id: &str, progress: f32) -> Self {
        Self::ProcessingProgress {
            document_id: document_id.to_string(),
            progress: progress.clamp(0.0, 1.0),
            timestamp: Utc::now(),
        }
    }

    pub fn completed(document_id: &str, session_id: &str) -> Self {
        Self::ProcessingCompleted {
            document_id: document_id.to_string(),
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn document_id(&self) -> &str {
        match self {
            Self::ProcessingStarted { document_id, .. }
            | Self::ProcessingProgress { document_id, .. }
            | Self::ProcessingCompleted { document_id, .. } => document_id,
        }
    }
}

/// Delivers progress events to a client-supplied target (a socket id, a
/// channel name). Delivery never fails the caller.
#[async_trait]
pub trait ProgressNotifier: Send + Sync {
    async fn notify(&self, target: &str, event: ProgressEvent);
}

/// Target-addressed event as seen by broadcast subscribers.
#[derive(Debug, Clone)]
pub struct TargetedEvent {
    pub target: String,
    pub event: ProgressEvent,
}

/// In-process fan-out of progress events. Events sent while nobody is
/// subscribed are dropped.
///
/// ```
/// use askdoc::notify::{BroadcastNotifier, ProgressEvent, ProgressNotifier};
///
/// # tokio_test::block_on(async {
/// let notifier = BroadcastNotifier::default();
/// let mut events = notifier.subscribe();
/// notifier.notify("socket-1", ProgressEvent::started("doc-1")).await;
///
/// let received = events.recv().await.unwrap();
/// assert_eq!(received.target, "socket-1");
/// assert_eq!(received.event.document_id(), "doc-1");
/// # });
/// ```
pub struct BroadcastNotifier {
    sender: broadcast::Sender<TargetedEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TargetedEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl ProgressNotifier for BroadcastNotifier {
    async fn notify(&self, target: &str, event: ProgressEvent) {
        let targeted = TargetedEvent {
            target: target.to_string(),
            event,
        };
        if self.sender.send(targeted).is_err() {
            debug!(target_id = %target, "No subscribers for progress event");
        }
    }
}
