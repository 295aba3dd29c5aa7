//! Chat history synchronization between the record store and the cache
//!
//! The record store is authoritative: a turn is persisted there first and
//! only then mirrored into the cache. The cache can lose entries at any time
//! (expiry, eviction, restart) and is rebuilt from the record store tail.
use moka::sync::Cache;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::cache_store::{HistoryCache, DEFAULT_HISTORY_TTL_SECS};
use crate::metrics;
use crate::record_store::{Message, RecordStore, SessionMetadata};

/// Process-local state for one session's history.
pub struct HistoryHandle {
    session_id: String,
    turn_lock: Arc<Mutex<()>>,
}

impl HistoryHandle {
    fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            turn_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

pub struct ChatHistorySync {
    records: Arc<RecordStore>,
    cache: Arc<dyn HistoryCache>,
    /// Handles of recently used sessions. Idle handles are dropped.
    handles: Cache<String, Arc<OnceCell<Arc<HistoryHandle>>>>,
    rehydrate_on_miss: bool,
    history_window: usize,
}

impl ChatHistorySync {
    pub fn new(
        records: Arc<RecordStore>,
        cache: Arc<dyn HistoryCache>,
        rehydrate_on_miss: bool,
        history_window: usize,
    ) -> Self {
        Self {
            records,
            cache,
            handles: handle_cache(Duration::from_secs(DEFAULT_HISTORY_TTL_SECS)),
            rehydrate_on_miss,
            history_window,
        }
    }

    /// Drops a session's handle after `idle` without use.
    pub fn with_handle_idle(mut self, idle: Duration) -> Self {
        self.handles = handle_cache(idle);
        self
    }

    /// Number of sessions holding a handle in this process.
    pub fn handle_count(&self) -> u64 {
        self.handles.run_pending_tasks();
        self.handles.entry_count()
    }

    /// Returns the session's handle, creating it on first use.
    ///
    /// Concurrent first callers wait for one creation and share its result.
    /// Creation warms the cache from the record store when enabled.
    pub async fn handle(&self, session_id: &str) -> Arc<HistoryHandle> {
        let cell = self
            .handles
            .get_with(session_id.to_string(), || Arc::new(OnceCell::new()));

        let handle = cell
            .get_or_init(|| async {
                info!(session_id, "Creating history handle");
                if self.rehydrate_on_miss {
                    self.cached_or_rehydrated(session_id).await;
                }
                Arc::new(HistoryHandle::new(session_id))
            })
            .await;
        Arc::clone(handle)
    }

    /// Serializes turns on one session within this process.
    pub async fn lock_session(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let handle = self.handle(session_id).await;
        Arc::clone(&handle.turn_lock).lock_owned().await
    }

    /// Cached messages for the session, or empty when there are none.
    pub async fn get_history(&self, session_id: &str) -> Vec<Message> {
        self.handle(session_id).await;
        self.cached_or_rehydrated(session_id).await
    }

    async fn cached_or_rehydrated(&self, session_id: &str) -> Vec<Message> {
        match self.cache.get(session_id).await {
            Ok(Some(messages)) => return messages,
            Ok(None) => debug!(session_id, "History cache miss"),
            Err(e) => warn!(session_id, "History cache read failed: {:#}", e),
        }
        if !self.rehydrate_on_miss {
            return Vec::new();
        }
        self.rehydrate(session_id).await.unwrap_or_default()
    }

    /// Reloads the cache entry from the record store tail.
    async fn rehydrate(&self, session_id: &str) -> Option<Vec<Message>> {
        let messages = match self.records.sessions.recent_messages(session_id, self.history_window) {
            Ok(messages) => messages,
            Err(e) => {
                warn!(session_id, "Failed to load history from the record store: {}", e);
                return None;
            }
        };
        if messages.is_empty() {
            return Some(messages);
        }
        if let Err(e) = self.cache.replace(session_id, messages.clone()).await {
            warn!(session_id, "Failed to rehydrate history cache: {:#}", e);
        } else {
            debug!(session_id, messages = messages.len(), "Rehydrated history cache");
        }
        Some(messages)
    }

    /// Persists one user/assistant pair, then mirrors it into the cache.
    ///
    /// Record store failures fail the turn. Cache failures are logged only.
    pub async fn append_turn(
        &self,
        session_id: &str,
        user_message: Message,
        assistant_message: Message,
    ) -> anyhow::Result<SessionMetadata> {
        let metadata = self
            .records
            .sessions
            .append_turn(session_id, &user_message, &assistant_message)?;

        let cache_written = match self.mirror_turn(session_id, [user_message, assistant_message]).await {
            Ok(()) => true,
            Err(e) => {
                warn!(session_id, "Chat turn saved but the history cache was not updated: {:#}", e);
                false
            }
        };
        metrics::record_chat_turn(cache_written);
        Ok(metadata)
    }

    async fn mirror_turn(&self, session_id: &str, turn: [Message; 2]) -> anyhow::Result<()> {
        // An expired entry would restart from this turn alone; rebuild it from
        // the record store instead, which already holds the turn.
        if self.rehydrate_on_miss && self.cache.get(session_id).await?.is_none() {
            let messages = self.records.sessions.recent_messages(session_id, self.history_window)?;
            return self.cache.replace(session_id, messages).await;
        }
        self.cache.append(session_id, &turn).await
    }

    /// Drops the cached history and the process-local handle.
    pub async fn forget(&self, session_id: &str) {
        self.handles.invalidate(session_id);
        if let Err(e) = self.cache.clear(session_id).await {
            warn!(session_id, "Failed to clear cached history: {:#}", e);
        }
    }
}

fn handle_cache(idle: Duration) -> Cache<String, Arc<OnceCell<Arc<HistoryHandle>>>> {
    Cache::builder().time_to_idle(idle).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_store::{MokaHistoryCache, SqliteHistoryCache};
    use crate::record_store::{NewSession, Role};
    use crate::test_support::{memory_records, seed_document, FailingCache};
    use std::time::Duration;

    fn setup(cache: Arc<dyn HistoryCache>, rehydrate: bool) -> (Arc<RecordStore>, ChatHistorySync, String) {
        let records = memory_records();
        let (user, document) = seed_document(&records, "U1", "report.pdf");
        let session = records
            .sessions
            .create_session(NewSession {
                user_id: user.id,
                document_id: document.id,
                title: "Chat about report.pdf".to_string(),
            })
            .unwrap();
        let sync = ChatHistorySync::new(Arc::clone(&records), cache, rehydrate, 50);
        (records, sync, session.id)
    }

    fn moka() -> Arc<MokaHistoryCache> {
        Arc::new(MokaHistoryCache::new(Duration::from_secs(3600), 100))
    }

    #[tokio::test]
    async fn test_unknown_session_has_empty_history() {
        let (_records, sync, _session_id) = setup(moka(), true);
        assert!(sync.get_history("no-such-session").await.is_empty());
    }

    #[tokio::test]
    async fn test_append_turn_updates_both_stores() {
        let (records, sync, session_id) = setup(moka(), true);
        let question = "What does the report say about revenue?";

        let metadata = sync
            .append_turn(&session_id, Message::user(question), Message::assistant("It grew 12%."))
            .await
            .unwrap();
        assert_eq!(metadata.total_tokens, (question.chars().count() / 4) as u64);

        let session = records.sessions.get_session(&session_id).unwrap().unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].role, Role::User);
        assert_eq!(session.messages[1].role, Role::Assistant);
        assert_eq!(sync.get_history(&session_id).await, session.messages);
    }

    #[tokio::test]
    async fn test_cache_matches_record_after_many_turns() {
        let (records, sync, session_id) = setup(moka(), true);
        let mut last_activity = None;

        for i in 0..8 {
            let metadata = sync
                .append_turn(
                    &session_id,
                    Message::user(format!("question {}", i)),
                    Message::assistant(format!("answer {}", i)),
                )
                .await
                .unwrap();
            if let Some(previous) = last_activity {
                assert!(metadata.last_activity >= previous);
            }
            last_activity = Some(metadata.last_activity);
        }

        let session = records.sessions.get_session(&session_id).unwrap().unwrap();
        let cached = sync.get_history(&session_id).await;
        assert_eq!(cached.len(), 16);
        assert_eq!(cached, session.messages);
        assert_eq!(cached[14].content, "question 7");
    }

    #[tokio::test]
    async fn test_lost_cache_entry_is_rehydrated() {
        let cache = moka();
        let (_records, sync, session_id) = setup(cache.clone(), true);
        sync.append_turn(&session_id, Message::user("q1"), Message::assistant("a1"))
            .await
            .unwrap();

        cache.clear(&session_id).await.unwrap();
        sync.append_turn(&session_id, Message::user("q2"), Message::assistant("a2"))
            .await
            .unwrap();

        let contents: Vec<String> = sync
            .get_history(&session_id)
            .await
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["q1", "a1", "q2", "a2"]);
    }

    #[tokio::test]
    async fn test_without_rehydration_a_miss_is_empty() {
        let cache = moka();
        let (_records, sync, session_id) = setup(cache.clone(), false);
        sync.append_turn(&session_id, Message::user("q1"), Message::assistant("a1"))
            .await
            .unwrap();
        cache.clear(&session_id).await.unwrap();

        assert!(sync.get_history(&session_id).await.is_empty());
    }

    #[tokio::test]
    async fn test_cache_failure_does_not_fail_the_turn() {
        let (records, sync, session_id) = setup(Arc::new(FailingCache), true);

        sync.append_turn(&session_id, Message::user("q1"), Message::assistant("a1"))
            .await
            .unwrap();

        let session = records.sessions.get_session(&session_id).unwrap().unwrap();
        assert_eq!(session.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_record_failure_fails_the_turn() {
        let (_records, sync, _session_id) = setup(moka(), true);
        let result = sync
            .append_turn("missing-session", Message::user("q"), Message::assistant("a"))
            .await;
        assert!(result.is_err());
        assert!(sync.get_history("missing-session").await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_handle() {
        let (_records, sync, session_id) = setup(moka(), true);
        let sync = Arc::new(sync);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let sync = Arc::clone(&sync);
                let session_id = session_id.clone();
                tokio::spawn(async move { sync.handle(&session_id).await })
            })
            .collect();

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap());
        }
        assert!(handles.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
        assert_eq!(handles[0].session_id(), session_id);
    }

    #[tokio::test]
    async fn test_idle_handles_are_released() {
        let (_records, sync, session_id) = setup(moka(), true);
        let sync = sync.with_handle_idle(Duration::from_millis(50));

        let first = sync.handle(&session_id).await;
        sync.handle("other-session").await;
        assert_eq!(sync.handle_count(), 2);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(sync.handle_count(), 0);
        assert!(!Arc::ptr_eq(&first, &sync.handle(&session_id).await));
    }

    #[tokio::test]
    async fn test_turns_are_visible_through_a_shared_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat-cache.db");
        let ttl = Duration::from_secs(3600);
        let (records, writer, session_id) = setup(Arc::new(SqliteHistoryCache::open(&path, ttl).unwrap()), false);
        let reader = ChatHistorySync::new(
            Arc::clone(&records),
            Arc::new(SqliteHistoryCache::open(&path, ttl).unwrap()),
            false,
            50,
        );

        writer
            .append_turn(&session_id, Message::user("q1"), Message::assistant("a1"))
            .await
            .unwrap();
        reader
            .append_turn(&session_id, Message::user("q2"), Message::assistant("a2"))
            .await
            .unwrap();

        let contents: Vec<String> = writer
            .get_history(&session_id)
            .await
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["q1", "a1", "q2", "a2"]);
    }

    #[tokio::test]
    async fn test_forget_drops_handle_and_cache() {
        let cache = moka();
        let (_records, sync, session_id) = setup(cache.clone(), false);
        sync.append_turn(&session_id, Message::user("q"), Message::assistant("a"))
            .await
            .unwrap();
        let before = sync.handle(&session_id).await;

        sync.forget(&session_id).await;

        assert!(cache.get(&session_id).await.unwrap().is_none());
        assert!(!Arc::ptr_eq(&before, &sync.handle(&session_id).await));
    }
}
