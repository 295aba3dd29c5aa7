use async_trait::async_trait;
use moka::sync::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{cache_key, HistoryCache};
use crate::record_store::Message;

/// In-process [`HistoryCache`] backed by a moka cache with time-to-live.
///
/// Entries expire `ttl` after their last write. Reads do not extend the
/// lifetime.
#[derive(Clone)]
pub struct MokaHistoryCache {
    entries: Cache<String, Arc<Vec<Message>>>,
}

impl MokaHistoryCache {
    pub fn new(ttl: Duration, max_sessions: u64) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(max_sessions)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }
}

#[async_trait]
impl HistoryCache for MokaHistoryCache {
    async fn get(&self, session_id: &str) -> anyhow::Result<Option<Vec<Message>>> {
        Ok(self
            .entries
            .get(&cache_key(session_id))
            .map(|messages| messages.as_ref().clone()))
    }

    async fn append(&self, session_id: &str, messages: &[Message]) -> anyhow::Result<()> {
        let entry = self
            .entries
            .entry(cache_key(session_id))
            .and_upsert_with(|existing| {
                let mut history = existing
                    .map(|entry| entry.into_value().as_ref().clone())
                    .unwrap_or_default();
                history.extend_from_slice(messages);
                Arc::new(history)
            });
        debug!(session_id, cached = entry.value().len(), "Appended to cached history");
        Ok(())
    }

    async fn replace(&self, session_id: &str, messages: Vec<Message>) -> anyhow::Result<()> {
        self.entries.insert(cache_key(session_id), Arc::new(messages));
        Ok(())
    }

    async fn clear(&self, session_id: &str) -> anyhow::Result<()> {
        self.entries.invalidate(&cache_key(session_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(question: &str, answer: &str) -> Vec<Message> {
        vec![Message::user(question), Message::assistant(answer)]
    }

    #[tokio::test]
    async fn test_missing_entry_reads_as_none() {
        let cache = MokaHistoryCache::new(Duration::from_secs(60), 100);
        assert!(cache.get("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_append_keeps_order() {
        let cache = MokaHistoryCache::new(Duration::from_secs(60), 100);
        cache.append("s1", &turn("q1", "a1")).await.unwrap();
        cache.append("s1", &turn("q2", "a2")).await.unwrap();

        let history = cache.get("s1").await.unwrap().unwrap();
        let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["q1", "a1", "q2", "a2"]);
        assert!(cache.get("s2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_entries_expire_after_ttl() {
        let cache = MokaHistoryCache::new(Duration::from_millis(50), 100);
        cache.append("s1", &turn("q", "a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(cache.get("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_renews_expiry() {
        let cache = MokaHistoryCache::new(Duration::from_millis(300), 100);
        cache.append("s1", &turn("q1", "a1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        cache.append("s1", &turn("q2", "a2")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let history = cache.get("s1").await.unwrap().unwrap();
        assert_eq!(history.len(), 4);
    }

    #[tokio::test]
    async fn test_replace_and_clear() {
        let cache = MokaHistoryCache::new(Duration::from_secs(60), 100);
        cache.append("s1", &turn("old", "old")).await.unwrap();
        cache.replace("s1", turn("new", "new")).await.unwrap();
        assert_eq!(cache.get("s1").await.unwrap().unwrap()[0].content, "new");

        cache.clear("s1").await.unwrap();
        assert!(cache.get("s1").await.unwrap().is_none());
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn test_cache_key_scheme() {
        assert_eq!(cache_key("abc"), "chat:abc");
    }
}
