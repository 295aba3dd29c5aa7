//! Cache store - expiring per-session chat history
//!
//! The cache only ever holds a copy of what the record store already has, so
//! losing an entry (expiry, eviction, restart) loses no message.
//! [`SqliteHistoryCache`] is shared by every process opening the same file;
//! [`MokaHistoryCache`] lives inside one process.
pub mod moka_cache;
pub mod sqlite_cache;

pub use moka_cache::MokaHistoryCache;
pub use sqlite_cache::SqliteHistoryCache;

use async_trait::async_trait;

use crate::record_store::Message;

/// Default lifetime of a history entry, renewed on every write.
pub const DEFAULT_HISTORY_TTL_SECS: u64 = 60 * 60 * 24 * 7;

pub fn cache_key(session_id: &str) -> String {
    format!("chat:{}", session_id)
}

/// Fast, expiring store of recent chat turns keyed by session.
#[async_trait]
pub trait HistoryCache: Send + Sync {
    /// `None` when the entry is absent or expired.
    async fn get(&self, session_id: &str) -> anyhow::Result<Option<Vec<Message>>>;

    /// Appends in order and renews the entry's expiry.
    async fn append(&self, session_id: &str, messages: &[Message]) -> anyhow::Result<()>;

    /// Overwrites the entry, used when rehydrating from the record store.
    async fn replace(&self, session_id: &str, messages: Vec<Message>) -> anyhow::Result<()>;

    async fn clear(&self, session_id: &str) -> anyhow::Result<()>;
}
