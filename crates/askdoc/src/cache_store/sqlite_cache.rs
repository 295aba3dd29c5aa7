use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{cache_key, HistoryCache};
use crate::record_store::{
    migrate, migration::Migrations, open_file_pool, open_memory_pool, Message, SqliteConn, SqlitePool,
};

const CACHE_MIGRATIONS: Migrations = &[(1, include_str!("migrations/001_chat_cache.sql"))];

/// [`HistoryCache`] in a SQLite file that every process opens, so a turn
/// cached by one process is visible to the others.
///
/// Entries are JSON message lists that expire `ttl` after their last write.
/// Expired rows read as absent and are purged on the next write.
pub struct SqliteHistoryCache {
    pool: SqlitePool,
    ttl: Duration,
}

impl SqliteHistoryCache {
    pub fn open(db_path: &Path, ttl: Duration) -> anyhow::Result<Self> {
        info!("Opening chat history cache at: {}", db_path.display());
        let pool = open_file_pool(db_path, 4)?;
        migrate(&pool, CACHE_MIGRATIONS)?;
        Ok(Self { pool: Arc::new(pool), ttl })
    }

    pub fn open_in_memory(ttl: Duration) -> anyhow::Result<Self> {
        let pool = open_memory_pool()?;
        migrate(&pool, CACHE_MIGRATIONS)?;
        Ok(Self { pool: Arc::new(pool), ttl })
    }

    fn get_conn(&self) -> anyhow::Result<SqliteConn> {
        self.pool.get().map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    fn expires_at(&self, now: i64) -> i64 {
        now.saturating_add(i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX))
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn read_live(conn: &Connection, key: &str, now: i64) -> anyhow::Result<Option<Vec<Message>>> {
    let json: Option<String> = conn
        .query_row(
            "SELECT messages FROM chat_cache WHERE key = ?1 AND expires_at > ?2",
            params![key, now],
            |row| row.get(0),
        )
        .optional()?;
    Ok(match json {
        Some(json) => Some(serde_json::from_str(&json)?),
        None => None,
    })
}

fn write_entry(conn: &Connection, key: &str, messages: &[Message], expires_at: i64, now: i64) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO chat_cache (key, messages, expires_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET messages = excluded.messages, expires_at = excluded.expires_at",
        params![key, serde_json::to_string(messages)?, expires_at],
    )?;
    let purged = conn.execute("DELETE FROM chat_cache WHERE expires_at <= ?1", [now])?;
    if purged > 0 {
        debug!(purged, "Purged expired history entries");
    }
    Ok(())
}

#[async_trait]
impl HistoryCache for SqliteHistoryCache {
    async fn get(&self, session_id: &str) -> anyhow::Result<Option<Vec<Message>>> {
        let conn = self.get_conn()?;
        read_live(&conn, &cache_key(session_id), now_ms())
    }

    async fn append(&self, session_id: &str, messages: &[Message]) -> anyhow::Result<()> {
        let key = cache_key(session_id);
        let now = now_ms();
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut history = read_live(&tx, &key, now)?.unwrap_or_default();
        history.extend_from_slice(messages);
        write_entry(&tx, &key, &history, self.expires_at(now), now)?;
        tx.commit()?;

        debug!(session_id, cached = history.len(), "Appended to cached history");
        Ok(())
    }

    async fn replace(&self, session_id: &str, messages: Vec<Message>) -> anyhow::Result<()> {
        let now = now_ms();
        let conn = self.get_conn()?;
        write_entry(&conn, &cache_key(session_id), &messages, self.expires_at(now), now)
    }

    async fn clear(&self, session_id: &str) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute("DELETE FROM chat_cache WHERE key = ?1", [cache_key(session_id)])?;
        Ok(())
    }
}
