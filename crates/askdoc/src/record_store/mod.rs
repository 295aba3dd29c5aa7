//! Record store - durable SQLite storage for users, documents and chat sessions
pub mod document_store;
pub mod migration;
pub mod schema;
pub mod session_store;
pub mod user_store;

pub use document_store::DocumentStore;
pub use migration::MigrationManager;
pub use schema::*;
pub use session_store::SessionStore;
pub use user_store::UserStore;

use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

pub(crate) type SqlitePool = Arc<Pool<SqliteConnectionManager>>;
pub(crate) type SqliteConn = PooledConnection<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("a document with namespace '{0}' already exists")]
    DuplicateNamespace(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { entity, id: id.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Fixed-width UTC timestamps so that stored values sort lexically.
pub(crate) fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn is_unique_violation(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

/// Opens a pooled file database. Every pooled connection gets the same pragmas.
pub(crate) fn open_file_pool(db_path: &Path, max_size: u32) -> anyhow::Result<Pool<SqliteConnectionManager>> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .with_init(|conn| {
            conn.busy_timeout(Duration::from_secs(5))?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
            conn.execute_batch(
                "PRAGMA foreign_keys = ON;
                 PRAGMA synchronous = NORMAL;",
            )
        });
    Pool::builder()
        .max_size(max_size)
        .build(manager)
        .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))
}

/// Every connection to `:memory:` is a separate database, so the pool holds one.
pub(crate) fn open_memory_pool() -> anyhow::Result<Pool<SqliteConnectionManager>> {
    let manager = SqliteConnectionManager::memory()
        .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
    Pool::builder()
        .max_size(1)
        .build(manager)
        .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))
}

pub(crate) fn migrate(
    pool: &Pool<SqliteConnectionManager>,
    migrations: migration::Migrations,
) -> anyhow::Result<()> {
    let mut conn = pool.get()?;
    MigrationManager::new(&mut conn, migrations).initialize_database()?;
    Ok(())
}

/// Durable record store. Authoritative for documents, sessions and messages.
pub struct RecordStore {
    pub users: UserStore,
    pub documents: DocumentStore,
    pub sessions: SessionStore,
    pool: SqlitePool,
}

impl RecordStore {
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        info!("Opening record store at: {}", db_path.display());
        let pool = open_file_pool(db_path, 10)?;
        migrate(&pool, migration::RECORD_STORE_MIGRATIONS)?;
        info!("Record store initialized successfully");
        Ok(Self::from_pool(Arc::new(pool)))
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let pool = open_memory_pool()?;
        migrate(&pool, migration::RECORD_STORE_MIGRATIONS)?;
        Ok(Self::from_pool(Arc::new(pool)))
    }

    fn from_pool(pool: SqlitePool) -> Self {
        Self {
            users: UserStore::new(Arc::clone(&pool)),
            documents: DocumentStore::new(Arc::clone(&pool)),
            sessions: SessionStore::new(Arc::clone(&pool)),
            pool,
        }
    }

    pub fn stats(&self) -> StoreResult<StoreStats> {
        let conn = self.pool.get()?;
        Ok(migration::get_database_stats(&conn)?)
    }
}

impl Drop for RecordStore {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_store_reopens_with_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("askdoc.db");
        {
            let store = RecordStore::open(&path).unwrap();
            store.users.create_user("U1", Some("u1@example.com")).unwrap();
        }
        let store = RecordStore::open(&path).unwrap();
        assert!(store.users.get_user_by_external_id("U1").unwrap().is_some());
        assert_eq!(store.stats().unwrap().total_users, 1);
    }

    #[test]
    fn test_timestamps_sort_lexically() {
        let earlier = Utc::now();
        let later = earlier + chrono::Duration::milliseconds(1500);
        assert!(format_timestamp(earlier) < format_timestamp(later));
        assert!(format_timestamp(earlier).ends_with('Z'));
    }
}
