//! Versioned schema migrations shared by the record store and the job queue

use rusqlite::{Connection, OptionalExtension, Result};
use tracing::{error, info, warn};

use super::schema::StoreStats;

/// Ordered list of `(version, sql)` pairs.
pub type Migrations = &'static [(i32, &'static str)];

pub(crate) const RECORD_STORE_MIGRATIONS: Migrations = &[
    (1, include_str!("migrations/001_initial.sql")),
    (2, include_str!("migrations/002_initial_session_marker.sql")),
];

/// Applies pending migrations to one connection
pub struct MigrationManager<'a> {
    conn: &'a mut Connection,
    migrations: Migrations,
}

impl<'a> MigrationManager<'a> {
    pub fn new(conn: &'a mut Connection, migrations: Migrations) -> Self {
        Self { conn, migrations }
    }

    pub fn initialize_database(&mut self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        let current_version = self.get_current_version()?;
        info!("Current database schema version: {}", current_version);

        self.apply_migrations(current_version)
    }

    fn apply_migrations(&mut self, current_version: i32) -> Result<()> {
        for (version, migration_sql) in self.migrations.iter() {
            if *version <= current_version {
                continue;
            }
            info!("Applying migration {}...", version);

            let tx = self.conn.transaction()?;
            if let Err(e) = tx.execute_batch(migration_sql) {
                error!("Failed to apply migration {}: {}", version, e);
                return Err(e);
            }
            tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
            tx.commit()?;

            info!("Migration {} applied successfully", version);
        }
        Ok(())
    }

    pub fn get_current_version(&self) -> Result<i32> {
        self.conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
    }

    pub fn has_migration_applied(&self, version: i32) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT 1 FROM schema_version WHERE version = ?1",
                [version],
                |_| Ok(()),
            )
            .optional()
            .map(|found| found.is_some())
    }
}

pub fn get_database_stats(conn: &Connection) -> Result<StoreStats> {
    fn table_count(conn: &Connection, table_name: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table_name), [], |row| row.get(0))
            .unwrap_or_else(|e| {
                warn!("Failed to count table {}: {}", table_name, e);
                0
            })
    }

    let database_size_bytes: i64 = conn
        .query_row(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(StoreStats {
        total_users: table_count(conn, "users"),
        total_documents: table_count(conn, "documents"),
        total_sessions: table_count(conn, "sessions"),
        total_messages: table_count(conn, "messages"),
        database_size_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_apply_once() {
        let mut conn = Connection::open_in_memory().unwrap();
        {
            let mut migrator = MigrationManager::new(&mut conn, RECORD_STORE_MIGRATIONS);
            migrator.initialize_database().unwrap();
            assert_eq!(migrator.get_current_version().unwrap(), 2);
            assert!(migrator.has_migration_applied(1).unwrap());
        }

        // A second run must be a no-op rather than re-running ALTER TABLE.
        let mut migrator = MigrationManager::new(&mut conn, RECORD_STORE_MIGRATIONS);
        migrator.initialize_database().unwrap();
        assert_eq!(migrator.get_current_version().unwrap(), 2);
        assert!(!migrator.has_migration_applied(3).unwrap());
    }

    #[test]
    fn test_stats_on_empty_database() {
        let mut conn = Connection::open_in_memory().unwrap();
        MigrationManager::new(&mut conn, RECORD_STORE_MIGRATIONS)
            .initialize_database()
            .unwrap();
        let stats = get_database_stats(&conn).unwrap();
        assert_eq!(stats.total_documents, 0);
        assert_eq!(stats.total_messages, 0);
        assert!(stats.database_size_bytes > 0);
    }
}
