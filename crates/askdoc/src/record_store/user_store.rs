use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use tracing::info;
use uuid::Uuid;

use super::schema::{parse_timestamp, User};
use super::{format_timestamp, SqliteConn, SqlitePool, StoreResult};

pub struct UserStore {
    pool: SqlitePool,
}

impl UserStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> StoreResult<SqliteConn> {
        Ok(self.pool.get()?)
    }

    pub fn create_user(&self, external_id: &str, email: Option<&str>) -> StoreResult<User> {
        let user = User {
            id: Uuid::new_v4().to_string(),
            external_id: external_id.to_string(),
            email: email.map(str::to_string),
            created_at: Utc::now(),
        };
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO users (id, external_id, email, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![user.id, user.external_id, user.email, format_timestamp(user.created_at)],
        )?;
        info!(user_id = %user.id, external_id, "Created user");
        Ok(user)
    }

    /// Returns the user for `external_id`, creating it on first sight.
    pub fn ensure_user(&self, external_id: &str, email: Option<&str>) -> StoreResult<User> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO users (id, external_id, email, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                Uuid::new_v4().to_string(),
                external_id,
                email,
                format_timestamp(Utc::now())
            ],
        )?;
        drop(conn);
        self.get_user_by_external_id(external_id)?
            .ok_or_else(|| super::StoreError::not_found("user", external_id))
    }

    pub fn get_user(&self, id: &str) -> StoreResult<Option<User>> {
        self.find_one("SELECT id, external_id, email, created_at FROM users WHERE id = ?1", id)
    }

    pub fn get_user_by_external_id(&self, external_id: &str) -> StoreResult<Option<User>> {
        self.find_one(
            "SELECT id, external_id, email, created_at FROM users WHERE external_id = ?1",
            external_id,
        )
    }

    fn find_one(&self, sql: &str, key: &str) -> StoreResult<Option<User>> {
        let conn = self.get_conn()?;
        let row = conn
            .query_row(sql, [key], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .optional()?;

        row.map(|(id, external_id, email, created_at)| -> StoreResult<User> {
            Ok(User {
                id,
                external_id,
                email,
                created_at: parse_timestamp(&created_at)?,
            })
        })
        .transpose()
    }
}
