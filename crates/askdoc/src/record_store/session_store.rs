use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use super::schema::*;
use super::{format_timestamp, is_unique_violation, SqliteConn, SqlitePool, StoreError, StoreResult};
use crate::utils::text_utils::approx_tokens;

const SESSION_COLUMNS: &str = "id, user_id, document_id, title, is_pinned, status, \
     total_tokens, last_activity, created_at, updated_at";

pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> StoreResult<SqliteConn> {
        Ok(self.pool.get()?)
    }

    pub fn create_session(&self, new: NewSession) -> StoreResult<Session> {
        let conn = self.get_conn()?;
        let session = insert_session(&conn, new, false)?;
        info!(session_id = %session.id, document_id = %session.document_id, "Created session");
        Ok(session)
    }

    /// Opens the first session for a freshly indexed document.
    ///
    /// Check-then-create inside one write transaction: if the document already
    /// has its initial session that session is returned with `false`, so a
    /// redelivered ingestion job never opens a second one.
    pub fn create_initial_session(&self, new: NewSession) -> StoreResult<(Session, bool)> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM sessions WHERE document_id = ?1 AND is_initial = 1",
                [&new.document_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            let session = load_session(&tx, &id)?
                .ok_or_else(|| StoreError::not_found("session", id.clone()))?;
            debug!(session_id = %id, document_id = %new.document_id, "Initial session already exists");
            return Ok((session, false));
        }

        let session = match insert_session(&tx, new, true) {
            Ok(session) => session,
            Err(StoreError::Database(e)) if is_unique_violation(&e) => {
                return Err(StoreError::Corrupt(
                    "initial session appeared inside a write transaction".to_string(),
                ));
            }
            Err(e) => return Err(e),
        };
        tx.commit()?;

        info!(session_id = %session.id, document_id = %session.document_id, "Created initial session");
        Ok((session, true))
    }

    pub fn get_session(&self, id: &str) -> StoreResult<Option<Session>> {
        let conn = self.get_conn()?;
        load_session(&conn, id)
    }

    pub fn get_session_for_owner(&self, id: &str, user_id: &str) -> StoreResult<Option<Session>> {
        let conn = self.get_conn()?;
        let owned: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sessions WHERE id = ?1 AND user_id = ?2)",
            params![id, user_id],
            |row| row.get(0),
        )?;
        if !owned {
            return Ok(None);
        }
        load_session(&conn, id)
    }

    /// Pinned sessions first, then by most recent activity.
    pub fn list_sessions_for_user(&self, user_id: &str) -> StoreResult<Vec<SessionSummary>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT s.id, s.user_id, s.document_id, s.title, s.is_pinned, s.status,
                    s.total_tokens, s.last_activity, s.created_at, s.updated_at,
                    (SELECT COUNT(*) FROM messages m WHERE m.session_id = s.id)
             FROM sessions s
             WHERE s.user_id = ?1
             ORDER BY s.is_pinned DESC, s.last_activity DESC",
        )?;
        let mut rows = stmt.query([user_id])?;
        let mut sessions = Vec::new();
        while let Some(row) = rows.next()? {
            let message_count: i64 = row.get(10)?;
            let session = session_from_row(row)?;
            sessions.push(SessionSummary {
                id: session.id,
                user_id: session.user_id,
                document_id: session.document_id,
                title: session.title,
                is_pinned: session.is_pinned,
                status: session.status,
                message_count,
                metadata: session.metadata,
                created_at: session.created_at,
                updated_at: session.updated_at,
            });
        }
        Ok(sessions)
    }

    pub fn count_sessions_for_document(&self, document_id: &str) -> StoreResult<i64> {
        let conn = self.get_conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE document_id = ?1",
            [document_id],
            |row| row.get(0),
        )?)
    }

    /// Appends one user/assistant pair as a single write.
    ///
    /// `total_tokens` grows by the approximate token count of the user message
    /// and `last_activity` never moves backwards.
    pub fn append_turn(
        &self,
        session_id: &str,
        user_message: &Message,
        assistant_message: &Message,
    ) -> StoreResult<SessionMetadata> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<(i64, String, i64)> = tx
            .query_row(
                "SELECT total_tokens, last_activity,
                        (SELECT COALESCE(MAX(message_index) + 1, 0) FROM messages WHERE session_id = ?1)
                 FROM sessions WHERE id = ?1",
                [session_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let (total_tokens, last_activity, next_index) =
            current.ok_or_else(|| StoreError::not_found("session", session_id))?;

        for (offset, message) in [user_message, assistant_message].into_iter().enumerate() {
            insert_message(&tx, session_id, next_index + offset as i64, message)?;
        }

        let now = Utc::now().max(parse_timestamp(&last_activity)?);
        let total_tokens = total_tokens as u64 + approx_tokens(&user_message.content);
        tx.execute(
            "UPDATE sessions SET total_tokens = ?1, last_activity = ?2, updated_at = ?2 WHERE id = ?3",
            params![total_tokens as i64, format_timestamp(now), session_id],
        )?;
        tx.commit()?;

        debug!(session_id, total_tokens, "Appended chat turn");
        Ok(SessionMetadata {
            total_tokens,
            last_activity: now,
        })
    }

    /// The last `limit` messages in conversation order.
    pub fn recent_messages(&self, session_id: &str, limit: usize) -> StoreResult<Vec<Message>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT role, content, metadata, created_at FROM (
                 SELECT message_index, role, content, metadata, created_at
                 FROM messages WHERE session_id = ?1
                 ORDER BY message_index DESC LIMIT ?2
             ) ORDER BY message_index ASC",
        )?;
        let mut rows = stmt.query(params![session_id, limit as i64])?;
        let mut messages = Vec::new();
        while let Some(row) = rows.next()? {
            messages.push(message_from_row(row)?);
        }
        Ok(messages)
    }

    pub fn rename_session(&self, id: &str, title: &str) -> StoreResult<()> {
        self.update_one(
            id,
            "title = ?1",
            title,
        )
    }

    pub fn set_pinned(&self, id: &str, pinned: bool) -> StoreResult<()> {
        self.update_one(
            id,
            "is_pinned = ?1",
            pinned,
        )
    }

    pub fn set_session_status(&self, id: &str, status: SessionStatus) -> StoreResult<()> {
        self.update_one(
            id,
            "status = ?1",
            status.as_str(),
        )
    }

    /// Every save also stamps `last_activity` and `updated_at`.
    fn update_one(&self, id: &str, assignment: &str, value: impl rusqlite::ToSql) -> StoreResult<()> {
        let conn = self.get_conn()?;
        let sql = format!(
            "UPDATE sessions SET {assignment}, last_activity = MAX(last_activity, ?2), updated_at = ?2 WHERE id = ?3"
        );
        let updated = conn.execute(&sql, params![value, format_timestamp(Utc::now()), id])?;
        if updated == 0 {
            return Err(StoreError::not_found("session", id));
        }
        Ok(())
    }

    /// Removes the session and, by cascade, its messages.
    pub fn delete_session(&self, id: &str) -> StoreResult<bool> {
        let conn = self.get_conn()?;
        let deleted = conn.execute("DELETE FROM sessions WHERE id = ?1", [id])?;
        Ok(deleted > 0)
    }
}

fn insert_session(conn: &Connection, new: NewSession, is_initial: bool) -> StoreResult<Session> {
    let now = Utc::now();
    let session = Session {
        id: Uuid::new_v4().to_string(),
        user_id: new.user_id,
        document_id: new.document_id,
        title: new.title,
        messages: Vec::new(),
        is_pinned: false,
        status: SessionStatus::Active,
        metadata: SessionMetadata {
            total_tokens: 0,
            last_activity: now,
        },
        created_at: now,
        updated_at: now,
    };
    conn.execute(
        &format!(
            "INSERT INTO sessions ({SESSION_COLUMNS}, is_initial)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
        ),
        params![
            session.id,
            session.user_id,
            session.document_id,
            session.title,
            session.is_pinned,
            session.status.as_str(),
            0_i64,
            format_timestamp(now),
            format_timestamp(now),
            format_timestamp(now),
            is_initial,
        ],
    )?;
    Ok(session)
}

fn insert_message(conn: &Connection, session_id: &str, index: i64, message: &Message) -> StoreResult<()> {
    let metadata = message
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        "INSERT INTO messages (session_id, message_index, role, content, metadata, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            session_id,
            index,
            message.role.as_str(),
            message.content,
            metadata,
            format_timestamp(message.created_at),
        ],
    )?;
    Ok(())
}

fn load_session(conn: &Connection, id: &str) -> StoreResult<Option<Session>> {
    let mut stmt = conn.prepare(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"))?;
    let mut rows = stmt.query([id])?;
    let mut session = match rows.next()? {
        Some(row) => session_from_row(row)?,
        None => return Ok(None),
    };

    let mut stmt = conn.prepare(
        "SELECT role, content, metadata, created_at FROM messages
         WHERE session_id = ?1 ORDER BY message_index ASC",
    )?;
    let mut rows = stmt.query([id])?;
    while let Some(row) = rows.next()? {
        session.messages.push(message_from_row(row)?);
    }
    Ok(Some(session))
}

fn session_from_row(row: &Row<'_>) -> StoreResult<Session> {
    let status: String = row.get(5)?;
    let total_tokens: i64 = row.get(6)?;
    let last_activity: String = row.get(7)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;

    Ok(Session {
        id: row.get(0)?,
        user_id: row.get(1)?,
        document_id: row.get(2)?,
        title: row.get(3)?,
        messages: Vec::new(),
        is_pinned: row.get(4)?,
        status: status.parse()?,
        metadata: SessionMetadata {
            total_tokens: total_tokens.max(0) as u64,
            last_activity: parse_timestamp(&last_activity)?,
        },
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn message_from_row(row: &Row<'_>) -> StoreResult<Message> {
    let role: String = row.get(0)?;
    let metadata: Option<String> = row.get(2)?;
    let created_at: String = row.get(3)?;
    Ok(Message {
        role: role.parse()?,
        content: row.get(1)?,
        metadata: metadata.as_deref().map(serde_json::from_str::<MessageMetadata>).transpose()?,
        created_at: parse_timestamp(&created_at)?,
    })
}
