use chrono::Utc;
use rusqlite::{params, Connection, Row, TransactionBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use super::schema::*;
use super::{format_timestamp, is_unique_violation, SqliteConn, SqlitePool, StoreError, StoreResult};

const DOCUMENT_COLUMNS: &str = "id, user_id, filename, original_name, mime_type, size_bytes, \
     namespace, path, status, error, page_count, chunk_count, processed_at, created_at, updated_at";

pub struct DocumentStore {
    pool: SqlitePool,
}

impl DocumentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> StoreResult<SqliteConn> {
        Ok(self.pool.get()?)
    }

    /// Inserts a `pending` document.
    ///
    /// Fails with [`StoreError::DuplicateNamespace`] when the namespace is
    /// taken. The unique index backs the explicit check, so two concurrent
    /// uploads of the same file cannot both succeed.
    pub fn create_document(&self, new: NewDocument) -> StoreResult<Document> {
        let now = Utc::now();
        let document = Document {
            id: Uuid::new_v4().to_string(),
            user_id: new.user_id,
            filename: new.filename,
            original_name: new.original_name,
            mime_type: new.mime_type,
            size_bytes: new.size_bytes,
            namespace: new.namespace,
            path: new.path,
            status: DocumentStatus::Pending,
            error: None,
            page_count: None,
            chunk_count: None,
            processed_at: None,
            created_at: now,
            updated_at: now,
        };

        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let taken: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM documents WHERE namespace = ?1)",
            [&document.namespace],
            |row| row.get(0),
        )?;
        if taken {
            return Err(StoreError::DuplicateNamespace(document.namespace));
        }

        let inserted = tx.execute(
            &format!(
                "INSERT INTO documents ({DOCUMENT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
            ),
            params![
                document.id,
                document.user_id,
                document.filename,
                document.original_name,
                document.mime_type,
                document.size_bytes,
                document.namespace,
                document.path,
                document.status.as_str(),
                document.error,
                document.page_count,
                document.chunk_count,
                document.processed_at.map(format_timestamp),
                format_timestamp(document.created_at),
                format_timestamp(document.updated_at),
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(StoreError::DuplicateNamespace(document.namespace));
            }
            Err(e) => return Err(e.into()),
        }
        tx.commit()?;

        info!(document_id = %document.id, namespace = %document.namespace, "Created document");
        Ok(document)
    }

    pub fn get_document(&self, id: &str) -> StoreResult<Option<Document>> {
        let conn = self.get_conn()?;
        query_one(
            &conn,
            &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?1"),
            &[&id],
        )
    }

    pub fn get_document_for_owner(&self, id: &str, user_id: &str) -> StoreResult<Option<Document>> {
        let conn = self.get_conn()?;
        query_one(
            &conn,
            &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?1 AND user_id = ?2"),
            &[&id, &user_id],
        )
    }

    pub fn get_document_by_namespace(&self, namespace: &str) -> StoreResult<Option<Document>> {
        let conn = self.get_conn()?;
        query_one(
            &conn,
            &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE namespace = ?1"),
            &[&namespace],
        )
    }

    /// Newest first.
    pub fn list_documents_for_user(&self, user_id: &str) -> StoreResult<Vec<Document>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE user_id = ?1 ORDER BY created_at DESC"
        ))?;
        let mut rows = stmt.query([user_id])?;
        let mut documents = Vec::new();
        while let Some(row) = rows.next()? {
            documents.push(document_from_row(row)?);
        }
        Ok(documents)
    }

    /// Persists the mutable fields of `document` and refreshes `updated_at`.
    ///
    /// The namespace is never rewritten.
    pub fn save_document(&self, document: &mut Document) -> StoreResult<()> {
        document.updated_at = Utc::now();
        let conn = self.get_conn()?;
        let updated = conn.execute(
            "UPDATE documents
             SET status = ?1, error = ?2, page_count = ?3, chunk_count = ?4,
                 processed_at = ?5, updated_at = ?6
             WHERE id = ?7",
            params![
                document.status.as_str(),
                document.error,
                document.page_count,
                document.chunk_count,
                document.processed_at.map(format_timestamp),
                format_timestamp(document.updated_at),
                document.id,
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::not_found("document", document.id.clone()));
        }
        debug!(document_id = %document.id, status = %document.status, "Saved document");
        Ok(())
    }

    pub fn delete_document(&self, id: &str) -> StoreResult<bool> {
        let conn = self.get_conn()?;
        let deleted = conn.execute("DELETE FROM documents WHERE id = ?1", [id])?;
        Ok(deleted > 0)
    }

    pub fn count_by_status(&self, status: DocumentStatus) -> StoreResult<i64> {
        let conn = self.get_conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE status = ?1",
            [status.as_str()],
            |row| row.get(0),
        )?)
    }
}

fn query_one(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> StoreResult<Option<Document>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    match rows.next()? {
        Some(row) => Ok(Some(document_from_row(row)?)),
        None => Ok(None),
    }
}

fn document_from_row(row: &Row<'_>) -> StoreResult<Document> {
    let status: String = row.get(8)?;
    let processed_at: Option<String> = row.get(12)?;
    let created_at: String = row.get(13)?;
    let updated_at: String = row.get(14)?;

    Ok(Document {
        id: row.get(0)?,
        user_id: row.get(1)?,
        filename: row.get(2)?,
        original_name: row.get(3)?,
        mime_type: row.get(4)?,
        size_bytes: row.get(5)?,
        namespace: row.get(6)?,
        path: row.get(7)?,
        status: status.parse()?,
        error: row.get(9)?,
        page_count: row.get(10)?,
        chunk_count: row.get(11)?,
        processed_at: parse_optional_timestamp(processed_at)?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}
