//! SQLite-backed durable job storage shared by every named queue

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::options::{JobOptions, KeepJobs};
use super::{FailOutcome, Job, JobState, QueueCounts, QueueError, QueueResult};
use crate::record_store::{migrate, migration::Migrations, open_file_pool, open_memory_pool, SqliteConn, SqlitePool};
use crate::utils::truncate_chars;

const QUEUE_MIGRATIONS: Migrations = &[(1, include_str!("migrations/001_jobs.sql"))];

const JOB_COLUMNS: &str = "id, queue, name, payload, options, state, attempts_made, max_attempts, \
     available_at, locked_by, locked_at, finished_at, last_error, created_at";

const MAX_ERROR_CHARS: usize = 4000;

pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        info!("Opening job queue at: {}", db_path.display());
        let pool = open_file_pool(db_path, 8)?;
        migrate(&pool, QUEUE_MIGRATIONS)?;
        Ok(Self { pool: Arc::new(pool) })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let pool = open_memory_pool()?;
        migrate(&pool, QUEUE_MIGRATIONS)?;
        Ok(Self { pool: Arc::new(pool) })
    }

    fn get_conn(&self) -> QueueResult<SqliteConn> {
        Ok(self.pool.get()?)
    }

    pub fn enqueue(
        &self,
        queue: &str,
        name: &str,
        payload: &serde_json::Value,
        options: &JobOptions,
    ) -> QueueResult<i64> {
        let now = now_ms();
        let available_at = now.saturating_add(i64::try_from(options.delay_ms).unwrap_or(i64::MAX));
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO jobs (queue, name, payload, options, state, attempts_made, max_attempts,
                               available_at, created_at)
             VALUES (?1, ?2, ?3, ?4, 'waiting', 0, ?5, ?6, ?7)",
            params![
                queue,
                name,
                serde_json::to_string(payload)?,
                serde_json::to_string(options)?,
                options.attempts.max(1),
                available_at,
                now,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Leases the oldest ready job of `queue` to `worker_id`.
    ///
    /// Each claim counts as one attempt.
    pub fn claim(&self, queue: &str, worker_id: &str) -> QueueResult<Option<Job>> {
        let now = now_ms();
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let next: Option<i64> = tx
            .query_row(
                "SELECT id FROM jobs
                 WHERE queue = ?1 AND state = 'waiting' AND available_at <= ?2
                 ORDER BY available_at ASC, id ASC
                 LIMIT 1",
                params![queue, now],
                |row| row.get(0),
            )
            .optional()?;
        let Some(job_id) = next else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE jobs
             SET state = 'active', attempts_made = attempts_made + 1, locked_by = ?1, locked_at = ?2
             WHERE id = ?3",
            params![worker_id, now, job_id],
        )?;
        let job = load_job(&tx, job_id)?.ok_or(QueueError::NotFound(job_id))?;
        tx.commit()?;

        debug!(job_id, queue, worker = worker_id, attempt = job.attempts_made, "Claimed job");
        Ok(Some(job))
    }

    /// Marks a job completed if `worker_id` still holds its lease.
    /// Returns `false`, writing nothing, when the lease was lost.
    pub fn complete(&self, job_id: i64, worker_id: &str) -> QueueResult<bool> {
        let now = now_ms();
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let updated = tx.execute(
            "UPDATE jobs
             SET state = 'completed', finished_at = ?1, locked_by = NULL, locked_at = NULL
             WHERE id = ?2 AND state = 'active' AND locked_by = ?3",
            params![now, job_id, worker_id],
        )?;
        if updated == 0 {
            warn!(job_id, worker = worker_id, "Lease lost before completion, result dropped");
            return Ok(false);
        }

        if let Some(job) = load_job(&tx, job_id)? {
            if let Some(keep) = job.options.remove_on_complete {
                prune_finished(&tx, &job.queue, JobState::Completed, keep, now)?;
            }
        }
        tx.commit()?;
        Ok(true)
    }

    /// Records a failed attempt by the lease holder `worker_id`.
    ///
    /// The job goes back to `waiting` with a backoff delay while attempts
    /// remain, unless `unrecoverable` is set, and to `failed` otherwise.
    /// A worker that no longer holds the lease gets [`FailOutcome::LeaseLost`]
    /// and the job is left untouched.
    pub fn fail(
        &self,
        job_id: i64,
        worker_id: &str,
        error: &str,
        unrecoverable: bool,
    ) -> QueueResult<FailOutcome> {
        let now = now_ms();
        let error = truncate_chars(error, MAX_ERROR_CHARS);
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let job = load_job(&tx, job_id)?.ok_or(QueueError::NotFound(job_id))?;
        if job.state != JobState::Active || job.locked_by.as_deref() != Some(worker_id) {
            warn!(
                job_id,
                worker = worker_id,
                state = job.state.as_str(),
                "Lease lost before failure, result dropped"
            );
            return Ok(FailOutcome::LeaseLost);
        }

        let outcome = if !unrecoverable && job.attempts_made < job.max_attempts {
            let delay = job.options.retry_delay(job.attempts_made);
            tx.execute(
                "UPDATE jobs
                 SET state = 'waiting', available_at = ?1, last_error = ?2,
                     locked_by = NULL, locked_at = NULL
                 WHERE id = ?3",
                params![now.saturating_add(duration_ms(delay)), error.as_ref(), job_id],
            )?;
            FailOutcome::Retrying {
                attempts_made: job.attempts_made,
                delay,
            }
        } else {
            tx.execute(
                "UPDATE jobs
                 SET state = 'failed', finished_at = ?1, last_error = ?2,
                     locked_by = NULL, locked_at = NULL
                 WHERE id = ?3",
                params![now, error.as_ref(), job_id],
            )?;
            if let Some(keep) = job.options.remove_on_fail {
                prune_finished(&tx, &job.queue, JobState::Failed, keep, now)?;
            }
            FailOutcome::Failed {
                attempts_made: job.attempts_made,
            }
        };
        tx.commit()?;
        Ok(outcome)
    }

    /// Returns jobs whose lease is older than `timeout` to the queue.
    ///
    /// This is the redelivery path for a worker that died mid-job. A stalled
    /// job with no attempts left is failed instead.
    pub fn reclaim_stalled(&self, queue: &str, timeout: Duration) -> QueueResult<usize> {
        let now = now_ms();
        let cutoff = now.saturating_sub(duration_ms(timeout));
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let requeued = tx.execute(
            "UPDATE jobs
             SET state = 'waiting', available_at = ?1, locked_by = NULL, locked_at = NULL
             WHERE queue = ?2 AND state = 'active' AND locked_at < ?3 AND attempts_made < max_attempts",
            params![now, queue, cutoff],
        )?;
        let failed = tx.execute(
            "UPDATE jobs
             SET state = 'failed', finished_at = ?1, locked_by = NULL, locked_at = NULL,
                 last_error = COALESCE(last_error, 'job stalled more than the allowed limit')
             WHERE queue = ?2 AND state = 'active' AND locked_at < ?3",
            params![now, queue, cutoff],
        )?;
        tx.commit()?;

        if requeued + failed > 0 {
            warn!(queue, requeued, failed, "Reclaimed stalled jobs");
        }
        Ok(requeued + failed)
    }

    /// Makes every delayed job of `queue` claimable now.
    pub fn promote_delayed(&self, queue: &str) -> QueueResult<usize> {
        let now = now_ms();
        let conn = self.get_conn()?;
        let promoted = conn.execute(
            "UPDATE jobs SET available_at = ?1
             WHERE queue = ?2 AND state = 'waiting' AND available_at > ?1",
            params![now, queue],
        )?;
        if promoted > 0 {
            debug!(queue, promoted, "Promoted delayed jobs");
        }
        Ok(promoted)
    }

    pub fn get_job(&self, job_id: i64) -> QueueResult<Option<Job>> {
        let conn = self.get_conn()?;
        load_job(&conn, job_id)
    }

    pub fn counts(&self, queue: &str) -> QueueResult<QueueCounts> {
        let now = now_ms();
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT state, available_at > ?2 AS delayed, COUNT(*)
             FROM jobs WHERE queue = ?1
             GROUP BY state, delayed",
        )?;
        let mut rows = stmt.query(params![queue, now])?;
        let mut counts = QueueCounts::default();
        while let Some(row) = rows.next()? {
            let state: String = row.get(0)?;
            let delayed: bool = row.get(1)?;
            let count: i64 = row.get(2)?;
            let count = count.max(0) as u64;
            match (state.parse::<JobState>()?, delayed) {
                (JobState::Waiting, true) => counts.delayed += count,
                (JobState::Waiting, false) => counts.waiting += count,
                (JobState::Active, _) => counts.active += count,
                (JobState::Completed, _) => counts.completed += count,
                (JobState::Failed, _) => counts.failed += count,
            }
        }
        Ok(counts)
    }
}

fn prune_finished(
    conn: &Connection,
    queue: &str,
    state: JobState,
    keep: KeepJobs,
    now: i64,
) -> QueueResult<usize> {
    let mut removed = 0;
    if let Some(age_secs) = keep.age_secs {
        let cutoff = now.saturating_sub(i64::try_from(age_secs.saturating_mul(1000)).unwrap_or(i64::MAX));
        removed += conn.execute(
            "DELETE FROM jobs WHERE queue = ?1 AND state = ?2 AND finished_at < ?3",
            params![queue, state.as_str(), cutoff],
        )?;
    }
    if let Some(count) = keep.count {
        removed += conn.execute(
            "DELETE FROM jobs WHERE id IN (
                 SELECT id FROM jobs WHERE queue = ?1 AND state = ?2
                 ORDER BY finished_at DESC, id DESC
                 LIMIT -1 OFFSET ?3
             )",
            params![queue, state.as_str(), i64::try_from(count).unwrap_or(i64::MAX)],
        )?;
    }
    if removed > 0 {
        debug!(queue, state = state.as_str(), removed, "Pruned finished jobs");
    }
    Ok(removed)
}

fn load_job(conn: &Connection, job_id: i64) -> QueueResult<Option<Job>> {
    let mut stmt = conn.prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))?;
    let mut rows = stmt.query([job_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(job_from_row(row)?)),
        None => Ok(None),
    }
}

fn job_from_row(row: &Row<'_>) -> QueueResult<Job> {
    let payload: String = row.get(3)?;
    let options: String = row.get(4)?;
    let state: String = row.get(5)?;
    let attempts_made: i64 = row.get(6)?;
    let max_attempts: i64 = row.get(7)?;
    Ok(Job {
        id: row.get(0)?,
        queue: row.get(1)?,
        name: row.get(2)?,
        payload: serde_json::from_str(&payload)?,
        options: serde_json::from_str(&options)?,
        state: state.parse()?,
        attempts_made: u32::try_from(attempts_made).unwrap_or(0),
        max_attempts: u32::try_from(max_attempts).unwrap_or(1),
        available_at: from_ms(row.get(8)?),
        locked_by: row.get(9)?,
        locked_at: row.get::<_, Option<i64>>(10)?.map(from_ms),
        finished_at: row.get::<_, Option<i64>>(11)?.map(from_ms),
        last_error: row.get(12)?,
        created_at: from_ms(row.get(13)?),
    })
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_ms(value: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(value).single().unwrap_or_default()
}

fn duration_ms(value: Duration) -> i64 {
    i64::try_from(value.as_millis()).unwrap_or(i64::MAX)
}
