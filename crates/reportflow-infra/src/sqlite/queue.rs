//! SQLite-backed durable queue.
//!
//! Implements `QueueBackend` from `reportflow-core`. Claiming is a single
//! `UPDATE ... WHERE id = (SELECT ...) AND status = 'pending' RETURNING *`,
//! so a job is handed to at most one worker even when several processes
//! share the database file.

use chrono::{DateTime, Utc};
use reportflow_core::queue::{BoxQueueBackend, QueueBackend, QueueConnector};
use reportflow_types::error::{QueueError, RepositoryError};
use reportflow_types::job::{Job, JobCounts, JobFailure, JobStatus, NewJob, PushOutcome};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_optional_datetime, parse_uuid};

const JOB_COLUMNS: &str = "id, queue_name, job_name, payload, status, attempts, max_attempts, \
     priority, dedup_key, created_at, scheduled_at, claimed_at, finished_at, last_error";

/// SQLite-backed implementation of `QueueBackend`.
pub struct SqliteQueueBackend {
    pool: DatabasePool,
}

impl SqliteQueueBackend {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Explain why a conditional update matched nothing.
    async fn state_error(&self, id: Uuid) -> QueueError {
        match QueueBackend::get(self, id).await {
            Ok(Some(job)) => QueueError::InvalidState {
                id,
                status: job.status,
            },
            Ok(None) => QueueError::NotFound(id),
            Err(e) => e,
        }
    }
}

// ---------------------------------------------------------------------------
// Internal row type
// ---------------------------------------------------------------------------

struct JobRow {
    id: String,
    queue_name: String,
    job_name: String,
    payload: String,
    status: String,
    attempts: i64,
    max_attempts: i64,
    priority: i64,
    dedup_key: Option<String>,
    created_at: String,
    scheduled_at: String,
    claimed_at: Option<String>,
    finished_at: Option<String>,
    last_error: Option<String>,
}

impl JobRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            queue_name: row.try_get("queue_name")?,
            job_name: row.try_get("job_name")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            priority: row.try_get("priority")?,
            dedup_key: row.try_get("dedup_key")?,
            created_at: row.try_get("created_at")?,
            scheduled_at: row.try_get("scheduled_at")?,
            claimed_at: row.try_get("claimed_at")?,
            finished_at: row.try_get("finished_at")?,
            last_error: row.try_get("last_error")?,
        })
    }

    fn into_job(self) -> Result<Job, RepositoryError> {
        let status: JobStatus = self
            .status
            .parse()
            .map_err(|e: String| RepositoryError::Query(e))?;
        let payload = serde_json::from_str(&self.payload)
            .map_err(|e| RepositoryError::Query(format!("invalid job payload JSON: {e}")))?;

        Ok(Job {
            id: parse_uuid(&self.id)?,
            queue_name: self.queue_name,
            job_name: self.job_name,
            payload,
            status,
            attempts: self.attempts.max(0) as u32,
            max_attempts: self.max_attempts.max(0) as u32,
            priority: self.priority as i32,
            dedup_key: self.dedup_key,
            created_at: parse_datetime(&self.created_at)?,
            scheduled_at: parse_datetime(&self.scheduled_at)?,
            claimed_at: parse_optional_datetime(self.claimed_at.as_deref())?,
            finished_at: parse_optional_datetime(self.finished_at.as_deref())?,
            last_error: self.last_error,
        })
    }
}

fn storage(e: sqlx::Error) -> QueueError {
    QueueError::Storage(e.to_string())
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Result<Job, QueueError> {
    let job = JobRow::from_row(row).map_err(storage)?.into_job()?;
    Ok(job)
}

// ---------------------------------------------------------------------------
// QueueBackend impl
// ---------------------------------------------------------------------------

impl QueueBackend for SqliteQueueBackend {
    fn kind(&self) -> &'static str {
        "sqlite"
    }

    async fn push(&self, job: NewJob) -> Result<PushOutcome, QueueError> {
        let payload = serde_json::to_string(&job.payload)
            .map_err(|e| QueueError::Validation(format!("payload is not serializable: {e}")))?;
        let id = Uuid::now_v7();

        let result = sqlx::query(
            r#"INSERT INTO jobs
               (id, queue_name, job_name, payload, status, attempts, max_attempts,
                priority, dedup_key, created_at, scheduled_at)
               VALUES (?, ?, ?, ?, 'pending', 0, ?, ?, ?, ?, ?)
               ON CONFLICT(dedup_key) DO NOTHING"#,
        )
        .bind(id.to_string())
        .bind(&job.queue_name)
        .bind(&job.job_name)
        .bind(&payload)
        .bind(i64::from(job.max_attempts))
        .bind(i64::from(job.priority))
        .bind(&job.dedup_key)
        .bind(format_datetime(&job.created_at))
        .bind(format_datetime(&job.scheduled_at))
        .execute(&self.pool.writer)
        .await
        .map_err(storage)?;

        if result.rows_affected() > 0 {
            return Ok(PushOutcome {
                id,
                deduplicated: false,
            });
        }

        // Only a dedup-key conflict suppresses the insert.
        let existing: Option<(String,)> = sqlx::query_as("SELECT id FROM jobs WHERE dedup_key = ?")
            .bind(&job.dedup_key)
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(storage)?;
        match existing {
            Some((existing,)) => Ok(PushOutcome {
                id: parse_uuid(&existing)?,
                deduplicated: true,
            }),
            None => Err(QueueError::Storage(format!(
                "insert of job into '{}' was ignored without a dedup match",
                job.queue_name
            ))),
        }
    }

    async fn pop(&self, queue: &str, now: DateTime<Utc>) -> Result<Option<Job>, QueueError> {
        let now = format_datetime(&now);
        let sql = format!(
            r#"UPDATE jobs SET status = 'active', claimed_at = ?
               WHERE id = (
                   SELECT id FROM jobs
                   WHERE queue_name = ? AND status = 'pending' AND scheduled_at <= ?
                   ORDER BY priority ASC, scheduled_at ASC, seq ASC
                   LIMIT 1
               )
               AND status = 'pending'
               RETURNING {JOB_COLUMNS}"#
        );
        let row = sqlx::query(&sql)
            .bind(&now)
            .bind(queue)
            .bind(&now)
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(storage)?;

        row.as_ref().map(row_to_job).transpose()
    }

    async fn ack(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"UPDATE jobs SET status = 'completed', claimed_at = NULL, finished_at = ?
               WHERE id = ? AND status = 'active'"#,
        )
        .bind(format_datetime(&now))
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(storage)?;

        if result.rows_affected() == 0 {
            return Err(self.state_error(id).await);
        }
        Ok(())
    }

    async fn nack(&self, id: Uuid, failure: JobFailure, now: DateTime<Utc>) -> Result<Job, QueueError> {
        let (status, finished_at) = match failure.retry_at {
            Some(_) => (JobStatus::Pending, None),
            None => (JobStatus::Failed, Some(format_datetime(&now))),
        };
        let sql = format!(
            r#"UPDATE jobs SET
                 attempts = MIN(attempts + 1, max_attempts),
                 last_error = ?,
                 claimed_at = NULL,
                 status = ?,
                 scheduled_at = COALESCE(?, scheduled_at),
                 finished_at = ?
               WHERE id = ? AND status = 'active'
               RETURNING {JOB_COLUMNS}"#
        );
        let row = sqlx::query(&sql)
            .bind(&failure.error)
            .bind(status.to_string())
            .bind(failure.retry_at.as_ref().map(format_datetime))
            .bind(finished_at)
            .bind(id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(storage)?;

        match row {
            Some(row) => row_to_job(&row),
            None => Err(self.state_error(id).await),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, QueueError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(storage)?;

        row.as_ref().map(row_to_job).transpose()
    }

    async fn retry_now(&self, id: Uuid, now: DateTime<Utc>) -> Result<Job, QueueError> {
        // SET expressions read the pre-update row, so `status` below is the old one.
        let sql = format!(
            r#"UPDATE jobs SET
                 attempts = CASE WHEN status = 'failed' THEN 0 ELSE attempts END,
                 status = 'pending',
                 scheduled_at = ?,
                 finished_at = NULL
               WHERE id = ? AND status IN ('pending', 'failed')
               RETURNING {JOB_COLUMNS}"#
        );
        let row = sqlx::query(&sql)
            .bind(format_datetime(&now))
            .bind(id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(storage)?;

        match row {
            Some(row) => row_to_job(&row),
            None => Err(self.state_error(id).await),
        }
    }

    async fn cleanup(&self, status: JobStatus, finished_before: DateTime<Utc>) -> Result<u64, QueueError> {
        if !status.is_terminal() {
            return Err(QueueError::Validation(format!(
                "cleanup only applies to finished jobs, not {status}"
            )));
        }
        let result = sqlx::query(
            "DELETE FROM jobs WHERE status = ? AND finished_at IS NOT NULL AND finished_at < ?",
        )
        .bind(status.to_string())
        .bind(format_datetime(&finished_before))
        .execute(&self.pool.writer)
        .await
        .map_err(storage)?;

        Ok(result.rows_affected())
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts, QueueError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM jobs WHERE queue_name = ? GROUP BY status",
        )
        .bind(queue)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(storage)?;

        let mut counts = JobCounts::default();
        for (status, n) in rows {
            let n = n.max(0) as u64;
            match status.parse::<JobStatus>() {
                Ok(JobStatus::Pending) => counts.pending = n,
                Ok(JobStatus::Active) => counts.active = n,
                Ok(JobStatus::Completed) => counts.completed = n,
                Ok(JobStatus::Failed) => counts.failed = n,
                Err(e) => return Err(QueueError::Storage(e)),
            }
        }
        Ok(counts)
    }

    async fn requeue_stale(&self, claimed_before: DateTime<Utc>) -> Result<u64, QueueError> {
        let result = sqlx::query(
            r#"UPDATE jobs SET status = 'pending', claimed_at = NULL
               WHERE status = 'active' AND claimed_at IS NOT NULL AND claimed_at < ?"#,
        )
        .bind(format_datetime(&claimed_before))
        .execute(&self.pool.writer)
        .await
        .map_err(storage)?;

        let requeued = result.rows_affected();
        if requeued > 0 {
            tracing::warn!(requeued, "returned abandoned active jobs to pending");
        }
        Ok(requeued)
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// Opens the durable queue database. Used by `JobQueue::initialize`, which
/// retries and falls back to the in-process backend on failure.
pub struct SqliteQueueConnector {
    database_url: String,
}

impl SqliteQueueConnector {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }
}

impl QueueConnector for SqliteQueueConnector {
    async fn connect(&self) -> Result<BoxQueueBackend, QueueError> {
        let pool = DatabasePool::new(&self.database_url)
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        Ok(BoxQueueBackend::new(SqliteQueueBackend::new(pool)))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    use super::*;
    use crate::sqlite::test_support::test_pool;
    use chrono::Duration;
    use reportflow_core::clock::{Clock, ManualClock, SharedClock};
    use reportflow_core::event::EventBus;
    use reportflow_core::queue::{EnqueueOptions, FnHandler, JobQueue};
    use reportflow_types::config::QueueConfig;
    use reportflow_types::error::HandlerError;
    use reportflow_types::job::{JobPayload, JobSettlement};

    fn new_job(queue: &str, priority: i32, scheduled_at: DateTime<Utc>) -> NewJob {
        NewJob {
            queue_name: queue.to_string(),
            job_name: "run_workflow".to_string(),
            payload: serde_json::json!({ "workflow_id": Uuid::now_v7() }),
            priority,
            max_attempts: 3,
            scheduled_at,
            dedup_key: None,
            created_at: scheduled_at,
        }
    }

    async fn backend() -> SqliteQueueBackend {
        SqliteQueueBackend::new(test_pool().await)
    }

    #[tokio::test]
    async fn pop_orders_by_priority_then_insertion() {
        let q = backend().await;
        let now = Utc::now();
        let low_first = q.push(new_job("reports", 5, now)).await.unwrap().id;
        let low_second = q.push(new_job("reports", 5, now)).await.unwrap().id;
        let urgent = q.push(new_job("reports", 0, now)).await.unwrap().id;
        q.push(new_job("other", -10, now)).await.unwrap();

        let order: Vec<Uuid> = [
            q.pop("reports", now).await.unwrap().unwrap(),
            q.pop("reports", now).await.unwrap().unwrap(),
            q.pop("reports", now).await.unwrap().unwrap(),
        ]
        .into_iter()
        .map(|j| j.id)
        .collect();
        assert_eq!(order, vec![urgent, low_first, low_second]);
        assert!(q.pop("reports", now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pop_claims_job_as_active() {
        let q = backend().await;
        let now = Utc::now();
        let id = q.push(new_job("reports", 0, now)).await.unwrap().id;

        let job = q.pop("reports", now).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.status, JobStatus::Active);
        assert_eq!(job.claimed_at, Some(parse_datetime(&format_datetime(&now)).unwrap()));
        assert_eq!(job.payload["workflow_id"].as_str().map(str::len), Some(36));
    }

    #[tokio::test]
    async fn delayed_job_is_not_claimed_early() {
        let q = backend().await;
        let now = Utc::now();
        q.push(new_job("reports", 0, now + Duration::seconds(30))).await.unwrap();

        assert!(q.pop("reports", now).await.unwrap().is_none());
        assert!(q.pop("reports", now + Duration::seconds(30)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn dedup_key_returns_existing_job() {
        let q = backend().await;
        let now = Utc::now();
        let mut first = new_job("reports", 0, now);
        first.dedup_key = Some("schedule:abc:1".to_string());
        let mut second = first.clone();
        second.payload = serde_json::json!({ "different": true });

        let a = q.push(first).await.unwrap();
        let b = q.push(second).await.unwrap();
        assert!(!a.deduplicated);
        assert!(b.deduplicated);
        assert_eq!(a.id, b.id);
        assert_eq!(q.counts("reports").await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn nack_reschedules_then_fails_with_capped_attempts() {
        let q = backend().await;
        let now = Utc::now();
        let mut job = new_job("reports", 0, now);
        job.max_attempts = 2;
        let id = q.push(job).await.unwrap().id;

        q.pop("reports", now).await.unwrap().unwrap();
        let retry_at = now + Duration::seconds(1);
        let retried = q
            .nack(
                id,
                JobFailure {
                    error: "smtp timeout".to_string(),
                    retry_at: Some(retry_at),
                },
                now,
            )
            .await
            .unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
        assert_eq!(retried.attempts, 1);
        assert!(retried.claimed_at.is_none());
        assert!(q.pop("reports", now).await.unwrap().is_none());

        q.pop("reports", retry_at).await.unwrap().unwrap();
        let failed = q
            .nack(
                id,
                JobFailure {
                    error: "smtp timeout again".to_string(),
                    retry_at: None,
                },
                retry_at,
            )
            .await
            .unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.attempts, 2);
        assert_eq!(failed.last_error.as_deref(), Some("smtp timeout again"));
        assert!(failed.finished_at.is_some());
    }

    #[tokio::test]
    async fn settling_a_job_that_is_not_active_is_rejected() {
        let q = backend().await;
        let now = Utc::now();
        let id = q.push(new_job("reports", 0, now)).await.unwrap().id;

        assert!(matches!(
            q.ack(id, now).await,
            Err(QueueError::InvalidState {
                status: JobStatus::Pending,
                ..
            })
        ));
        let missing = Uuid::now_v7();
        assert!(matches!(q.ack(missing, now).await, Err(QueueError::NotFound(m)) if m == missing));
    }

    #[tokio::test]
    async fn retry_now_restores_failed_and_rejects_completed() {
        let q = backend().await;
        let now = Utc::now();
        let mut job = new_job("reports", 0, now);
        job.max_attempts = 1;
        let failed_id = q.push(job).await.unwrap().id;
        q.pop("reports", now).await.unwrap();
        q.nack(
            failed_id,
            JobFailure {
                error: "boom".to_string(),
                retry_at: None,
            },
            now,
        )
        .await
        .unwrap();

        let later = now + Duration::minutes(5);
        let restored = q.retry_now(failed_id, later).await.unwrap();
        assert_eq!(restored.status, JobStatus::Pending);
        assert_eq!(restored.attempts, 0);
        assert!(restored.finished_at.is_none());
        assert_eq!(restored.last_error.as_deref(), Some("boom"));

        let done_id = q.push(new_job("reports", 0, now)).await.unwrap().id;
        // The restored job was scheduled later, so the new one is claimed first.
        let claimed = q.pop("reports", now).await.unwrap().unwrap();
        assert_eq!(claimed.id, done_id);
        q.ack(done_id, now).await.unwrap();
        assert!(matches!(
            q.retry_now(done_id, later).await,
            Err(QueueError::InvalidState {
                status: JobStatus::Completed,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_jobs_of_the_given_status() {
        let q = backend().await;
        let now = Utc::now();
        let old = q.push(new_job("reports", 0, now)).await.unwrap().id;
        q.pop("reports", now).await.unwrap();
        q.ack(old, now - Duration::days(2)).await.unwrap();

        let recent = q.push(new_job("reports", 0, now)).await.unwrap().id;
        q.pop("reports", now).await.unwrap();
        q.ack(recent, now).await.unwrap();

        assert_eq!(q.cleanup(JobStatus::Failed, now).await.unwrap(), 0);
        assert_eq!(
            q.cleanup(JobStatus::Completed, now - Duration::days(1)).await.unwrap(),
            1
        );
        assert!(q.get(old).await.unwrap().is_none());
        assert!(q.get(recent).await.unwrap().is_some());
        assert!(matches!(
            q.cleanup(JobStatus::Pending, now).await,
            Err(QueueError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn requeue_stale_returns_abandoned_claims() {
        let q = backend().await;
        let now = Utc::now();
        // Claimed an hour ago and never finished.
        let claimed_at = now - Duration::hours(1);
        let id = q.push(new_job("reports", 0, claimed_at)).await.unwrap().id;
        q.pop("reports", claimed_at).await.unwrap().unwrap();

        assert_eq!(q.requeue_stale(now - Duration::minutes(10)).await.unwrap(), 1);
        let job = q.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.claimed_at.is_none());

        let counts = q.counts("reports").await.unwrap();
        assert_eq!(counts, JobCounts { pending: 1, ..JobCounts::default() });
    }

    #[tokio::test]
    async fn concurrent_claims_never_hand_out_a_job_twice() {
        let q = Arc::new(backend().await);
        let now = Utc::now();
        for _ in 0..40 {
            q.push(new_job("reports", 0, now)).await.unwrap();
        }

        let mut workers = Vec::new();
        for _ in 0..8 {
            let q = q.clone();
            workers.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(job) = q.pop("reports", now).await.unwrap() {
                    claimed.push(job.id);
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for w in workers {
            all.extend(w.await.unwrap());
        }
        let unique: HashSet<Uuid> = all.iter().copied().collect();
        assert_eq!(all.len(), 40);
        assert_eq!(unique.len(), 40);
    }

    #[tokio::test]
    async fn connector_failure_is_a_connection_error() {
        let connector = SqliteQueueConnector::new("sqlite:///nonexistent-reportflow-dir/sub/queue.db");
        assert!(matches!(
            connector.connect().await,
            Err(QueueError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn job_queue_over_sqlite_is_durable_mode() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("queue.db").display());
        let clock: SharedClock = Arc::new(ManualClock::new(Utc::now()));
        let config = QueueConfig {
            connect_timeout_ms: 5_000,
            ..QueueConfig::default()
        };

        let queue = JobQueue::initialize(
            &SqliteQueueConnector::new(url),
            config,
            clock.clone(),
            EventBus::default(),
        )
        .await;
        assert!(!queue.is_fallback_mode());
        assert_eq!(queue.backend_kind(), "sqlite");

        queue.register_worker(
            "workflows",
            FnHandler(|_job: Job| async { Err::<(), _>(HandlerError::Failed("upstream 503".into())) }),
        );
        let id = queue
            .enqueue(
                "workflows",
                &JobPayload::RunWorkflow {
                    workflow_id: Uuid::now_v7(),
                },
                EnqueueOptions::default().with_delay(StdDuration::ZERO),
            )
            .await
            .unwrap();

        let processed = queue.process_next("workflows").await.unwrap().unwrap();
        assert_eq!(processed.job_id, id);
        assert!(matches!(
            processed.settlement,
            JobSettlement::RetryScheduled { attempts: 1, .. }
        ));
        let stored = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert!(stored.scheduled_at > clock.now());
    }
}
