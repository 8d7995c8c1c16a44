//! Queue backend port.
//!
//! A backend is the single source of truth for job state. `pop` must be an
//! atomic claim so two workers (possibly in different processes) never
//! process the same job.

use std::future::Future;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use reportflow_types::error::QueueError;
use reportflow_types::job::{Job, JobCounts, JobFailure, JobStatus, NewJob, PushOutcome};
use uuid::Uuid;

pub trait QueueBackend: Send + Sync {
    /// Short label for logs ("sqlite", "memory").
    fn kind(&self) -> &'static str;

    /// Store a job. A job carrying a dedup key that already exists is not
    /// inserted; the existing id is returned instead.
    fn push(&self, job: NewJob) -> impl Future<Output = Result<PushOutcome, QueueError>> + Send;

    /// Claim the next due pending job of `queue`, ordered by priority, then
    /// `scheduled_at`, then insertion. The claimed job is `active`.
    fn pop(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Option<Job>, QueueError>> + Send;

    /// Mark an active job completed.
    fn ack(&self, id: Uuid, now: DateTime<Utc>)
    -> impl Future<Output = Result<(), QueueError>> + Send;

    /// Settle a failed attempt of an active job: increments `attempts`,
    /// records the error, and either re-queues at `retry_at` or fails it.
    fn nack(
        &self,
        id: Uuid,
        failure: JobFailure,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Job, QueueError>> + Send;

    fn get(&self, id: Uuid) -> impl Future<Output = Result<Option<Job>, QueueError>> + Send;

    /// Make a job due immediately. Pending jobs move `scheduled_at` to now;
    /// failed jobs get a fresh attempt budget. Active and completed jobs are
    /// rejected with `InvalidState`.
    fn retry_now(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Job, QueueError>> + Send;

    /// Delete jobs in `status` that finished before `finished_before`.
    fn cleanup(
        &self,
        status: JobStatus,
        finished_before: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64, QueueError>> + Send;

    fn counts(&self, queue: &str) -> impl Future<Output = Result<JobCounts, QueueError>> + Send;

    /// Return active jobs claimed before `claimed_before` to pending.
    fn requeue_stale(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64, QueueError>> + Send;
}

/// Connects to a durable backend.
pub trait QueueConnector: Send + Sync {
    fn connect(&self) -> impl Future<Output = Result<BoxQueueBackend, QueueError>> + Send;
}

// ---------------------------------------------------------------------------
// Dynamic dispatch
// ---------------------------------------------------------------------------

/// Object-safe version of [`QueueBackend`] with boxed futures.
pub trait QueueBackendDyn: Send + Sync {
    fn kind(&self) -> &'static str;
    fn push_boxed(&self, job: NewJob) -> BoxFuture<'_, Result<PushOutcome, QueueError>>;
    fn pop_boxed<'a>(
        &'a self,
        queue: &'a str,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<Option<Job>, QueueError>>;
    fn ack_boxed(&self, id: Uuid, now: DateTime<Utc>) -> BoxFuture<'_, Result<(), QueueError>>;
    fn nack_boxed(
        &self,
        id: Uuid,
        failure: JobFailure,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Job, QueueError>>;
    fn get_boxed(&self, id: Uuid) -> BoxFuture<'_, Result<Option<Job>, QueueError>>;
    fn retry_now_boxed(&self, id: Uuid, now: DateTime<Utc>)
    -> BoxFuture<'_, Result<Job, QueueError>>;
    fn cleanup_boxed(
        &self,
        status: JobStatus,
        finished_before: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<u64, QueueError>>;
    fn counts_boxed<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<JobCounts, QueueError>>;
    fn requeue_stale_boxed(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<u64, QueueError>>;
}

impl<T: QueueBackend> QueueBackendDyn for T {
    fn kind(&self) -> &'static str {
        QueueBackend::kind(self)
    }

    fn push_boxed(&self, job: NewJob) -> BoxFuture<'_, Result<PushOutcome, QueueError>> {
        Box::pin(self.push(job))
    }

    fn pop_boxed<'a>(
        &'a self,
        queue: &'a str,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<Option<Job>, QueueError>> {
        Box::pin(self.pop(queue, now))
    }

    fn ack_boxed(&self, id: Uuid, now: DateTime<Utc>) -> BoxFuture<'_, Result<(), QueueError>> {
        Box::pin(self.ack(id, now))
    }

    fn nack_boxed(
        &self,
        id: Uuid,
        failure: JobFailure,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Job, QueueError>> {
        Box::pin(self.nack(id, failure, now))
    }

    fn get_boxed(&self, id: Uuid) -> BoxFuture<'_, Result<Option<Job>, QueueError>> {
        Box::pin(self.get(id))
    }

    fn retry_now_boxed(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Job, QueueError>> {
        Box::pin(self.retry_now(id, now))
    }

    fn cleanup_boxed(
        &self,
        status: JobStatus,
        finished_before: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<u64, QueueError>> {
        Box::pin(self.cleanup(status, finished_before))
    }

    fn counts_boxed<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<JobCounts, QueueError>> {
        Box::pin(self.counts(queue))
    }

    fn requeue_stale_boxed(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<u64, QueueError>> {
        Box::pin(self.requeue_stale(claimed_before))
    }
}

/// Type-erased queue backend, chosen at runtime (durable or fallback).
pub struct BoxQueueBackend {
    inner: Box<dyn QueueBackendDyn>,
}

impl BoxQueueBackend {
    pub fn new<T: QueueBackend + 'static>(backend: T) -> Self {
        Self {
            inner: Box::new(backend),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.inner.kind()
    }

    pub async fn push(&self, job: NewJob) -> Result<PushOutcome, QueueError> {
        self.inner.push_boxed(job).await
    }

    pub async fn pop(&self, queue: &str, now: DateTime<Utc>) -> Result<Option<Job>, QueueError> {
        self.inner.pop_boxed(queue, now).await
    }

    pub async fn ack(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), QueueError> {
        self.inner.ack_boxed(id, now).await
    }

    pub async fn nack(
        &self,
        id: Uuid,
        failure: JobFailure,
        now: DateTime<Utc>,
    ) -> Result<Job, QueueError> {
        self.inner.nack_boxed(id, failure, now).await
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Job>, QueueError> {
        self.inner.get_boxed(id).await
    }

    pub async fn retry_now(&self, id: Uuid, now: DateTime<Utc>) -> Result<Job, QueueError> {
        self.inner.retry_now_boxed(id, now).await
    }

    pub async fn cleanup(
        &self,
        status: JobStatus,
        finished_before: DateTime<Utc>,
    ) -> Result<u64, QueueError> {
        self.inner.cleanup_boxed(status, finished_before).await
    }

    pub async fn counts(&self, queue: &str) -> Result<JobCounts, QueueError> {
        self.inner.counts_boxed(queue).await
    }

    pub async fn requeue_stale(&self, claimed_before: DateTime<Utc>) -> Result<u64, QueueError> {
        self.inner.requeue_stale_boxed(claimed_before).await
    }
}
