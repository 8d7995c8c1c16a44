//! The job queue: enqueue work, process it asynchronously, retry on failure.
//!
//! `JobQueue::initialize` tries the durable backend first. If it cannot be
//! reached within the connect timeout (after local retries), the queue logs
//! a warning and runs on the in-process [`MemoryQueueBackend`] for the rest
//! of the process lifetime; `is_fallback_mode()` reports which one is live.
//!
//! Each registered queue gets one worker loop. The loop claims due jobs
//! (bounded by `worker_concurrency`) and runs every job on its own task, so
//! a handler awaiting I/O never blocks the others. Enqueues wake the loop;
//! a poll tick picks up delayed and retried jobs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use reportflow_types::config::QueueConfig;
use reportflow_types::error::{HandlerError, QueueError};
use reportflow_types::event::EngineEvent;
use reportflow_types::job::{
    Job, JobCounts, JobFailure, JobPayload, JobSettlement, JobStatus, NewJob, TerminalReason,
};
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use super::backend::{BoxQueueBackend, QueueConnector};
use super::handler::{BoxJobHandler, JobHandler};
use super::memory::MemoryQueueBackend;
use crate::clock::SharedClock;
use crate::event::EventBus;
use crate::resilience::retry::{RetryPolicy, backoff_delay, with_retry_if};
use crate::task::join_error_message;

/// Per-enqueue options.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Lower value is processed sooner.
    pub priority: i32,
    /// Earliest processing time, relative to now.
    pub delay: Duration,
    /// Defaults to `QueueConfig::default_max_attempts`.
    pub max_attempts: Option<u32>,
    /// Enqueueing twice with the same key creates one job.
    pub dedup_key: Option<String>,
}

impl EnqueueOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }
}

/// One job taken through a processing cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedJob {
    pub job_id: Uuid,
    pub settlement: JobSettlement,
}

/// Cheaply cloneable handle to a job queue.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    backend: BoxQueueBackend,
    fallback: bool,
    config: QueueConfig,
    clock: SharedClock,
    events: EventBus,
    handlers: DashMap<String, Arc<BoxJobHandler>>,
    wakeups: DashMap<String, Arc<Notify>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    started: AtomicBool,
}

impl JobQueue {
    /// Connect to the durable backend, falling back to the in-process queue
    /// when it is unreachable.
    pub async fn initialize<C: QueueConnector>(
        connector: &C,
        config: QueueConfig,
        clock: SharedClock,
        events: EventBus,
    ) -> Self {
        let timeout = config.connect_timeout();
        let policy = RetryPolicy::new(config.connect_retries, Duration::from_millis(200))
            .with_max_elapsed(timeout);
        let connect = with_retry_if(
            &policy,
            || connector.connect(),
            |e| matches!(e, QueueError::Connection(_)),
        );

        match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(backend)) => {
                tracing::info!(backend = backend.kind(), "connected to durable queue backend");
                Self::from_parts(backend, false, config, clock, events)
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "durable queue backend unavailable, using in-process fallback");
                Self::in_process(config, clock, events)
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "timed out connecting to durable queue backend, using in-process fallback"
                );
                Self::in_process(config, clock, events)
            }
        }
    }

    /// A queue over an already-connected durable backend.
    pub fn with_backend(
        backend: BoxQueueBackend,
        config: QueueConfig,
        clock: SharedClock,
        events: EventBus,
    ) -> Self {
        Self::from_parts(backend, false, config, clock, events)
    }

    /// A queue running on the in-process fallback backend.
    pub fn in_process(config: QueueConfig, clock: SharedClock, events: EventBus) -> Self {
        Self::from_parts(
            BoxQueueBackend::new(MemoryQueueBackend::new()),
            true,
            config,
            clock,
            events,
        )
    }

    fn from_parts(
        backend: BoxQueueBackend,
        fallback: bool,
        config: QueueConfig,
        clock: SharedClock,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                backend,
                fallback,
                config,
                clock,
                events,
                handlers: DashMap::new(),
                wakeups: DashMap::new(),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_fallback_mode(&self) -> bool {
        self.inner.fallback
    }

    pub fn backend_kind(&self) -> &'static str {
        self.inner.backend.kind()
    }

    // -----------------------------------------------------------------------
    // Producing
    // -----------------------------------------------------------------------

    /// Enqueue a typed job. Returns the job id, or the id of the existing job
    /// when `dedup_key` matches one.
    pub async fn enqueue(
        &self,
        queue: &str,
        payload: &JobPayload,
        opts: EnqueueOptions,
    ) -> Result<Uuid, QueueError> {
        let body = payload
            .to_value()
            .map_err(|e| QueueError::Validation(format!("unserializable payload: {e}")))?;
        self.push(queue, payload.job_name(), body, opts).await
    }

    /// Enqueue an untyped job, e.g. from the management surface. The payload
    /// is decoded up front; anything that is not a known job is rejected.
    pub async fn enqueue_raw(
        &self,
        queue: &str,
        job_name: &str,
        payload: serde_json::Value,
        opts: EnqueueOptions,
    ) -> Result<Uuid, QueueError> {
        JobPayload::decode(job_name, &payload)
            .map_err(|e| QueueError::Validation(format!("malformed '{job_name}' payload: {e}")))?;
        self.push(queue, job_name, payload, opts).await
    }

    async fn push(
        &self,
        queue: &str,
        job_name: &str,
        payload: serde_json::Value,
        opts: EnqueueOptions,
    ) -> Result<Uuid, QueueError> {
        if queue.trim().is_empty() {
            return Err(QueueError::Validation("queue name must not be empty".to_string()));
        }
        let max_attempts = opts
            .max_attempts
            .unwrap_or(self.inner.config.default_max_attempts);
        if max_attempts == 0 {
            return Err(QueueError::Validation("max_attempts must be at least 1".to_string()));
        }
        let delay = chrono::Duration::from_std(opts.delay)
            .map_err(|_| QueueError::Validation("delay out of range".to_string()))?;

        let now = self.inner.clock.now();
        let outcome = self
            .inner
            .backend
            .push(NewJob {
                queue_name: queue.to_string(),
                job_name: job_name.to_string(),
                payload,
                priority: opts.priority,
                max_attempts,
                scheduled_at: now + delay,
                dedup_key: opts.dedup_key,
                created_at: now,
            })
            .await?;

        if outcome.deduplicated {
            tracing::debug!(job_id = %outcome.id, queue, job_name, "duplicate enqueue ignored");
        } else {
            tracing::debug!(job_id = %outcome.id, queue, job_name, "job enqueued");
            self.inner.events.publish(EngineEvent::JobEnqueued {
                job_id: outcome.id,
                queue: queue.to_string(),
                job_name: job_name.to_string(),
            });
            self.inner.wake(queue);
        }
        Ok(outcome.id)
    }

    // -----------------------------------------------------------------------
    // Consuming
    // -----------------------------------------------------------------------

    /// Register the handler for a queue. Replaces any previous handler.
    pub fn register_worker<H: JobHandler + 'static>(&self, queue: &str, handler: H) {
        let replaced = self
            .inner
            .handlers
            .insert(queue.to_string(), Arc::new(BoxJobHandler::new(handler)))
            .is_some();
        tracing::debug!(queue, replaced, "worker registered");

        if !replaced && self.inner.started.load(Ordering::SeqCst) {
            self.spawn_worker(queue.to_string());
        }
    }

    /// Recover abandoned claims and start one worker loop per registered queue.
    pub async fn start(&self) -> Result<(), QueueError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let stale_after = chrono::Duration::from_std(self.inner.config.stale_after())
            .unwrap_or_else(|_| chrono::Duration::MAX);
        let cutoff = self
            .inner
            .clock
            .now()
            .checked_sub_signed(stale_after)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
        let requeued = self.inner.backend.requeue_stale(cutoff).await?;
        if requeued > 0 {
            tracing::warn!(requeued, "returned abandoned active jobs to pending");
        }

        let queues: Vec<String> = self.inner.handlers.iter().map(|e| e.key().clone()).collect();
        for queue in &queues {
            self.spawn_worker(queue.clone());
        }
        tracing::info!(
            backend = self.inner.backend.kind(),
            fallback = self.inner.fallback,
            workers = queues.len(),
            "job queue started"
        );
        Ok(())
    }

    /// Stop claiming new jobs and wait for in-flight jobs to settle.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        tracing::info!("job queue stopped");
    }

    /// Claim and process one due job of `queue` on the calling task.
    ///
    /// Returns `None` when nothing is due.
    pub async fn process_next(&self, queue: &str) -> Result<Option<ProcessedJob>, QueueError> {
        let handler = self.inner.handler(queue)?;
        let now = self.inner.clock.now();
        match self.inner.backend.pop(queue, now).await? {
            Some(job) => {
                let job_id = job.id;
                let settlement = self.inner.process(handler, job).await?;
                Ok(Some(ProcessedJob { job_id, settlement }))
            }
            None => Ok(None),
        }
    }

    fn spawn_worker(&self, queue: String) {
        let inner = self.inner.clone();
        self.inner.tracker.spawn(async move {
            inner.worker_loop(queue).await;
        });
    }

    // -----------------------------------------------------------------------
    // Management
    // -----------------------------------------------------------------------

    /// Force an immediate re-attempt regardless of the backoff schedule.
    pub async fn retry_job(&self, id: Uuid) -> Result<Job, QueueError> {
        let job = self
            .inner
            .backend
            .retry_now(id, self.inner.clock.now())
            .await?;
        tracing::info!(job_id = %id, queue = %job.queue_name, "job retry forced");
        self.inner.wake(&job.queue_name);
        Ok(job)
    }

    /// Purge completed jobs that finished more than `older_than` ago.
    pub async fn cleanup_completed(&self, older_than: Duration) -> Result<u64, QueueError> {
        self.cleanup(JobStatus::Completed, older_than).await
    }

    /// Purge failed jobs that finished more than `older_than` ago. Failures
    /// are retained separately from completions.
    pub async fn cleanup_failed(&self, older_than: Duration) -> Result<u64, QueueError> {
        self.cleanup(JobStatus::Failed, older_than).await
    }

    async fn cleanup(&self, status: JobStatus, older_than: Duration) -> Result<u64, QueueError> {
        let older_than = chrono::Duration::from_std(older_than)
            .map_err(|_| QueueError::Validation("retention out of range".to_string()))?;
        let cutoff = self.inner.clock.now() - older_than;
        let removed = self.inner.backend.cleanup(status, cutoff).await?;
        if removed > 0 {
            tracing::info!(removed, %status, "purged finished jobs");
        }
        Ok(removed)
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Option<Job>, QueueError> {
        self.inner.backend.get(id).await
    }

    pub async fn counts(&self, queue: &str) -> Result<JobCounts, QueueError> {
        self.inner.backend.counts(queue).await
    }
}

impl QueueInner {
    fn wakeup(&self, queue: &str) -> Arc<Notify> {
        self.wakeups
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn wake(&self, queue: &str) {
        self.wakeup(queue).notify_one();
    }

    fn handler(&self, queue: &str) -> Result<Arc<BoxJobHandler>, QueueError> {
        self.handlers
            .get(queue)
            .map(|h| h.clone())
            .ok_or_else(|| QueueError::Validation(format!("no worker registered for queue '{queue}'")))
    }

    async fn worker_loop(self: Arc<Self>, queue: String) {
        let notify = self.wakeup(&queue);
        let permits = Arc::new(Semaphore::new(self.config.worker_concurrency.max(1)));
        let poll = self.config.poll_interval();
        tracing::debug!(queue = %queue, "worker loop started");

        loop {
            // Claim due jobs while permits remain.
            loop {
                let permit = tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    permit = permits.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                };
                let handler = match self.handler(&queue) {
                    Ok(handler) => handler,
                    Err(_) => break,
                };
                let job = match self.backend.pop(&queue, self.clock.now()).await {
                    Ok(Some(job)) => job,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(queue = %queue, error = %e, "failed to claim job");
                        break;
                    }
                };

                let inner = self.clone();
                self.tracker.spawn(async move {
                    let _permit = permit;
                    let job_id = job.id;
                    let queue = job.queue_name.clone();
                    if let Err(e) = inner.process(handler, job).await {
                        tracing::error!(%job_id, error = %e, "failed to settle job");
                    }
                    // A freed slot may admit a job that was already due.
                    inner.wake(&queue);
                });
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = notify.notified() => {}
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    /// Run the handler on its own task (so a panic is contained) and settle
    /// the attempt.
    async fn process(
        &self,
        handler: Arc<BoxJobHandler>,
        job: Job,
    ) -> Result<JobSettlement, QueueError> {
        let job_id = job.id;
        let queue = job.queue_name.clone();
        let job_name = job.job_name.clone();
        let attempts = job.attempts;
        let max_attempts = job.max_attempts;

        let outcome = match tokio::spawn(async move { handler.handle(job).await }).await {
            Ok(result) => result,
            Err(join_err) => Err(HandlerError::Failed(format!(
                "handler {}",
                join_error_message(join_err)
            ))),
        };

        let now = self.clock.now();
        match outcome {
            Ok(()) => {
                self.backend.ack(job_id, now).await?;
                tracing::info!(%job_id, queue = %queue, job_name = %job_name, "job completed");
                self.events.publish(EngineEvent::JobCompleted { job_id, queue });
                Ok(JobSettlement::Completed)
            }
            Err(HandlerError::Poison(msg)) => {
                self.fail(job_id, TerminalReason::Poison, format!("poison message: {msg}"))
                    .await
            }
            Err(HandlerError::Failed(msg)) => {
                let attempts = attempts + 1;
                if attempts < max_attempts {
                    let delay = backoff_delay(
                        self.config.backoff_base(),
                        self.config.backoff_max(),
                        attempts - 1,
                    );
                    let retry_at = now
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::zero());
                    let job = self
                        .backend
                        .nack(
                            job_id,
                            JobFailure {
                                error: msg.clone(),
                                retry_at: Some(retry_at),
                            },
                            now,
                        )
                        .await?;
                    tracing::warn!(
                        %job_id,
                        queue = %queue,
                        job_name = %job_name,
                        attempts = job.attempts,
                        max_attempts,
                        %retry_at,
                        error = %msg,
                        "job failed, retry scheduled"
                    );
                    self.events.publish(EngineEvent::JobRetryScheduled {
                        job_id,
                        attempts: job.attempts,
                        retry_at,
                    });
                    Ok(JobSettlement::RetryScheduled {
                        attempts: job.attempts,
                        retry_at,
                    })
                } else {
                    self.fail(
                        job_id,
                        TerminalReason::MaxAttemptsExceeded,
                        format!("max attempts exceeded ({max_attempts}): {msg}"),
                    )
                    .await
                }
            }
        }
    }

    async fn fail(
        &self,
        job_id: Uuid,
        reason: TerminalReason,
        error: String,
    ) -> Result<JobSettlement, QueueError> {
        let job = self
            .backend
            .nack(
                job_id,
                JobFailure {
                    error: error.clone(),
                    retry_at: None,
                },
                self.clock.now(),
            )
            .await?;
        tracing::error!(%job_id, queue = %job.queue_name, %reason, error = %error, "job failed permanently");
        self.events.publish(EngineEvent::JobFailed {
            job_id,
            reason,
            error,
        });
        Ok(JobSettlement::Failed {
            attempts: job.attempts,
            reason,
        })
    }
}
