//! Cron scheduler: one timer task per active schedule.
//!
//! A timer never calls the engine directly. Each trigger enqueues a
//! `scheduled_run` job on the workflow queue, so a slow workflow cannot
//! block the timer, and overlapping runs are left to the engine's lock.
//!
//! Every timer owns a child of the scheduler's root `CancellationToken`;
//! stopping or deleting a schedule cancels exactly that timer, `shutdown()`
//! cancels all of them.
//!
//! Other processes (the CLI) change schedules through the same store. A
//! timer reloads its schedule before every fire and exits once it is gone
//! or no longer active; [`Scheduler::reconcile`] picks up schedules that
//! were created or resumed elsewhere.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use croner::Cron;
use dashmap::DashMap;
use reportflow_types::config::SchedulerConfig;
use reportflow_types::error::SchedulerError;
use reportflow_types::event::EngineEvent;
use reportflow_types::job::JobPayload;
use reportflow_types::schedule::{NewSchedule, Schedule, ScheduleStatus};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use super::normalize::{check_missed_runs, next_occurrence, normalize_schedule, parse_cron};
use crate::clock::SharedClock;
use crate::event::EventBus;
use crate::queue::{EnqueueOptions, JobQueue};
use crate::repository::schedule::ScheduleRepository;
use crate::task::join_error_message;

const NO_FUTURE_OCCURRENCE: &str = "cron expression has no future occurrence";

/// Cheaply cloneable handle to the scheduler.
pub struct Scheduler<S: ScheduleRepository> {
    inner: Arc<SchedulerInner<S>>,
}

impl<S: ScheduleRepository> Clone for Scheduler<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct SchedulerInner<S: ScheduleRepository> {
    repo: Arc<S>,
    queue: JobQueue,
    clock: SharedClock,
    events: EventBus,
    config: SchedulerConfig,
    timers: DashMap<Uuid, CancellationToken>,
    root: CancellationToken,
    tracker: TaskTracker,
}

impl<S: ScheduleRepository + 'static> Scheduler<S> {
    pub fn new(
        repo: Arc<S>,
        queue: JobQueue,
        clock: SharedClock,
        events: EventBus,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                repo,
                queue,
                clock,
                events,
                config,
                timers: DashMap::new(),
                root: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start timers for every active schedule. When enabled, a schedule that
    /// missed runs while the process was down gets one catch-up run.
    ///
    /// A schedule that cannot be started is logged and skipped; the others
    /// still start. Returns the number of running timers.
    pub async fn start(&self) -> Result<usize, SchedulerError> {
        let schedules = self
            .inner
            .repo
            .list(Some(ScheduleStatus::Active))
            .await?;
        let now = self.inner.clock.now();

        for schedule in &schedules {
            if self.inner.config.catch_up_missed {
                self.catch_up(schedule, now).await;
            }
            if let Err(e) = self.start_schedule(schedule).await {
                tracing::error!(schedule_id = %schedule.id, error = %e, "failed to start schedule");
            }
        }

        let running = self.inner.timers.len();
        tracing::info!(schedules = schedules.len(), running, "scheduler started");
        Ok(running)
    }

    async fn catch_up(&self, schedule: &Schedule, now: DateTime<Utc>) {
        let cron = match parse_cron(&schedule.cron) {
            Ok(cron) => cron,
            Err(_) => return,
        };
        let missed = check_missed_runs(&cron, schedule.last_run_at, now);
        if let Some(latest) = missed.last() {
            tracing::warn!(
                schedule_id = %schedule.id,
                missed = missed.len(),
                fire_at = %latest,
                "schedule missed runs while down, catching up once"
            );
            self.inner.fire(schedule, *latest).await;
        }
    }

    /// Cancel every timer and wait for in-progress triggers to finish.
    pub async fn shutdown(&self) {
        self.inner.root.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.timers.clear();
        tracing::info!("scheduler stopped");
    }

    /// Sync timers with the stored schedules: start one for every active
    /// schedule that has none, cancel those whose schedule was deleted or is
    /// no longer active. Returns the number of running timers.
    pub async fn reconcile(&self) -> Result<usize, SchedulerError> {
        if self.inner.root.is_cancelled() {
            return Ok(0);
        }
        let active = self
            .inner
            .repo
            .list(Some(ScheduleStatus::Active))
            .await?;
        let active_ids: HashSet<Uuid> = active.iter().map(|s| s.id).collect();

        let orphaned: Vec<Uuid> = self
            .inner
            .timers
            .iter()
            .map(|entry| *entry.key())
            .filter(|id| !active_ids.contains(id))
            .collect();
        for id in orphaned {
            if self.cancel_timer(id) {
                tracing::info!(schedule_id = %id, "schedule no longer active, timer cancelled");
            }
        }

        for schedule in &active {
            if self.inner.timers.contains_key(&schedule.id) {
                continue;
            }
            match self.start_schedule(schedule).await {
                Ok(()) => tracing::info!(schedule_id = %schedule.id, "timer started for active schedule"),
                Err(e) => {
                    tracing::error!(schedule_id = %schedule.id, error = %e, "failed to start schedule")
                }
            }
        }

        Ok(self.inner.timers.len())
    }

    /// Number of timers currently registered.
    pub fn active_timers(&self) -> usize {
        self.inner.timers.len()
    }

    // -----------------------------------------------------------------------
    // Schedule operations
    // -----------------------------------------------------------------------

    /// Validate, persist and start a schedule.
    ///
    /// An invalid expression is rejected before anything is stored. An
    /// expression without a future occurrence is stored as `failed`.
    pub async fn register_schedule(&self, new: NewSchedule) -> Result<Schedule, SchedulerError> {
        let cron = normalize_schedule(&new.cron)?;
        let now = self.inner.clock.now();
        let schedule = Schedule {
            id: Uuid::now_v7(),
            cron,
            workflow_id: new.workflow_id,
            status: ScheduleStatus::Active,
            last_run_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        self.inner.repo.create(&schedule).await?;
        tracing::info!(
            schedule_id = %schedule.id,
            workflow_id = %schedule.workflow_id,
            cron = %schedule.cron,
            "schedule registered"
        );

        self.start_schedule(&schedule).await?;
        Ok(schedule)
    }

    /// Start (or restart) the timer for a schedule. Any existing timer for
    /// the same schedule is cancelled first, so there is never more than one.
    pub async fn start_schedule(&self, schedule: &Schedule) -> Result<(), SchedulerError> {
        let cron = parse_cron(&schedule.cron)?;
        self.cancel_timer(schedule.id);

        let now = self.inner.clock.now();
        if next_occurrence(&cron, now).is_none() {
            self.inner.mark_failed(schedule.id, NO_FUTURE_OCCURRENCE).await;
            return Err(SchedulerError::Unschedulable {
                id: schedule.id,
                reason: NO_FUTURE_OCCURRENCE.to_string(),
            });
        }

        let token = self.inner.root.child_token();
        self.inner.timers.insert(schedule.id, token.clone());

        let inner = self.inner.clone();
        let id = schedule.id;
        tracing::debug!(schedule_id = %id, cron = %schedule.cron, "timer started");
        self.inner.tracker.spawn(async move {
            inner.run_timer(id, cron, token).await;
        });
        Ok(())
    }

    /// Cancel a schedule's timer and mark it paused. Calling this for a
    /// schedule without a timer, or one that does not exist, is a no-op.
    pub async fn stop_schedule(&self, id: Uuid) -> Result<(), SchedulerError> {
        let had_timer = self.cancel_timer(id);

        match self.inner.repo.get(&id).await? {
            Some(schedule) => {
                self.inner
                    .repo
                    .update_status(
                        &id,
                        ScheduleStatus::Paused,
                        schedule.last_error.as_deref(),
                        self.inner.clock.now(),
                    )
                    .await?;
                tracing::info!(schedule_id = %id, had_timer, "schedule paused");
            }
            None => tracing::debug!(schedule_id = %id, "stop requested for unknown schedule"),
        }
        Ok(())
    }

    /// Reactivate a paused or failed schedule.
    pub async fn resume_schedule(&self, id: Uuid) -> Result<Schedule, SchedulerError> {
        let mut schedule = self.get_schedule(id).await?;
        let now = self.inner.clock.now();
        self.inner
            .repo
            .update_status(&id, ScheduleStatus::Active, None, now)
            .await?;
        schedule.status = ScheduleStatus::Active;
        schedule.last_error = None;
        schedule.updated_at = now;

        self.start_schedule(&schedule).await?;
        tracing::info!(schedule_id = %id, "schedule resumed");
        Ok(schedule)
    }

    /// Cancel the timer and remove the schedule. Returns whether it existed.
    pub async fn delete_schedule(&self, id: Uuid) -> Result<bool, SchedulerError> {
        self.cancel_timer(id);
        let existed = self.inner.repo.delete(&id).await?;
        if existed {
            tracing::info!(schedule_id = %id, "schedule deleted");
        }
        Ok(existed)
    }

    pub async fn get_schedule(&self, id: Uuid) -> Result<Schedule, SchedulerError> {
        self.inner
            .repo
            .get(&id)
            .await?
            .ok_or(SchedulerError::NotFound(id))
    }

    pub async fn list_schedules(
        &self,
        status: Option<ScheduleStatus>,
    ) -> Result<Vec<Schedule>, SchedulerError> {
        Ok(self.inner.repo.list(status).await?)
    }

    fn cancel_timer(&self, id: Uuid) -> bool {
        match self.inner.timers.remove(&id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

impl<S: ScheduleRepository + 'static> SchedulerInner<S> {
    async fn run_timer(self: Arc<Self>, id: Uuid, cron: Cron, token: CancellationToken) {
        let mut cursor = self.clock.now();

        loop {
            let now = self.clock.now();
            let Some(next) = next_occurrence(&cron, cursor.max(now)) else {
                self.mark_failed(id, NO_FUTURE_OCCURRENCE).await;
                break;
            };
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            cursor = next;

            let schedule = match self.repo.get(&id).await {
                Ok(Some(current)) if current.status == ScheduleStatus::Active => current,
                Ok(Some(current)) => {
                    tracing::debug!(schedule_id = %id, status = %current.status, "schedule no longer active");
                    break;
                }
                Ok(None) => {
                    tracing::debug!(schedule_id = %id, "schedule deleted");
                    break;
                }
                Err(e) => {
                    tracing::warn!(schedule_id = %id, error = %e, "failed to reload schedule, skipping tick");
                    continue;
                }
            };

            // Each tick runs on its own task so a panic only costs one tick.
            let tick = {
                let inner = self.clone();
                tokio::spawn(async move { inner.fire(&schedule, next).await })
            };
            if let Err(join_err) = tick.await {
                let message = format!("trigger {}", join_error_message(join_err));
                tracing::error!(schedule_id = %id, error = %message, "schedule tick failed");
                if let Err(e) = self.repo.record_run(&id, next, Some(&message)).await {
                    tracing::warn!(schedule_id = %id, error = %e, "failed to record tick error");
                }
            }
        }

        // A cancelled timer was already deregistered (or replaced) by whoever
        // cancelled it.
        if !token.is_cancelled() {
            self.timers.remove(&id);
        }
        tracing::debug!(schedule_id = %id, "timer stopped");
    }

    /// Enqueue one scheduled run and record the outcome on the schedule.
    async fn fire(&self, schedule: &Schedule, fire_at: DateTime<Utc>) {
        let payload = JobPayload::ScheduledRun {
            schedule_id: schedule.id,
            workflow_id: schedule.workflow_id,
            fire_at,
        };
        let opts = EnqueueOptions::default().with_dedup_key(format!(
            "schedule:{}:{}",
            schedule.id,
            fire_at.timestamp_millis()
        ));

        let error = match self
            .queue
            .enqueue(&self.config.workflow_queue, &payload, opts)
            .await
        {
            Ok(job_id) => {
                tracing::info!(
                    schedule_id = %schedule.id,
                    workflow_id = %schedule.workflow_id,
                    %job_id,
                    %fire_at,
                    "schedule fired"
                );
                self.events.publish(EngineEvent::ScheduleFired {
                    schedule_id: schedule.id,
                    workflow_id: schedule.workflow_id,
                    fire_at,
                });
                None
            }
            Err(e) => {
                tracing::warn!(schedule_id = %schedule.id, error = %e, "failed to enqueue scheduled run");
                Some(e.to_string())
            }
        };

        if let Err(e) = self
            .repo
            .record_run(&schedule.id, fire_at, error.as_deref())
            .await
        {
            tracing::warn!(schedule_id = %schedule.id, error = %e, "failed to record schedule run");
        }
    }

    async fn mark_failed(&self, id: Uuid, reason: &str) {
        tracing::error!(schedule_id = %id, reason, "schedule failed");
        if let Err(e) = self
            .repo
            .update_status(&id, ScheduleStatus::Failed, Some(reason), self.clock.now())
            .await
        {
            tracing::warn!(schedule_id = %id, error = %e, "failed to mark schedule failed");
        }
    }
}
