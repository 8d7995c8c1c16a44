//! `rflow serve`: the long-running worker process.
//!
//! Registers queue workers, starts schedule timers, resumes abandoned runs
//! and purges old jobs until Ctrl+C or SIGTERM, then drains in-flight work.
//! Timers are re-synced with the schedule table periodically, so schedules
//! created, paused or deleted from another `rflow` invocation take effect
//! without a restart.

use std::time::Duration;

use anyhow::Result;
use console::style;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use reportflow_core::event::EventBus;
use reportflow_core::queue::{JobHandler, JobQueue};
use reportflow_core::repository::schedule::ScheduleRepository;
use reportflow_core::scheduler::Scheduler;
use reportflow_core::task::join_error_message;
use reportflow_core::workflow::WorkflowJobHandler;
use reportflow_types::error::HandlerError;
use reportflow_types::event::EngineEvent;
use reportflow_types::job::{Job, JobPayload};

use crate::state::EngineContext;

/// Consumes `notify_completion` jobs by logging them.
///
/// Delivery channels (email, webhooks) plug in here; the engine only
/// guarantees the job is enqueued once per final state.
pub struct NotificationLogger;

impl JobHandler for NotificationLogger {
    async fn handle(&self, job: Job) -> Result<(), HandlerError> {
        match job.decode_payload() {
            Ok(JobPayload::NotifyCompletion {
                workflow_id,
                status,
            }) => {
                tracing::info!(%workflow_id, %status, job_id = %job.id, "workflow finished");
                Ok(())
            }
            Ok(other) => Err(HandlerError::Poison(format!(
                "'{}' jobs do not belong on the notification queue",
                other.job_name()
            ))),
            Err(e) => Err(HandlerError::Poison(format!(
                "undecodable '{}' payload: {e}",
                job.job_name
            ))),
        }
    }
}

pub async fn run_serve(ctx: &EngineContext, json: bool) -> Result<()> {
    ctx.queue.register_worker(
        ctx.workflow_queue(),
        WorkflowJobHandler::new(ctx.engine.clone()),
    );
    if let Some(notify_queue) = &ctx.config.engine.notify_queue {
        ctx.queue.register_worker(notify_queue, NotificationLogger);
    }

    let stop = CancellationToken::new();
    let event_task = tokio::spawn(log_events(ctx.events.clone(), stop.clone()));

    ctx.queue.start().await?;
    let timers = ctx.scheduler.start().await?;
    let recovered = ctx.engine.recover_stale().await?;

    let cleanup_task = tokio::spawn(cleanup_loop(
        ctx.queue.clone(),
        ctx.config.queue.cleanup_interval(),
        ctx.config.queue.completed_retention(),
        stop.clone(),
    ));
    let reconcile_task = tokio::spawn(reconcile_loop(
        ctx.scheduler.clone(),
        ctx.config.scheduler.reconcile_interval(),
        stop.clone(),
    ));

    if !json {
        println!();
        println!(
            "  {} rflow serving (queue backend: {}{})",
            style("*").green().bold(),
            ctx.queue.backend_kind(),
            if ctx.queue.is_fallback_mode() {
                style(", fallback").yellow().to_string()
            } else {
                String::new()
            }
        );
        println!("  Schedules: {timers} running");
        if !recovered.is_empty() {
            println!("  Recovered: {} abandoned workflow(s)", recovered.len());
        }
        println!("  {}", style("Press Ctrl+C to stop.").dim());
        println!();
    }
    tracing::info!(
        holder = ctx.engine.holder_id(),
        schedules = timers,
        recovered = recovered.len(),
        "serving"
    );

    shutdown_signal().await;
    tracing::info!("shutdown requested, draining");

    ctx.scheduler.shutdown().await;
    ctx.queue.shutdown().await;
    stop.cancel();
    let (events_done, cleanup_done, reconcile_done) =
        tokio::join!(event_task, cleanup_task, reconcile_task);
    report_task_exit("event logger", events_done);
    report_task_exit("job cleanup", cleanup_done);
    report_task_exit("schedule reconcile", reconcile_done);
    ctx.db_pool.close().await;

    if !json {
        println!("  {} Stopped.", style("*").green().bold());
    }
    Ok(())
}

async fn log_events(events: EventBus, stop: CancellationToken) {
    let mut rx = events.subscribe();
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            received = rx.recv() => match received {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event logger lagged behind");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::JobFailed {
            job_id,
            reason,
            error,
        } => tracing::warn!(%job_id, %reason, %error, "job failed"),
        EngineEvent::BreakerOpened { name } => tracing::warn!(breaker = %name, "breaker opened"),
        EngineEvent::WorkflowCompleted {
            workflow_id,
            status,
        } => tracing::info!(%workflow_id, %status, "workflow reached final state"),
        EngineEvent::ScheduleFired {
            schedule_id,
            workflow_id,
            fire_at,
        } => tracing::info!(%schedule_id, %workflow_id, %fire_at, "schedule fired"),
        other => tracing::debug!(event = ?other, "engine event"),
    }
}

async fn cleanup_loop(
    queue: JobQueue,
    every: Duration,
    retention: Duration,
    stop: CancellationToken,
) {
    let mut interval = tokio::time::interval(every.max(Duration::from_secs(1)));
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = queue.cleanup_completed(retention).await {
                    tracing::warn!(error = %e, "periodic job cleanup failed");
                }
            }
        }
    }
}

async fn reconcile_loop<S: ScheduleRepository + 'static>(
    scheduler: Scheduler<S>,
    every: Duration,
    stop: CancellationToken,
) {
    let mut interval = tokio::time::interval(every.max(Duration::from_secs(1)));
    // The first tick is immediate and `start()` has just run.
    interval.tick().await;
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = scheduler.reconcile().await {
                    tracing::warn!(error = %e, "schedule reconcile failed");
                }
            }
        }
    }
}

/// Log a background task that ended by panicking or being aborted.
/// Returns whether it did.
fn report_task_exit(task: &str, result: Result<(), JoinError>) -> bool {
    match result {
        Ok(()) => false,
        Err(e) => {
            tracing::error!(task, error = %join_error_message(e), "background task failed");
            true
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use reportflow_types::job::NewJob;
    use reportflow_types::workflow::WorkflowStatus;
    use uuid::Uuid;

    fn job_for(payload: &JobPayload) -> Job {
        let now = Utc::now();
        NewJob {
            queue_name: "notifications".to_string(),
            job_name: payload.job_name().to_string(),
            payload: payload.to_value().unwrap(),
            priority: 0,
            max_attempts: 3,
            scheduled_at: now,
            dedup_key: None,
            created_at: now,
        }
        .into_job()
    }

    #[tokio::test]
    async fn notifier_accepts_completion_notices() {
        let job = job_for(&JobPayload::NotifyCompletion {
            workflow_id: Uuid::now_v7(),
            status: WorkflowStatus::Completed,
        });
        assert!(NotificationLogger.handle(job).await.is_ok());
    }

    #[tokio::test]
    async fn notifier_rejects_other_payloads_as_poison() {
        let job = job_for(&JobPayload::RunWorkflow {
            workflow_id: Uuid::now_v7(),
        });
        let err = NotificationLogger.handle(job).await.unwrap_err();
        assert!(matches!(err, HandlerError::Poison(_)));
    }

    #[tokio::test]
    async fn background_task_panics_are_reported() {
        let clean = tokio::spawn(async {}).await;
        assert!(!report_task_exit("clean", clean));

        let panicked: tokio::task::JoinHandle<()> = tokio::spawn(async { panic!("cleanup blew up") });
        assert!(report_task_exit("cleanup", panicked.await));

        let aborted = tokio::spawn(std::future::pending::<()>());
        aborted.abort();
        assert!(report_task_exit("aborted", aborted.await));
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_loop_starts_schedules_created_elsewhere() {
        use std::sync::Arc;

        use reportflow_core::clock::{SharedClock, TokioClock};
        use reportflow_core::repository::memory::MemoryScheduleRepository;
        use reportflow_types::config::{QueueConfig, SchedulerConfig};
        use reportflow_types::schedule::NewSchedule;

        let clock: SharedClock = Arc::new(TokioClock::starting_at(Utc::now()));
        let events = EventBus::default();
        let repo = Arc::new(MemoryScheduleRepository::new());
        let queue = JobQueue::in_process(QueueConfig::default(), clock.clone(), events.clone());
        let build = || {
            Scheduler::new(
                repo.clone(),
                queue.clone(),
                clock.clone(),
                events.clone(),
                SchedulerConfig::default(),
            )
        };
        let serving = build();
        let stop = CancellationToken::new();
        let task = tokio::spawn(reconcile_loop(
            serving.clone(),
            Duration::from_secs(5),
            stop.clone(),
        ));

        let cli = build();
        cli.register_schedule(NewSchedule {
            cron: "0 0 0 1 1 *".to_string(),
            workflow_id: Uuid::now_v7(),
        })
        .await
        .unwrap();
        cli.shutdown().await;
        assert_eq!(serving.active_timers(), 0);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(serving.active_timers(), 1);

        stop.cancel();
        task.await.unwrap();
        serving.shutdown().await;
    }

    #[tokio::test]
    async fn event_logger_stops_on_cancel() {
        let events = EventBus::new(8);
        let stop = CancellationToken::new();
        let task = tokio::spawn(log_events(events.clone(), stop.clone()));

        events.publish(EngineEvent::BreakerOpened {
            name: "http".to_string(),
        });
        stop.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("logger should stop")
            .unwrap();
    }
}
