//! Queue worker that drives the workflow engine.

use std::sync::Arc;

use reportflow_types::error::{EngineError, HandlerError};
use reportflow_types::job::{Job, JobPayload};
use reportflow_types::workflow::RunOutcome;

use super::engine::WorkflowEngine;
use crate::queue::JobHandler;
use crate::repository::workflow::WorkflowRepository;

/// Handles `run_workflow` and `scheduled_run` jobs.
///
/// A workflow that ends `failed` is a completed job: the failure lives on the
/// instance and is resumed by the next run, not by queue retries. Only engine
/// errors (storage, lost lock) are retried.
pub struct WorkflowJobHandler<W: WorkflowRepository> {
    engine: Arc<WorkflowEngine<W>>,
}

impl<W: WorkflowRepository> WorkflowJobHandler<W> {
    pub fn new(engine: Arc<WorkflowEngine<W>>) -> Self {
        Self { engine }
    }
}

impl<W: WorkflowRepository + 'static> JobHandler for WorkflowJobHandler<W> {
    async fn handle(&self, job: Job) -> Result<(), HandlerError> {
        let payload = job.decode_payload().map_err(|e| {
            HandlerError::Poison(format!("undecodable '{}' payload: {e}", job.job_name))
        })?;

        let result = match payload {
            JobPayload::RunWorkflow { workflow_id } => self.engine.run_workflow(workflow_id).await,
            JobPayload::ScheduledRun {
                schedule_id,
                workflow_id,
                fire_at,
            } => {
                tracing::debug!(%schedule_id, %workflow_id, %fire_at, "running scheduled cycle");
                self.engine.run_scheduled_cycle(workflow_id).await
            }
            other => {
                return Err(HandlerError::Poison(format!(
                    "'{}' jobs are not handled by the workflow worker",
                    other.job_name()
                )));
            }
        };

        match result {
            Ok(RunOutcome::Completed) => Ok(()),
            Ok(RunOutcome::Failed { step_index, error }) => {
                tracing::debug!(job_id = %job.id, step_index, %error, "workflow run ended failed");
                Ok(())
            }
            Ok(RunOutcome::Skipped { reason }) => {
                tracing::debug!(job_id = %job.id, ?reason, "workflow run skipped");
                Ok(())
            }
            Err(EngineError::NotFound(id)) => Err(HandlerError::Poison(format!(
                "workflow {id} does not exist"
            ))),
            Err(e) => Err(HandlerError::Failed(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use reportflow_types::config::{EngineConfig, QueueConfig};
    use reportflow_types::error::ToolError;
    use reportflow_types::job::{JobSettlement, JobStatus, NewJob, TerminalReason};
    use reportflow_types::workflow::{StepDefinition, WorkflowDefinition, WorkflowStatus};
    use serde_json::{Value, json};
    use uuid::Uuid;

    use crate::clock::{ManualClock, SharedClock};
    use crate::event::EventBus;
    use crate::queue::{EnqueueOptions, JobQueue};
    use crate::repository::breaker::BoxBreakerStore;
    use crate::repository::memory::{MemoryBreakerStore, MemoryWorkflowRepository};
    use crate::resilience::{BreakerConfig, BreakerRegistry};
    use crate::workflow::tool::{StepTool, ToolRegistry};

    struct Echo;

    impl StepTool for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(&self, config: Value) -> Result<Value, ToolError> {
            Ok(config)
        }
    }

    fn engine(clock: SharedClock) -> Arc<WorkflowEngine<MemoryWorkflowRepository>> {
        let events = EventBus::default();
        let mut tools = ToolRegistry::new();
        tools.register(Echo);
        let breakers = Arc::new(BreakerRegistry::new(
            BreakerConfig::default(),
            BoxBreakerStore::new(MemoryBreakerStore::new()),
            clock.clone(),
            events.clone(),
        ));
        Arc::new(WorkflowEngine::new(
            Arc::new(MemoryWorkflowRepository::new()),
            tools,
            breakers,
            events,
            clock,
            EngineConfig {
                notify_queue: None,
                ..EngineConfig::default()
            },
        ))
    }

    fn raw_job(job_name: &str, payload: Value) -> Job {
        NewJob {
            queue_name: "workflows".to_string(),
            job_name: job_name.to_string(),
            payload,
            priority: 0,
            max_attempts: 3,
            scheduled_at: Utc::now(),
            dedup_key: None,
            created_at: Utc::now(),
        }
        .into_job()
    }

    #[tokio::test]
    async fn run_job_drives_workflow_to_completion() {
        let clock: SharedClock = Arc::new(ManualClock::new(Utc::now()));
        let engine = engine(clock.clone());
        let wf = engine
            .create_workflow(WorkflowDefinition {
                owner_id: "dealer-1".to_string(),
                name: "inventory".to_string(),
                steps: vec![StepDefinition {
                    name: "echo".to_string(),
                    tool: "echo".to_string(),
                    config: json!({ "n": 1 }),
                }],
            })
            .await
            .unwrap();

        let queue = JobQueue::in_process(QueueConfig::default(), clock, EventBus::default());
        queue.register_worker("workflows", WorkflowJobHandler::new(engine.clone()));
        queue
            .enqueue(
                "workflows",
                &JobPayload::RunWorkflow { workflow_id: wf.id },
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        let processed = queue.process_next("workflows").await.unwrap().unwrap();
        assert_eq!(processed.settlement, JobSettlement::Completed);
        assert_eq!(
            engine.get_workflow(wf.id).await.unwrap().status,
            WorkflowStatus::Completed
        );
    }

    #[tokio::test]
    async fn undecodable_payload_is_poison() {
        let clock: SharedClock = Arc::new(ManualClock::new(Utc::now()));
        let handler = WorkflowJobHandler::new(engine(clock));

        let err = handler
            .handle(raw_job("run_workflow", json!({ "workflow": "nope" })))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Poison(_)));

        let err = handler
            .handle(raw_job("rebuild_index", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Poison(_)));
    }

    #[tokio::test]
    async fn missing_workflow_is_poison_and_not_retried() {
        let clock: SharedClock = Arc::new(ManualClock::new(Utc::now()));
        let queue = JobQueue::in_process(QueueConfig::default(), clock.clone(), EventBus::default());
        queue.register_worker("workflows", WorkflowJobHandler::new(engine(clock)));

        let id = queue
            .enqueue(
                "workflows",
                &JobPayload::RunWorkflow {
                    workflow_id: Uuid::now_v7(),
                },
                EnqueueOptions::default(),
            )
            .await
            .unwrap();
        let processed = queue.process_next("workflows").await.unwrap().unwrap();
        assert_eq!(
            processed.settlement,
            JobSettlement::Failed {
                attempts: 1,
                reason: TerminalReason::Poison
            }
        );
        assert_eq!(
            queue.get_job(id).await.unwrap().unwrap().status,
            JobStatus::Failed
        );
    }
}
