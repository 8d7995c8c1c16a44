//! Workflow engine: sequential step execution under a distributed lock.
//!
//! # Execution flow
//!
//! 1. Atomically claim the instance lock (`locked_by`/`locked_at`). A live
//!    lock held by someone else means the run is skipped, not failed.
//! 2. For the step at `current_step_index`: refresh the lock, resolve
//!    `${stepK...}` references, invoke the tool (retry + circuit breaker).
//! 3. On success store the output, advance the index, persist, continue.
//!    On failure mark step and workflow failed, persist, stop.
//! 4. After the last step mark the workflow completed.
//! 5. Release the lock, publish `WorkflowCompleted`, enqueue a notification.
//!
//! Every progress write is fenced on the lock holder, so a runner that lost
//! its lock (expired and reclaimed elsewhere) aborts instead of clobbering
//! the new holder's state. Crash recovery relies on lock expiry: a later run
//! reclaims the instance and resumes at `current_step_index`; completed
//! steps are never re-run.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use reportflow_types::config::EngineConfig;
use reportflow_types::error::{EngineError, ToolError};
use reportflow_types::event::EngineEvent;
use reportflow_types::job::JobPayload;
use reportflow_types::workflow::{
    RunOutcome, SkipReason, StepStatus, WorkflowDefinition, WorkflowInstance, WorkflowStatus,
};
use serde_json::{Value, json};
use uuid::Uuid;

use super::template::{referenced_steps, resolve_config};
use super::tool::ToolRegistry;
use crate::clock::SharedClock;
use crate::event::EventBus;
use crate::queue::{EnqueueOptions, JobQueue};
use crate::repository::workflow::WorkflowRepository;
use crate::resilience::{BreakerError, BreakerRegistry, RetryPolicy, with_retry_if};
use crate::task::join_error_message;

/// Maximum serialized size of a stored step output (1 MB).
pub const MAX_STEP_OUTPUT_SIZE: usize = 1_048_576;

/// Where run jobs for crash recovery go.
struct QueueBinding {
    queue: JobQueue,
    workflow_queue: String,
}

pub struct WorkflowEngine<W: WorkflowRepository> {
    repo: Arc<W>,
    tools: ToolRegistry,
    breakers: Arc<BreakerRegistry>,
    queue: Option<QueueBinding>,
    events: EventBus,
    clock: SharedClock,
    config: EngineConfig,
    holder_id: String,
}

/// Whether a run may start over a completed workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    Resume,
    NextCycle,
}

impl<W: WorkflowRepository + 'static> WorkflowEngine<W> {
    pub fn new(
        repo: Arc<W>,
        tools: ToolRegistry,
        breakers: Arc<BreakerRegistry>,
        events: EventBus,
        clock: SharedClock,
        config: EngineConfig,
    ) -> Self {
        Self {
            repo,
            tools,
            breakers,
            queue: None,
            events,
            clock,
            config,
            holder_id: format!("engine-{}", Uuid::now_v7()),
        }
    }

    /// Attach the job queue used for completion notifications and for
    /// re-dispatching recovered runs onto `workflow_queue`.
    pub fn with_queue(mut self, queue: JobQueue, workflow_queue: impl Into<String>) -> Self {
        self.queue = Some(QueueBinding {
            queue,
            workflow_queue: workflow_queue.into(),
        });
        self
    }

    /// Identity written to `locked_by` while this engine runs a workflow.
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Validate a definition and store a pending instance without running it.
    pub async fn create_workflow(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<WorkflowInstance, EngineError> {
        self.validate(&definition)?;
        let instance = WorkflowInstance::from_definition(definition, self.clock.now());
        self.repo.create(&instance).await?;
        tracing::info!(
            workflow_id = %instance.id,
            owner_id = %instance.owner_id,
            name = %instance.name,
            steps = instance.steps.len(),
            "workflow created"
        );
        Ok(instance)
    }

    /// Create an instance and run it to completion or failure.
    pub async fn start_workflow(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<(Uuid, RunOutcome), EngineError> {
        let instance = self.create_workflow(definition).await?;
        let outcome = self.run_workflow(instance.id).await?;
        Ok((instance.id, outcome))
    }

    fn validate(&self, definition: &WorkflowDefinition) -> Result<(), EngineError> {
        if definition.name.trim().is_empty() {
            return Err(EngineError::Validation("workflow name must not be empty".to_string()));
        }
        if definition.steps.is_empty() {
            return Err(EngineError::Validation("workflow has no steps".to_string()));
        }

        for (index, step) in definition.steps.iter().enumerate() {
            if !self.tools.contains(&step.tool) {
                return Err(EngineError::Validation(format!(
                    "step {index} ('{}') uses unknown tool '{}'",
                    step.name, step.tool
                )));
            }
            let refs = referenced_steps(&step.config).map_err(|e| {
                EngineError::Validation(format!("step {index} ('{}'): {e}", step.name))
            })?;
            if let Some(bad) = refs.into_iter().find(|&k| k >= index) {
                return Err(EngineError::Validation(format!(
                    "step {index} ('{}') references step {bad}; only earlier steps may be referenced",
                    step.name
                )));
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Running
    // -----------------------------------------------------------------------

    /// Run (or resume) a workflow.
    ///
    /// Lock contention is not an error: the call returns
    /// `RunOutcome::Skipped`. A failed workflow resumes at the failed step.
    pub async fn run_workflow(&self, id: Uuid) -> Result<RunOutcome, EngineError> {
        self.run_locked(id, RunMode::Resume).await
    }

    /// Run a workflow for the next cron cycle: a completed instance is reset
    /// first, anything else behaves like `run_workflow`.
    pub async fn run_scheduled_cycle(&self, id: Uuid) -> Result<RunOutcome, EngineError> {
        self.run_locked(id, RunMode::NextCycle).await
    }

    async fn run_locked(&self, id: Uuid, mode: RunMode) -> Result<RunOutcome, EngineError> {
        let Some(mut instance) = self.acquire(id).await? else {
            tracing::debug!(workflow_id = %id, "workflow locked by another runner, skipping");
            return Ok(RunOutcome::Skipped {
                reason: SkipReason::AlreadyRunning,
            });
        };

        if instance.status == WorkflowStatus::Completed {
            match mode {
                RunMode::Resume => {
                    self.release(id).await;
                    tracing::debug!(workflow_id = %id, "workflow already completed, skipping");
                    return Ok(RunOutcome::Skipped {
                        reason: SkipReason::AlreadyCompleted,
                    });
                }
                RunMode::NextCycle => {
                    tracing::info!(workflow_id = %id, "re-arming completed workflow for next cycle");
                    reset_instance(&mut instance, self.clock.now());
                }
            }
        }

        let result = self.execute(&mut instance).await;
        self.release(id).await;
        result
    }

    /// Claim the lock. `Ok(None)` means a live runner holds it.
    async fn acquire(&self, id: Uuid) -> Result<Option<WorkflowInstance>, EngineError> {
        let now = self.clock.now();
        let claimed = self
            .repo
            .try_acquire_lock(&id, &self.holder_id, now, self.lock_expiry_cutoff(now))
            .await?;
        match claimed {
            Some(instance) => Ok(Some(instance)),
            None => match self.repo.get(&id).await? {
                Some(_) => Ok(None),
                None => Err(EngineError::NotFound(id)),
            },
        }
    }

    async fn release(&self, id: Uuid) {
        match self.repo.release_lock(&id, &self.holder_id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(workflow_id = %id, "lock was no longer held at release")
            }
            Err(e) => {
                tracing::warn!(workflow_id = %id, error = %e, "failed to release workflow lock")
            }
        }
    }

    fn lock_expiry_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(self.config.lock_ttl())
            .unwrap_or_else(|_| chrono::Duration::MAX);
        now.checked_sub_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Fenced write of the instance.
    async fn persist(&self, instance: &WorkflowInstance) -> Result<(), EngineError> {
        if self.repo.save_progress(instance, &self.holder_id).await? {
            Ok(())
        } else {
            tracing::warn!(workflow_id = %instance.id, "lost workflow lock mid-run, aborting");
            Err(EngineError::LockLost(instance.id))
        }
    }

    async fn execute(&self, instance: &mut WorkflowInstance) -> Result<RunOutcome, EngineError> {
        let workflow_id = instance.id;
        instance.status = WorkflowStatus::Running;
        instance.error = None;
        instance.completed_at = None;

        while instance.current_step_index < instance.steps.len() {
            let index = instance.current_step_index;
            let now = self.clock.now();

            instance.locked_at = Some(now);
            instance.updated_at = now;
            {
                let step = &mut instance.steps[index];
                step.reset();
                step.status = StepStatus::Running;
                step.started_at = Some(now);
            }
            self.persist(instance).await?;

            let (step_name, tool_name) = {
                let step = &instance.steps[index];
                (step.name.clone(), step.tool.clone())
            };
            tracing::info!(%workflow_id, step_index = index, step = %step_name, tool = %tool_name, "step started");

            let result = match resolve_config(&instance.steps[index].config, &instance.steps, index)
            {
                Ok(config) => self.invoke_tool(&tool_name, config).await,
                Err(e) => Err(EngineError::TemplateResolution(e).to_string()),
            };

            let now = self.clock.now();
            instance.updated_at = now;
            match result {
                Ok(output) => {
                    let step = &mut instance.steps[index];
                    step.output = Some(cap_output(&step_name, output));
                    step.status = StepStatus::Completed;
                    step.completed_at = Some(now);
                    instance.current_step_index += 1;
                    self.persist(instance).await?;

                    tracing::info!(%workflow_id, step_index = index, step = %step_name, "step completed");
                    self.events.publish(EngineEvent::StepCompleted {
                        workflow_id,
                        step_index: index,
                    });
                }
                Err(error) => {
                    let step = &mut instance.steps[index];
                    step.status = StepStatus::Failed;
                    step.error = Some(error.clone());
                    step.completed_at = Some(now);
                    instance.status = WorkflowStatus::Failed;
                    instance.error = Some(format!("step {index} ('{step_name}') failed: {error}"));
                    self.persist(instance).await?;

                    tracing::warn!(%workflow_id, step_index = index, step = %step_name, %error, "step failed, workflow stopped");
                    self.finish(instance).await;
                    return Ok(RunOutcome::Failed {
                        step_index: index,
                        error,
                    });
                }
            }
        }

        let now = self.clock.now();
        instance.status = WorkflowStatus::Completed;
        instance.completed_at = Some(now);
        instance.updated_at = now;
        self.persist(instance).await?;

        tracing::info!(%workflow_id, steps = instance.steps.len(), "workflow completed");
        self.finish(instance).await;
        Ok(RunOutcome::Completed)
    }

    /// Invoke a tool through its circuit breaker, retrying transient errors.
    ///
    /// The tool runs on its own task so a panic becomes a permanent failure
    /// of the step instead of unwinding through the engine.
    async fn invoke_tool(&self, name: &str, config: Value) -> Result<Value, String> {
        let Some(tool) = self.tools.get(name) else {
            return Err(format!("tool '{name}' is not registered"));
        };
        let breaker = self.breakers.get(&format!("tool:{name}")).await;
        let policy = RetryPolicy::new(self.config.tool_retries, self.config.tool_backoff_base());

        with_retry_if(
            &policy,
            || {
                let tool = tool.clone();
                let config = config.clone();
                let breaker = breaker.clone();
                async move {
                    breaker
                        .call_classified(
                            || async move {
                                match tokio::spawn(async move { tool.execute(config).await }).await {
                                    Ok(result) => result,
                                    Err(join_err) => Err(ToolError::Permanent(format!(
                                        "tool {}",
                                        join_error_message(join_err)
                                    ))),
                                }
                            },
                            ToolError::is_transient,
                        )
                        .await
                }
            },
            |e: &BreakerError<ToolError>| matches!(e, BreakerError::Inner(ToolError::Transient(_))),
        )
        .await
        .map_err(|e| e.to_string())
    }

    /// Final-state side effects. Failures here are logged; the instance is
    /// already persisted.
    async fn finish(&self, instance: &WorkflowInstance) {
        self.events.publish(EngineEvent::WorkflowCompleted {
            workflow_id: instance.id,
            status: instance.status,
        });

        let Some(binding) = &self.queue else {
            return;
        };
        let Some(notify_queue) = self.config.notify_queue.as_deref().filter(|q| !q.is_empty())
        else {
            return;
        };

        let payload = JobPayload::NotifyCompletion {
            workflow_id: instance.id,
            status: instance.status,
        };
        let opts = EnqueueOptions::default().with_dedup_key(format!(
            "notify:{}:{}",
            instance.id,
            instance.updated_at.timestamp_millis()
        ));
        if let Err(e) = binding.queue.enqueue(notify_queue, &payload, opts).await {
            tracing::warn!(workflow_id = %instance.id, error = %e, "failed to enqueue completion notification");
        }
    }

    // -----------------------------------------------------------------------
    // Management
    // -----------------------------------------------------------------------

    /// Reset a workflow to its first step. Fails with `LockContention` while
    /// a live runner holds the lock.
    pub async fn reset_workflow(&self, id: Uuid) -> Result<WorkflowInstance, EngineError> {
        let Some(mut instance) = self.acquire(id).await? else {
            return Err(EngineError::LockContention(id));
        };

        reset_instance(&mut instance, self.clock.now());
        let saved = self.persist(&instance).await;
        self.release(id).await;
        saved?;

        instance.locked_by = None;
        instance.locked_at = None;
        tracing::info!(workflow_id = %id, "workflow reset");
        Ok(instance)
    }

    /// Find `running` workflows whose lock expired (their runner died) and
    /// resume them: through the queue when one is attached, inline otherwise.
    /// Returns the ids that were picked up.
    pub async fn recover_stale(&self) -> Result<Vec<Uuid>, EngineError> {
        let now = self.clock.now();
        let stale = self
            .repo
            .list_stale_running(self.lock_expiry_cutoff(now))
            .await?;

        let mut recovered = Vec::with_capacity(stale.len());
        for instance in stale {
            let id = instance.id;
            match &self.queue {
                Some(binding) => {
                    let marker = instance.locked_at.unwrap_or(instance.updated_at);
                    let opts = EnqueueOptions::default().with_dedup_key(format!(
                        "recover:{id}:{}",
                        marker.timestamp_millis()
                    ));
                    binding
                        .queue
                        .enqueue(
                            &binding.workflow_queue,
                            &JobPayload::RunWorkflow { workflow_id: id },
                            opts,
                        )
                        .await?;
                }
                None => {
                    let outcome = self.run_workflow(id).await?;
                    tracing::debug!(workflow_id = %id, ?outcome, "recovered workflow inline");
                }
            }
            tracing::warn!(workflow_id = %id, step_index = instance.current_step_index, "recovering abandoned workflow run");
            recovered.push(id);
        }
        Ok(recovered)
    }

    pub async fn get_workflow(&self, id: Uuid) -> Result<WorkflowInstance, EngineError> {
        self.repo.get(&id).await?.ok_or(EngineError::NotFound(id))
    }

    pub async fn list_workflows(&self, limit: u32) -> Result<Vec<WorkflowInstance>, EngineError> {
        Ok(self.repo.list(limit).await?)
    }
}

fn reset_instance(instance: &mut WorkflowInstance, now: DateTime<Utc>) {
    instance.status = WorkflowStatus::Pending;
    instance.current_step_index = 0;
    instance.error = None;
    instance.completed_at = None;
    instance.updated_at = now;
    for step in &mut instance.steps {
        step.reset();
    }
}

/// Replace an oversized output with a marker object.
fn cap_output(step: &str, output: Value) -> Value {
    let size = serde_json::to_vec(&output).map(|v| v.len()).unwrap_or(0);
    if size <= MAX_STEP_OUTPUT_SIZE {
        return output;
    }
    tracing::warn!(step, size, max = MAX_STEP_OUTPUT_SIZE, "step output exceeds size limit, truncating");
    json!({
        "_truncated": true,
        "_original_size": size,
        "_message": format!("output exceeded {MAX_STEP_OUTPUT_SIZE} byte limit and was truncated"),
    })
}
