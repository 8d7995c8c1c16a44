//! Engine events distributed over the broadcast event bus.
//!
//! Subscribers (notification side, CLI `serve` logging, tests) observe the
//! queue and engine without the core knowing who listens.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::TerminalReason;
use crate::workflow::WorkflowStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    JobEnqueued {
        job_id: Uuid,
        queue: String,
        job_name: String,
    },
    JobCompleted {
        job_id: Uuid,
        queue: String,
    },
    JobRetryScheduled {
        job_id: Uuid,
        attempts: u32,
        retry_at: DateTime<Utc>,
    },
    JobFailed {
        job_id: Uuid,
        reason: TerminalReason,
        error: String,
    },
    StepCompleted {
        workflow_id: Uuid,
        step_index: usize,
    },
    /// Published on every final state, successful or not.
    WorkflowCompleted {
        workflow_id: Uuid,
        status: WorkflowStatus,
    },
    ScheduleFired {
        schedule_id: Uuid,
        workflow_id: Uuid,
        fire_at: DateTime<Utc>,
    },
    BreakerOpened {
        name: String,
    },
}
