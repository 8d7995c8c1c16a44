//! Workflow domain types.
//!
//! A `WorkflowDefinition` is what callers submit (from YAML, JSON, or code).
//! Starting it materializes a `WorkflowInstance` whose steps carry execution
//! state. The instance also carries the distributed-lock fields
//! (`locked_by`/`locked_at`) that guarantee a single active runner.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Definition
// ---------------------------------------------------------------------------

/// A workflow as submitted for execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Who the workflow belongs to (a dealership, a user, a tenant).
    pub owner_id: String,
    pub name: String,
    /// Ordered steps; step N may read outputs of steps 0..N.
    pub steps: Vec<StepDefinition>,
}

/// One step of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    /// Registered tool name invoked for this step.
    pub tool: String,
    /// Tool parameters; string values may contain `${stepK.path}` references.
    #[serde(default)]
    pub config: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Execution status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowStatus::Pending => write!(f, "pending"),
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Paused => write!(f, "paused"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(WorkflowStatus::Pending),
            "running" => Ok(WorkflowStatus::Running),
            "paused" => Ok(WorkflowStatus::Paused),
            "completed" => Ok(WorkflowStatus::Completed),
            "failed" => Ok(WorkflowStatus::Failed),
            other => Err(format!("invalid workflow status: '{other}'")),
        }
    }
}

/// Execution status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Running => write!(f, "running"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Instance
// ---------------------------------------------------------------------------

/// One step of a running or finished workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub name: String,
    pub tool: String,
    pub config: serde_json::Value,
    /// Tool output; `None` until the step has completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowStep {
    pub fn from_definition(def: StepDefinition) -> Self {
        Self {
            name: def.name,
            tool: def.tool,
            config: def.config,
            output: None,
            status: StepStatus::Pending,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Clear execution state, keeping name/tool/config.
    pub fn reset(&mut self) {
        self.output = None;
        self.status = StepStatus::Pending;
        self.error = None;
        self.started_at = None;
        self.completed_at = None;
    }
}

/// A workflow execution, retained after completion for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub owner_id: String,
    pub name: String,
    pub status: WorkflowStatus,
    pub steps: Vec<WorkflowStep>,
    /// Index of the next step to execute. Only moves forward, except on reset.
    pub current_step_index: usize,
    /// Identity of the runner holding the lock.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
    /// When the lock was taken or last refreshed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowInstance {
    /// Materialize a pending instance from a definition.
    pub fn from_definition(def: WorkflowDefinition, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            owner_id: def.owner_id,
            name: def.name,
            status: WorkflowStatus::Pending,
            steps: def
                .steps
                .into_iter()
                .map(WorkflowStep::from_definition)
                .collect(),
            current_step_index: 0,
            locked_by: None,
            locked_at: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
        }
    }

    /// Whether a live runner holds the lock at `now` given the lock TTL.
    pub fn is_locked(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        match (&self.locked_by, self.locked_at) {
            (Some(_), Some(at)) => at + ttl > now,
            _ => false,
        }
    }

    /// Number of steps that have completed.
    pub fn completed_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count()
    }
}

// ---------------------------------------------------------------------------
// Run outcome
// ---------------------------------------------------------------------------

/// Why a run request did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Another live runner holds the lock.
    AlreadyRunning,
    /// The workflow has nothing left to execute.
    AlreadyCompleted,
}

/// Result of a `run_workflow` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Failed { step_index: usize, error: String },
    Skipped { reason: SkipReason },
}

impl RunOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, RunOutcome::Skipped { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_definition() -> WorkflowDefinition {
        WorkflowDefinition {
            owner_id: "dealer-42".to_string(),
            name: "weekly report".to_string(),
            steps: vec![
                StepDefinition {
                    name: "parse".to_string(),
                    tool: "parse_csv".to_string(),
                    config: serde_json::json!({ "path": "/tmp/report.csv" }),
                },
                StepDefinition {
                    name: "mail".to_string(),
                    tool: "send_email".to_string(),
                    config: serde_json::json!({ "to": "${step0.user.email}" }),
                },
            ],
        }
    }

    #[test]
    fn instance_from_definition_is_pending() {
        let now = Utc::now();
        let wf = WorkflowInstance::from_definition(sample_definition(), now);
        assert_eq!(wf.status, WorkflowStatus::Pending);
        assert_eq!(wf.current_step_index, 0);
        assert_eq!(wf.steps.len(), 2);
        assert!(wf.steps.iter().all(|s| s.status == StepStatus::Pending));
        assert!(wf.steps.iter().all(|s| s.output.is_none()));
        assert!(wf.locked_by.is_none());
    }

    #[test]
    fn lock_expires_after_ttl() {
        let now = Utc::now();
        let mut wf = WorkflowInstance::from_definition(sample_definition(), now);
        let ttl = chrono::Duration::seconds(30);
        assert!(!wf.is_locked(now, ttl));

        wf.locked_by = Some("runner-a".to_string());
        wf.locked_at = Some(now);
        assert!(wf.is_locked(now + chrono::Duration::seconds(29), ttl));
        assert!(!wf.is_locked(now + chrono::Duration::seconds(30), ttl));
    }

    #[test]
    fn step_reset_clears_execution_state() {
        let mut def = sample_definition();
        let mut step = WorkflowStep::from_definition(def.steps.remove(0));
        step.output = Some(serde_json::json!({ "rows": 3 }));
        step.status = StepStatus::Completed;
        step.started_at = Some(Utc::now());
        step.completed_at = Some(Utc::now());

        step.reset();
        assert_eq!(step.status, StepStatus::Pending);
        assert!(step.output.is_none());
        assert!(step.started_at.is_none());
        assert_eq!(step.tool, "parse_csv");
    }

    #[test]
    fn run_outcome_serializes_tagged() {
        let skipped = RunOutcome::Skipped {
            reason: SkipReason::AlreadyRunning,
        };
        let json = serde_json::to_value(&skipped).unwrap();
        assert_eq!(json["outcome"], "skipped");
        assert_eq!(json["reason"], "already_running");
        assert!(skipped.is_skipped());
    }

    #[test]
    fn definition_config_defaults_to_null() {
        let def: StepDefinition =
            serde_json::from_str(r#"{ "name": "noop", "tool": "echo" }"#).unwrap();
        assert!(def.config.is_null());
    }
}
