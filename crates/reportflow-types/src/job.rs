//! Job domain types for the asynchronous work queue.
//!
//! A `Job` is stored with an opaque JSON payload so backends never need to
//! know every job kind. Producers and handlers go through the strongly-typed
//! [`JobPayload`] union, keyed by `job_name`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::WorkflowStatus;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a job.
///
/// Within one attempt a job moves pending -> active -> {completed | failed};
/// a failed attempt with budget left goes back to pending with a later
/// `scheduled_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    /// Completed and failed jobs are never claimed again without a manual retry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Active => write!(f, "active"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "active" => Ok(JobStatus::Active),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("invalid job status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// One unit of asynchronous work tracked by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub queue_name: String,
    /// Discriminator selecting the payload variant.
    pub job_name: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Number of failed attempts so far.
    pub attempts: u32,
    pub max_attempts: u32,
    /// Lower value is processed sooner.
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Earliest time the job may be claimed.
    pub scheduled_at: DateTime<Utc>,
    /// When a worker claimed the job (active only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Job {
    /// Decode the stored payload into its typed variant.
    ///
    /// A decode failure means the job can never be processed (poison message).
    pub fn decode_payload(&self) -> Result<JobPayload, serde_json::Error> {
        JobPayload::decode(&self.job_name, &self.payload)
    }
}

/// A job as submitted to a backend, before it has an id.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub queue_name: String,
    pub job_name: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub max_attempts: u32,
    pub scheduled_at: DateTime<Utc>,
    pub dedup_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NewJob {
    /// Materialize the stored job with a fresh UUIDv7.
    pub fn into_job(self) -> Job {
        Job {
            id: Uuid::now_v7(),
            queue_name: self.queue_name,
            job_name: self.job_name,
            payload: self.payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: self.max_attempts,
            priority: self.priority,
            dedup_key: self.dedup_key,
            created_at: self.created_at,
            scheduled_at: self.scheduled_at,
            claimed_at: None,
            finished_at: None,
            last_error: None,
        }
    }
}

/// Result of pushing a job to a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushOutcome {
    pub id: Uuid,
    /// True when an existing job with the same dedup key was returned instead.
    pub deduplicated: bool,
}

/// How a failed attempt is settled by `nack`.
#[derive(Debug, Clone)]
pub struct JobFailure {
    pub error: String,
    /// `Some` re-queues the job at that time; `None` fails it terminally.
    pub retry_at: Option<DateTime<Utc>>,
}

/// Why a job ended in `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    MaxAttemptsExceeded,
    Poison,
}

impl fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalReason::MaxAttemptsExceeded => write!(f, "max attempts exceeded"),
            TerminalReason::Poison => write!(f, "poison message"),
        }
    }
}

/// Where one processed job ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobSettlement {
    Completed,
    RetryScheduled {
        attempts: u32,
        retry_at: DateTime<Utc>,
    },
    Failed {
        attempts: u32,
        reason: TerminalReason,
    },
}

/// Per-status job counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub pending: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

// ---------------------------------------------------------------------------
// Typed payloads
// ---------------------------------------------------------------------------

/// Strongly-typed job payloads, keyed by `job_name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "job_name", content = "payload", rename_all = "snake_case")]
pub enum JobPayload {
    /// Run (or resume) a workflow instance.
    RunWorkflow { workflow_id: Uuid },
    /// A cron trigger fired for a schedule.
    ScheduledRun {
        schedule_id: Uuid,
        workflow_id: Uuid,
        fire_at: DateTime<Utc>,
    },
    /// A workflow reached a final state; consumed by the notification side.
    NotifyCompletion {
        workflow_id: Uuid,
        status: WorkflowStatus,
    },
}

impl JobPayload {
    pub fn job_name(&self) -> &'static str {
        match self {
            JobPayload::RunWorkflow { .. } => "run_workflow",
            JobPayload::ScheduledRun { .. } => "scheduled_run",
            JobPayload::NotifyCompletion { .. } => "notify_completion",
        }
    }

    /// The payload body as stored on the job (without the discriminator).
    pub fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        let mut tagged = serde_json::to_value(self)?;
        Ok(tagged
            .get_mut("payload")
            .map(serde_json::Value::take)
            .unwrap_or(serde_json::Value::Null))
    }

    /// Rebuild a typed payload from a stored `job_name` and body.
    pub fn decode(job_name: &str, payload: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::json!({
            "job_name": job_name,
            "payload": payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_display_and_parse() {
        for status in [
            JobStatus::Pending,
            JobStatus::Active,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            let parsed: JobStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("archived".parse::<JobStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Active.is_terminal());
    }

    #[test]
    fn payload_body_excludes_discriminator() {
        let id = Uuid::now_v7();
        let payload = JobPayload::RunWorkflow { workflow_id: id };
        assert_eq!(payload.job_name(), "run_workflow");

        let body = payload.to_value().unwrap();
        assert_eq!(body, serde_json::json!({ "workflow_id": id }));
        assert_eq!(JobPayload::decode("run_workflow", &body).unwrap(), payload);
    }

    #[test]
    fn decode_rejects_unknown_job_name() {
        let body = serde_json::json!({ "workflow_id": Uuid::now_v7() });
        assert!(JobPayload::decode("send_fax", &body).is_err());
    }

    #[test]
    fn decode_rejects_malformed_body() {
        let body = serde_json::json!({ "workflow_id": "not-a-uuid" });
        assert!(JobPayload::decode("run_workflow", &body).is_err());
    }

    #[test]
    fn new_job_starts_pending_with_no_attempts() {
        let now = Utc::now();
        let job = NewJob {
            queue_name: "workflows".to_string(),
            job_name: "run_workflow".to_string(),
            payload: serde_json::json!({}),
            priority: 0,
            max_attempts: 3,
            scheduled_at: now,
            dedup_key: None,
            created_at: now,
        }
        .into_job();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.claimed_at.is_none());
        assert!(job.finished_at.is_none());
    }
}
