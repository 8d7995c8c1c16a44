use thiserror::Error;
use uuid::Uuid;

use crate::job::JobStatus;

/// Errors from repository operations (used by trait definitions in reportflow-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Errors surfaced by the job queue and its backends.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The durable backend could not be reached. Triggers fallback mode at
    /// initialization; afterwards it is treated as transient.
    #[error("queue backend unreachable: {0}")]
    Connection(String),

    /// Rejected at the boundary, never enqueued.
    #[error("invalid job: {0}")]
    Validation(String),

    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("job {id} is {status}")]
    InvalidState { id: Uuid, status: JobStatus },

    #[error("queue storage error: {0}")]
    Storage(String),
}

impl From<RepositoryError> for QueueError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::Connection => QueueError::Connection(e.to_string()),
            other => QueueError::Storage(other.to_string()),
        }
    }
}

/// Outcome of a job handler that did not succeed.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Ordinary failure; the queue schedules a retry while attempts remain.
    #[error("{0}")]
    Failed(String),

    /// The payload can never be processed. Failed immediately, no retries.
    #[error("poison message: {0}")]
    Poison(String),
}

/// Errors returned by step tools.
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    /// Timeouts, connection resets, upstream 5xx. Retried locally.
    #[error("transient tool failure: {0}")]
    Transient(String),

    /// Bad input or a definitive upstream rejection.
    #[error("tool failure: {0}")]
    Permanent(String),
}

impl ToolError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ToolError::Transient(_))
    }
}

/// A `${stepK.path}` reference that cannot be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("malformed template in '{0}'")]
    Malformed(String),

    #[error("invalid step reference '${{{0}}}'")]
    InvalidReference(String),

    #[error("step {current} references step {referenced}, only earlier steps may be referenced")]
    ForwardReference { current: usize, referenced: usize },

    #[error("step {0} has no output")]
    MissingOutput(usize),

    #[error("path '{path}' does not resolve in the output of step {step}")]
    UnresolvedPath { step: usize, path: String },
}

/// Errors from workflow engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid workflow definition: {0}")]
    Validation(String),

    #[error("template resolution failed: {0}")]
    TemplateResolution(#[from] TemplateError),

    /// The workflow lock is held by a live runner.
    #[error("workflow {0} is currently running")]
    LockContention(Uuid),

    /// Another runner reclaimed the lock while this one was executing.
    #[error("lost the lock on workflow {0}")]
    LockLost(Uuid),

    #[error("workflow {0} not found")]
    NotFound(Uuid),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Errors from scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The cron expression (or human-readable schedule) was rejected.
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    /// The expression parsed but yields no future occurrence.
    #[error("schedule {id} cannot be registered: {reason}")]
    Unschedulable { id: Uuid, reason: String },

    #[error("schedule {0} not found")]
    NotFound(Uuid),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}
