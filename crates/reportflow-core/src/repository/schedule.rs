//! Schedule repository trait.

use std::future::Future;

use chrono::{DateTime, Utc};
use reportflow_types::error::RepositoryError;
use reportflow_types::schedule::{Schedule, ScheduleStatus};
use uuid::Uuid;

pub trait ScheduleRepository: Send + Sync {
    fn create(&self, schedule: &Schedule)
    -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn get(
        &self,
        id: &Uuid,
    ) -> impl Future<Output = Result<Option<Schedule>, RepositoryError>> + Send;

    /// All schedules, optionally filtered by status, oldest first.
    fn list(
        &self,
        status: Option<ScheduleStatus>,
    ) -> impl Future<Output = Result<Vec<Schedule>, RepositoryError>> + Send;

    /// Set the status and overwrite `last_error`. Returns `false` if missing.
    fn update_status(
        &self,
        id: &Uuid,
        status: ScheduleStatus,
        last_error: Option<&str>,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    /// Record a trigger: sets `last_run_at` and overwrites `last_error`
    /// (cleared on success).
    fn record_run(
        &self,
        id: &Uuid,
        fired_at: DateTime<Utc>,
        error: Option<&str>,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Returns `true` if the schedule existed.
    fn delete(&self, id: &Uuid) -> impl Future<Output = Result<bool, RepositoryError>> + Send;
}
