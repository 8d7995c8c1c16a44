//! Workflow instance repository trait.
//!
//! Besides plain CRUD, the trait carries the load-bearing concurrency
//! primitive of the engine: `try_acquire_lock`, an atomic compare-and-set on
//! `locked_by`/`locked_at` with expiry. Runners may be separate processes,
//! so the lock lives in the store, not in memory.

use std::future::Future;

use chrono::{DateTime, Utc};
use reportflow_types::error::RepositoryError;
use reportflow_types::workflow::WorkflowInstance;
use uuid::Uuid;

/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    fn create(
        &self,
        instance: &WorkflowInstance,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn get(
        &self,
        id: &Uuid,
    ) -> impl Future<Output = Result<Option<WorkflowInstance>, RepositoryError>> + Send;

    /// Most recently created first.
    fn list(
        &self,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;

    /// Claim the lock for `holder` if it is free or was last taken at or
    /// before `expired_before`. Returns the locked instance, or `None` when
    /// a live holder owns it (or the workflow does not exist).
    fn try_acquire_lock(
        &self,
        id: &Uuid,
        holder: &str,
        now: DateTime<Utc>,
        expired_before: DateTime<Utc>,
    ) -> impl Future<Output = Result<Option<WorkflowInstance>, RepositoryError>> + Send;

    /// Persist execution state, fenced on `locked_by == holder`. Returns
    /// `false` when the holder no longer owns the lock.
    fn save_progress(
        &self,
        instance: &WorkflowInstance,
        holder: &str,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    /// Clear the lock if `holder` still owns it.
    fn release_lock(
        &self,
        id: &Uuid,
        holder: &str,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    /// `running` workflows whose lock is absent or was taken at or before
    /// `expired_before` (the runner is presumed dead).
    fn list_stale_running(
        &self,
        expired_before: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;
}
