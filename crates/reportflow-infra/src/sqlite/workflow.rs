//! SQLite workflow instance repository.
//!
//! Implements `WorkflowRepository` from `reportflow-core`. Steps (with their
//! outputs) are stored as one JSON column; the instance row is rewritten on
//! every progress save. The lock claim and every progress write are single
//! conditional statements.

use chrono::{DateTime, Utc};
use reportflow_core::repository::workflow::WorkflowRepository;
use reportflow_types::error::RepositoryError;
use reportflow_types::workflow::{WorkflowInstance, WorkflowStatus, WorkflowStep};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_optional_datetime, parse_uuid, query_error};

const INSTANCE_COLUMNS: &str = "id, owner_id, name, status, steps, current_step_index, \
     locked_by, locked_at, created_at, updated_at, completed_at, error";

/// SQLite-backed implementation of `WorkflowRepository`.
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row type
// ---------------------------------------------------------------------------

struct InstanceRow {
    id: String,
    owner_id: String,
    name: String,
    status: String,
    steps: String,
    current_step_index: i64,
    locked_by: Option<String>,
    locked_at: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
    error: Option<String>,
}

impl InstanceRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            owner_id: row.try_get("owner_id")?,
            name: row.try_get("name")?,
            status: row.try_get("status")?,
            steps: row.try_get("steps")?,
            current_step_index: row.try_get("current_step_index")?,
            locked_by: row.try_get("locked_by")?,
            locked_at: row.try_get("locked_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
            error: row.try_get("error")?,
        })
    }

    fn into_instance(self) -> Result<WorkflowInstance, RepositoryError> {
        let status: WorkflowStatus = self
            .status
            .parse()
            .map_err(|e: String| RepositoryError::Query(e))?;
        let steps: Vec<WorkflowStep> = serde_json::from_str(&self.steps)
            .map_err(|e| RepositoryError::Query(format!("invalid steps JSON: {e}")))?;

        Ok(WorkflowInstance {
            id: parse_uuid(&self.id)?,
            owner_id: self.owner_id,
            name: self.name,
            status,
            steps,
            current_step_index: self.current_step_index.max(0) as usize,
            locked_by: self.locked_by,
            locked_at: parse_optional_datetime(self.locked_at.as_deref())?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            completed_at: parse_optional_datetime(self.completed_at.as_deref())?,
            error: self.error,
        })
    }
}

fn rows_to_instances(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<WorkflowInstance>, RepositoryError> {
    let mut instances = Vec::with_capacity(rows.len());
    for row in rows {
        let r = InstanceRow::from_row(row).map_err(query_error)?;
        instances.push(r.into_instance()?);
    }
    Ok(instances)
}

fn steps_json(instance: &WorkflowInstance) -> Result<String, RepositoryError> {
    serde_json::to_string(&instance.steps)
        .map_err(|e| RepositoryError::Query(format!("serialize steps: {e}")))
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn create(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"INSERT INTO workflow_instances
               (id, owner_id, name, status, steps, current_step_index,
                locked_by, locked_at, created_at, updated_at, completed_at, error)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO NOTHING"#,
        )
        .bind(instance.id.to_string())
        .bind(&instance.owner_id)
        .bind(&instance.name)
        .bind(instance.status.to_string())
        .bind(steps_json(instance)?)
        .bind(instance.current_step_index as i64)
        .bind(&instance.locked_by)
        .bind(instance.locked_at.as_ref().map(format_datetime))
        .bind(format_datetime(&instance.created_at))
        .bind(format_datetime(&instance.updated_at))
        .bind(instance.completed_at.as_ref().map(format_datetime))
        .bind(&instance.error)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict(format!(
                "workflow {} already exists",
                instance.id
            )));
        }
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let sql = format!("SELECT {INSTANCE_COLUMNS} FROM workflow_instances WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = InstanceRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_instance()?))
            }
            None => Ok(None),
        }
    }

    async fn list(&self, limit: u32) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let sql = format!(
            "SELECT {INSTANCE_COLUMNS} FROM workflow_instances ORDER BY created_at DESC, id DESC LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(limit))
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        rows_to_instances(&rows)
    }

    async fn try_acquire_lock(
        &self,
        id: &Uuid,
        holder: &str,
        now: DateTime<Utc>,
        expired_before: DateTime<Utc>,
    ) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let sql = format!(
            r#"UPDATE workflow_instances SET locked_by = ?, locked_at = ?
               WHERE id = ?
                 AND (locked_by IS NULL OR locked_at IS NULL OR locked_at <= ?)
               RETURNING {INSTANCE_COLUMNS}"#
        );
        let row = sqlx::query(&sql)
            .bind(holder)
            .bind(format_datetime(&now))
            .bind(id.to_string())
            .bind(format_datetime(&expired_before))
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = InstanceRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_instance()?))
            }
            None => Ok(None),
        }
    }

    async fn save_progress(
        &self,
        instance: &WorkflowInstance,
        holder: &str,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE workflow_instances SET
                 status = ?, steps = ?, current_step_index = ?, locked_at = ?,
                 updated_at = ?, completed_at = ?, error = ?
               WHERE id = ? AND locked_by = ?"#,
        )
        .bind(instance.status.to_string())
        .bind(steps_json(instance)?)
        .bind(instance.current_step_index as i64)
        .bind(instance.locked_at.as_ref().map(format_datetime))
        .bind(format_datetime(&instance.updated_at))
        .bind(instance.completed_at.as_ref().map(format_datetime))
        .bind(&instance.error)
        .bind(instance.id.to_string())
        .bind(holder)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_lock(&self, id: &Uuid, holder: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE workflow_instances SET locked_by = NULL, locked_at = NULL WHERE id = ? AND locked_by = ?",
        )
        .bind(id.to_string())
        .bind(holder)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_stale_running(
        &self,
        expired_before: DateTime<Utc>,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let sql = format!(
            r#"SELECT {INSTANCE_COLUMNS} FROM workflow_instances
               WHERE status = 'running'
                 AND (locked_by IS NULL OR locked_at IS NULL OR locked_at <= ?)
               ORDER BY created_at ASC"#
        );
        let rows = sqlx::query(&sql)
            .bind(format_datetime(&expired_before))
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        rows_to_instances(&rows)
    }
}
