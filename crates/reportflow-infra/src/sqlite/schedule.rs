//! SQLite schedule repository.

use chrono::{DateTime, Utc};
use reportflow_core::repository::schedule::ScheduleRepository;
use reportflow_types::error::RepositoryError;
use reportflow_types::schedule::{Schedule, ScheduleStatus};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_optional_datetime, parse_uuid, query_error};

const SCHEDULE_COLUMNS: &str =
    "id, cron, workflow_id, status, last_run_at, last_error, created_at, updated_at";

/// SQLite-backed implementation of `ScheduleRepository`.
pub struct SqliteScheduleRepository {
    pool: DatabasePool,
}

impl SqliteScheduleRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

struct ScheduleRow {
    id: String,
    cron: String,
    workflow_id: String,
    status: String,
    last_run_at: Option<String>,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl ScheduleRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            cron: row.try_get("cron")?,
            workflow_id: row.try_get("workflow_id")?,
            status: row.try_get("status")?,
            last_run_at: row.try_get("last_run_at")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_schedule(self) -> Result<Schedule, RepositoryError> {
        let status: ScheduleStatus = self
            .status
            .parse()
            .map_err(|e: String| RepositoryError::Query(e))?;

        Ok(Schedule {
            id: parse_uuid(&self.id)?,
            cron: self.cron,
            workflow_id: parse_uuid(&self.workflow_id)?,
            status,
            last_run_at: parse_optional_datetime(self.last_run_at.as_deref())?,
            last_error: self.last_error,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

impl ScheduleRepository for SqliteScheduleRepository {
    async fn create(&self, schedule: &Schedule) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO schedules
               (id, cron, workflow_id, status, last_run_at, last_error, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(schedule.id.to_string())
        .bind(&schedule.cron)
        .bind(schedule.workflow_id.to_string())
        .bind(schedule.status.to_string())
        .bind(schedule.last_run_at.as_ref().map(format_datetime))
        .bind(&schedule.last_error)
        .bind(format_datetime(&schedule.created_at))
        .bind(format_datetime(&schedule.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<Schedule>, RepositoryError> {
        let sql = format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = ScheduleRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_schedule()?))
            }
            None => Ok(None),
        }
    }

    async fn list(&self, status: Option<ScheduleStatus>) -> Result<Vec<Schedule>, RepositoryError> {
        let rows = match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE status = ? ORDER BY created_at ASC, id ASC"
                );
                sqlx::query(&sql)
                    .bind(status.to_string())
                    .fetch_all(&self.pool.reader)
                    .await
            }
            None => {
                let sql = format!(
                    "SELECT {SCHEDULE_COLUMNS} FROM schedules ORDER BY created_at ASC, id ASC"
                );
                sqlx::query(&sql).fetch_all(&self.pool.reader).await
            }
        }
        .map_err(query_error)?;

        let mut schedules = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = ScheduleRow::from_row(row).map_err(query_error)?;
            schedules.push(r.into_schedule()?);
        }
        Ok(schedules)
    }

    async fn update_status(
        &self,
        id: &Uuid,
        status: ScheduleStatus,
        last_error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE schedules SET status = ?, last_error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.to_string())
        .bind(last_error)
        .bind(format_datetime(&now))
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_run(
        &self,
        id: &Uuid,
        fired_at: DateTime<Utc>,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let fired_at = format_datetime(&fired_at);
        let result = sqlx::query(
            "UPDATE schedules SET last_run_at = ?, last_error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&fired_at)
        .bind(error)
        .bind(&fired_at)
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn delete(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM schedules WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::test_support::test_pool;
    use chrono::{Duration, TimeZone};

    fn schedule(created_at: DateTime<Utc>) -> Schedule {
        Schedule {
            id: Uuid::now_v7(),
            cron: "0 */5 * * * *".to_string(),
            workflow_id: Uuid::now_v7(),
            status: ScheduleStatus::Active,
            last_run_at: None,
            last_error: None,
            created_at,
            updated_at: created_at,
        }
    }

    #[tokio::test]
    async fn create_get_and_filter_by_status() {
        let repo = SqliteScheduleRepository::new(test_pool().await);
        let now = Utc::now();
        let active = schedule(now);
        let mut paused = schedule(now + Duration::seconds(1));
        paused.status = ScheduleStatus::Paused;
        repo.create(&active).await.unwrap();
        repo.create(&paused).await.unwrap();

        let loaded = repo.get(&active.id).await.unwrap().unwrap();
        assert_eq!(loaded.cron, "0 */5 * * * *");
        assert_eq!(loaded.workflow_id, active.workflow_id);

        assert_eq!(repo.list(None).await.unwrap().len(), 2);
        let only_paused = repo.list(Some(ScheduleStatus::Paused)).await.unwrap();
        assert_eq!(only_paused.len(), 1);
        assert_eq!(only_paused[0].id, paused.id);
    }

    #[tokio::test]
    async fn record_run_sets_and_clears_last_error() {
        let repo = SqliteScheduleRepository::new(test_pool().await);
        let s = schedule(Utc::now());
        repo.create(&s).await.unwrap();

        let fired = Utc.with_ymd_and_hms(2026, 3, 1, 12, 5, 0).unwrap();
        repo.record_run(&s.id, fired, Some("queue unavailable")).await.unwrap();
        let loaded = repo.get(&s.id).await.unwrap().unwrap();
        assert_eq!(loaded.last_run_at, Some(fired));
        assert_eq!(loaded.last_error.as_deref(), Some("queue unavailable"));

        repo.record_run(&s.id, fired + Duration::minutes(5), None).await.unwrap();
        assert!(repo.get(&s.id).await.unwrap().unwrap().last_error.is_none());

        assert!(matches!(
            repo.record_run(&Uuid::now_v7(), fired, None).await,
            Err(RepositoryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn update_status_and_delete() {
        let repo = SqliteScheduleRepository::new(test_pool().await);
        let s = schedule(Utc::now());
        repo.create(&s).await.unwrap();

        assert!(repo
            .update_status(&s.id, ScheduleStatus::Failed, Some("no future occurrence"), Utc::now())
            .await
            .unwrap());
        let loaded = repo.get(&s.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ScheduleStatus::Failed);
        assert_eq!(loaded.last_error.as_deref(), Some("no future occurrence"));

        assert!(repo.delete(&s.id).await.unwrap());
        assert!(!repo.delete(&s.id).await.unwrap());
        assert!(!repo
            .update_status(&s.id, ScheduleStatus::Active, None, Utc::now())
            .await
            .unwrap());
    }
}
