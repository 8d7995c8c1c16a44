//! SQLite circuit breaker state store.
//!
//! One row per breaker name, upserted on every transition so an open
//! breaker is still open after a restart.

use reportflow_core::repository::breaker::BreakerStateStore;
use reportflow_types::breaker::{BreakerPhase, BreakerSnapshot};
use reportflow_types::error::RepositoryError;
use sqlx::Row;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_optional_datetime, query_error};

const BREAKER_COLUMNS: &str =
    "name, phase, consecutive_failures, opened_at, last_failure_at, last_error, updated_at";

/// SQLite-backed implementation of `BreakerStateStore`.
pub struct SqliteBreakerStore {
    pool: DatabasePool,
}

impl SqliteBreakerStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

struct BreakerRow {
    name: String,
    phase: String,
    consecutive_failures: i64,
    opened_at: Option<String>,
    last_failure_at: Option<String>,
    last_error: Option<String>,
    updated_at: String,
}

impl BreakerRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            name: row.try_get("name")?,
            phase: row.try_get("phase")?,
            consecutive_failures: row.try_get("consecutive_failures")?,
            opened_at: row.try_get("opened_at")?,
            last_failure_at: row.try_get("last_failure_at")?,
            last_error: row.try_get("last_error")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_snapshot(self) -> Result<BreakerSnapshot, RepositoryError> {
        let phase: BreakerPhase = self
            .phase
            .parse()
            .map_err(|e: String| RepositoryError::Query(e))?;

        Ok(BreakerSnapshot {
            name: self.name,
            phase,
            consecutive_failures: self.consecutive_failures.max(0) as u32,
            opened_at: parse_optional_datetime(self.opened_at.as_deref())?,
            last_failure_at: parse_optional_datetime(self.last_failure_at.as_deref())?,
            last_error: self.last_error,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

impl BreakerStateStore for SqliteBreakerStore {
    async fn load(&self, name: &str) -> Result<Option<BreakerSnapshot>, RepositoryError> {
        let sql = format!("SELECT {BREAKER_COLUMNS} FROM breaker_state WHERE name = ?");
        let row = sqlx::query(&sql)
            .bind(name)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = BreakerRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_snapshot()?))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, snapshot: &BreakerSnapshot) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO breaker_state
               (name, phase, consecutive_failures, opened_at, last_failure_at, last_error, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(name) DO UPDATE SET
                 phase = excluded.phase,
                 consecutive_failures = excluded.consecutive_failures,
                 opened_at = excluded.opened_at,
                 last_failure_at = excluded.last_failure_at,
                 last_error = excluded.last_error,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&snapshot.name)
        .bind(snapshot.phase.to_string())
        .bind(i64::from(snapshot.consecutive_failures))
        .bind(snapshot.opened_at.as_ref().map(format_datetime))
        .bind(snapshot.last_failure_at.as_ref().map(format_datetime))
        .bind(&snapshot.last_error)
        .bind(format_datetime(&snapshot.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn list(&self) -> Result<Vec<BreakerSnapshot>, RepositoryError> {
        let sql = format!("SELECT {BREAKER_COLUMNS} FROM breaker_state ORDER BY name ASC");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        let mut snapshots = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = BreakerRow::from_row(row).map_err(query_error)?;
            snapshots.push(r.into_snapshot()?);
        }
        Ok(snapshots)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    use super::*;
    use crate::sqlite::test_support::test_pool;
    use chrono::{Duration, TimeZone, Utc};
    use reportflow_core::clock::{ManualClock, SharedClock};
    use reportflow_core::event::EventBus;
    use reportflow_core::repository::breaker::BoxBreakerStore;
    use reportflow_core::resilience::{BreakerConfig, BreakerError, BreakerRegistry};

    #[tokio::test]
    async fn save_upserts_by_name() {
        let store = SqliteBreakerStore::new(test_pool().await);
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();

        let mut snapshot = BreakerSnapshot::closed("tool:http", now);
        store.save(&snapshot).await.unwrap();

        snapshot.phase = BreakerPhase::Open;
        snapshot.consecutive_failures = 5;
        snapshot.opened_at = Some(now);
        snapshot.last_failure_at = Some(now);
        snapshot.last_error = Some("connection reset".to_string());
        store.save(&snapshot).await.unwrap();

        assert_eq!(store.load("tool:http").await.unwrap(), Some(snapshot));
        assert_eq!(store.list().await.unwrap().len(), 1);
        assert!(store.load("tool:smtp").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn open_breaker_survives_a_restart() {
        let pool = test_pool().await;
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        ));
        let config = BreakerConfig {
            failure_threshold: 2,
            cool_down: StdDuration::from_secs(60),
        };

        let first = BreakerRegistry::new(
            config.clone(),
            BoxBreakerStore::new(SqliteBreakerStore::new(pool.clone())),
            clock.clone() as SharedClock,
            EventBus::default(),
        );
        let breaker = first.get("tool:http").await;
        for _ in 0..2 {
            let _ = breaker
                .call(|| async { Err::<(), _>("upstream 502".to_string()) })
                .await;
        }

        // A fresh registry over the same database sees the open breaker.
        clock.advance(Duration::seconds(10));
        let restarted = BreakerRegistry::new(
            config,
            BoxBreakerStore::new(SqliteBreakerStore::new(pool)),
            clock.clone() as SharedClock,
            EventBus::default(),
        );
        let restored = restarted.get("tool:http").await;
        let result = restored.call(|| async { Ok::<_, String>(()) }).await;
        assert!(matches!(result, Err(BreakerError::Open { .. })));
    }
}
