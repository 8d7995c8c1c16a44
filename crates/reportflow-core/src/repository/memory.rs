//! In-process repository implementations.
//!
//! Same contracts as the SQLite adapters, including the atomic lock claim,
//! backed by mutex-guarded maps. State is lost with the process.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use reportflow_types::breaker::BreakerSnapshot;
use reportflow_types::error::RepositoryError;
use reportflow_types::schedule::{Schedule, ScheduleStatus};
use reportflow_types::workflow::{WorkflowInstance, WorkflowStatus};
use uuid::Uuid;

use super::breaker::BreakerStateStore;
use super::schedule::ScheduleRepository;
use super::workflow::WorkflowRepository;

fn guard<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryWorkflowRepository {
    instances: Mutex<HashMap<Uuid, WorkflowInstance>>,
}

impl MemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock_is_free(wf: &WorkflowInstance, expired_before: DateTime<Utc>) -> bool {
    match (&wf.locked_by, wf.locked_at) {
        (None, _) => true,
        (Some(_), None) => true,
        (Some(_), Some(at)) => at <= expired_before,
    }
}

impl WorkflowRepository for MemoryWorkflowRepository {
    async fn create(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let mut map = guard(&self.instances);
        if map.contains_key(&instance.id) {
            return Err(RepositoryError::Conflict(format!(
                "workflow {} already exists",
                instance.id
            )));
        }
        map.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        Ok(guard(&self.instances).get(id).cloned())
    }

    async fn list(&self, limit: u32) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let mut all: Vec<WorkflowInstance> = guard(&self.instances).values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        all.truncate(limit as usize);
        Ok(all)
    }

    async fn try_acquire_lock(
        &self,
        id: &Uuid,
        holder: &str,
        now: DateTime<Utc>,
        expired_before: DateTime<Utc>,
    ) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let mut map = guard(&self.instances);
        let Some(wf) = map.get_mut(id) else {
            return Ok(None);
        };
        if !lock_is_free(wf, expired_before) {
            return Ok(None);
        }
        wf.locked_by = Some(holder.to_string());
        wf.locked_at = Some(now);
        Ok(Some(wf.clone()))
    }

    async fn save_progress(
        &self,
        instance: &WorkflowInstance,
        holder: &str,
    ) -> Result<bool, RepositoryError> {
        let mut map = guard(&self.instances);
        let Some(stored) = map.get_mut(&instance.id) else {
            return Ok(false);
        };
        if stored.locked_by.as_deref() != Some(holder) {
            return Ok(false);
        }
        let mut updated = instance.clone();
        updated.locked_by = Some(holder.to_string());
        *stored = updated;
        Ok(true)
    }

    async fn release_lock(&self, id: &Uuid, holder: &str) -> Result<bool, RepositoryError> {
        let mut map = guard(&self.instances);
        match map.get_mut(id) {
            Some(wf) if wf.locked_by.as_deref() == Some(holder) => {
                wf.locked_by = None;
                wf.locked_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_stale_running(
        &self,
        expired_before: DateTime<Utc>,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        Ok(guard(&self.instances)
            .values()
            .filter(|wf| wf.status == WorkflowStatus::Running && lock_is_free(wf, expired_before))
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryScheduleRepository {
    schedules: Mutex<HashMap<Uuid, Schedule>>,
}

impl MemoryScheduleRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ScheduleRepository for MemoryScheduleRepository {
    async fn create(&self, schedule: &Schedule) -> Result<(), RepositoryError> {
        guard(&self.schedules).insert(schedule.id, schedule.clone());
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<Schedule>, RepositoryError> {
        Ok(guard(&self.schedules).get(id).cloned())
    }

    async fn list(&self, status: Option<ScheduleStatus>) -> Result<Vec<Schedule>, RepositoryError> {
        let mut all: Vec<Schedule> = guard(&self.schedules)
            .values()
            .filter(|s| status.is_none_or(|wanted| s.status == wanted))
            .cloned()
            .collect();
        all.sort_by_key(|s| (s.created_at, s.id));
        Ok(all)
    }

    async fn update_status(
        &self,
        id: &Uuid,
        status: ScheduleStatus,
        last_error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut map = guard(&self.schedules);
        let Some(schedule) = map.get_mut(id) else {
            return Ok(false);
        };
        schedule.status = status;
        schedule.last_error = last_error.map(str::to_string);
        schedule.updated_at = now;
        Ok(true)
    }

    async fn record_run(
        &self,
        id: &Uuid,
        fired_at: DateTime<Utc>,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut map = guard(&self.schedules);
        let schedule = map.get_mut(id).ok_or(RepositoryError::NotFound)?;
        schedule.last_run_at = Some(fired_at);
        schedule.last_error = error.map(str::to_string);
        schedule.updated_at = fired_at;
        Ok(())
    }

    async fn delete(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(guard(&self.schedules).remove(id).is_some())
    }
}

// ---------------------------------------------------------------------------
// Breakers
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryBreakerStore {
    snapshots: Mutex<HashMap<String, BreakerSnapshot>>,
}

impl MemoryBreakerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BreakerStateStore for MemoryBreakerStore {
    async fn load(&self, name: &str) -> Result<Option<BreakerSnapshot>, RepositoryError> {
        Ok(guard(&self.snapshots).get(name).cloned())
    }

    async fn save(&self, snapshot: &BreakerSnapshot) -> Result<(), RepositoryError> {
        guard(&self.snapshots).insert(snapshot.name.clone(), snapshot.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<BreakerSnapshot>, RepositoryError> {
        let mut all: Vec<BreakerSnapshot> = guard(&self.snapshots).values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reportflow_types::workflow::{StepDefinition, WorkflowDefinition};

    fn instance(now: DateTime<Utc>) -> WorkflowInstance {
        WorkflowInstance::from_definition(
            WorkflowDefinition {
                owner_id: "dealer-1".to_string(),
                name: "nightly".to_string(),
                steps: vec![StepDefinition {
                    name: "echo".to_string(),
                    tool: "echo".to_string(),
                    config: serde_json::json!({}),
                }],
            },
            now,
        )
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_expiry() {
        let repo = MemoryWorkflowRepository::new();
        let now = Utc::now();
        let wf = instance(now);
        repo.create(&wf).await.unwrap();

        let expired_before = now - chrono::Duration::seconds(60);
        assert!(repo
            .try_acquire_lock(&wf.id, "a", now, expired_before)
            .await
            .unwrap()
            .is_some());
        assert!(repo
            .try_acquire_lock(&wf.id, "b", now, expired_before)
            .await
            .unwrap()
            .is_none());

        // Two minutes later the holder is presumed dead.
        let later = now + chrono::Duration::seconds(120);
        let reclaimed = repo
            .try_acquire_lock(&wf.id, "b", later, later - chrono::Duration::seconds(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.locked_by.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn save_progress_is_fenced_on_holder() {
        let repo = MemoryWorkflowRepository::new();
        let now = Utc::now();
        let mut wf = instance(now);
        repo.create(&wf).await.unwrap();
        repo.try_acquire_lock(&wf.id, "a", now, now - chrono::Duration::seconds(1))
            .await
            .unwrap();

        wf.current_step_index = 1;
        assert!(!repo.save_progress(&wf, "b").await.unwrap());
        assert!(repo.save_progress(&wf, "a").await.unwrap());
        assert_eq!(repo.get(&wf.id).await.unwrap().unwrap().current_step_index, 1);

        assert!(!repo.release_lock(&wf.id, "b").await.unwrap());
        assert!(repo.release_lock(&wf.id, "a").await.unwrap());
        assert!(repo.get(&wf.id).await.unwrap().unwrap().locked_by.is_none());
    }

    #[tokio::test]
    async fn acquire_on_missing_workflow_returns_none() {
        let repo = MemoryWorkflowRepository::new();
        let now = Utc::now();
        assert!(repo
            .try_acquire_lock(&Uuid::now_v7(), "a", now, now)
            .await
            .unwrap()
            .is_none());
    }
}
