//! In-process queue backend used in fallback mode.
//!
//! Pending jobs live in a per-queue ordered index keyed by
//! (priority, scheduled_at, insertion sequence), so equal-priority jobs are
//! claimed in insertion order and a retried job takes the position its new
//! `scheduled_at` gives it. Claims happen under one mutex.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use reportflow_types::error::QueueError;
use reportflow_types::job::{Job, JobCounts, JobFailure, JobStatus, NewJob, PushOutcome};
use uuid::Uuid;

use super::backend::QueueBackend;

type PendingKey = (i32, DateTime<Utc>, u64);

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<Uuid, Job>,
    /// queue name -> ordered pending index.
    pending: HashMap<String, BTreeMap<PendingKey, Uuid>>,
    /// Pending-index key for each pending job, for O(log n) removal.
    keys: HashMap<Uuid, PendingKey>,
    dedup: HashMap<String, Uuid>,
    next_seq: u64,
}

impl MemoryState {
    fn index_pending(&mut self, job: &Job) {
        let key = (job.priority, job.scheduled_at, self.next_seq);
        self.next_seq += 1;
        self.pending
            .entry(job.queue_name.clone())
            .or_default()
            .insert(key, job.id);
        self.keys.insert(job.id, key);
    }

    fn unindex(&mut self, job: &Job) {
        if let Some(key) = self.keys.remove(&job.id) {
            if let Some(index) = self.pending.get_mut(&job.queue_name) {
                index.remove(&key);
            }
        }
    }

    fn remove_job(&mut self, id: &Uuid) {
        if let Some(job) = self.jobs.remove(id) {
            self.unindex(&job);
            if let Some(key) = &job.dedup_key {
                if self.dedup.get(key) == Some(id) {
                    self.dedup.remove(key);
                }
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryQueueBackend {
    state: Mutex<MemoryState>,
}

impl MemoryQueueBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn active_job<'a>(state: &'a mut MemoryState, id: Uuid) -> Result<&'a mut Job, QueueError> {
    let job = state.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
    if job.status != JobStatus::Active {
        return Err(QueueError::InvalidState {
            id,
            status: job.status,
        });
    }
    Ok(job)
}

impl QueueBackend for MemoryQueueBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn push(&self, job: NewJob) -> Result<PushOutcome, QueueError> {
        let mut state = self.state();
        if let Some(existing) = job.dedup_key.as_ref().and_then(|k| state.dedup.get(k)) {
            return Ok(PushOutcome {
                id: *existing,
                deduplicated: true,
            });
        }

        let job = job.into_job();
        let id = job.id;
        if let Some(key) = &job.dedup_key {
            state.dedup.insert(key.clone(), id);
        }
        state.index_pending(&job);
        state.jobs.insert(id, job);
        Ok(PushOutcome {
            id,
            deduplicated: false,
        })
    }

    async fn pop(&self, queue: &str, now: DateTime<Utc>) -> Result<Option<Job>, QueueError> {
        let mut state = self.state();
        let next = state.pending.get(queue).and_then(|index| {
            index
                .iter()
                .find(|((_, scheduled_at, _), _)| *scheduled_at <= now)
                .map(|(key, id)| (*key, *id))
        });
        let Some((key, id)) = next else {
            return Ok(None);
        };

        if let Some(index) = state.pending.get_mut(queue) {
            index.remove(&key);
        }
        state.keys.remove(&id);
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| QueueError::Storage(format!("pending index references missing job {id}")))?;
        job.status = JobStatus::Active;
        job.claimed_at = Some(now);
        Ok(Some(job.clone()))
    }

    async fn ack(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), QueueError> {
        let mut state = self.state();
        let job = active_job(&mut state, id)?;
        job.status = JobStatus::Completed;
        job.claimed_at = None;
        job.finished_at = Some(now);
        Ok(())
    }

    async fn nack(&self, id: Uuid, failure: JobFailure, now: DateTime<Utc>) -> Result<Job, QueueError> {
        let mut state = self.state();
        let job = active_job(&mut state, id)?;
        job.attempts = (job.attempts + 1).min(job.max_attempts);
        job.last_error = Some(failure.error);
        job.claimed_at = None;
        match failure.retry_at {
            Some(retry_at) => {
                job.status = JobStatus::Pending;
                job.scheduled_at = retry_at;
            }
            None => {
                job.status = JobStatus::Failed;
                job.finished_at = Some(now);
            }
        }
        let job = job.clone();
        if job.status == JobStatus::Pending {
            state.index_pending(&job);
        }
        Ok(job)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, QueueError> {
        Ok(self.state().jobs.get(&id).cloned())
    }

    async fn retry_now(&self, id: Uuid, now: DateTime<Utc>) -> Result<Job, QueueError> {
        let mut state = self.state();
        let current = state.jobs.get(&id).cloned().ok_or(QueueError::NotFound(id))?;
        match current.status {
            JobStatus::Active | JobStatus::Completed => {
                return Err(QueueError::InvalidState {
                    id,
                    status: current.status,
                });
            }
            JobStatus::Pending => state.unindex(&current),
            JobStatus::Failed => {}
        }

        let job = state.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if job.status == JobStatus::Failed {
            job.attempts = 0;
            job.finished_at = None;
        }
        job.status = JobStatus::Pending;
        job.scheduled_at = now;
        let job = job.clone();
        state.index_pending(&job);
        Ok(job)
    }

    async fn cleanup(&self, status: JobStatus, finished_before: DateTime<Utc>) -> Result<u64, QueueError> {
        if !status.is_terminal() {
            return Err(QueueError::Validation(format!(
                "cleanup only applies to finished jobs, not {status}"
            )));
        }
        let mut state = self.state();
        let doomed: Vec<Uuid> = state
            .jobs
            .values()
            .filter(|j| j.status == status && j.finished_at.is_some_and(|t| t < finished_before))
            .map(|j| j.id)
            .collect();
        for id in &doomed {
            state.remove_job(id);
        }
        Ok(doomed.len() as u64)
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts, QueueError> {
        let state = self.state();
        let mut counts = JobCounts::default();
        for job in state.jobs.values().filter(|j| j.queue_name == queue) {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Active => counts.active += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn requeue_stale(&self, claimed_before: DateTime<Utc>) -> Result<u64, QueueError> {
        let mut state = self.state();
        let stale: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Active && j.claimed_at.is_some_and(|t| t < claimed_before)
            })
            .cloned()
            .collect();
        for job in &stale {
            if let Some(stored) = state.jobs.get_mut(&job.id) {
                stored.status = JobStatus::Pending;
                stored.claimed_at = None;
            }
            let requeued = state.jobs.get(&job.id).cloned();
            if let Some(requeued) = requeued {
                state.index_pending(&requeued);
            }
        }
        Ok(stale.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_job(queue: &str, priority: i32, at: DateTime<Utc>) -> NewJob {
        NewJob {
            queue_name: queue.to_string(),
            job_name: "run_workflow".to_string(),
            payload: serde_json::json!({}),
            priority,
            max_attempts: 3,
            scheduled_at: at,
            dedup_key: None,
            created_at: at,
        }
    }

    #[tokio::test]
    async fn equal_priority_pops_in_insertion_order() {
        let backend = MemoryQueueBackend::new();
        let now = Utc::now();
        let a = backend.push(new_job("q", 0, now)).await.unwrap().id;
        let b = backend.push(new_job("q", 0, now)).await.unwrap().id;
        let c = backend.push(new_job("q", 0, now)).await.unwrap().id;

        let order: Vec<Uuid> = [
            backend.pop("q", now).await.unwrap().unwrap().id,
            backend.pop("q", now).await.unwrap().unwrap().id,
            backend.pop("q", now).await.unwrap().unwrap().id,
        ]
        .to_vec();
        assert_eq!(order, vec![a, b, c]);
        assert!(backend.pop("q", now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lower_priority_value_preempts_queued_jobs() {
        let backend = MemoryQueueBackend::new();
        let now = Utc::now();
        backend.push(new_job("q", 5, now)).await.unwrap();
        let urgent = backend.push(new_job("q", 1, now)).await.unwrap().id;

        assert_eq!(backend.pop("q", now).await.unwrap().unwrap().id, urgent);
    }

    #[tokio::test]
    async fn delayed_jobs_are_not_claimed_early() {
        let backend = MemoryQueueBackend::new();
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(30);
        // Higher priority but not yet due; the due job behind it is claimed.
        backend.push(new_job("q", 0, later)).await.unwrap();
        let due = backend.push(new_job("q", 9, now)).await.unwrap().id;

        assert_eq!(backend.pop("q", now).await.unwrap().unwrap().id, due);
        assert!(backend.pop("q", now).await.unwrap().is_none());
        assert!(backend.pop("q", later).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn dedup_key_returns_existing_job() {
        let backend = MemoryQueueBackend::new();
        let now = Utc::now();
        let mut job = new_job("q", 0, now);
        job.dedup_key = Some("schedule:1:1000".to_string());

        let first = backend.push(job.clone()).await.unwrap();
        let second = backend.push(job).await.unwrap();
        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.id, second.id);
        assert_eq!(backend.counts("q").await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn nack_requeues_or_fails() {
        let backend = MemoryQueueBackend::new();
        let now = Utc::now();
        let id = backend.push(new_job("q", 0, now)).await.unwrap().id;

        backend.pop("q", now).await.unwrap().unwrap();
        let retry_at = now + chrono::Duration::seconds(2);
        let job = backend
            .nack(
                id,
                JobFailure {
                    error: "timeout".to_string(),
                    retry_at: Some(retry_at),
                },
                now,
            )
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert!(backend.pop("q", now).await.unwrap().is_none());

        backend.pop("q", retry_at).await.unwrap().unwrap();
        let job = backend
            .nack(
                id,
                JobFailure {
                    error: "still broken".to_string(),
                    retry_at: None,
                },
                retry_at,
            )
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 2);
        assert_eq!(job.last_error.as_deref(), Some("still broken"));
    }

    #[tokio::test]
    async fn ack_requires_active_job() {
        let backend = MemoryQueueBackend::new();
        let now = Utc::now();
        let id = backend.push(new_job("q", 0, now)).await.unwrap().id;

        assert!(matches!(
            backend.ack(id, now).await,
            Err(QueueError::InvalidState { .. })
        ));
        assert!(matches!(
            backend.ack(Uuid::now_v7(), now).await,
            Err(QueueError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn cleanup_only_removes_requested_status() {
        let backend = MemoryQueueBackend::new();
        let now = Utc::now();
        let done = backend.push(new_job("q", 0, now)).await.unwrap().id;
        let broken = backend.push(new_job("q", 0, now)).await.unwrap().id;
        backend.pop("q", now).await.unwrap();
        backend.ack(done, now).await.unwrap();
        backend.pop("q", now).await.unwrap();
        backend
            .nack(
                broken,
                JobFailure {
                    error: "x".to_string(),
                    retry_at: None,
                },
                now,
            )
            .await
            .unwrap();

        let later = now + chrono::Duration::seconds(1);
        assert_eq!(backend.cleanup(JobStatus::Completed, later).await.unwrap(), 1);
        assert!(backend.get(done).await.unwrap().is_none());
        assert!(backend.get(broken).await.unwrap().is_some());
        assert!(backend.cleanup(JobStatus::Pending, later).await.is_err());
    }

    #[tokio::test]
    async fn requeue_stale_returns_abandoned_claims() {
        let backend = MemoryQueueBackend::new();
        let now = Utc::now();
        let id = backend.push(new_job("q", 0, now)).await.unwrap().id;
        backend.pop("q", now).await.unwrap().unwrap();

        let later = now + chrono::Duration::minutes(15);
        let requeued = backend
            .requeue_stale(later - chrono::Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(requeued, 1);
        assert_eq!(backend.pop("q", later).await.unwrap().unwrap().id, id);
    }
}
