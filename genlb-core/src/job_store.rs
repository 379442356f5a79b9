use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::GenlbError;
use crate::job::{CancelOutcome, Job, JobId, JobStatus};

const DEFAULT_TERMINAL_CAP: usize = 1000;

struct Inner {
    pending: IndexMap<JobId, Job>,
    dispatched: HashMap<JobId, Job>,
    terminal: IndexMap<JobId, Job>,
    worker_job_index: HashMap<String, JobId>,
    counter: u64,
}

/// Tracks every job from enqueue through terminal state; indexes by both
/// balancer id and worker-job-id (spec §4.5). All three maps are behind one
/// mutex so every transition below is atomic with respect to the others.
pub struct JobStore {
    inner: Mutex<Inner>,
    max_size: usize,
    terminal_cap: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Default)]
pub struct QueueStatus {
    pub pending: usize,
    pub dispatched: usize,
    pub total: usize,
}

impl JobStore {
    pub fn new(max_size: usize) -> Arc<Self> {
        Self::with_terminal_cap(max_size, DEFAULT_TERMINAL_CAP)
    }

    pub fn with_terminal_cap(max_size: usize, terminal_cap: usize) -> Arc<Self> {
        Arc::new(JobStore {
            inner: Mutex::new(Inner {
                pending: IndexMap::new(),
                dispatched: HashMap::new(),
                terminal: IndexMap::new(),
                worker_job_index: HashMap::new(),
                counter: 0,
            }),
            max_size,
            terminal_cap,
        })
    }

    pub async fn enqueue(
        &self,
        spec: Value,
        client_id: Option<String>,
        extra_data: Option<Value>,
    ) -> Result<Job, GenlbError> {
        let mut guard = self.inner.lock().await;
        if guard.pending.len() >= self.max_size {
            return Err(GenlbError::QueueFull);
        }
        guard.counter += 1;
        let job = Job::new(Uuid::new_v4(), guard.counter, spec, client_id, extra_data);
        info!(job_id = %job.id, number = job.number, "job enqueued");
        guard.pending.insert(job.id, job.clone());
        Ok(job)
    }

    /// FIFO peek without removal (spec §4.5).
    pub async fn peek_oldest_pending(&self) -> Option<Job> {
        let guard = self.inner.lock().await;
        guard.pending.get_index(0).map(|(_, job)| job.clone())
    }

    /// Removes a job from `pending` and binds it to `worker_name`. Fails
    /// with `NotFound` if the job is no longer pending (e.g. raced with a
    /// cancellation) — the dispatcher treats that as "already handled".
    pub async fn move_pending_to_dispatched(
        &self,
        job_id: JobId,
        worker_name: &str,
    ) -> Result<Job, GenlbError> {
        let mut guard = self.inner.lock().await;
        let mut job = guard
            .pending
            .shift_remove(&job_id)
            .ok_or_else(|| GenlbError::NotFound(format!("pending job {job_id}")))?;
        job.status = JobStatus::Dispatched;
        job.backend_name = Some(worker_name.to_string());
        job.dispatched_at = Some(chrono::Utc::now());
        guard.dispatched.insert(job_id, job.clone());
        Ok(job)
    }

    pub async fn bind_worker_job_id(
        &self,
        job_id: JobId,
        worker_job_id: String,
    ) -> Result<(), GenlbError> {
        let mut guard = self.inner.lock().await;
        let job = guard
            .dispatched
            .get_mut(&job_id)
            .ok_or_else(|| GenlbError::NotFound(format!("dispatched job {job_id}")))?;
        job.worker_job_id = Some(worker_job_id.clone());
        guard.worker_job_index.insert(worker_job_id, job_id);
        Ok(())
    }

    /// Retry rule (spec §4.4): on dispatch failure the job goes back to
    /// pending with bindings cleared if `retries < max_retries`, else it
    /// becomes terminal FAILED. Either way the attempt is "handled" —
    /// callers never need to retry this call themselves.
    pub async fn mark_attempt_failed(
        &self,
        job_id: JobId,
        error_msg: String,
        max_retries: u32,
    ) -> Result<JobStatus, GenlbError> {
        let mut guard = self.inner.lock().await;
        let mut job = guard
            .dispatched
            .remove(&job_id)
            .ok_or_else(|| GenlbError::NotFound(format!("dispatched job {job_id}")))?;
        if let Some(wid) = job.worker_job_id.take() {
            guard.worker_job_index.remove(&wid);
        }
        job.retries += 1;
        job.error = Some(error_msg);
        job.backend_name = None;

        if job.retries < max_retries {
            job.status = JobStatus::Queued;
            warn!(job_id = %job_id, retries = job.retries, "dispatch attempt failed, retrying");
            guard.pending.insert(job_id, job.clone());
        } else {
            job.status = JobStatus::Failed;
            job.completed_at = Some(chrono::Utc::now());
            error!(job_id = %job_id, retries = job.retries, "dispatch failed permanently");
            insert_terminal(&mut guard.terminal, job.clone(), self.terminal_cap);
        }
        Ok(job.status)
    }

    /// Worker-start-event: DISPATCHED -> RUNNING. Idempotent no-op if the
    /// job already progressed past DISPATCHED.
    pub async fn mark_running(&self, worker_job_id: &str) -> Result<(), GenlbError> {
        let mut guard = self.inner.lock().await;
        let job_id = *guard
            .worker_job_index
            .get(worker_job_id)
            .ok_or_else(|| GenlbError::NotFound(format!("worker job {worker_job_id}")))?;
        if let Some(job) = guard.dispatched.get_mut(&job_id) {
            if job.status == JobStatus::Dispatched {
                job.status = JobStatus::Running;
            }
        }
        Ok(())
    }

    pub async fn mark_completed(
        &self,
        worker_job_id: &str,
        success: bool,
        error_msg: Option<String>,
    ) -> Result<(), GenlbError> {
        let mut guard = self.inner.lock().await;
        let job_id = *guard
            .worker_job_index
            .get(worker_job_id)
            .ok_or_else(|| GenlbError::NotFound(format!("worker job {worker_job_id}")))?;
        guard.worker_job_index.remove(worker_job_id);
        let mut job = guard
            .dispatched
            .remove(&job_id)
            .ok_or_else(|| GenlbError::NotFound(format!("dispatched job {job_id}")))?;
        job.status = if success {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        job.completed_at = Some(chrono::Utc::now());
        job.error = error_msg;
        info!(job_id = %job_id, status = ?job.status, "job reached terminal state");
        insert_terminal(&mut guard.terminal, job, self.terminal_cap);
        Ok(())
    }

    /// Cancellation of QUEUED removes it from the pending map directly.
    /// Cancellation of DISPATCHED/RUNNING transitions local state to
    /// CANCELLED immediately; the caller is responsible for issuing
    /// `UpstreamClient::cancel` using the returned binding (spec §4.4).
    pub async fn cancel(&self, job_id: JobId) -> CancelOutcome {
        let mut guard = self.inner.lock().await;

        if let Some(mut job) = guard.pending.shift_remove(&job_id) {
            job.status = JobStatus::Cancelled;
            job.completed_at = Some(chrono::Utc::now());
            insert_terminal(&mut guard.terminal, job, self.terminal_cap);
            return CancelOutcome::RemovedFromQueue;
        }

        if let Some(mut job) = guard.dispatched.remove(&job_id) {
            let upstream = match (&job.backend_name, job.worker_job_id.take()) {
                (Some(name), Some(wid)) => {
                    guard.worker_job_index.remove(&wid);
                    Some((name.clone(), wid))
                }
                _ => None,
            };
            job.status = JobStatus::Cancelled;
            job.completed_at = Some(chrono::Utc::now());
            insert_terminal(&mut guard.terminal, job, self.terminal_cap);
            return CancelOutcome::CancelUpstream(upstream);
        }

        if guard.terminal.contains_key(&job_id) {
            return CancelOutcome::AlreadyTerminal;
        }

        CancelOutcome::NotFound
    }

    /// Fails every DISPATCHED/RUNNING job bound to `worker_name`, without
    /// retrying: used when the worker itself is removed (spec §3 — "removed
    /// only by explicit unregister... destroyed with all dependents... jobs
    /// marked failed-unretryable if the worker was their only binding").
    /// Returns the ids of the jobs that were failed.
    pub async fn fail_all_for_worker(&self, worker_name: &str, reason: &str) -> Vec<JobId> {
        let mut guard = self.inner.lock().await;
        let ids: Vec<JobId> = guard
            .dispatched
            .iter()
            .filter(|(_, job)| job.backend_name.as_deref() == Some(worker_name))
            .map(|(id, _)| *id)
            .collect();

        for job_id in &ids {
            let mut job = match guard.dispatched.remove(job_id) {
                Some(job) => job,
                None => continue,
            };
            if let Some(wid) = job.worker_job_id.take() {
                guard.worker_job_index.remove(&wid);
            }
            job.status = JobStatus::Failed;
            job.error = Some(reason.to_string());
            job.completed_at = Some(chrono::Utc::now());
            error!(job_id = %job_id, worker = %worker_name, "job failed: backing worker removed");
            insert_terminal(&mut guard.terminal, job, self.terminal_cap);
        }
        ids
    }

    pub async fn get(&self, job_id: JobId) -> Option<Job> {
        let guard = self.inner.lock().await;
        guard
            .pending
            .get(&job_id)
            .or_else(|| guard.dispatched.get(&job_id))
            .or_else(|| guard.terminal.get(&job_id))
            .cloned()
    }

    pub async fn get_by_worker_job_id(&self, worker_job_id: &str) -> Option<Job> {
        let guard = self.inner.lock().await;
        let job_id = *guard.worker_job_index.get(worker_job_id)?;
        guard.dispatched.get(&job_id).cloned()
    }

    pub async fn status(&self) -> QueueStatus {
        let guard = self.inner.lock().await;
        QueueStatus {
            pending: guard.pending.len(),
            dispatched: guard.dispatched.len(),
            total: guard.pending.len() + guard.dispatched.len(),
        }
    }

    pub async fn snapshot_pending(&self) -> Vec<Job> {
        self.inner.lock().await.pending.values().cloned().collect()
    }

    pub async fn snapshot_dispatched(&self) -> Vec<Job> {
        self.inner
            .lock()
            .await
            .dispatched
            .values()
            .cloned()
            .collect()
    }

    pub async fn snapshot_terminal(&self) -> Vec<Job> {
        self.inner.lock().await.terminal.values().cloned().collect()
    }
}

fn insert_terminal(terminal: &mut IndexMap<JobId, Job>, job: Job, cap: usize) {
    terminal.insert(job.id, job);
    while terminal.len() > cap {
        terminal.shift_remove_index(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn fifo_pending_order() {
        let store = JobStore::new(10);
        let j1 = store.enqueue(json!({"a": 1}), None, None).await.unwrap();
        let j2 = store.enqueue(json!({"a": 2}), None, None).await.unwrap();
        let first = store.peek_oldest_pending().await.unwrap();
        assert_eq!(first.id, j1.id);
        store
            .move_pending_to_dispatched(j1.id, "w1")
            .await
            .unwrap();
        let next = store.peek_oldest_pending().await.unwrap();
        assert_eq!(next.id, j2.id);
    }

    #[tokio::test]
    async fn queue_full_rejects() {
        let store = JobStore::new(1);
        store.enqueue(json!({}), None, None).await.unwrap();
        let err = store.enqueue(json!({}), None, None).await.unwrap_err();
        assert!(matches!(err, GenlbError::QueueFull));
    }

    #[tokio::test]
    async fn retry_then_permanent_failure() {
        let store = JobStore::new(10);
        let job = store.enqueue(json!({}), None, None).await.unwrap();
        store
            .move_pending_to_dispatched(job.id, "w1")
            .await
            .unwrap();
        let status = store
            .mark_attempt_failed(job.id, "boom".into(), 2)
            .await
            .unwrap();
        assert_eq!(status, JobStatus::Queued);
        assert_eq!(store.peek_oldest_pending().await.unwrap().id, job.id);

        store
            .move_pending_to_dispatched(job.id, "w1")
            .await
            .unwrap();
        let status = store
            .mark_attempt_failed(job.id, "boom again".into(), 2)
            .await
            .unwrap();
        assert_eq!(status, JobStatus::Failed);
        let terminal = store.get(job.id).await.unwrap();
        assert_eq!(terminal.status, JobStatus::Failed);
        assert_eq!(terminal.retries, 2);
    }

    #[tokio::test]
    async fn cancel_dispatched_returns_upstream_binding() {
        let store = JobStore::new(10);
        let job = store.enqueue(json!({}), None, None).await.unwrap();
        store
            .move_pending_to_dispatched(job.id, "w1")
            .await
            .unwrap();
        store
            .bind_worker_job_id(job.id, "wid-1".to_string())
            .await
            .unwrap();

        let outcome = store.cancel(job.id).await;
        match outcome {
            CancelOutcome::CancelUpstream(Some((name, wid))) => {
                assert_eq!(name, "w1");
                assert_eq!(wid, "wid-1");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(store.get(job.id).await.unwrap().status, JobStatus::Cancelled);
        assert!(store.get_by_worker_job_id("wid-1").await.is_none());
    }

    #[tokio::test]
    async fn fail_all_for_worker_only_touches_that_workers_dispatched_jobs() {
        let store = JobStore::new(10);
        let on_w1 = store.enqueue(json!({}), None, None).await.unwrap();
        let on_w2 = store.enqueue(json!({}), None, None).await.unwrap();
        let still_pending = store.enqueue(json!({}), None, None).await.unwrap();

        store.move_pending_to_dispatched(on_w1.id, "w1").await.unwrap();
        store.bind_worker_job_id(on_w1.id, "wid-1".into()).await.unwrap();
        store.move_pending_to_dispatched(on_w2.id, "w2").await.unwrap();
        store.bind_worker_job_id(on_w2.id, "wid-2".into()).await.unwrap();

        let failed = store.fail_all_for_worker("w1", "worker removed").await;
        assert_eq!(failed, vec![on_w1.id]);

        let job = store.get(on_w1.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("worker removed"));
        assert!(store.get_by_worker_job_id("wid-1").await.is_none());

        assert_eq!(store.get(on_w2.id).await.unwrap().status, JobStatus::Dispatched);
        assert_eq!(store.get(still_pending.id).await.unwrap().status, JobStatus::Queued);
    }
}
