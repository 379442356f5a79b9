use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Dispatched,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// A job from enqueue through terminal state (spec §3). `spec` and
/// `extra_data` are opaque structured trees: the balancer never interprets
/// their contents beyond forwarding them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub spec: Value,
    pub client_id: Option<String>,
    pub number: u64,

    pub status: JobStatus,
    pub backend_name: Option<String>,
    pub worker_job_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub error: Option<String>,
    pub retries: u32,
    pub extra_data: Option<Value>,
}

impl Job {
    pub fn new(id: JobId, number: u64, spec: Value, client_id: Option<String>, extra_data: Option<Value>) -> Self {
        Job {
            id,
            spec,
            client_id,
            number,
            status: JobStatus::Queued,
            backend_name: None,
            worker_job_id: None,
            created_at: Utc::now(),
            dispatched_at: None,
            completed_at: None,
            error: None,
            retries: 0,
            extra_data,
        }
    }
}

/// Outcome of attempting to cancel a job (spec §4.4).
#[derive(Debug, Clone)]
pub enum CancelOutcome {
    /// Was pending; removed from the queue with no upstream call needed.
    RemovedFromQueue,
    /// Was dispatched/running; local state is now CANCELLED regardless of
    /// the inner value. `Some((worker_name, worker_job_id))` means the
    /// caller must still issue `UpstreamClient::cancel` against that
    /// binding; `None` means the job hadn't been bound to a worker-job-id
    /// yet (raced with dispatch), so there is nothing upstream to cancel.
    CancelUpstream(Option<(String, String)>),
    /// Already in a terminal state; cancellation is a no-op.
    AlreadyTerminal,
    NotFound,
}
