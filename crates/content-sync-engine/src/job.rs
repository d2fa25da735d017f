use std::time::Duration;

use chrono::{DateTime, Utc};
use content_sync_core::{SyncError, VersionId};
use serde::Serialize;
use tokio::sync::watch;
use uuid::Uuid;

/// Lifecycle of a sync job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting for a worker slot or for another job on the same version
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

/// Inspectable record of a sync job.
#[derive(Debug, Clone, Serialize)]
pub struct SyncJob {
    pub id: Uuid,
    /// Version asked for; `None` means "latest at run time".
    pub requested: Option<VersionId>,
    pub status: JobStatus,
    /// Version actually indexed, once known.
    pub resolved: Option<VersionId>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SyncJob {
    pub(crate) fn new(id: Uuid, requested: Option<VersionId>) -> Self {
        Self {
            id,
            requested,
            status: JobStatus::Pending,
            resolved: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum JobState {
    Pending,
    Running,
    Finished(Result<VersionId, SyncError>),
}

/// Handle on a submitted sync job.
///
/// Handles are cheap to clone. Dropping one does not affect the job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: Uuid,
    requested: Option<VersionId>,
    state: watch::Receiver<JobState>,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn requested(&self) -> Option<&VersionId> {
        self.requested.as_ref()
    }

    pub fn status(&self) -> JobStatus {
        match &*self.state.borrow() {
            JobState::Pending => JobStatus::Pending,
            JobState::Running => JobStatus::Running,
            JobState::Finished(Ok(_)) => JobStatus::Succeeded,
            JobState::Finished(Err(_)) => JobStatus::Failed,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status().is_finished()
    }

    /// Wait for the job to finish and return the version it indexed.
    pub async fn wait(mut self) -> Result<VersionId, SyncError> {
        let state = self
            .state
            .wait_for(|s| matches!(s, JobState::Finished(_)))
            .await
            .map_err(|_| SyncError::Execution(format!("sync job {} was dropped", self.id)))?;
        match &*state {
            JobState::Finished(result) => result.clone(),
            _ => Err(SyncError::Execution(format!(
                "sync job {} ended in an unexpected state",
                self.id
            ))),
        }
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`.
    ///
    /// The job itself keeps running; a later wait or sync can pick up its
    /// result.
    pub async fn wait_timeout(self, timeout: Duration) -> Result<VersionId, SyncError> {
        let version = self
            .requested
            .clone()
            .unwrap_or_else(|| VersionId::from("latest"));
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| SyncError::Timeout {
                version,
                waited: timeout,
            })?
    }

    /// Let the job run to completion without anyone waiting on it.
    pub fn detach(self) {}
}

/// Sending side of a job, owned by the worker that executes it.
pub(crate) struct JobTicket {
    pub id: Uuid,
    pub requested: Option<VersionId>,
    state: watch::Sender<JobState>,
    pub cancel: watch::Receiver<bool>,
}

impl JobTicket {
    /// Create a job; returns its ticket, a handle, and the cancel switch.
    pub fn new(requested: Option<VersionId>) -> (Self, JobHandle, watch::Sender<bool>) {
        let id = Uuid::new_v4();
        let (state_tx, state_rx) = watch::channel(JobState::Pending);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let ticket = Self {
            id,
            requested: requested.clone(),
            state: state_tx,
            cancel: cancel_rx,
        };
        let handle = JobHandle {
            id,
            requested,
            state: state_rx,
        };
        (ticket, handle, cancel_tx)
    }

    /// Another handle on this job.
    pub fn handle(&self) -> JobHandle {
        JobHandle {
            id: self.id,
            requested: self.requested.clone(),
            state: self.state.subscribe(),
        }
    }

    pub fn mark_running(&self) {
        self.state.send_replace(JobState::Running);
    }

    pub fn finish(&self, result: Result<VersionId, SyncError>) {
        self.state.send_replace(JobState::Finished(result));
    }
}
