use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use content_sync_core::{BackingStore, IndexCache, SyncError, VersionId};
use futures::FutureExt;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::job::{JobHandle, JobTicket};

/// Callbacks fired by sync workers as jobs progress.
pub trait SyncListener: Send + Sync {
    /// A job found out which version it targets, before doing any indexing.
    ///
    /// Returning a handle makes the job wait on that job instead of running
    /// itself; `handle` is the job's own handle.
    fn on_target_resolved(
        &self,
        _job: Uuid,
        _version: &VersionId,
        _handle: &JobHandle,
    ) -> Option<JobHandle> {
        None
    }

    fn on_job_started(&self, _job: Uuid) {}

    /// `attempted` is the version the job tried to index, when known.
    fn on_sync_complete(
        &self,
        job: Uuid,
        attempted: Option<&VersionId>,
        result: &Result<VersionId, SyncError>,
    );
}

/// Makes one version available in the index cache.
#[derive(Clone)]
pub struct SyncWorker {
    store: Arc<dyn BackingStore>,
    cache: Arc<dyn IndexCache>,
}

impl SyncWorker {
    pub fn new(store: Arc<dyn BackingStore>, cache: Arc<dyn IndexCache>) -> Self {
        Self { store, cache }
    }

    /// Resolve the target, check it exists, then ensure it is cached.
    ///
    /// With no target the latest version is resolved at the moment this
    /// runs, not when the job was submitted.
    #[instrument(skip(self), level = "debug")]
    pub async fn run(&self, requested: Option<&VersionId>) -> Result<VersionId, SyncError> {
        let version = match requested {
            Some(version) => version.clone(),
            None => self.resolve_latest().await?,
        };
        self.sync(&version).await?;
        Ok(version)
    }

    async fn resolve_latest(&self) -> Result<VersionId, SyncError> {
        let latest = self.store.latest_version().await?;
        debug!("Resolved latest version {}", latest);
        Ok(latest)
    }

    async fn sync(&self, version: &VersionId) -> Result<(), SyncError> {
        if !self.store.is_valid_version(version).await? {
            warn!("Refusing to sync unknown version {}", version);
            return Err(SyncError::InvalidVersion(version.clone()));
        }
        self.cache.ensure_cache(version).await
    }

    /// Execute `ticket` on its own task once a slot in `permits` frees up.
    ///
    /// The job stays pending until its target is known. If another job is
    /// already handling that version, this one follows it and never runs.
    pub(crate) fn spawn(
        &self,
        ticket: JobTicket,
        permits: Arc<Semaphore>,
        listener: Arc<dyn SyncListener>,
    ) {
        let worker = self.clone();
        tokio::spawn(async move {
            let id = ticket.id;
            let requested = ticket.requested.clone();
            let mut cancel = ticket.cancel.clone();

            let permit = tokio::select! {
                permit = permits.acquire_owned() => permit.ok(),
                true = cancelled(&mut cancel) => None,
            };
            let Some(permit) = permit else {
                info!("Sync job {} cancelled before it started", id);
                let result = Err(removed_from_queue(id));
                listener.on_sync_complete(id, requested.as_ref(), &result);
                ticket.finish(result);
                return;
            };

            let target = match requested.clone() {
                Some(version) => Ok(version),
                None => guarded(id, worker.resolve_latest()).await,
            };

            let result = match target {
                Err(e) => Err(e),
                Ok(version) => match listener.on_target_resolved(id, &version, &ticket.handle()) {
                    Some(leader) => {
                        drop(permit);
                        info!("Sync job {} follows job {} for {}", id, leader.id(), version);
                        tokio::select! {
                            result = leader.wait() => result,
                            true = cancelled(&mut cancel) => Err(removed_from_queue(id)),
                        }
                    }
                    None => {
                        ticket.mark_running();
                        listener.on_job_started(id);
                        info!("Sync job {} started (target: {})", id, version);
                        let result = guarded(id, worker.sync(&version)).await;
                        drop(permit);
                        result.map(|()| version)
                    }
                },
            };

            let attempted = match &result {
                Ok(version) => Some(version.clone()),
                Err(e) => e.version().cloned().or_else(|| requested.clone()),
            };
            match &result {
                Ok(version) => info!("Sync job {} completed: {} is cached", id, version),
                Err(e) => error!("Sync job {} failed: {}", id, e),
            }

            listener.on_sync_complete(id, attempted.as_ref(), &result);
            ticket.finish(result);
        });
    }
}

/// Run `work`, turning a panic into an execution error for job `id`.
async fn guarded<T>(
    id: Uuid,
    work: impl Future<Output = Result<T, SyncError>>,
) -> Result<T, SyncError> {
    AssertUnwindSafe(work)
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(SyncError::Execution(format!("sync job {} panicked", id))))
}

fn removed_from_queue(id: Uuid) -> SyncError {
    SyncError::Cancelled(format!("job {} removed from queue", id))
}

/// Resolves once the job is cancelled; `false` if the switch was dropped.
async fn cancelled(cancel: &mut watch::Receiver<bool>) -> bool {
    cancel.wait_for(|cancelled| *cancelled).await.is_ok()
}
