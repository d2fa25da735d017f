use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::Utc;
use content_sync_core::{BackingStore, ContentProblemReport, IndexCache, SyncError, VersionId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::job::{JobHandle, JobStatus, JobTicket, SyncJob};
use crate::worker::{SyncListener, SyncWorker};

struct ControllerInner {
    config: SyncConfig,
    /// The version served to readers
    live: ArcSwap<VersionId>,
    /// Whether `live` has been confirmed cached since start or the last clear
    live_verified: Mutex<bool>,
    store: Arc<dyn BackingStore>,
    cache: Arc<dyn IndexCache>,
    worker: SyncWorker,
    /// Bounds how many sync jobs execute at once
    permits: Arc<Semaphore>,
    /// Job records, including recent finished ones
    jobs: DashMap<Uuid, SyncJob>,
    /// Unfinished job per concrete target version
    active: DashMap<VersionId, JobHandle>,
    /// Cancel switches of jobs that have not started
    cancellers: DashMap<Uuid, watch::Sender<bool>>,
}

impl ControllerInner {
    fn live_verified(&self) -> MutexGuard<'_, bool> {
        self.live_verified
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// If `version` is live, record whether it is in the cache right now.
    ///
    /// The flag stays locked while the cache is checked, so a concurrent
    /// clear is never overwritten by a stale `true`.
    fn refresh_live_verified(&self, version: &VersionId) {
        let mut verified = self.live_verified();
        if **self.live.load() != *version {
            return;
        }
        *verified = self.cache.is_cached(version);
        if !*verified {
            warn!(
                "Live version {} is no longer cached; it will be re-indexed on next read",
                version
            );
        }
    }

    /// Drop the oldest finished job records beyond the configured history.
    fn trim_history(&self) {
        let mut finished: Vec<_> = self
            .jobs
            .iter()
            .filter(|j| j.status.is_finished())
            .map(|j| (j.finished_at, j.id))
            .collect();
        if finished.len() <= self.config.job_history {
            return;
        }
        finished.sort();
        let excess = finished.len() - self.config.job_history;
        for (_, id) in finished.into_iter().take(excess) {
            self.jobs.remove(&id);
        }
    }
}

impl SyncListener for ControllerInner {
    fn on_target_resolved(
        &self,
        job: Uuid,
        version: &VersionId,
        handle: &JobHandle,
    ) -> Option<JobHandle> {
        if let Some(mut record) = self.jobs.get_mut(&job) {
            record.resolved = Some(version.clone());
        }

        match self.active.entry(version.clone()) {
            Entry::Occupied(entry) if entry.get().id() != job && !entry.get().is_finished() => {
                Some(entry.get().clone())
            }
            Entry::Occupied(mut entry) => {
                entry.insert(handle.clone());
                None
            }
            Entry::Vacant(entry) => {
                entry.insert(handle.clone());
                None
            }
        }
    }

    fn on_job_started(&self, job: Uuid) {
        self.cancellers.remove(&job);
        if let Some(mut record) = self.jobs.get_mut(&job) {
            record.status = JobStatus::Running;
            record.started_at = Some(Utc::now());
        }
    }

    fn on_sync_complete(
        &self,
        job: Uuid,
        attempted: Option<&VersionId>,
        result: &Result<VersionId, SyncError>,
    ) {
        self.cancellers.remove(&job);

        let requested = self.jobs.get_mut(&job).and_then(|mut record| {
            record.finished_at = Some(Utc::now());
            record.resolved = attempted.cloned();
            match result {
                Ok(_) => record.status = JobStatus::Succeeded,
                Err(e) => {
                    record.status = JobStatus::Failed;
                    record.error = Some(e.to_string());
                }
            }
            record.requested.clone()
        });

        for version in requested.iter().chain(attempted) {
            self.active.remove_if(version, |_, handle| handle.id() == job);
        }

        if let Ok(version) = result {
            self.refresh_live_verified(version);
        }

        self.trim_history();
    }
}

/// Owns the live version pointer and orchestrates sync jobs.
///
/// Cloning is cheap; all clones share the same state. Reading the live
/// version is a single atomic load. Every change to it goes through
/// [`change_live_version`](Self::change_live_version), which only ever
/// promotes a version that is in the index cache.
#[derive(Clone)]
pub struct VersionController {
    inner: Arc<ControllerInner>,
}

impl VersionController {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn BackingStore>,
        cache: Arc<dyn IndexCache>,
    ) -> Self {
        info!(
            "Version controller starting with live version {} ({} environment, {} concurrent jobs)",
            config.initial_live_version, config.environment, config.max_concurrent_jobs
        );
        Self {
            inner: Arc::new(ControllerInner {
                live: ArcSwap::from_pointee(config.initial_live_version.clone()),
                live_verified: Mutex::new(false),
                worker: SyncWorker::new(store.clone(), cache.clone()),
                permits: Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1))),
                jobs: DashMap::new(),
                active: DashMap::new(),
                cancellers: DashMap::new(),
                store,
                cache,
                config,
            }),
        }
    }

    pub fn cache(&self) -> Arc<dyn IndexCache> {
        Arc::clone(&self.inner.cache)
    }

    /// The version currently served to readers.
    pub fn live_version(&self) -> VersionId {
        VersionId::clone(&self.inner.live.load())
    }

    /// Whether the live version has been confirmed cached since start or
    /// since the last cache clear.
    pub fn is_live_verified(&self) -> bool {
        *self.inner.live_verified()
    }

    pub fn is_version_in_use(&self, version: &VersionId) -> bool {
        **self.inner.live.load() == *version
    }

    /// Submit a sync job and return immediately.
    ///
    /// `None` syncs whatever is latest when the job actually runs; once
    /// resolved it follows any unfinished job for that version. A trigger
    /// for a version that already has an unfinished job returns that job.
    pub fn trigger_sync_job(&self, version: Option<VersionId>) -> JobHandle {
        let Some(version) = version else {
            return self.submit(None);
        };

        match self.inner.active.entry(version.clone()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_finished() {
                    debug!("Joining sync job {} for {}", entry.get().id(), version);
                    return entry.get().clone();
                }
                let handle = self.submit(Some(version));
                entry.insert(handle.clone());
                handle
            }
            Entry::Vacant(entry) => {
                let handle = self.submit(Some(version));
                entry.insert(handle.clone());
                handle
            }
        }
    }

    fn submit(&self, requested: Option<VersionId>) -> JobHandle {
        let (ticket, handle, cancel) = JobTicket::new(requested.clone());
        info!(
            "Queued sync job {} for {}",
            ticket.id,
            requested.as_ref().map_or("latest", VersionId::as_str)
        );

        self.inner
            .jobs
            .insert(ticket.id, SyncJob::new(ticket.id, requested));
        self.inner.cancellers.insert(ticket.id, cancel);

        let listener: Arc<dyn SyncListener> = self.inner.clone();
        self.inner
            .worker
            .spawn(ticket, Arc::clone(&self.inner.permits), listener);
        handle
    }

    /// Make `version` cached, waiting on a (possibly shared) sync job.
    async fn ensure_version_cached(
        &self,
        version: &VersionId,
        timeout: Option<Duration>,
    ) -> Result<(), SyncError> {
        if !self.inner.store.is_valid_version(version).await? {
            warn!("Rejecting unknown version {}", version);
            return Err(SyncError::InvalidVersion(version.clone()));
        }

        if !self.inner.cache.is_cached(version) {
            let handle = self.trigger_sync_job(Some(version.clone()));
            match timeout.or(self.inner.config.promotion_timeout) {
                Some(timeout) => handle.wait_timeout(timeout).await?,
                None => handle.wait().await?,
            };
        }

        if !self.inner.cache.is_cached(version) {
            return Err(SyncError::indexing(
                version,
                "dropped from the cache before it could be used",
            ));
        }
        Ok(())
    }

    /// Promote `version` to live.
    ///
    /// Indexes the version first if it is not cached, waiting at most
    /// `timeout` (or the configured default). On timeout the sync job keeps
    /// running, so retrying later can succeed immediately. On any error the
    /// live version is left untouched.
    #[instrument(skip(self), level = "debug")]
    pub async fn change_live_version(
        &self,
        version: &VersionId,
        timeout: Option<Duration>,
    ) -> Result<VersionId, SyncError> {
        self.ensure_version_cached(version, timeout).await?;

        let previous = self.inner.live.swap(Arc::new(version.clone()));
        self.inner.refresh_live_verified(version);
        info!("Live version changed from {} to {}", previous, version);
        Ok(version.clone())
    }

    /// Index the current live version through the normal sync path.
    ///
    /// Used at startup, when the configured live version is not yet known to
    /// be cached.
    pub async fn warm_live_version(&self, timeout: Option<Duration>) -> Result<VersionId, SyncError> {
        let live = self.live_version();
        self.ensure_version_cached(&live, timeout).await?;
        self.inner.refresh_live_verified(&live);
        if self.is_version_in_use(&live) && self.is_live_verified() {
            info!("Live version {} is cached and verified", live);
        }
        Ok(live)
    }

    /// Drop every cached version. The live version is kept; reads of it
    /// rebuild its index on demand.
    pub fn clear_caches(&self) {
        {
            let mut verified = self.inner.live_verified();
            self.inner.cache.clear_cache();
            *verified = false;
        }
        info!(
            "Caches cleared; live version {} will be re-indexed on next read",
            self.live_version()
        );
    }

    /// Drop one version from the cache. Returns `true` if it was cached.
    pub fn clear_version_cache(&self, version: &VersionId) -> bool {
        let mut verified = self.inner.live_verified();
        let removed = self.inner.cache.clear_version(version);
        if removed && self.is_version_in_use(version) {
            *verified = false;
        }
        removed
    }

    pub fn problem_map(&self, version: &VersionId) -> ContentProblemReport {
        self.inner.cache.problem_map(version)
    }

    pub fn cached_versions(&self) -> BTreeSet<VersionId> {
        self.inner.cache.cached_versions()
    }

    /// Content-push notification: sync whatever is latest.
    ///
    /// Unauthorised callers are rejected in environments that require
    /// authentication for this.
    pub fn notify_new_version(&self, authorised: bool) -> Result<JobHandle, SyncError> {
        if !authorised && !self.inner.config.environment.allows_unauthenticated_sync() {
            warn!(
                "Rejected unauthorised sync request in {} environment",
                self.inner.config.environment
            );
            return Err(SyncError::Forbidden(format!(
                "unauthenticated synchronisation is disabled in {}",
                self.inner.config.environment
            )));
        }
        Ok(self.trigger_sync_job(None))
    }

    pub fn job(&self, id: Uuid) -> Option<SyncJob> {
        self.inner.jobs.get(&id).map(|j| j.value().clone())
    }

    /// All known jobs, oldest first.
    pub fn jobs(&self) -> Vec<SyncJob> {
        let mut jobs: Vec<_> = self.inner.jobs.iter().map(|j| j.value().clone()).collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Jobs that are queued or running, oldest first.
    pub fn index_queue(&self) -> Vec<SyncJob> {
        let mut queue = self.jobs();
        queue.retain(|j| !j.status.is_finished());
        queue
    }

    /// Cancel every job that has not started yet. Returns how many were
    /// cancelled; they finish as failed with [`SyncError::Cancelled`].
    pub fn clean_up_index_queue(&self) -> usize {
        let pending: Vec<Uuid> = self
            .inner
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending)
            .map(|j| j.id)
            .collect();

        let mut cancelled = 0;
        for id in pending {
            if let Some((_, cancel)) = self.inner.cancellers.remove(&id) {
                cancel.send_replace(true);
                cancelled += 1;
            }
        }
        info!("Removed {} queued sync jobs", cancelled);
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryIndexCache;
    use crate::config::Environment;
    use crate::indexer::IndexerOptions;
    use content_sync_core::MemoryStore;

    const PAGE: &str = r#"{"id": "page", "published": true, "value": "hello"}"#;

    fn setup(config: SyncConfig, versions: &[&str]) -> (Arc<MemoryStore>, VersionController) {
        let mut store = MemoryStore::new();
        for v in versions {
            store = store.with_version(v, [("page.json", PAGE)]);
        }
        let store = Arc::new(store);
        let cache = Arc::new(MemoryIndexCache::new(store.clone(), IndexerOptions::default()));
        let controller = VersionController::new(config, store.clone(), cache);
        (store, controller)
    }

    fn v(id: &str) -> VersionId {
        VersionId::from(id)
    }

    #[tokio::test]
    async fn test_trigger_then_promote() {
        let (_store, controller) = setup(SyncConfig::new("v0"), &["v0", "abc123"]);

        controller.trigger_sync_job(Some(v("abc123"))).detach();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !controller.cached_versions().contains(&v("abc123")) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let live = controller.change_live_version(&v("abc123"), None).await.unwrap();
        assert_eq!(live, v("abc123"));
        assert_eq!(controller.live_version(), v("abc123"));
        assert!(controller.is_live_verified());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_promotions_pick_one() {
        let (_store, controller) = setup(SyncConfig::new("v0"), &["v0", "v1", "v2"]);
        controller.change_live_version(&v("v1"), None).await.unwrap();
        controller.change_live_version(&v("v2"), None).await.unwrap();

        let (v1, v2) = (v("v1"), v("v2"));
        let (a, b) = tokio::join!(
            controller.change_live_version(&v1, None),
            controller.change_live_version(&v2, None)
        );
        assert!(a.is_ok() && b.is_ok());
        let live = controller.live_version();
        assert!(live == v("v1") || live == v("v2"));
    }

    #[tokio::test]
    async fn test_invalid_version_is_rejected() {
        let (store, controller) = setup(SyncConfig::new("v0"), &["v0"]);

        let err = controller
            .change_live_version(&v("bad-version"), None)
            .await
            .unwrap_err();
        assert_eq!(err, SyncError::InvalidVersion(v("bad-version")));
        assert_eq!(controller.live_version(), v("v0"));
        assert_eq!(store.listing_count(), 0);
        assert!(controller.jobs().is_empty());
    }

    #[tokio::test]
    async fn test_failed_indexing_leaves_live_untouched() {
        let (store, controller) = setup(SyncConfig::new("v0"), &["v0", "v1"]);
        store.fail_version("v1").await;

        let err = controller.change_live_version(&v("v1"), None).await.unwrap_err();
        assert!(matches!(err, SyncError::IndexingFailure { .. }));
        assert!(err.is_retryable());
        assert_eq!(controller.live_version(), v("v0"));
        assert!(!controller.cached_versions().contains(&v("v1")));

        let job = &controller.jobs()[0];
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.is_some());
    }

    #[tokio::test]
    async fn test_timeout_does_not_cancel_indexing() {
        let (store, controller) = setup(SyncConfig::new("v0"), &["v0", "v1"]);
        store.set_read_delay(Duration::from_millis(150));

        let err = controller
            .change_live_version(&v("v1"), Some(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Timeout { .. }));
        assert_eq!(controller.live_version(), v("v0"));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(controller.cached_versions().contains(&v("v1")));

        let live = controller
            .change_live_version(&v("v1"), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert_eq!(live, v("v1"));
        assert_eq!(store.listing_count(), 1);
    }

    #[tokio::test]
    async fn test_triggers_for_same_version_join() {
        let (store, controller) = setup(SyncConfig::new("v0"), &["v0", "v1"]);
        store.set_read_delay(Duration::from_millis(50));

        let first = controller.trigger_sync_job(Some(v("v1")));
        let second = controller.trigger_sync_job(Some(v("v1")));
        assert_eq!(first.id(), second.id());

        assert_eq!(second.wait().await.unwrap(), v("v1"));
        assert_eq!(controller.jobs().len(), 1);
        assert_eq!(store.listing_count(), 1);

        // A finished job is not joined; the new one returns at once.
        let third = controller.trigger_sync_job(Some(v("v1")));
        assert_ne!(third.id(), first.id());
        third.wait().await.unwrap();
        assert_eq!(store.listing_count(), 1);
    }

    #[tokio::test]
    async fn test_clear_keeps_live_and_rebuilds_lazily() {
        let (store, controller) = setup(SyncConfig::new("v1"), &["v1"]);
        controller.warm_live_version(None).await.unwrap();
        assert!(controller.is_live_verified());

        controller.clear_caches();
        assert!(controller.cached_versions().is_empty());
        assert_eq!(controller.live_version(), v("v1"));
        assert!(!controller.is_live_verified());

        let item = controller
            .cache()
            .get_by_id(&controller.live_version(), "page")
            .await
            .unwrap();
        assert!(item.is_some());
        assert!(controller.cached_versions().contains(&v("v1")));
        assert_eq!(store.listing_count(), 2);
    }

    #[tokio::test]
    async fn test_previous_live_version_stays_cached() {
        let (_store, controller) = setup(SyncConfig::new("v1"), &["v1", "v2"]);
        controller.warm_live_version(None).await.unwrap();
        controller.change_live_version(&v("v2"), None).await.unwrap();

        assert!(controller.is_version_in_use(&v("v2")));
        assert!(!controller.is_version_in_use(&v("v1")));
        assert!(controller.cached_versions().contains(&v("v1")));

        assert!(controller.clear_version_cache(&v("v1")));
        assert!(controller.is_live_verified());
        assert!(controller.clear_version_cache(&v("v2")));
        assert!(!controller.is_live_verified());
    }

    #[tokio::test]
    async fn test_notify_requires_auth_in_prod() {
        let config = SyncConfig::new("v0").with_environment(Environment::Prod);
        let (store, controller) = setup(config, &["v0"]);

        assert!(matches!(
            controller.notify_new_version(false),
            Err(SyncError::Forbidden(_))
        ));

        store.add_version("v1", [("page.json", PAGE)]).await;
        let handle = controller.notify_new_version(true).unwrap();
        assert!(handle.requested().is_none());
        assert_eq!(handle.wait().await.unwrap(), v("v1"));

        let (_store, dev) = setup(SyncConfig::new("v0"), &["v0"]);
        assert!(dev.notify_new_version(false).is_ok());
    }

    #[tokio::test]
    async fn test_clean_up_index_queue() {
        let config = SyncConfig::new("v0").with_max_concurrent_jobs(1);
        let (store, controller) = setup(config, &["v0", "v1", "v2"]);
        store.set_read_delay(Duration::from_millis(100));

        let running = controller.trigger_sync_job(Some(v("v1")));
        let queued = controller.trigger_sync_job(Some(v("v2")));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(controller.index_queue().len(), 2);
        assert_eq!(controller.clean_up_index_queue(), 1);

        assert!(matches!(queued.clone().wait().await, Err(SyncError::Cancelled(_))));
        assert_eq!(running.wait().await.unwrap(), v("v1"));
        assert_eq!(controller.job(queued.id()).unwrap().status, JobStatus::Failed);
        assert!(controller.index_queue().is_empty());
        assert!(!controller.cached_versions().contains(&v("v2")));
    }

    #[tokio::test]
    async fn test_job_history_is_bounded() {
        let config = SyncConfig::new("v0").with_job_history(1);
        let (_store, controller) = setup(config, &["v0", "v1"]);

        let first = controller.trigger_sync_job(Some(v("v0")));
        let first_id = first.id();
        first.wait().await.unwrap();
        controller.trigger_sync_job(Some(v("v1"))).wait().await.unwrap();

        let jobs = controller.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].resolved, Some(v("v1")));
        assert!(controller.job(first_id).is_none());
    }

    #[tokio::test]
    async fn test_problem_map_follows_indexing() {
        let store = Arc::new(MemoryStore::new().with_version(
            "v1",
            [("broken.json", r#"{"id": "broken", "value": "x", "children": [{"value": "y"}]}"#)],
        ));
        let cache = Arc::new(MemoryIndexCache::new(store.clone(), IndexerOptions::default()));
        let controller = VersionController::new(SyncConfig::new("v1"), store, cache);

        assert!(controller.problem_map(&v("v1")).is_empty());
        controller.warm_live_version(None).await.unwrap();
        assert_eq!(controller.problem_map(&v("v1")).len(), 1);
    }

    #[tokio::test]
    async fn test_latest_trigger_follows_running_job() {
        let (store, controller) = setup(SyncConfig::new("v0"), &["v0", "v1"]);
        store.set_read_delay(Duration::from_millis(300));

        let concrete = controller.trigger_sync_job(Some(v("v1")));
        let latest = controller.trigger_sync_job(None);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let running: Vec<_> = controller
            .jobs()
            .into_iter()
            .filter(|j| j.status == JobStatus::Running)
            .collect();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, concrete.id());
        assert_eq!(controller.job(latest.id()).unwrap().resolved, Some(v("v1")));

        assert_eq!(latest.clone().wait().await.unwrap(), v("v1"));
        assert_eq!(concrete.wait().await.unwrap(), v("v1"));
        assert_eq!(controller.job(latest.id()).unwrap().status, JobStatus::Succeeded);
        assert_eq!(store.listing_count(), 1);
    }

    #[tokio::test]
    async fn test_concrete_trigger_joins_resolved_latest_job() {
        let (store, controller) = setup(SyncConfig::new("v0"), &["v0", "v1"]);
        store.set_read_delay(Duration::from_millis(300));

        let latest = controller.trigger_sync_job(None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(latest.status(), JobStatus::Running);

        let concrete = controller.trigger_sync_job(Some(v("v1")));
        assert_eq!(concrete.id(), latest.id());
        assert_eq!(concrete.wait().await.unwrap(), v("v1"));
        assert_eq!(controller.jobs().len(), 1);
        assert_eq!(store.listing_count(), 1);

        // Finished, so the registry no longer hands it out.
        let next = controller.trigger_sync_job(Some(v("v1")));
        assert_ne!(next.id(), latest.id());
        next.wait().await.unwrap();
    }

    /// Store that panics on demand.
    struct PanickingStore {
        inner: MemoryStore,
        on_latest: bool,
        on_listing: bool,
    }

    #[async_trait::async_trait]
    impl BackingStore for PanickingStore {
        fn backend_name(&self) -> &'static str {
            "panicking"
        }

        async fn is_valid_version(&self, version: &VersionId) -> Result<bool, SyncError> {
            self.inner.is_valid_version(version).await
        }

        async fn latest_version(&self) -> Result<VersionId, SyncError> {
            if self.on_latest {
                panic!("latest boom");
            }
            self.inner.latest_version().await
        }

        async fn list_versions(&self) -> Result<Vec<content_sync_core::VersionInfo>, SyncError> {
            self.inner.list_versions().await
        }

        async fn list_content_files(&self, version: &VersionId) -> Result<Vec<String>, SyncError> {
            if self.on_listing {
                panic!("list boom");
            }
            self.inner.list_content_files(version).await
        }

        async fn read_file(&self, version: &VersionId, path: &str) -> Result<Vec<u8>, SyncError> {
            self.inner.read_file(version, path).await
        }

        async fn file_exists(&self, version: &VersionId, path: &str) -> Result<bool, SyncError> {
            self.inner.file_exists(version, path).await
        }
    }

    fn panicking(on_latest: bool, on_listing: bool) -> (MemoryIndexCache, VersionController) {
        let inner = MemoryStore::new()
            .with_version("v0", [("page.json", PAGE)])
            .with_version("v1", [("page.json", PAGE)]);
        let store = Arc::new(PanickingStore {
            inner,
            on_latest,
            on_listing,
        });
        let cache = MemoryIndexCache::new(store.clone(), IndexerOptions::default());
        let controller =
            VersionController::new(SyncConfig::new("v0"), store, Arc::new(cache.clone()));
        (cache, controller)
    }

    #[tokio::test]
    async fn test_panic_resolving_latest_fails_the_job() {
        let (cache, controller) = panicking(true, false);

        let handle = controller.trigger_sync_job(None);
        let id = handle.id();
        match handle.wait().await {
            Err(SyncError::Execution(msg)) => assert!(msg.contains("panicked")),
            other => panic!("expected an execution error, got {:?}", other),
        }

        assert_eq!(controller.job(id).unwrap().status, JobStatus::Failed);
        assert_eq!(controller.live_version(), v("v0"));
        assert!(cache.in_flight_versions().is_empty());
        assert!(controller.index_queue().is_empty());
    }

    #[tokio::test]
    async fn test_panic_while_indexing_fails_the_promotion() {
        let (cache, controller) = panicking(false, true);

        match controller.change_live_version(&v("v1"), None).await {
            Err(SyncError::Execution(msg)) => assert!(msg.contains("indexing task failed")),
            other => panic!("expected an execution error, got {:?}", other),
        }

        assert_eq!(controller.live_version(), v("v0"));
        assert!(!cache.is_cached(&v("v1")));
        assert!(cache.in_flight_versions().is_empty());
        assert_eq!(controller.jobs()[0].status, JobStatus::Failed);
    }

    /// Cache that drops everything right after a set number of
    /// `is_cached` checks, to land a clear inside a promotion.
    struct ClearingCache {
        inner: MemoryIndexCache,
        checks_until_clear: std::sync::atomic::AtomicUsize,
    }

    impl ClearingCache {
        fn clear_after_checks(&self, checks: usize) {
            self.checks_until_clear
                .store(checks, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl IndexCache for ClearingCache {
        async fn ensure_cache(&self, version: &VersionId) -> Result<(), SyncError> {
            self.inner.ensure_cache(version).await
        }

        fn is_cached(&self, version: &VersionId) -> bool {
            use std::sync::atomic::Ordering::SeqCst;
            let cached = self.inner.is_cached(version);
            let countdown = self
                .checks_until_clear
                .fetch_update(SeqCst, SeqCst, |n| n.checked_sub(1));
            if countdown == Ok(1) {
                self.inner.clear_cache();
            }
            cached
        }

        fn cached_versions(&self) -> BTreeSet<VersionId> {
            self.inner.cached_versions()
        }

        fn problem_map(&self, version: &VersionId) -> ContentProblemReport {
            self.inner.problem_map(version)
        }

        fn clear_cache(&self) {
            self.inner.clear_cache()
        }

        fn clear_version(&self, version: &VersionId) -> bool {
            self.inner.clear_version(version)
        }

        async fn get_by_id(
            &self,
            version: &VersionId,
            id: &str,
        ) -> Result<Option<content_sync_core::ContentItem>, SyncError> {
            self.inner.get_by_id(version, id).await
        }

        async fn get_by_id_prefix(
            &self,
            version: &VersionId,
            prefix: &str,
        ) -> Result<Vec<content_sync_core::ContentItem>, SyncError> {
            self.inner.get_by_id_prefix(version, prefix).await
        }

        async fn find_by_tags(
            &self,
            version: &VersionId,
            tags: &[&str],
        ) -> Result<Vec<content_sync_core::ContentItem>, SyncError> {
            self.inner.find_by_tags(version, tags).await
        }

        async fn tags(&self, version: &VersionId) -> Result<BTreeSet<String>, SyncError> {
            self.inner.tags(version).await
        }

        async fn units(
            &self,
            version: &VersionId,
        ) -> Result<std::collections::BTreeMap<String, String>, SyncError> {
            self.inner.units(version).await
        }
    }

    #[tokio::test]
    async fn test_clear_during_promotion_leaves_live_unverified() {
        let store = Arc::new(
            MemoryStore::new()
                .with_version("v0", [("page.json", PAGE)])
                .with_version("v1", [("page.json", PAGE)]),
        );
        let cache = Arc::new(ClearingCache {
            inner: MemoryIndexCache::new(store.clone(), IndexerOptions::default()),
            checks_until_clear: std::sync::atomic::AtomicUsize::new(0),
        });
        let controller = VersionController::new(SyncConfig::new("v0"), store, cache.clone());
        controller.warm_live_version(None).await.unwrap();
        controller.trigger_sync_job(Some(v("v1"))).wait().await.unwrap();
        assert!(controller.is_live_verified());

        // Both pre-swap checks see v1 cached; the clear lands before the swap.
        cache.clear_after_checks(2);
        controller.change_live_version(&v("v1"), None).await.unwrap();

        assert_eq!(controller.live_version(), v("v1"));
        assert!(controller.cached_versions().is_empty());
        assert!(!controller.is_live_verified());
    }
}
