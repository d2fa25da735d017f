use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use content_sync_core::{
    BackingStore, ContentItem, ContentProblemReport, IndexCache, SyncError, VersionId,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tracing::{debug, error, info, instrument};

use crate::indexer::{ContentIndexer, IndexerOptions, VersionIndex};

type SharedRun = Shared<BoxFuture<'static, Result<(), SyncError>>>;

/// An indexing run other callers can join.
struct InFlight {
    run_id: u64,
    run: SharedRun,
}

struct CacheState {
    indexer: ContentIndexer,
    /// Fully indexed versions
    versions: DashMap<VersionId, Arc<VersionIndex>>,
    /// Latest problem report per version
    problems: DashMap<VersionId, ContentProblemReport>,
    /// Indexing runs currently executing, one per version at most
    in_flight: DashMap<VersionId, InFlight>,
    next_run_id: AtomicU64,
}

/// Removes the registry entry of a run when it ends, including on panic.
struct InFlightGuard<'a> {
    state: &'a CacheState,
    version: &'a VersionId,
    run_id: u64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.state
            .in_flight
            .remove_if(self.version, |_, entry| entry.run_id == self.run_id);
    }
}

impl CacheState {
    async fn index_version(&self, version: VersionId, run_id: u64) -> Result<(), SyncError> {
        let _guard = InFlightGuard {
            state: self,
            version: &version,
            run_id,
        };

        let started = Instant::now();
        match self.indexer.build(&version).await {
            Ok(outcome) => {
                let index = Arc::new(outcome.index);
                let items = index.len();
                let problems = outcome.problems.len();
                self.problems.insert(index.version().clone(), outcome.problems);
                self.versions.insert(index.version().clone(), Arc::clone(&index));
                info!(
                    "Indexed version {} ({} items, {} with problems) in {:?}",
                    index.version(),
                    items,
                    problems,
                    started.elapsed()
                );
                Ok(())
            }
            Err(e) => {
                error!("Indexing version {} failed: {}", version, e);
                Err(e)
            }
        }
    }
}

/// In-memory [`IndexCache`] holding one [`VersionIndex`] per cached version.
///
/// Each indexing run executes on its own task, so it completes even when
/// every caller waiting on it gives up. Concurrent callers for the same
/// version join the run already in flight.
#[derive(Clone)]
pub struct MemoryIndexCache {
    state: Arc<CacheState>,
}

impl MemoryIndexCache {
    pub fn new(store: Arc<dyn BackingStore>, options: IndexerOptions) -> Self {
        Self {
            state: Arc::new(CacheState {
                indexer: ContentIndexer::new(store, options),
                versions: DashMap::new(),
                problems: DashMap::new(),
                in_flight: DashMap::new(),
                next_run_id: AtomicU64::new(0),
            }),
        }
    }

    /// Versions with an indexing run currently executing.
    pub fn in_flight_versions(&self) -> BTreeSet<VersionId> {
        self.state
            .in_flight
            .iter()
            .map(|e| e.key().clone())
            .collect()
    }

    /// Number of indexing runs started since creation.
    pub fn indexing_runs(&self) -> u64 {
        self.state.next_run_id.load(Ordering::SeqCst)
    }

    /// The index of `version`, building it first if needed.
    pub async fn index(&self, version: &VersionId) -> Result<Arc<VersionIndex>, SyncError> {
        // A clear can land between the run finishing and the lookup.
        for _ in 0..2 {
            if let Some(index) = self.state.versions.get(version) {
                return Ok(Arc::clone(index.value()));
            }
            self.ensure_cache(version).await?;
        }
        Err(SyncError::NotFound(format!(
            "version {} is not available in the cache",
            version
        )))
    }

    /// The run to wait on for `version`, or `None` when it is already cached.
    fn join_or_start(&self, version: &VersionId) -> Option<SharedRun> {
        match self.state.in_flight.entry(version.clone()) {
            Entry::Occupied(entry) => {
                debug!("Joining indexing run in flight for {}", version);
                Some(entry.get().run.clone())
            }
            Entry::Vacant(entry) => {
                // The previous run may have finished since the caller checked.
                if self.is_cached(version) {
                    return None;
                }
                let (run_id, run) = self.start_run(version);
                debug!("Started indexing run {} for {}", run_id, version);
                entry.insert(InFlight {
                    run_id,
                    run: run.clone(),
                });
                Some(run)
            }
        }
    }

    fn start_run(&self, version: &VersionId) -> (u64, SharedRun) {
        let run_id = self.state.next_run_id.fetch_add(1, Ordering::SeqCst) + 1;
        let state = Arc::clone(&self.state);
        let owned = version.clone();
        let handle = tokio::spawn(async move { state.index_version(owned, run_id).await });

        let run = async move {
            handle.await.unwrap_or_else(|e| {
                Err(SyncError::Execution(format!("indexing task failed: {}", e)))
            })
        }
        .boxed()
        .shared();
        (run_id, run)
    }
}

#[async_trait]
impl IndexCache for MemoryIndexCache {
    #[instrument(skip(self), level = "debug")]
    async fn ensure_cache(&self, version: &VersionId) -> Result<(), SyncError> {
        if self.is_cached(version) {
            return Ok(());
        }

        match self.join_or_start(version) {
            Some(run) => run.await,
            None => Ok(()),
        }
    }

    fn is_cached(&self, version: &VersionId) -> bool {
        self.state.versions.contains_key(version)
    }

    fn cached_versions(&self) -> BTreeSet<VersionId> {
        self.state
            .versions
            .iter()
            .map(|e| e.key().clone())
            .collect()
    }

    fn problem_map(&self, version: &VersionId) -> ContentProblemReport {
        self.state
            .problems
            .get(version)
            .map(|p| p.value().clone())
            .unwrap_or_default()
    }

    fn clear_cache(&self) {
        let dropped = self.state.versions.len();
        self.state.versions.clear();
        self.state.problems.clear();
        info!("Cleared index cache ({} versions dropped)", dropped);
    }

    fn clear_version(&self, version: &VersionId) -> bool {
        self.state.problems.remove(version);
        let removed = self.state.versions.remove(version).is_some();
        if removed {
            info!("Dropped version {} from the index cache", version);
        }
        removed
    }

    async fn get_by_id(
        &self,
        version: &VersionId,
        id: &str,
    ) -> Result<Option<ContentItem>, SyncError> {
        Ok(self.index(version).await?.get(id).cloned())
    }

    async fn get_by_id_prefix(
        &self,
        version: &VersionId,
        prefix: &str,
    ) -> Result<Vec<ContentItem>, SyncError> {
        Ok(self.index(version).await?.with_prefix(prefix))
    }

    async fn find_by_tags(
        &self,
        version: &VersionId,
        tags: &[&str],
    ) -> Result<Vec<ContentItem>, SyncError> {
        Ok(self.index(version).await?.with_tags(tags))
    }

    async fn tags(&self, version: &VersionId) -> Result<BTreeSet<String>, SyncError> {
        Ok(self.index(version).await?.tags().clone())
    }

    async fn units(&self, version: &VersionId) -> Result<BTreeMap<String, String>, SyncError> {
        Ok(self.index(version).await?.units().clone())
    }
}
