//! In-memory backing store for testing.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::SyncError;
use crate::store::BackingStore;
use crate::version::{VersionId, VersionInfo};

#[derive(Default)]
struct State {
    /// version -> (insertion sequence, created_at, files)
    versions: BTreeMap<VersionId, (u64, chrono::DateTime<chrono::Utc>, HashMap<String, Vec<u8>>)>,
    failing: HashSet<VersionId>,
    next_seq: u64,
}

/// In-memory backing store.
///
/// The most recently added version is the latest. Counters expose how often
/// content was listed and read so tests can observe how many indexing runs
/// actually happened.
///
/// ```
/// use content_sync_core::{BackingStore, MemoryStore, VersionId};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = MemoryStore::new().with_version("v1", [("page.json", r#"{"id": "p"}"#)]);
/// assert!(store.is_valid_version(&VersionId::from("v1")).await.unwrap());
/// # }
/// ```
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
    read_delay_ms: AtomicU64,
    listings: AtomicUsize,
    reads: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`add_version`](Self::add_version).
    pub fn with_version(
        mut self,
        id: &str,
        files: impl IntoIterator<Item = (impl Into<String>, impl Into<Vec<u8>>)>,
    ) -> Self {
        Self::insert(self.state.get_mut(), id, files);
        self
    }

    /// Add a version; it becomes the latest.
    pub async fn add_version(
        &self,
        id: &str,
        files: impl IntoIterator<Item = (impl Into<String>, impl Into<Vec<u8>>)>,
    ) {
        let mut state = self.state.write().await;
        Self::insert(&mut state, id, files);
    }

    fn insert(
        state: &mut State,
        id: &str,
        files: impl IntoIterator<Item = (impl Into<String>, impl Into<Vec<u8>>)>,
    ) {
        let files = files
            .into_iter()
            .map(|(path, data)| (path.into(), data.into()))
            .collect();
        let seq = state.next_seq;
        state.next_seq += 1;
        state
            .versions
            .insert(VersionId::from(id), (seq, chrono::Utc::now(), files));
    }

    /// Make every content read of `id` fail with an I/O error.
    pub async fn fail_version(&self, id: &str) {
        self.state.write().await.failing.insert(VersionId::from(id));
    }

    /// Slow down every content listing, to keep indexing runs in flight.
    pub fn set_read_delay(&self, delay: Duration) {
        self.read_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of `list_content_files` calls, i.e. indexing runs started.
    pub fn listing_count(&self) -> usize {
        self.listings.load(Ordering::SeqCst)
    }

    /// Number of `read_file` calls.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    async fn check_readable(&self, version: &VersionId) -> Result<(), SyncError> {
        let state = self.state.read().await;
        if state.failing.contains(version) {
            return Err(SyncError::Io(format!("injected failure reading {}", version)));
        }
        if !state.versions.contains_key(version) {
            return Err(SyncError::NotFound(format!("version {}", version)));
        }
        Ok(())
    }
}

#[async_trait]
impl BackingStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn is_valid_version(&self, version: &VersionId) -> Result<bool, SyncError> {
        Ok(self.state.read().await.versions.contains_key(version))
    }

    async fn latest_version(&self) -> Result<VersionId, SyncError> {
        self.state
            .read()
            .await
            .versions
            .iter()
            .max_by_key(|(_, (seq, _, _))| *seq)
            .map(|(id, _)| id.clone())
            .ok_or_else(|| SyncError::NotFound("no versions in store".to_string()))
    }

    async fn list_versions(&self) -> Result<Vec<VersionInfo>, SyncError> {
        let state = self.state.read().await;
        let mut versions: Vec<_> = state
            .versions
            .iter()
            .map(|(id, (seq, created_at, _))| {
                (
                    *seq,
                    VersionInfo {
                        id: id.clone(),
                        created_at: *created_at,
                    },
                )
            })
            .collect();
        versions.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(versions.into_iter().map(|(_, info)| info).collect())
    }

    async fn list_content_files(&self, version: &VersionId) -> Result<Vec<String>, SyncError> {
        self.listings.fetch_add(1, Ordering::SeqCst);

        let delay = self.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        self.check_readable(version).await?;
        let state = self.state.read().await;
        let mut files: Vec<String> = state
            .versions
            .get(version)
            .map(|(_, _, files)| {
                files
                    .keys()
                    .filter(|p| p.ends_with(".json"))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        files.sort();
        Ok(files)
    }

    async fn read_file(&self, version: &VersionId, path: &str) -> Result<Vec<u8>, SyncError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.check_readable(version).await?;
        self.state
            .read()
            .await
            .versions
            .get(version)
            .and_then(|(_, _, files)| files.get(path).cloned())
            .ok_or_else(|| SyncError::NotFound(format!("{} in version {}", path, version)))
    }

    async fn file_exists(&self, version: &VersionId, path: &str) -> Result<bool, SyncError> {
        Ok(self
            .state
            .read()
            .await
            .versions
            .get(version)
            .is_some_and(|(_, _, files)| files.contains_key(path)))
    }
}
