use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;

use crate::content::{ContentItem, ContentProblemReport};
use crate::error::SyncError;
use crate::version::VersionId;

/// Per-version searchable cache of parsed content.
///
/// Implementations must guarantee at most one concurrent indexing run per
/// version: concurrent `ensure_cache` calls for the same id share one run and
/// observe the same outcome. A version becomes visible in
/// [`cached_versions`](IndexCache::cached_versions) only after its run fully
/// succeeded.
///
/// The read operations ensure the cache first, so reading a version that was
/// cleared rebuilds it rather than returning nothing.
#[async_trait]
pub trait IndexCache: Send + Sync {
    /// Index `version` unless it is already cached. Idempotent.
    async fn ensure_cache(&self, version: &VersionId) -> Result<(), SyncError>;

    /// Whether `version` is currently cached.
    fn is_cached(&self, version: &VersionId) -> bool;

    /// Snapshot of currently cached versions.
    fn cached_versions(&self) -> BTreeSet<VersionId>;

    /// Most recent problem report for `version`; empty if never indexed.
    fn problem_map(&self, version: &VersionId) -> ContentProblemReport;

    /// Drop every cached version and problem report.
    fn clear_cache(&self);

    /// Drop a single version. Returns `true` if it was cached.
    fn clear_version(&self, version: &VersionId) -> bool;

    // =========================================================================
    // Reads
    // =========================================================================

    /// Look up one content item by its fully qualified id.
    async fn get_by_id(
        &self,
        version: &VersionId,
        id: &str,
    ) -> Result<Option<ContentItem>, SyncError>;

    /// All items whose id starts with `prefix`, sorted by id.
    async fn get_by_id_prefix(
        &self,
        version: &VersionId,
        prefix: &str,
    ) -> Result<Vec<ContentItem>, SyncError>;

    /// All items carrying every one of `tags`, sorted by id.
    async fn find_by_tags(
        &self,
        version: &VersionId,
        tags: &[&str],
    ) -> Result<Vec<ContentItem>, SyncError>;

    /// Every tag used in `version`.
    async fn tags(&self, version: &VersionId) -> Result<BTreeSet<String>, SyncError>;

    /// Units used by numeric answers in `version`, keyed by their whitespace-free form.
    async fn units(&self, version: &VersionId) -> Result<BTreeMap<String, String>, SyncError>;
}
