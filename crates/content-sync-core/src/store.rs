use async_trait::async_trait;

use crate::error::SyncError;
use crate::version::{VersionId, VersionInfo};

/// Durable, append-only history of content versions.
///
/// Versions are immutable once they exist: reading the same path of the same
/// version always yields the same bytes. Paths are relative to the version
/// root and use `/` as separator.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Returns the backend identifier (e.g., "local", "memory").
    fn backend_name(&self) -> &'static str;

    /// Cheap existence and shape check. Must not read content.
    async fn is_valid_version(&self, version: &VersionId) -> Result<bool, SyncError>;

    /// Resolve the newest version at call time.
    async fn latest_version(&self) -> Result<VersionId, SyncError>;

    /// List all known versions, newest first.
    async fn list_versions(&self) -> Result<Vec<VersionInfo>, SyncError>;

    /// List the `.json` content files of a version, sorted.
    async fn list_content_files(&self, version: &VersionId) -> Result<Vec<String>, SyncError>;

    /// Read one file of a version.
    async fn read_file(&self, version: &VersionId, path: &str) -> Result<Vec<u8>, SyncError>;

    /// Check whether a file exists in a version (used to verify media references).
    async fn file_exists(&self, version: &VersionId, path: &str) -> Result<bool, SyncError>;
}
