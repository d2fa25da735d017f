use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use content_sync_core::{BackingStore, SyncError, VersionId, VersionInfo};
use tokio::fs;
use tracing::{debug, instrument, warn};

/// Name of the optional file pinning the latest version.
const LATEST_FILE: &str = "LATEST";

/// Local filesystem content store.
///
/// Every version is an immutable directory of content files:
/// ```text
/// {root}/
///   LATEST              (optional, holds the latest version id)
///   {version_id}/
///     **/*.json
///     **/*.png, ...
/// ```
/// Without a `LATEST` file, the most recently modified version directory is
/// the latest.
#[derive(Debug, Clone)]
pub struct LocalContentStore {
    root: PathBuf,
}

impl LocalContentStore {
    /// Create a new LocalContentStore over the given root directory.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Whether `id` is shaped like a version directory name.
    fn is_well_formed(id: &str) -> bool {
        !id.is_empty()
            && id.len() <= 128
            && !id.starts_with('.')
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    }

    fn version_dir(&self, version: &VersionId) -> Result<PathBuf, SyncError> {
        if !Self::is_well_formed(version.as_str()) {
            return Err(SyncError::InvalidVersion(version.clone()));
        }
        Ok(self.root.join(version.as_str()))
    }

    /// Resolve a version-relative path, refusing anything that escapes the
    /// version directory.
    fn file_path(&self, version: &VersionId, path: &str) -> Result<PathBuf, SyncError> {
        if path.starts_with('/') || path.split(['/', '\\']).any(|s| s == "..") {
            return Err(SyncError::NotFound(format!(
                "{} is not a valid content path",
                path
            )));
        }
        Ok(self.version_dir(version)?.join(path))
    }

    async fn is_dir(path: &Path) -> bool {
        fs::metadata(path).await.is_ok_and(|m| m.is_dir())
    }

    /// Version named in the `LATEST` file, if it exists and is usable.
    async fn pinned_latest(&self) -> Option<VersionId> {
        let contents = fs::read_to_string(self.root.join(LATEST_FILE)).await.ok()?;
        let version = VersionId::from(contents.trim());
        let dir = self.version_dir(&version).ok()?;
        if Self::is_dir(&dir).await {
            Some(version)
        } else {
            warn!("{} names unknown version {}; ignoring it", LATEST_FILE, version);
            None
        }
    }
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> SyncError {
    SyncError::Io(format!("Failed to {} {}: {}", action, path.display(), e))
}

#[async_trait]
impl BackingStore for LocalContentStore {
    fn backend_name(&self) -> &'static str {
        "local"
    }

    #[instrument(skip(self), level = "debug")]
    async fn is_valid_version(&self, version: &VersionId) -> Result<bool, SyncError> {
        match self.version_dir(version) {
            Ok(dir) => Ok(Self::is_dir(&dir).await),
            Err(_) => Ok(false),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn latest_version(&self) -> Result<VersionId, SyncError> {
        if let Some(version) = self.pinned_latest().await {
            return Ok(version);
        }
        self.list_versions()
            .await?
            .into_iter()
            .next()
            .map(|info| info.id)
            .ok_or_else(|| {
                SyncError::NotFound(format!("no content versions under {}", self.root.display()))
            })
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_versions(&self) -> Result<Vec<VersionInfo>, SyncError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(io_error("read", &self.root, e)),
        };

        let mut versions = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("read", &self.root, e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if !Self::is_well_formed(&name) {
                continue;
            }
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_dir() {
                continue;
            }
            let created_at = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            versions.push(VersionInfo {
                id: VersionId::from(name),
                created_at,
            });
        }

        // Newest first, ties broken by id for a stable order
        versions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        debug!("Listed {} versions", versions.len());
        Ok(versions)
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_content_files(&self, version: &VersionId) -> Result<Vec<String>, SyncError> {
        let base = self.version_dir(version)?;
        if !Self::is_dir(&base).await {
            return Err(SyncError::NotFound(format!("version {}", version)));
        }

        let mut files = Vec::new();
        let mut pending = vec![base.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir)
                .await
                .map_err(|e| io_error("read", &dir, e))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| io_error("read", &dir, e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| io_error("stat", &path, e))?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if path.extension().is_some_and(|ext| ext == "json") {
                    if let Ok(relative) = path.strip_prefix(&base) {
                        let parts: Vec<_> = relative
                            .components()
                            .map(|c| c.as_os_str().to_string_lossy().to_string())
                            .collect();
                        files.push(parts.join("/"));
                    }
                }
            }
        }

        files.sort();
        debug!("Found {} content files in {}", files.len(), version);
        Ok(files)
    }

    #[instrument(skip(self), level = "debug")]
    async fn read_file(&self, version: &VersionId, path: &str) -> Result<Vec<u8>, SyncError> {
        let full = self.file_path(version, path)?;
        match fs::read(&full).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(SyncError::NotFound(
                format!("{} in version {}", path, version),
            )),
            Err(e) => Err(io_error("read", &full, e)),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn file_exists(&self, version: &VersionId, path: &str) -> Result<bool, SyncError> {
        let Ok(full) = self.file_path(version, path) else {
            return Ok(false);
        };
        Ok(fs::metadata(&full).await.is_ok_and(|m| m.is_file()))
    }
}
