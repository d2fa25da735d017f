use std::collections::{BTreeMap, BTreeSet};

use content_sync_core::{ContentItem, SyncError, VersionId};

use crate::controller::VersionController;

/// Read access to the content of whatever version is live.
///
/// The live version is resolved on every call, so a promotion is visible to
/// the next read. Reads after a cache clear rebuild the index first.
#[derive(Clone)]
pub struct ContentReader {
    controller: VersionController,
}

impl ContentReader {
    pub fn new(controller: VersionController) -> Self {
        Self { controller }
    }

    pub fn live_version(&self) -> VersionId {
        self.controller.live_version()
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Option<ContentItem>, SyncError> {
        let version = self.controller.live_version();
        self.controller.cache().get_by_id(&version, id).await
    }

    pub async fn get_by_id_prefix(&self, prefix: &str) -> Result<Vec<ContentItem>, SyncError> {
        let version = self.controller.live_version();
        self.controller.cache().get_by_id_prefix(&version, prefix).await
    }

    pub async fn find_by_tags(&self, tags: &[&str]) -> Result<Vec<ContentItem>, SyncError> {
        let version = self.controller.live_version();
        self.controller.cache().find_by_tags(&version, tags).await
    }

    pub async fn tags(&self) -> Result<BTreeSet<String>, SyncError> {
        let version = self.controller.live_version();
        self.controller.cache().tags(&version).await
    }

    pub async fn units(&self) -> Result<BTreeMap<String, String>, SyncError> {
        let version = self.controller.live_version();
        self.controller.cache().units(&version).await
    }
}
