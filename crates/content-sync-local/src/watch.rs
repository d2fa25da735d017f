use std::sync::Arc;
use std::time::Duration;

use content_sync_core::{BackingStore, SyncError, VersionId};
use content_sync_engine::VersionController;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Polling-based detection of new content versions.
///
/// The local store has no push notifications, so the latest version is
/// resolved periodically. Each new one is synced in the background, or
/// promoted to live when auto-promotion is on.
pub struct LatestVersionPoller {
    store: Arc<dyn BackingStore>,
    controller: VersionController,
    interval: Duration,
    auto_promote: bool,
    /// Latest version already handed to the controller
    last_seen: Option<VersionId>,
}

impl LatestVersionPoller {
    pub fn new(
        store: Arc<dyn BackingStore>,
        controller: VersionController,
        interval: Duration,
        auto_promote: bool,
    ) -> Self {
        Self {
            store,
            controller,
            interval,
            auto_promote,
            last_seen: None,
        }
    }

    /// Check for a new latest version once. Returns it if one was found.
    pub async fn poll_once(&mut self) -> Result<Option<VersionId>, SyncError> {
        let latest = self.store.latest_version().await?;
        if self.last_seen.as_ref() == Some(&latest) {
            debug!("Latest version unchanged ({})", latest);
            return Ok(None);
        }

        info!("Detected new latest version {}", latest);
        if self.auto_promote {
            self.controller.change_live_version(&latest, None).await?;
        } else {
            self.controller
                .trigger_sync_job(Some(latest.clone()))
                .detach();
        }

        self.last_seen = Some(latest.clone());
        Ok(Some(latest))
    }

    /// Poll until `shutdown` flips to `true`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Polling {} store for new versions every {:?} (auto-promote: {})",
            self.store.backend_name(),
            self.interval,
            self.auto_promote
        );
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        warn!("Version poll failed: {}", e);
                    }
                }
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }

        info!("Version poller stopped");
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|&v| v).await;
}
