use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};
use content_sync_core::VersionId;
use content_sync_engine::{Environment, IndexerOptions, SyncConfig};

/// Configuration for the content-sync-local daemon.
#[derive(Parser, Debug, Clone)]
#[command(name = "content-sync-local")]
#[command(about = "Indexes versioned content from a local directory and serves a live version")]
pub struct Config {
    /// Directory holding one subdirectory per content version
    #[arg(long, env = "CONTENT_ROOT")]
    pub content_root: Option<PathBuf>,

    /// Live version at startup. Defaults to the latest version in the store.
    #[arg(long, env = "LIVE_VERSION")]
    pub live_version: Option<String>,

    /// Deployment environment: dev, staging or prod
    #[arg(long, default_value = "dev", env = "SYNC_ENVIRONMENT")]
    pub environment: Environment,

    /// Maximum number of sync jobs running at once
    #[arg(long, default_value = "2", env = "MAX_CONCURRENT_JOBS")]
    pub max_concurrent_jobs: usize,

    /// Index content that is not marked as published
    #[arg(long, default_value = "true", env = "INDEX_UNPUBLISHED", action = ArgAction::Set)]
    pub index_unpublished: bool,

    /// How long a promotion waits for indexing, in seconds. Unbounded if unset.
    #[arg(long, env = "PROMOTION_TIMEOUT_SECS")]
    pub promotion_timeout_secs: Option<u64>,

    /// Seconds between checks for a new latest version (0 disables polling)
    #[arg(long, default_value = "30", env = "POLL_INTERVAL_SECS")]
    pub poll_interval_secs: u64,

    /// Promote each new latest version to live once it is indexed
    #[arg(long, env = "AUTO_PROMOTE")]
    pub auto_promote: bool,
}

impl Config {
    /// Get the effective content root directory.
    pub fn effective_content_root(&self) -> PathBuf {
        self.content_root.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("content-sync")
                .join("versions")
        })
    }

    pub fn sync_config(&self, live_version: VersionId) -> SyncConfig {
        SyncConfig::new(live_version)
            .with_environment(self.environment)
            .with_max_concurrent_jobs(self.max_concurrent_jobs)
            .with_promotion_timeout(self.promotion_timeout_secs.map(Duration::from_secs))
    }

    pub fn indexer_options(&self) -> IndexerOptions {
        IndexerOptions {
            include_unpublished: self.index_unpublished,
        }
    }

    /// `None` when polling is disabled.
    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_secs > 0).then(|| Duration::from_secs(self.poll_interval_secs))
    }
}
