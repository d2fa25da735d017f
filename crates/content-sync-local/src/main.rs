mod config;
mod store;
mod watch;

use std::sync::Arc;

use clap::Parser;
use content_sync_core::{BackingStore, VersionId};
use content_sync_engine::{MemoryIndexCache, VersionController};
use tokio::signal;
use tokio::sync::watch as tokio_watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use store::LocalContentStore;
use watch::LatestVersionPoller;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();

    info!("Starting content-sync-local");
    info!("  Environment: {}", config.environment);
    info!("  Max concurrent jobs: {}", config.max_concurrent_jobs);
    info!("  Index unpublished: {}", config.index_unpublished);

    let root = config.effective_content_root();
    info!("  Content root: {}", root.display());
    let store: Arc<dyn BackingStore> = Arc::new(LocalContentStore::new(&root));

    let live = match &config.live_version {
        Some(version) => VersionId::from(version.as_str()),
        None => store.latest_version().await?,
    };
    info!("  Initial live version: {}", live);

    let cache = Arc::new(MemoryIndexCache::new(store.clone(), config.indexer_options()));
    let controller = VersionController::new(config.sync_config(live), store.clone(), cache);

    // The configured live version is not trusted until it has been indexed.
    let live = controller.warm_live_version(None).await?;
    let problems = controller.problem_map(&live);
    if problems.is_empty() {
        info!("Live version {} indexed without content problems", live);
    } else {
        warn!(
            "Live version {} has {} problems across {} items",
            live,
            problems.total_problems(),
            problems.len()
        );
        for (item, messages) in problems.iter() {
            for message in messages {
                warn!("  {}: {}", item, message);
            }
        }
    }

    let mut shutdown_rx = create_shutdown_signal();

    let poller = config.poll_interval().map(|interval| {
        let poller =
            LatestVersionPoller::new(store.clone(), controller.clone(), interval, config.auto_promote);
        tokio::spawn(poller.run(shutdown_rx.clone()))
    });

    let _ = shutdown_rx.wait_for(|&v| v).await;

    if let Some(poller) = poller {
        if let Err(e) = poller.await {
            error!("Version poller task failed: {}", e);
        }
    }

    info!(
        "Shutdown complete (live version {}, {} versions cached)",
        controller.live_version(),
        controller.cached_versions().len()
    );
    Ok(())
}

/// Create a shutdown signal that triggers on Ctrl+C or SIGTERM.
fn create_shutdown_signal() -> tokio_watch::Receiver<bool> {
    let (tx, rx) = tokio_watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            match signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C, initiating shutdown"),
                Err(e) => {
                    error!("Failed to install Ctrl+C handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating shutdown");
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        let _ = tx.send(true);
    });

    rx
}
