//! Content version synchronization engine.
//!
//! - `VersionController`: owns the live version pointer and the promotion protocol
//! - `SyncWorker`: drives one version from requested to cached
//! - `MemoryIndexCache`: per-version index with in-flight run de-duplication
//! - `ContentIndexer`: parses, augments and validates a version's content
//! - `ContentReader`: reads through the live version

mod cache;
mod config;
mod controller;
mod indexer;
mod job;
mod reader;
mod validate;
mod worker;

pub use cache::MemoryIndexCache;
pub use config::{Environment, SyncConfig};
pub use controller::VersionController;
pub use indexer::{ContentIndexer, IndexOutcome, IndexerOptions, VersionIndex};
pub use job::{JobHandle, JobStatus, SyncJob};
pub use reader::ContentReader;
pub use validate::check_for_content_errors;
pub use worker::{SyncListener, SyncWorker};
