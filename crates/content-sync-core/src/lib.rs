//! Core traits and types for the content version synchronization pipeline.
//!
//! This crate defines the abstractions shared between the engine and the
//! backing store implementations:
//! - `BackingStore`: Immutably versioned content history
//! - `IndexCache`: Per-version parsed and validated content cache
//! - `ContentItem` / `ContentProblemReport`: What gets indexed, and what was wrong with it
//! - `SyncError`: Typed failures shared by every layer

mod cache;
mod content;
mod error;
#[cfg(feature = "mock")]
mod mock;
mod store;
mod version;

pub use cache::IndexCache;
pub use content::{Choice, ContentItem, ContentProblemReport, ID_SEPARATOR};
pub use error::{ErrorClass, SyncError};
#[cfg(feature = "mock")]
pub use mock::MemoryStore;
pub use store::BackingStore;
pub use version::{VersionId, VersionInfo};
