//! Parallel multi-peer file download.
//!
//! [`planner::DownloadPlanner`] finds holders and splits the file into
//! per-holder spans; [`engine::DownloadEngine`] drives the rounds, writes
//! chunks into a preallocated temp file and redistributes the work of
//! holders that fail.

use std::path::Path;

use async_trait::async_trait;

use crate::contact::Contact;
use crate::files::FileDescriptor;

pub mod chunk;
pub mod engine;
pub mod planner;

pub use chunk::{chunk_bounds, chunk_count, merge_ranges, ChunkRange, DownloadChunkRequest};
pub use engine::{DownloadEngine, DownloadReport, Fs2SpaceProbe, SpaceProbe};
pub use planner::DownloadPlanner;

/// Source of currently reachable peers, consulted when holders drop out.
#[async_trait]
pub trait OnlineContacts: Send + Sync {
    async fn online_contacts(&self) -> Vec<Contact>;
}

/// Told about every file that lands at its final path.
#[async_trait]
pub trait FileChangesNotifier: Send + Sync {
    async fn file_downloaded(&self, file: &FileDescriptor, path: &Path);
}
