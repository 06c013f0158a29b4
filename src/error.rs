//! Error types shared across the crate.
//!
//! RPC failures are not here: they travel as
//! [`RpcError`](crate::rpc::RpcError) values and feed the eviction policy
//! instead of escalating.

use std::path::PathBuf;

use thiserror::Error;

use crate::download::ChunkRange;

/// Malformed identifier input.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// Raw input was not exactly 20 bytes.
    #[error("invalid identifier: expected 20 bytes, got {len}")]
    InvalidIdentifier { len: usize },
    /// Textual input was not valid hex.
    #[error("invalid identifier hex: {0}")]
    InvalidHex(String),
}

/// Bucket-level insertion failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BucketError {
    /// The bucket already holds `k` contacts; the caller must split or evict.
    #[error("bucket full")]
    BucketFull,
    /// The contact does not belong to this bucket's range.
    #[error("identifier outside bucket range")]
    OutOfRange,
}

/// Failures while saving or restoring a routing-state snapshot.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding: {0}")]
    Json(#[from] serde_json::Error),
    /// Restored buckets do not tile the identifier space.
    #[error("snapshot buckets do not cover the identifier space")]
    InvalidBuckets,
}

/// Failures while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse: {0}")]
    Json(#[from] serde_json::Error),
}

/// Typed failures of a single file download.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// No location has room for the file plus the configured reserve.
    #[error("not enough drive space: need {required} bytes, {available} available")]
    NotEnoughDriveSpace { required: u64, available: u64 },
    /// Some bytes were written but no peer is left for the rest.
    ///
    /// `remaining` lists the exact undownloaded ranges so an origin fetch can
    /// resume from them; `temp_path` is the partially written file.
    #[error("file partially downloaded: {} ranges missing", remaining.len())]
    FilePartiallyDownloaded {
        remaining: Vec<ChunkRange>,
        temp_path: PathBuf,
    },
    /// Nothing usable: no holder for the file, no peer in its bucket, or a
    /// holder that returned malformed data.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    /// The caller's cancellation token fired.
    #[error("download cancelled")]
    Cancelled,
    #[error("download i/o: {0}")]
    Io(#[from] std::io::Error),
}
