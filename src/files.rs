//! File identity and the local side of file serving.

use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

use crate::download::ChunkRange;
use crate::protocol::FileRef;
use crate::rpc::FileStat;

/// A specific version of a shared file, as requested for download.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileDescriptor {
    /// Logical group the file is shared in.
    pub bucket_id: String,
    /// Original file name.
    pub name: String,
    /// Content hash prefix distinguishing same-named files.
    pub hex_prefix: String,
    pub version: u64,
    pub size: u64,
}

impl FileDescriptor {
    pub fn file_ref(&self) -> FileRef {
        FileRef {
            bucket_id: self.bucket_id.clone(),
            file_name: self.name.clone(),
            hex_prefix: self.hex_prefix.clone(),
        }
    }

    /// Whether a holder's report matches this exact version.
    pub fn matches(&self, stat: &FileStat) -> bool {
        stat.size == self.size && stat.version == self.version
    }
}

/// Files this node can serve to peers.
#[async_trait]
pub trait FileSource: Send + Sync + 'static {
    /// Size and version of a local file, `None` if we do not hold it.
    async fn stat(&self, file: &FileRef) -> Option<FileStat>;

    /// Bytes of `range` (inclusive bounds) of the given version.
    async fn read_range(
        &self,
        file: &FileRef,
        version: u64,
        range: &ChunkRange,
    ) -> std::io::Result<Vec<u8>>;
}

/// Serves `root/<bucket_id>/<file_name>`; the version is the modification
/// time in seconds since the epoch.
#[derive(Clone, Debug)]
pub struct DirFileSource {
    root: PathBuf,
}

impl DirFileSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, file: &FileRef) -> Option<PathBuf> {
        let bucket = Path::new(&file.bucket_id);
        let name = Path::new(&file.file_name);
        if !is_plain(bucket) || !is_plain(name) {
            debug!(bucket = %file.bucket_id, file = %file.file_name, "rejecting non-plain path");
            return None;
        }
        Some(self.root.join(bucket).join(name))
    }
}

fn is_plain(path: &Path) -> bool {
    let mut components = path.components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

#[async_trait]
impl FileSource for DirFileSource {
    async fn stat(&self, file: &FileRef) -> Option<FileStat> {
        let path = self.resolve(file)?;
        let meta = tokio::fs::metadata(&path).await.ok()?;
        if !meta.is_file() {
            return None;
        }
        let version = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Some(FileStat {
            size: meta.len(),
            version,
        })
    }

    async fn read_range(
        &self,
        file: &FileRef,
        version: u64,
        range: &ChunkRange,
    ) -> std::io::Result<Vec<u8>> {
        let not_found = || std::io::Error::new(std::io::ErrorKind::NotFound, "file not shared");
        let path = self.resolve(file).ok_or_else(not_found)?;
        let stat = self.stat(file).await.ok_or_else(not_found)?;
        if stat.version != version {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("version {version} requested, {} held", stat.version),
            ));
        }
        if range.end >= stat.size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "range past end of file",
            ));
        }
        let mut handle = tokio::fs::File::open(&path).await?;
        handle.seek(std::io::SeekFrom::Start(range.start)).await?;
        let mut buf = vec![0u8; range.len() as usize];
        handle.read_exact(&mut buf).await?;
        Ok(buf)
    }
}
