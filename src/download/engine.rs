//! Round-based parallel download into a preallocated temp file.
//!
//! Small files (one chunk or less) are fetched whole from the first holder
//! that confirms the version. Larger files are split across up to
//! `holder_fan_out` holders; each round runs one worker per holder, and
//! whatever a failed holder left behind is redistributed in the next round,
//! topping up the holder set from the online contacts of the same bucket.

use std::collections::{BTreeSet, HashSet};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::contact::Contact;
use crate::error::DownloadError;
use crate::files::FileDescriptor;
use crate::id::Identifier;
use crate::rpc::{RpcClient, RpcError, Transport};

use super::chunk::{chunk_bounds, chunk_count, merge_ranges, ChunkRange, DownloadChunkRequest};
use super::planner::DownloadPlanner;
use super::{FileChangesNotifier, OnlineContacts};

/// Reports free space on the volume holding a directory.
pub trait SpaceProbe: Send + Sync {
    fn available_space(&self, dir: &Path) -> std::io::Result<u64>;
}

/// [`SpaceProbe`] backed by the operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct Fs2SpaceProbe;

impl SpaceProbe for Fs2SpaceProbe {
    fn available_space(&self, dir: &Path) -> std::io::Result<u64> {
        fs2::available_space(existing_ancestor(dir))
    }
}

fn existing_ancestor(dir: &Path) -> &Path {
    dir.ancestors()
        .find(|p| !p.as_os_str().is_empty() && p.exists())
        .unwrap_or_else(|| Path::new("."))
}

/// Summary of a finished download.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadReport {
    /// Where the file ended up; differs from the request when relocated.
    pub path: PathBuf,
    pub bytes: u64,
    /// Holders that served at least one chunk.
    pub served_by: Vec<Identifier>,
    pub rounds: usize,
}

enum SpanFailure {
    Rpc(RpcError),
    Io(std::io::Error),
    Cancelled,
}

struct SpanOutcome {
    holder: Contact,
    request: DownloadChunkRequest,
    written: Vec<u64>,
    failure: Option<SpanFailure>,
}

struct Target {
    path: PathBuf,
    relocated: bool,
}

/// Downloads files from the peers holding them.
pub struct DownloadEngine<T: Transport> {
    planner: DownloadPlanner<T>,
    rpc: RpcClient<T>,
    online: Arc<dyn OnlineContacts>,
    space: Arc<dyn SpaceProbe>,
    notifier: Option<Arc<dyn FileChangesNotifier>>,
}

impl<T: Transport> DownloadEngine<T> {
    pub fn new(planner: DownloadPlanner<T>, rpc: RpcClient<T>, online: Arc<dyn OnlineContacts>) -> Self {
        Self {
            planner,
            rpc,
            online,
            space: Arc::new(Fs2SpaceProbe),
            notifier: None,
        }
    }

    pub fn with_space_probe(mut self, space: Arc<dyn SpaceProbe>) -> Self {
        self.space = space;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn FileChangesNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Download `file` to `target`, trying `candidates` as holders first.
    pub async fn download(
        &self,
        file: &FileDescriptor,
        target: &Path,
        candidates: Vec<Contact>,
        cancel: &CancellationToken,
    ) -> Result<DownloadReport, DownloadError> {
        let target = self.resolve_target(target, file.size)?;
        if target.relocated {
            info!(file = %file.name, path = %target.path.display(), "relocating download to alternate directory");
        }
        if file.size <= self.planner.config().max_chunk_size {
            self.download_small(file, target, candidates, cancel).await
        } else {
            self.download_big(file, target, candidates, cancel).await
        }
    }

    /// Pick a directory with room for the file plus the configured reserve.
    fn resolve_target(&self, target: &Path, size: u64) -> Result<Target, DownloadError> {
        let required = size.saturating_add(self.planner.config().min_free_reserve);
        let dir = target.parent().unwrap_or_else(|| Path::new("."));
        let available = self.space.available_space(dir)?;
        if available >= required {
            return Ok(Target {
                path: target.to_path_buf(),
                relocated: false,
            });
        }
        let Some(name) = target.file_name() else {
            return Err(DownloadError::InvalidOperation(format!(
                "target {} has no file name",
                target.display()
            )));
        };
        for alt in &self.planner.config().alternate_dirs {
            match self.space.available_space(alt) {
                Ok(free) if free >= required => {
                    return Ok(Target {
                        path: alt.join(name),
                        relocated: true,
                    })
                }
                Ok(_) => {}
                Err(err) => debug!(dir = %alt.display(), error = %err, "cannot probe alternate directory"),
            }
        }
        Err(DownloadError::NotEnoughDriveSpace {
            required,
            available,
        })
    }

    async fn download_small(
        &self,
        file: &FileDescriptor,
        target: Target,
        candidates: Vec<Contact>,
        cancel: &CancellationToken,
    ) -> Result<DownloadReport, DownloadError> {
        let file_ref = file.file_ref();
        let our_id = self.rpc.sender().id;
        for holder in candidates.iter().filter(|c| c.id != our_id) {
            if cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            match self.rpc.file_exists(holder, &file_ref).await {
                Ok(stat) if file.matches(&stat) => {}
                Ok(_) => continue,
                Err(err) => {
                    debug!(peer = %holder.id, error = %err, "small-file holder unavailable");
                    continue;
                }
            }
            let data = if file.size == 0 {
                Vec::new()
            } else {
                let range = ChunkRange::new(0, file.size - 1, file.size, file.size);
                match self
                    .rpc
                    .download_chunk(holder, &file_ref, file.version, range, vec![0])
                    .await
                {
                    Ok(data) if data.len() as u64 == file.size => data,
                    Ok(data) => {
                        warn!(peer = %holder.id, got = data.len(), want = file.size, "short small-file transfer");
                        continue;
                    }
                    Err(err) => {
                        debug!(peer = %holder.id, error = %err, "small-file transfer failed");
                        continue;
                    }
                }
            };
            if let Some(parent) = target.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target.path, &data).await?;
            self.notify(file, &target.path).await;
            return Ok(DownloadReport {
                path: target.path,
                bytes: file.size,
                served_by: vec![holder.id],
                rounds: 1,
            });
        }
        Err(DownloadError::InvalidOperation("no holder for file".into()))
    }

    async fn download_big(
        &self,
        file: &FileDescriptor,
        target: Target,
        candidates: Vec<Contact>,
        cancel: &CancellationToken,
    ) -> Result<DownloadReport, DownloadError> {
        let chunk = self.planner.config().max_chunk_size;
        let capacity = self.planner.holder_capacity(file.size);
        let mut holders = self
            .planner
            .contacts_with_file(candidates, file, capacity, cancel)
            .await;
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        if holders.is_empty() {
            return Err(DownloadError::InvalidOperation("no holder for file".into()));
        }

        let temp_path = temp_path_for(&target.path);
        if let Some(parent) = temp_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let handle = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)
            .await?;
        // Growing with set_len allocates no blocks on ext4, xfs and apfs, so the file stays sparse.
        if let Err(err) = handle.set_len(file.size).await {
            drop(handle);
            self.discard_temp(&temp_path, &target).await;
            return Err(err.into());
        }
        let handle = Arc::new(Mutex::new(handle));

        let mut missing: BTreeSet<u64> = (0..chunk_count(file.size, chunk)).collect();
        let mut written: u64 = 0;
        let mut exhausted: HashSet<Identifier> = HashSet::new();
        let mut served_by: Vec<Identifier> = Vec::new();
        let mut rounds = 0;

        loop {
            if cancel.is_cancelled() {
                drop(handle);
                self.discard_temp(&temp_path, &target).await;
                return Err(DownloadError::Cancelled);
            }
            let pending: Vec<u64> = missing.iter().copied().collect();
            let plan = self.planner.partition_remaining(file, &pending, &holders);
            rounds += 1;
            debug!(file = %file.name, round = rounds, holders = plan.len(), missing = pending.len(), "download round");

            let outcomes = self.run_round(plan, handle.clone(), cancel).await;

            let mut failed = 0usize;
            let mut io_error = None;
            for outcome in outcomes {
                for index in &outcome.written {
                    if missing.remove(index) {
                        written += chunk_bounds(*index, chunk, file.size).len();
                    }
                }
                if outcome.request.downloaded_bytes > 0 && !served_by.contains(&outcome.holder.id) {
                    served_by.push(outcome.holder.id);
                }
                match outcome.failure {
                    None | Some(SpanFailure::Cancelled) => {}
                    Some(SpanFailure::Io(err)) => io_error = Some(err),
                    Some(SpanFailure::Rpc(err)) => {
                        warn!(peer = %outcome.holder.id, error = %err, "holder failed mid-transfer");
                        exhausted.insert(outcome.holder.id);
                        failed += 1;
                    }
                }
            }

            if let Some(err) = io_error {
                drop(handle);
                self.discard_temp(&temp_path, &target).await;
                return Err(err.into());
            }
            if cancel.is_cancelled() {
                drop(handle);
                self.discard_temp(&temp_path, &target).await;
                return Err(DownloadError::Cancelled);
            }
            if missing.is_empty() {
                if let Err(err) = finish_temp(handle, &temp_path, &target.path).await {
                    self.discard_temp(&temp_path, &target).await;
                    return Err(err.into());
                }
                info!(file = %file.name, path = %target.path.display(), rounds, "download complete");
                self.notify(file, &target.path).await;
                return Ok(DownloadReport {
                    path: target.path,
                    bytes: file.size,
                    served_by,
                    rounds,
                });
            }

            // Holders left without a span this round stay available.
            holders.retain(|h| !exhausted.contains(&h.id));
            if failed > holders.len() || holders.is_empty() {
                let deficit = (failed.saturating_sub(holders.len())).max(1);
                let extra = self
                    .replacement_holders(file, &holders, &exhausted, deficit, cancel)
                    .await;
                holders.extend(extra);
            }
            if cancel.is_cancelled() {
                drop(handle);
                self.discard_temp(&temp_path, &target).await;
                return Err(DownloadError::Cancelled);
            }

            if holders.is_empty() {
                let remaining = merge_ranges(&pending_vec(&missing), chunk, file.size);
                if written == 0 {
                    drop(handle);
                    self.discard_temp(&temp_path, &target).await;
                    return Err(DownloadError::InvalidOperation("no holder for file".into()));
                }
                warn!(file = %file.name, ranges = remaining.len(), "no holders left for outstanding ranges");
                return Err(DownloadError::FilePartiallyDownloaded {
                    remaining,
                    temp_path,
                });
            }
        }
    }

    /// One worker per planned span, at most `max_workers` at a time.
    async fn run_round(
        &self,
        plan: Vec<(Contact, DownloadChunkRequest)>,
        handle: Arc<Mutex<File>>,
        cancel: &CancellationToken,
    ) -> Vec<SpanOutcome> {
        let workers = self.planner.config().max_workers.max(1);
        stream::iter(plan)
            .map(|(holder, baseline)| {
                let handle = handle.clone();
                async move { self.fetch_span(holder, &baseline, handle, cancel).await }
            })
            .buffer_unordered(workers)
            .collect()
            .await
    }

    /// Fetch every pending chunk of one span, writing each as it arrives.
    async fn fetch_span(
        &self,
        holder: Contact,
        baseline: &DownloadChunkRequest,
        handle: Arc<Mutex<File>>,
        cancel: &CancellationToken,
    ) -> SpanOutcome {
        let mut attempt = baseline.clone();
        let file = &baseline.file;
        let file_ref = file.file_ref();
        let chunk = self.planner.config().max_chunk_size;

        for index in baseline.pending_chunks.iter().copied() {
            if cancel.is_cancelled() {
                return outcome(holder, attempt, Some(SpanFailure::Cancelled));
            }
            let mut range = chunk_bounds(index, chunk, file.size);
            range.total_per_contact = baseline.range.total_per_contact;
            let fetched = tokio::select! {
                _ = cancel.cancelled() => return outcome(holder, attempt, Some(SpanFailure::Cancelled)),
                fetched = self.rpc.download_chunk(
                    &holder,
                    &file_ref,
                    file.version,
                    range,
                    attempt.pending_chunks.clone(),
                ) => fetched,
            };
            let data = match fetched {
                Ok(data) if data.len() as u64 == range.len() => data,
                Ok(data) => {
                    let err = RpcError::remote(format!(
                        "chunk {index}: got {} bytes, want {}",
                        data.len(),
                        range.len()
                    ));
                    return outcome(holder, attempt, Some(SpanFailure::Rpc(err)));
                }
                Err(err) => return outcome(holder, attempt, Some(SpanFailure::Rpc(err))),
            };
            if let Err(err) = write_at(&handle, range.start, &data).await {
                return outcome(holder, attempt, Some(SpanFailure::Io(err)));
            }
            attempt.mark_written(index, range.len());
        }
        outcome(holder, attempt, None)
    }

    /// Online peers in the file's bucket that hold it and were not tried yet.
    async fn replacement_holders(
        &self,
        file: &FileDescriptor,
        current: &[Contact],
        exhausted: &HashSet<Identifier>,
        wanted: usize,
        cancel: &CancellationToken,
    ) -> Vec<Contact> {
        let candidates: Vec<Contact> = self
            .online
            .online_contacts()
            .await
            .into_iter()
            .filter(|c| c.in_bucket(&file.bucket_id))
            .filter(|c| !exhausted.contains(&c.id))
            .filter(|c| current.iter().all(|h| h.id != c.id))
            .collect();
        if candidates.is_empty() {
            debug!(bucket = %file.bucket_id, "no further peers in bucket");
            return Vec::new();
        }
        self.planner
            .contacts_with_file(candidates, file, wanted, cancel)
            .await
    }

    /// Remove a temp file unless it lives in an alternate directory.
    async fn discard_temp(&self, temp_path: &Path, target: &Target) {
        if target.relocated {
            return;
        }
        if let Err(err) = tokio::fs::remove_file(temp_path).await {
            debug!(path = %temp_path.display(), error = %err, "could not remove temp file");
        }
    }

    async fn notify(&self, file: &FileDescriptor, path: &Path) {
        if let Some(notifier) = &self.notifier {
            notifier.file_downloaded(file, path).await;
        }
    }
}

fn outcome(
    holder: Contact,
    request: DownloadChunkRequest,
    failure: Option<SpanFailure>,
) -> SpanOutcome {
    let written = request.written_chunks();
    SpanOutcome {
        holder,
        request,
        written,
        failure,
    }
}

/// Flush and sync the temp file, then move it over the target.
async fn finish_temp(handle: Arc<Mutex<File>>, temp_path: &Path, target: &Path) -> std::io::Result<()> {
    {
        let mut guard = handle.lock().await;
        guard.flush().await?;
        guard.sync_all().await?;
    }
    drop(handle);
    tokio::fs::rename(temp_path, target).await
}

async fn write_at(handle: &Mutex<File>, offset: u64, data: &[u8]) -> std::io::Result<()> {
    let mut file = handle.lock().await;
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    file.flush().await
}

fn pending_vec(missing: &BTreeSet<u64>) -> Vec<u64> {
    missing.iter().copied().collect()
}

fn temp_path_for(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    target.with_file_name(name)
}
