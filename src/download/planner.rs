//! Holder discovery and work partitioning.

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::DownloadConfig;
use crate::contact::Contact;
use crate::files::FileDescriptor;
use crate::rpc::{RpcClient, Transport};

use super::chunk::{chunk_bounds, chunk_count, ChunkRange, DownloadChunkRequest};

/// Finds peers holding a file and splits the outstanding work among them.
pub struct DownloadPlanner<T: Transport> {
    rpc: RpcClient<T>,
    config: DownloadConfig,
}

impl<T: Transport> Clone for DownloadPlanner<T> {
    fn clone(&self) -> Self {
        Self {
            rpc: self.rpc.clone(),
            config: self.config.clone(),
        }
    }
}

impl<T: Transport> DownloadPlanner<T> {
    pub fn new(rpc: RpcClient<T>, config: DownloadConfig) -> Self {
        Self { rpc, config }
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// How many holders are worth finding for `undownloaded` bytes.
    ///
    /// The full fan-out while more than `fan_out` chunks remain, otherwise
    /// one holder per remaining chunk.
    pub fn holder_capacity(&self, undownloaded: u64) -> usize {
        let chunk = self.config.max_chunk_size.max(1);
        let fan_out = self.config.holder_fan_out.max(1);
        if undownloaded > fan_out as u64 * chunk {
            fan_out
        } else {
            (chunk_count(undownloaded, chunk) as usize).max(1)
        }
    }

    /// Probe `candidates` concurrently and return up to `capacity` of them
    /// that report exactly the wanted size and version.
    ///
    /// Outstanding probes are dropped once enough holders have answered.
    pub async fn contacts_with_file(
        &self,
        candidates: Vec<Contact>,
        file: &FileDescriptor,
        capacity: usize,
        cancel: &CancellationToken,
    ) -> Vec<Contact> {
        let our_id = self.rpc.sender().id;
        let file_ref = file.file_ref();
        let parallel = self.config.max_workers.max(1);

        let mut probes = stream::iter(candidates.into_iter().filter(|c| c.id != our_id))
            .map(|contact| {
                let rpc = &self.rpc;
                let file_ref = &file_ref;
                async move {
                    let result = rpc.file_exists(&contact, file_ref).await;
                    (contact, result)
                }
            })
            .buffer_unordered(parallel);

        let mut holders = Vec::new();
        while holders.len() < capacity {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = probes.next() => next,
            };
            let Some((contact, result)) = next else { break };
            match result {
                Ok(stat) if file.matches(&stat) => {
                    trace!(peer = %contact.id, "holder found");
                    holders.push(contact);
                }
                Ok(stat) => {
                    debug!(peer = %contact.id, size = stat.size, version = stat.version, "holder has another version");
                }
                Err(err) => {
                    debug!(peer = %contact.id, error = %err, "file probe failed");
                }
            }
        }
        holders
    }

    /// Split a whole file of `total` bytes across `holders`.
    pub fn partition_by_contact(
        &self,
        file: &FileDescriptor,
        holders: &[Contact],
    ) -> Vec<(Contact, DownloadChunkRequest)> {
        let all: Vec<u64> = (0..chunk_count(file.size, self.config.max_chunk_size)).collect();
        self.partition_remaining(file, &all, holders)
    }

    /// Split the `missing` chunk indices across `holders` in contiguous runs.
    ///
    /// Each holder gets `ceil(missing / holders)` chunks; the last one takes
    /// whatever is left, and holders beyond the chunk count get nothing.
    pub fn partition_remaining(
        &self,
        file: &FileDescriptor,
        missing: &[u64],
        holders: &[Contact],
    ) -> Vec<(Contact, DownloadChunkRequest)> {
        if holders.is_empty() || missing.is_empty() {
            return Vec::new();
        }
        let chunk = self.config.max_chunk_size;
        let per_holder = missing.len().div_ceil(holders.len()).max(1);

        missing
            .chunks(per_holder)
            .zip(holders.iter())
            .map(|(indices, holder)| {
                let first = chunk_bounds(indices[0], chunk, file.size);
                let last = chunk_bounds(indices[indices.len() - 1], chunk, file.size);
                let span: u64 = indices
                    .iter()
                    .map(|i| chunk_bounds(*i, chunk, file.size).len())
                    .sum();
                let request = DownloadChunkRequest {
                    file: file.clone(),
                    range: ChunkRange::new(first.start, last.end, span, file.size),
                    pending_chunks: indices.to_vec(),
                    downloaded_bytes: 0,
                    confirmed: Vec::new(),
                };
                (holder.clone(), request)
            })
            .collect()
    }
}
