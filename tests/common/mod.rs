#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use kadshare::download::ChunkRange;
use kadshare::files::FileSource;
use kadshare::id::ID_LEN;
use kadshare::protocol::{FileRef, Request};
use kadshare::rpc::{FileStat, RpcError, Transport};
use kadshare::{Contact, Dht, DhtConfig, Identifier, RequestHandler};

/// Every node reachable in a test, keyed by endpoint.
#[derive(Default)]
pub struct NetworkRegistry {
    peers: RwLock<HashMap<String, Arc<RequestHandler<TestNetwork>>>>,
    failures: Mutex<HashSet<String>>,
    /// Endpoint -> chunk requests still answered before failing.
    chunk_budgets: Mutex<HashMap<String, usize>>,
    calls: Mutex<Vec<(String, &'static str)>>,
    /// Tokens cancelled when a matching call is made.
    cancel_hooks: Mutex<Vec<(String, &'static str, CancellationToken)>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl NetworkRegistry {
    pub async fn register(&self, endpoint: &str, handler: Arc<RequestHandler<TestNetwork>>) {
        let mut peers = self.peers.write().await;
        peers.insert(endpoint.to_string(), handler);
    }

    pub async fn unregister(&self, endpoint: &str) {
        self.peers.write().await.remove(endpoint);
    }

    /// Make every call to `endpoint` fail (or succeed again).
    pub async fn set_failure(&self, endpoint: &str, fail: bool) {
        let mut failures = self.failures.lock().await;
        if fail {
            failures.insert(endpoint.to_string());
        } else {
            failures.remove(endpoint);
        }
    }

    /// Let `endpoint` serve `served` more chunks, then fail chunk requests.
    pub async fn fail_chunks_after(&self, endpoint: &str, served: usize) {
        self.chunk_budgets
            .lock()
            .await
            .insert(endpoint.to_string(), served);
    }

    /// Cancel `token` as soon as a `kind` call reaches `endpoint`. The call
    /// itself is still answered.
    pub async fn cancel_on(&self, endpoint: &str, kind: &'static str, token: CancellationToken) {
        self.cancel_hooks
            .lock()
            .await
            .push((endpoint.to_string(), kind, token));
    }

    /// Calls of `kind` ("ping", "store", ...) made to `endpoint`.
    pub async fn calls_to(&self, endpoint: &str, kind: &str) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|(e, k)| e == endpoint && *k == kind)
            .count()
    }

    /// Most calls that were ever outstanding at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn reset_peak(&self) {
        self.peak_in_flight.store(0, Ordering::SeqCst);
    }

    pub async fn any_calls_to(&self, endpoint: &str) -> bool {
        self.calls.lock().await.iter().any(|(e, _)| e == endpoint)
    }
}

/// In-memory [`Transport`] dispatching straight into the target's handler.
#[derive(Clone)]
pub struct TestNetwork {
    registry: Arc<NetworkRegistry>,
}

impl TestNetwork {
    pub fn new(registry: Arc<NetworkRegistry>) -> Self {
        Self { registry }
    }
}

fn kind_of(request: &Request) -> &'static str {
    match request {
        Request::Ping(_) => "ping",
        Request::Store(_) => "store",
        Request::FindNode(_) => "find_node",
        Request::FindValue(_) => "find_value",
        Request::FileExists(_) => "file_exists",
        Request::DownloadChunk(_) => "download_chunk",
    }
}

#[async_trait]
impl Transport for TestNetwork {
    async fn send_and_receive(
        &self,
        endpoint: &str,
        request: Vec<u8>,
        _timeouts: &kadshare::RpcTimeouts,
    ) -> Result<Vec<u8>, RpcError> {
        let now = self.registry.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.registry.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        // Let other callers start before this one finishes.
        tokio::task::yield_now().await;
        let result = self.dispatch(endpoint, request).await;
        self.registry.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl TestNetwork {
    async fn dispatch(&self, endpoint: &str, request: Vec<u8>) -> Result<Vec<u8>, RpcError> {
        let decoded: Request = serde_json::from_slice(&request)
            .map_err(|err| RpcError::local(format!("bad request: {err}")))?;
        let kind = kind_of(&decoded);
        self.registry
            .calls
            .lock()
            .await
            .push((endpoint.to_string(), kind));
        for (hooked, hooked_kind, token) in self.registry.cancel_hooks.lock().await.iter() {
            if hooked == endpoint && *hooked_kind == kind {
                token.cancel();
            }
        }

        if self.registry.failures.lock().await.contains(endpoint) {
            return Err(RpcError::timeout("injected network failure"));
        }
        if kind == "download_chunk" {
            let mut budgets = self.registry.chunk_budgets.lock().await;
            if let Some(left) = budgets.get_mut(endpoint) {
                if *left == 0 {
                    return Err(RpcError::remote("injected chunk failure"));
                }
                *left -= 1;
            }
        }

        let handler = {
            let peers = self.registry.peers.read().await;
            peers.get(endpoint).cloned()
        };
        match handler {
            Some(handler) => Ok(handler.handle_bytes(&request).await),
            None => Err(RpcError::local(format!("{endpoint}: connection refused"))),
        }
    }
}

/// Files held in memory: `(bucket, name) -> (version, bytes)`.
#[derive(Default)]
pub struct MemoryFiles {
    files: RwLock<HashMap<(String, String), (u64, Vec<u8>)>>,
}

impl MemoryFiles {
    pub async fn insert(&self, bucket: &str, name: &str, version: u64, data: Vec<u8>) {
        self.files
            .write()
            .await
            .insert((bucket.to_string(), name.to_string()), (version, data));
    }
}

#[async_trait]
impl FileSource for MemoryFiles {
    async fn stat(&self, file: &FileRef) -> Option<FileStat> {
        let files = self.files.read().await;
        files
            .get(&(file.bucket_id.clone(), file.file_name.clone()))
            .map(|(version, data)| FileStat {
                size: data.len() as u64,
                version: *version,
            })
    }

    async fn read_range(
        &self,
        file: &FileRef,
        version: u64,
        range: &ChunkRange,
    ) -> std::io::Result<Vec<u8>> {
        let files = self.files.read().await;
        match files.get(&(file.bucket_id.clone(), file.file_name.clone())) {
            Some((held, data)) if *held == version && (range.end as usize) < data.len() => {
                Ok(data[range.start as usize..=range.end as usize].to_vec())
            }
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no such file version",
            )),
        }
    }
}

pub struct TestNode {
    pub dht: Dht<TestNetwork>,
    pub files: Arc<MemoryFiles>,
    pub network: TestNetwork,
}

impl TestNode {
    pub async fn new(registry: Arc<NetworkRegistry>, index: u32, config: DhtConfig) -> Self {
        Self::with_contact(registry, make_contact(index), config).await
    }

    pub async fn with_contact(
        registry: Arc<NetworkRegistry>,
        contact: Contact,
        config: DhtConfig,
    ) -> Self {
        let network = TestNetwork::new(registry.clone());
        let dht = Dht::new(contact.clone(), Arc::new(network.clone()), config);
        let files = Arc::new(MemoryFiles::default());
        let handler = RequestHandler::new(dht.node()).with_files(files.clone());
        registry.register(&contact.endpoint, Arc::new(handler)).await;
        Self {
            dht,
            files,
            network,
        }
    }

    pub fn contact(&self) -> Contact {
        self.dht.our_contact().clone()
    }
}

/// An id whose first four bytes are `index`, big-endian.
pub fn make_node_id(index: u32) -> Identifier {
    let mut id = [0u8; ID_LEN];
    id[..4].copy_from_slice(&index.to_be_bytes());
    Identifier::from_array(id)
}

/// An id with only the first byte set.
pub fn id_with_first_byte(byte: u8) -> Identifier {
    let mut id = [0u8; ID_LEN];
    id[0] = byte;
    Identifier::from_array(id)
}

pub fn make_contact(index: u32) -> Contact {
    Contact::new(
        make_node_id(index),
        format!("node-{index}"),
        format!("machine-{index}"),
    )
    .with_buckets(["shared"])
}

pub fn small_config(k: usize) -> DhtConfig {
    DhtConfig {
        k,
        ..DhtConfig::default()
    }
}
