//! Tunables for the DHT and the download engine.
//!
//! Every field has a default so a JSON config only needs to name what it
//! overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default bucket size and replication factor.
pub const DEFAULT_K: usize = 20;
/// Default parallelism for iterative lookups.
pub const DEFAULT_ALPHA: usize = 3;
/// Far buckets may only split while their shared prefix is not a multiple of this.
pub const DEFAULT_B: usize = 5;
/// Consecutive failures before a contact is evicted.
pub const DEFAULT_EVICTION_LIMIT: u32 = 5;
/// Lifetime of republished and cached values (24 hours).
pub const EXPIRATION_TIME_SECONDS: u64 = 86_400;
/// Largest unit of a chunked transfer (1 MiB).
pub const MAX_CHUNK_SIZE: u64 = 1024 * 1024;
/// Number of holders probed for large files.
pub const HOLDER_FAN_OUT: usize = 10;
/// Upper bound on concurrent RPCs and chunk workers.
pub const MAX_PARALLELISM: usize = 20;

/// Per-call RPC timeouts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcTimeouts {
    #[serde(with = "millis")]
    pub connect: Duration,
    #[serde(with = "millis")]
    pub send: Duration,
    #[serde(with = "millis")]
    pub receive: Duration,
}

impl Default for RpcTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(2),
            send: Duration::from_secs(2),
            receive: Duration::from_secs(10),
        }
    }
}

impl RpcTimeouts {
    /// Longest a single call may hold a connection: connect + send + send + receive.
    pub fn total(&self) -> Duration {
        self.connect + self.send + self.send + self.receive
    }
}

/// DHT engine parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    pub k: usize,
    pub alpha: usize,
    pub b: usize,
    pub eviction_limit: u32,
    /// Bound on contacts waiting for a free bucket slot.
    pub max_pending_contacts: usize,
    pub expiration_secs: u64,
    #[serde(with = "millis")]
    pub bucket_refresh_interval: Duration,
    #[serde(with = "millis")]
    pub republish_interval: Duration,
    #[serde(with = "millis")]
    pub originator_republish_interval: Duration,
    #[serde(with = "millis")]
    pub expiry_check_interval: Duration,
    /// Capacity of each key/value store.
    pub store_capacity: usize,
    pub rpc_timeouts: RpcTimeouts,
    pub max_parallelism: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            b: DEFAULT_B,
            eviction_limit: DEFAULT_EVICTION_LIMIT,
            max_pending_contacts: 64,
            expiration_secs: EXPIRATION_TIME_SECONDS,
            bucket_refresh_interval: Duration::from_secs(60 * 60),
            republish_interval: Duration::from_secs(60 * 60),
            originator_republish_interval: Duration::from_secs(24 * 60 * 60),
            expiry_check_interval: Duration::from_secs(60),
            store_capacity: 100_000,
            rpc_timeouts: RpcTimeouts::default(),
            max_parallelism: MAX_PARALLELISM,
        }
    }
}

/// Download engine parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub max_chunk_size: u64,
    pub holder_fan_out: usize,
    pub max_workers: usize,
    /// Free space that must remain after the file is allocated.
    pub min_free_reserve: u64,
    /// Fallback directories when the target volume is too full.
    pub alternate_dirs: Vec<PathBuf>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: MAX_CHUNK_SIZE,
            holder_fan_out: HOLDER_FAN_OUT,
            max_workers: MAX_PARALLELISM,
            min_free_reserve: 64 * 1024 * 1024,
            alternate_dirs: Vec::new(),
        }
    }
}

/// Top-level config file layout used by the binary.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub dht: DhtConfig,
    pub download: DownloadConfig,
}

/// Read a JSON config file; absent fields take their defaults.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
