//! Wire messages exchanged between nodes.
//!
//! Every message is serialized as JSON and carried in a single
//! length-prefixed frame (see [`crate::framing`]). DHT requests carry a
//! random id that the response must echo.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::contact::Contact;
use crate::download::ChunkRange;
use crate::id::Identifier;

/// Contact as it travels on the wire: no local timestamps.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInfo {
    pub id: Identifier,
    pub endpoint: String,
    #[serde(default)]
    pub machine_id: String,
    #[serde(default)]
    pub buckets: BTreeSet<String>,
}

impl From<&Contact> for ContactInfo {
    fn from(contact: &Contact) -> Self {
        Self {
            id: contact.id,
            endpoint: contact.endpoint.clone(),
            machine_id: contact.machine_id.clone(),
            buckets: contact.buckets.clone(),
        }
    }
}

impl From<ContactInfo> for Contact {
    fn from(info: ContactInfo) -> Self {
        let mut contact = Contact::new(info.id, info.endpoint, info.machine_id);
        contact.buckets = info.buckets;
        contact
    }
}

/// Liveness check.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PingRequest {
    pub random_id: Identifier,
    pub sender: ContactInfo,
}

/// Ask a node to hold `key -> value`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreRequest {
    pub random_id: Identifier,
    pub sender: ContactInfo,
    pub key: Identifier,
    pub value: String,
    /// Cached copies go to the cache store with `expiration_secs` TTL.
    pub is_cached: bool,
    pub expiration_secs: u64,
}

/// Ask for the contacts closest to `key`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FindNodeRequest {
    pub random_id: Identifier,
    pub sender: ContactInfo,
    pub key: Identifier,
}

/// Ask for the value under `key`, or closer contacts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FindValueRequest {
    pub random_id: Identifier,
    pub sender: ContactInfo,
    pub key: Identifier,
}

/// Identity of a shared file as both sides name it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub bucket_id: String,
    pub file_name: String,
    pub hex_prefix: String,
}

/// Does the receiver hold this file, and at what size/version?
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileExistsRequest {
    pub sender_id: Identifier,
    pub machine_id: String,
    pub file: FileRef,
}

/// Fetch the bytes of `range` of a file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkFetchRequest {
    pub sender_id: Identifier,
    pub machine_id: String,
    pub file: FileRef,
    pub version: u64,
    pub range: ChunkRange,
    /// Chunk indices the requester still misses, for the holder's bookkeeping.
    #[serde(default)]
    pub undownloaded: Vec<u64>,
}

/// All inbound calls.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Request {
    Ping(PingRequest),
    Store(StoreRequest),
    FindNode(FindNodeRequest),
    FindValue(FindValueRequest),
    FileExists(FileExistsRequest),
    DownloadChunk(ChunkFetchRequest),
}

/// All replies. `Error` reports a failure on the remote side.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Response {
    Ping {
        random_id: Identifier,
    },
    Store {
        random_id: Identifier,
    },
    FindNode {
        random_id: Identifier,
        contacts: Vec<ContactInfo>,
    },
    FindValue {
        random_id: Identifier,
        #[serde(default)]
        contacts: Vec<ContactInfo>,
        #[serde(default)]
        value: Option<String>,
    },
    FileExists {
        file_size: u64,
        file_version: u64,
    },
    Chunk {
        #[serde(with = "hex_bytes")]
        data: Vec<u8>,
    },
    Error {
        message: String,
    },
}

impl Response {
    /// Variant name, for logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Response::Ping { .. } => "ping",
            Response::Store { .. } => "store",
            Response::FindNode { .. } => "find_node",
            Response::FindValue { .. } => "find_value",
            Response::FileExists { .. } => "file_exists",
            Response::Chunk { .. } => "chunk",
            Response::Error { .. } => "error",
        }
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
