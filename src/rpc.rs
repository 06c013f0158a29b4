//! Outbound RPCs and their error classification.
//!
//! [`Transport`] abstracts the socket layer so the DHT and download logic work
//! over TCP in production ([`crate::net::TcpTransport`]) and over an
//! in-memory registry in tests. [`RpcClient`] encodes requests, enforces the
//! overall deadline, validates the echoed random id and turns every failure
//! into an [`RpcError`] value.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::timeout;
use tracing::trace;

use crate::config::RpcTimeouts;
use crate::contact::Contact;
use crate::download::ChunkRange;
use crate::id::Identifier;
use crate::protocol::{
    ChunkFetchRequest, ContactInfo, FileExistsRequest, FileRef, FindNodeRequest, FindValueRequest,
    PingRequest, Request, Response, StoreRequest,
};

/// How an RPC failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RpcErrorKind {
    /// No answer within the deadline.
    Timeout,
    /// Failure on our side: encoding, connect refused, socket error.
    LocalError,
    /// The peer answered with an error or something undecodable.
    RemoteError,
    /// The peer answered a different request.
    IdMismatch,
}

impl fmt::Display for RpcErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RpcErrorKind::Timeout => "timeout",
            RpcErrorKind::LocalError => "local error",
            RpcErrorKind::RemoteError => "remote error",
            RpcErrorKind::IdMismatch => "id mismatch",
        };
        f.write_str(label)
    }
}

/// Outcome of a failed RPC, returned as a value rather than propagated.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct RpcError {
    pub kind: RpcErrorKind,
    pub message: String,
}

impl RpcError {
    pub fn new(kind: RpcErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::Timeout, message)
    }

    pub fn local(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::LocalError, message)
    }

    pub fn remote(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::RemoteError, message)
    }
}

/// Byte-level request/response exchange with a remote endpoint.
///
/// Implementations must answer each call with exactly one response or a
/// classified error, and honour the per-phase timeouts they are handed.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send_and_receive(
        &self,
        endpoint: &str,
        request: Vec<u8>,
        timeouts: &RpcTimeouts,
    ) -> Result<Vec<u8>, RpcError>;
}

/// Size and version a holder reports for a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub version: u64,
}

/// Typed RPC front-end over a [`Transport`].
pub struct RpcClient<T: Transport> {
    transport: Arc<T>,
    sender: ContactInfo,
    timeouts: RpcTimeouts,
}

impl<T: Transport> Clone for RpcClient<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            sender: self.sender.clone(),
            timeouts: self.timeouts,
        }
    }
}

impl<T: Transport> RpcClient<T> {
    pub fn new(transport: Arc<T>, sender: &Contact, timeouts: RpcTimeouts) -> Self {
        Self {
            transport,
            sender: ContactInfo::from(sender),
            timeouts,
        }
    }

    /// The contact advertised as sender in every request.
    pub fn sender(&self) -> &ContactInfo {
        &self.sender
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Send one request and decode its response.
    pub async fn call(&self, to: &Contact, request: &Request) -> Result<Response, RpcError> {
        let bytes = serde_json::to_vec(request)
            .map_err(|err| RpcError::local(format!("encode request: {err}")))?;
        let deadline = self.timeouts.total();
        let raw = match timeout(
            deadline,
            self.transport
                .send_and_receive(&to.endpoint, bytes, &self.timeouts),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(RpcError::timeout(format!(
                    "no response from {} within {deadline:?}",
                    to.endpoint
                )))
            }
        };
        let response: Response = serde_json::from_slice(&raw)
            .map_err(|err| RpcError::remote(format!("decode response: {err}")))?;
        if let Response::Error { message } = response {
            return Err(RpcError::remote(message));
        }
        Ok(response)
    }

    /// Liveness check; succeeds only if the peer echoes our random id.
    pub async fn ping(&self, to: &Contact) -> Result<(), RpcError> {
        let random_id = Identifier::random();
        let request = Request::Ping(PingRequest {
            random_id,
            sender: self.sender.clone(),
        });
        match self.call(to, &request).await? {
            Response::Ping { random_id: echoed } => check_echo(random_id, echoed),
            other => Err(unexpected("ping", &other)),
        }
    }

    /// Ask `to` to hold `key -> value`.
    pub async fn store(
        &self,
        to: &Contact,
        key: Identifier,
        value: &str,
        is_cached: bool,
        expiration_secs: u64,
    ) -> Result<(), RpcError> {
        let random_id = Identifier::random();
        let request = Request::Store(StoreRequest {
            random_id,
            sender: self.sender.clone(),
            key,
            value: value.to_string(),
            is_cached,
            expiration_secs,
        });
        match self.call(to, &request).await? {
            Response::Store { random_id: echoed } => check_echo(random_id, echoed),
            other => Err(unexpected("store", &other)),
        }
    }

    /// Contacts `to` knows closest to `key`.
    pub async fn find_node(&self, to: &Contact, key: Identifier) -> Result<Vec<Contact>, RpcError> {
        let random_id = Identifier::random();
        let request = Request::FindNode(FindNodeRequest {
            random_id,
            sender: self.sender.clone(),
            key,
        });
        match self.call(to, &request).await? {
            Response::FindNode {
                random_id: echoed,
                contacts,
            } => {
                check_echo(random_id, echoed)?;
                trace!(peer = %to.id, returned = contacts.len(), "find_node answered");
                Ok(contacts.into_iter().map(Contact::from).collect())
            }
            other => Err(unexpected("find_node", &other)),
        }
    }

    /// The value under `key` if `to` holds it, otherwise closer contacts.
    pub async fn find_value(
        &self,
        to: &Contact,
        key: Identifier,
    ) -> Result<(Option<String>, Vec<Contact>), RpcError> {
        let random_id = Identifier::random();
        let request = Request::FindValue(FindValueRequest {
            random_id,
            sender: self.sender.clone(),
            key,
        });
        match self.call(to, &request).await? {
            Response::FindValue {
                random_id: echoed,
                contacts,
                value,
            } => {
                check_echo(random_id, echoed)?;
                Ok((value, contacts.into_iter().map(Contact::from).collect()))
            }
            other => Err(unexpected("find_value", &other)),
        }
    }

    /// Size and version of `file` on `to`.
    pub async fn file_exists(&self, to: &Contact, file: &FileRef) -> Result<FileStat, RpcError> {
        let request = Request::FileExists(FileExistsRequest {
            sender_id: self.sender.id,
            machine_id: self.sender.machine_id.clone(),
            file: file.clone(),
        });
        match self.call(to, &request).await? {
            Response::FileExists {
                file_size,
                file_version,
            } => Ok(FileStat {
                size: file_size,
                version: file_version,
            }),
            other => Err(unexpected("file_exists", &other)),
        }
    }

    /// The bytes of `range` of `file` from `to`.
    pub async fn download_chunk(
        &self,
        to: &Contact,
        file: &FileRef,
        version: u64,
        range: ChunkRange,
        undownloaded: Vec<u64>,
    ) -> Result<Vec<u8>, RpcError> {
        let request = Request::DownloadChunk(ChunkFetchRequest {
            sender_id: self.sender.id,
            machine_id: self.sender.machine_id.clone(),
            file: file.clone(),
            version,
            range,
            undownloaded,
        });
        match self.call(to, &request).await? {
            Response::Chunk { data } => Ok(data),
            other => Err(unexpected("download_chunk", &other)),
        }
    }
}

fn check_echo(sent: Identifier, echoed: Identifier) -> Result<(), RpcError> {
    if sent == echoed {
        Ok(())
    } else {
        Err(RpcError::new(
            RpcErrorKind::IdMismatch,
            format!("sent random id {sent}, got {echoed}"),
        ))
    }
}

fn unexpected(call: &str, response: &Response) -> RpcError {
    RpcError::remote(format!("unexpected {} response to {call}", response.kind()))
}
