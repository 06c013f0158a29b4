//! TCP transport: one connection per request, one frame each way.

use std::io;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

use crate::config::RpcTimeouts;
use crate::framing::{read_frame, write_frame};
use crate::rpc::{RpcError, Transport};

/// [`Transport`] over plain TCP, for peers on the same LAN.
///
/// Each phase (connect, send, receive) runs under its own timeout; expiry
/// maps to [`RpcErrorKind::Timeout`](crate::rpc::RpcErrorKind::Timeout),
/// socket failures on our side to `LocalError`, and a peer hanging up
/// without answering to `RemoteError`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send_and_receive(
        &self,
        endpoint: &str,
        request: Vec<u8>,
        timeouts: &RpcTimeouts,
    ) -> Result<Vec<u8>, RpcError> {
        let mut stream = match timeout(timeouts.connect, TcpStream::connect(endpoint)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(RpcError::local(format!("connect {endpoint}: {err}"))),
            Err(_) => return Err(RpcError::timeout(format!("connect {endpoint}"))),
        };
        if let Err(err) = stream.set_nodelay(true) {
            trace!(endpoint, error = %err, "could not disable nagle");
        }

        match timeout(timeouts.send, write_frame(&mut stream, &request)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(RpcError::local(format!("send to {endpoint}: {err}"))),
            Err(_) => return Err(RpcError::timeout(format!("send to {endpoint}"))),
        }

        match timeout(timeouts.receive, read_frame(&mut stream)).await {
            Ok(Ok(Some(bytes))) => Ok(bytes),
            Ok(Ok(None)) => Err(RpcError::remote(format!("{endpoint} closed without answering"))),
            Ok(Err(err)) if err.kind() == io::ErrorKind::InvalidData => {
                Err(RpcError::remote(format!("bad frame from {endpoint}: {err}")))
            }
            Ok(Err(err)) => Err(RpcError::local(format!("receive from {endpoint}: {err}"))),
            Err(_) => Err(RpcError::timeout(format!("receive from {endpoint}"))),
        }
    }
}
