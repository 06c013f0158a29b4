//! Inbound request dispatch and the TCP accept loop.

use std::sync::Arc;

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::contact::Contact;
use crate::files::FileSource;
use crate::framing::{read_frame, write_frame};
use crate::node::DhtNode;
use crate::protocol::{Request, Response};
use crate::rpc::Transport;

/// Turns decoded [`Request`]s into [`Response`]s.
///
/// DHT calls go to the [`DhtNode`]; file calls go to the optional
/// [`FileSource`]. A node without one answers file calls with an error.
pub struct RequestHandler<T: Transport> {
    node: DhtNode<T>,
    files: Option<Arc<dyn FileSource>>,
}

impl<T: Transport> RequestHandler<T> {
    pub fn new(node: DhtNode<T>) -> Self {
        Self { node, files: None }
    }

    pub fn with_files(mut self, files: Arc<dyn FileSource>) -> Self {
        self.files = Some(files);
        self
    }

    pub fn node(&self) -> &DhtNode<T> {
        &self.node
    }

    /// Answer one request. Never fails: problems become [`Response::Error`].
    pub async fn handle_request(&self, request: Request) -> Response {
        match request {
            Request::Ping(req) => {
                self.node.ping(Contact::from(req.sender)).await;
                Response::Ping {
                    random_id: req.random_id,
                }
            }
            Request::Store(req) => {
                self.node
                    .store(
                        Contact::from(req.sender),
                        req.key,
                        req.value,
                        req.is_cached,
                        req.expiration_secs,
                    )
                    .await;
                Response::Store {
                    random_id: req.random_id,
                }
            }
            Request::FindNode(req) => {
                let contacts = self.node.find_node(Contact::from(req.sender), req.key).await;
                Response::FindNode {
                    random_id: req.random_id,
                    contacts: contacts.iter().map(Into::into).collect(),
                }
            }
            Request::FindValue(req) => {
                let reply = self
                    .node
                    .find_value(Contact::from(req.sender), req.key)
                    .await;
                Response::FindValue {
                    random_id: req.random_id,
                    contacts: reply.contacts.iter().map(Into::into).collect(),
                    value: reply.value,
                }
            }
            Request::FileExists(req) => {
                let Some(files) = &self.files else {
                    return not_shared();
                };
                match files.stat(&req.file).await {
                    Some(stat) => Response::FileExists {
                        file_size: stat.size,
                        file_version: stat.version,
                    },
                    None => not_shared(),
                }
            }
            Request::DownloadChunk(req) => {
                let Some(files) = &self.files else {
                    return not_shared();
                };
                match files.read_range(&req.file, req.version, &req.range).await {
                    Ok(data) => Response::Chunk { data },
                    Err(err) => {
                        debug!(file = %req.file.file_name, from = %req.sender_id, error = %err, "chunk read failed");
                        Response::Error {
                            message: err.to_string(),
                        }
                    }
                }
            }
        }
    }

    /// Decode, dispatch and encode one frame's worth of request.
    pub async fn handle_bytes(&self, bytes: &[u8]) -> Vec<u8> {
        let response = match serde_json::from_slice::<Request>(bytes) {
            Ok(request) => self.handle_request(request).await,
            Err(err) => Response::Error {
                message: format!("malformed request: {err}"),
            },
        };
        serde_json::to_vec(&response).unwrap_or_else(|err| {
            warn!(error = %err, "could not encode response");
            br#"{"Error":{"message":"internal error"}}"#.to_vec()
        })
    }
}

fn not_shared() -> Response {
    Response::Error {
        message: "file not shared".into(),
    }
}

/// Serve requests on one connection until the peer hangs up.
pub async fn handle_connection<T: Transport>(
    handler: Arc<RequestHandler<T>>,
    mut stream: TcpStream,
) -> Result<()> {
    while let Some(bytes) = read_frame(&mut stream).await? {
        let reply = handler.handle_bytes(&bytes).await;
        write_frame(&mut stream, &reply).await?;
    }
    Ok(())
}

/// Accept connections until `cancel` fires, one task per connection.
pub async fn serve<T: Transport>(
    listener: TcpListener,
    handler: Arc<RequestHandler<T>>,
    cancel: CancellationToken,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "listening");
    }
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                warn!(error = %err, "accept failed");
                continue;
            }
        };
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(handler, stream).await {
                debug!(%peer, error = %err, "connection ended with error");
            }
        });
    }
    Ok(())
}
