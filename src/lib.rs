//! # kadshare
//!
//! A LAN peer-to-peer node: a Kademlia DHT with 160-bit identifiers plus a
//! chunked download engine that pulls one file from many peers in parallel.
//!
//! - [`id`], [`contact`], [`bucket`], [`routing`]: identifiers and the
//!   dynamically split routing table.
//! - [`storage`]: the originator, republish and cache value stores.
//! - [`dht`]: the engine (lookups, store, find value, eviction, maintenance,
//!   snapshots); [`node`] answers inbound requests against it.
//! - [`protocol`], [`rpc`], [`framing`], [`net`], [`server`]: wire messages,
//!   the typed RPC client, length-prefixed frames, the TCP transport and the
//!   accept loop.
//! - [`files`], [`download`]: shared-file identity, serving, and the
//!   multi-peer download engine.
//!
//! ## Getting started
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use kadshare::{Contact, Dht, DhtConfig, Identifier, RequestHandler, TcpTransport};
//! use tokio::net::TcpListener;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn launch() -> anyhow::Result<()> {
//! let listener = TcpListener::bind("0.0.0.0:7400").await?;
//! let me = Contact::new(Identifier::random(), "192.168.1.10:7400", "workstation-1");
//! let dht = Dht::new(me, Arc::new(TcpTransport::new()), DhtConfig::default());
//! dht.start();
//!
//! let handler = Arc::new(RequestHandler::new(dht.node()));
//! tokio::spawn(kadshare::server::serve(listener, handler, CancellationToken::new()));
//!
//! dht.store(Identifier::from_key("greeting"), "hello").await;
//! # Ok(())
//! # }
//! ```

pub mod bucket;
pub mod config;
pub mod contact;
pub mod dht;
pub mod download;
pub mod error;
pub mod files;
pub mod framing;
pub mod id;
pub mod net;
pub mod node;
pub mod protocol;
pub mod registry;
pub mod routing;
pub mod rpc;
pub mod server;
pub mod storage;

pub use config::{DhtConfig, DownloadConfig, NodeConfig, RpcTimeouts};
pub use contact::Contact;
pub use dht::{Dht, DhtSnapshot, LookupResult, StoreKind};
pub use download::{DownloadEngine, DownloadPlanner, FileChangesNotifier, OnlineContacts};
pub use error::DownloadError;
pub use files::{DirFileSource, FileDescriptor, FileSource};
pub use id::{BucketRange, Identifier};
pub use net::TcpTransport;
pub use node::DhtNode;
pub use registry::DhtRegistry;
pub use routing::{AddOutcome, RoutingTable};
pub use rpc::{RpcClient, RpcError, RpcErrorKind, Transport};
pub use server::RequestHandler;
