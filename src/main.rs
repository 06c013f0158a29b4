//! Demo node: serves the DHT and a shared directory over TCP.
//!
//! # Usage
//!
//! ```bash
//! kadshare --listen 0.0.0.0:7400 --advertise 192.168.1.10:7400 \
//!     --share ./shared --bucket photos \
//!     --bootstrap 3f2a...9c@192.168.1.11:7400
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`). With `--snapshot` the
//! routing state is restored at start and saved again on Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kadshare::config::load_json;
use kadshare::{
    Contact, DhtSnapshot, DirFileSource, Dht, DhtRegistry, Identifier, NodeConfig,
    RequestHandler, TcpTransport,
};

/// Protocol version this binary registers its engine under.
const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Parser)]
#[command(name = "kadshare", about = "LAN Kademlia node with multi-peer file sharing")]
struct Args {
    /// Address to accept connections on.
    #[arg(long, default_value = "0.0.0.0:7400")]
    listen: String,
    /// Address peers should use to reach us; defaults to the listen address.
    #[arg(long)]
    advertise: Option<String>,
    /// Stable identity of this machine.
    #[arg(long, default_value = "")]
    machine_id: String,
    /// Known peer as `<hex id>@<host:port>`; may be repeated.
    #[arg(long)]
    bootstrap: Vec<String>,
    /// Directory served to peers as `<dir>/<bucket>/<file>`.
    #[arg(long)]
    share: Option<PathBuf>,
    /// File buckets this node participates in; may be repeated.
    #[arg(long)]
    bucket: Vec<String>,
    /// JSON config file; absent fields keep their defaults.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Routing-state snapshot to restore from and save to.
    #[arg(long)]
    snapshot: Option<PathBuf>,
    /// Store `key=value` once bootstrapped.
    #[arg(long)]
    put: Vec<String>,
    /// Look up a key once bootstrapped.
    #[arg(long)]
    get: Vec<String>,
}

fn parse_peer(peer_arg: &str) -> Result<Contact> {
    let (id, endpoint) = peer_arg
        .split_once('@')
        .ok_or_else(|| anyhow!("bootstrap peer {peer_arg:?} is not <id>@<host:port>"))?;
    let id: Identifier = id.parse().with_context(|| format!("bootstrap id in {peer_arg:?}"))?;
    Ok(Contact::new(id, endpoint, ""))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config: NodeConfig = match &args.config {
        Some(path) => load_json(path).with_context(|| format!("loading {}", path.display()))?,
        None => NodeConfig::default(),
    };

    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    let advertise = match &args.advertise {
        Some(addr) => addr.clone(),
        None => listener.local_addr()?.to_string(),
    };

    let transport = Arc::new(TcpTransport::new());
    let dht = match args.snapshot.as_deref().filter(|p| p.exists()) {
        Some(path) => {
            let snapshot = DhtSnapshot::load(path)
                .with_context(|| format!("reading snapshot {}", path.display()))?;
            info!(path = %path.display(), "restoring routing state");
            Dht::restore(snapshot, transport)?
        }
        None => {
            let me = Contact::new(Identifier::random(), advertise, args.machine_id.clone())
                .with_buckets(args.bucket.iter().cloned());
            let dht = Dht::new(me, transport, config.dht.clone());
            dht.start();
            dht
        }
    };
    info!(id = %dht.our_id(), endpoint = %dht.our_contact().endpoint, "node started");

    let registry = DhtRegistry::new();
    registry.register(PROTOCOL_VERSION, dht.clone()).await;

    let mut handler = RequestHandler::new(dht.node());
    if let Some(dir) = &args.share {
        info!(dir = %dir.display(), "sharing directory");
        handler = handler.with_files(Arc::new(DirFileSource::new(dir)));
    }
    let cancel = CancellationToken::new();
    let server = tokio::spawn(kadshare::server::serve(
        listener,
        Arc::new(handler),
        cancel.clone(),
    ));

    for peer_arg in &args.bootstrap {
        let peer = parse_peer(peer_arg)?;
        if let Err(err) = dht.bootstrap(peer).await {
            warn!(peer = %peer_arg, error = %err, "bootstrap failed");
        }
    }

    for entry in &args.put {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("--put expects key=value, got {entry:?}"))?;
        let replicas = dht.store(Identifier::from_key(key), value).await;
        info!(key = %key, replicas, "stored");
    }
    for key in &args.get {
        let result = dht.find_value(Identifier::from_key(key)).await;
        match result.value {
            Some(value) => info!(key = %key, value = %value, "found"),
            None => info!(key = %key, closest = result.contacts.len(), "not found"),
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    cancel.cancel();
    if let Some(path) = &args.snapshot {
        dht.snapshot()
            .await
            .save(path)
            .with_context(|| format!("saving snapshot {}", path.display()))?;
    }
    registry.shutdown_all().await;
    server.await??;
    Ok(())
}
