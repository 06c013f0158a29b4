//! Nodes talking over real loopback TCP sockets.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use kadshare::files::FileSource;
use kadshare::protocol::FileRef;
use kadshare::{
    Contact, Dht, DhtConfig, DirFileSource, DownloadConfig, DownloadEngine, DownloadPlanner,
    FileDescriptor, Identifier, OnlineContacts, RequestHandler, RpcErrorKind, TcpTransport,
};

struct TcpNode {
    dht: Dht<TcpTransport>,
    cancel: CancellationToken,
    server: JoinHandle<anyhow::Result<()>>,
}

impl TcpNode {
    async fn spawn(machine: &str, share: Option<&std::path::Path>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind loopback");
        let endpoint = listener.local_addr().expect("local addr").to_string();
        let me = Contact::new(Identifier::random(), endpoint, machine).with_buckets(["docs"]);
        let dht = Dht::new(me, Arc::new(TcpTransport::new()), DhtConfig::default());

        let mut handler = RequestHandler::new(dht.node());
        if let Some(dir) = share {
            handler = handler.with_files(Arc::new(DirFileSource::new(dir)));
        }
        let cancel = CancellationToken::new();
        let server = tokio::spawn(kadshare::server::serve(
            listener,
            Arc::new(handler),
            cancel.clone(),
        ));
        Self {
            dht,
            cancel,
            server,
        }
    }

    fn contact(&self) -> Contact {
        self.dht.our_contact().clone()
    }

    async fn stop(self) {
        self.cancel.cancel();
        self.server
            .await
            .expect("server task")
            .expect("server exits cleanly");
    }
}

#[tokio::test]
async fn ping_store_and_find_over_tcp() {
    let alice = TcpNode::spawn("alice", None).await;
    let bob = TcpNode::spawn("bob", None).await;

    alice
        .dht
        .rpc()
        .ping(&bob.contact())
        .await
        .expect("ping over tcp");

    let learned = alice
        .dht
        .bootstrap(bob.contact())
        .await
        .expect("bootstrap over tcp");
    assert_eq!(learned, 0);

    let key = Identifier::from_key("readme");
    assert_eq!(alice.dht.store(key, "hello over tcp").await, 1);

    let carol = TcpNode::spawn("carol", None).await;
    carol.dht.add_contact(bob.contact()).await;
    let found = carol.dht.find_value(key).await;
    assert_eq!(found.value.as_deref(), Some("hello over tcp"));
    assert_eq!(found.found_by.map(|c| c.id), Some(bob.contact().id));

    for node in [alice, bob, carol] {
        node.stop().await;
    }
}

#[tokio::test]
async fn unreachable_peer_is_a_local_error() {
    let alice = TcpNode::spawn("alice", None).await;
    let closed = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let endpoint = closed.local_addr().expect("addr").to_string();
    drop(closed);

    let ghost = Contact::new(Identifier::random(), endpoint, "ghost");
    let err = alice.dht.rpc().ping(&ghost).await.expect_err("nobody listens");
    assert_eq!(err.kind, RpcErrorKind::LocalError);

    alice.stop().await;
}

#[tokio::test]
async fn file_download_over_tcp() {
    let shared = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir_all(shared.path().join("docs")).expect("bucket dir");
    let data: Vec<u8> = (0..300_000u32).map(|i| (i % 253) as u8).collect();
    std::fs::write(shared.path().join("docs").join("manual.pdf"), &data).expect("write");

    let holder_a = TcpNode::spawn("holder-a", Some(shared.path())).await;
    let holder_b = TcpNode::spawn("holder-b", Some(shared.path())).await;
    let requester = TcpNode::spawn("requester", None).await;

    let file_ref = FileRef {
        bucket_id: "docs".into(),
        file_name: "manual.pdf".into(),
        hex_prefix: "c0ffee".into(),
    };
    let stat = DirFileSource::new(shared.path())
        .stat(&file_ref)
        .await
        .expect("file is shared");
    let descriptor = FileDescriptor {
        bucket_id: "docs".into(),
        name: "manual.pdf".into(),
        hex_prefix: "c0ffee".into(),
        version: stat.version,
        size: stat.size,
    };

    let rpc = requester.dht.rpc().clone();
    let config = DownloadConfig {
        max_chunk_size: 64 * 1024,
        min_free_reserve: 0,
        ..DownloadConfig::default()
    };
    let online: Arc<dyn OnlineContacts> = Arc::new(requester.dht.clone());
    let engine = DownloadEngine::new(DownloadPlanner::new(rpc.clone(), config), rpc, online);

    let out = tempfile::tempdir().expect("tempdir");
    let target = out.path().join("manual.pdf");
    let report = engine
        .download(
            &descriptor,
            &target,
            vec![holder_a.contact(), holder_b.contact()],
            &CancellationToken::new(),
        )
        .await
        .expect("download over tcp");

    assert_eq!(report.bytes, data.len() as u64);
    assert_eq!(report.served_by.len(), 2);
    assert_eq!(std::fs::read(&target).expect("read target"), data);

    for node in [holder_a, holder_b, requester] {
        node.stop().await;
    }
}
