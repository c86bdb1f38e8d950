//! End-to-end replication scenarios: a real `tonic` server wrapping one
//! `CASStore`, talked to over a loopback TCP socket by a `RemoteClient`
//! bound to a second, independent `CASStore`. Mirrors the in-process
//! gRPC client/server pattern `tvix_castore::utils` uses for its own
//! proto-level tests, minus the UDS plumbing (a loopback port is simpler
//! to wire up from outside the crate and exercises the same RPCs).

use cas_engine::nodes::{Directory, FileNode, Node};
use cas_engine::{CASStore, Digest, DirectoryCodec, RemoteClient, RemoteClientConfig};
use tempfile::tempdir;

mod support {
    use cas_engine::server::{ByteStreamServiceWrapper, CasServiceWrapper, ReferenceServiceWrapper};
    use cas_engine::CASStore;
    use cas_engine::proto::byte_stream_server::ByteStreamServer;
    use cas_engine::proto::content_addressable_storage_server::ContentAddressableStorageServer;
    use cas_engine::proto::reference_storage_server::ReferenceStorageServer;
    use tokio::net::TcpListener;
    use tonic::transport::Server;

    /// Spawns a server exposing `store` over all three RPC services on an
    /// ephemeral loopback port, returning the port once it is accepting
    /// connections.
    pub async fn spawn_server(store: CASStore) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);
            Server::builder()
                .add_service(ContentAddressableStorageServer::new(CasServiceWrapper::new(
                    store.clone(),
                )))
                .add_service(ByteStreamServer::new(ByteStreamServiceWrapper::new(
                    store.clone(),
                )))
                .add_service(ReferenceStorageServer::new(ReferenceServiceWrapper::new(
                    store,
                )))
                .serve_with_incoming(incoming)
                .await
                .unwrap();
        });

        addr.port()
    }
}

async fn build_single_file_tree(store: &CASStore, contents: &[u8]) -> Digest {
    let blob_digest = store.blobs().insert_bytes(contents).await.unwrap();
    let mut dir = Directory::new();
    dir.add(Node::File(FileNode::new("payload", blob_digest, false)))
        .unwrap();
    let bytes = DirectoryCodec::encode(&dir);
    store.blobs().insert_bytes(&bytes).await.unwrap()
}

async fn connect_client(port: u16, local: CASStore) -> RemoteClient {
    let endpoint = format!("http://127.0.0.1:{port}");
    RemoteClient::connect(endpoint, local, RemoteClientConfig::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn pull_replicates_ref_and_every_required_blob() {
    let remote_root = tempdir().unwrap();
    let remote_store = CASStore::open(remote_root.path()).await.unwrap();

    let digest = build_single_file_tree(&remote_store, b"hello from remote").await;
    remote_store.refs().set("main", &digest).await.unwrap();

    let port = support::spawn_server(remote_store.clone()).await;

    let local_root = tempdir().unwrap();
    let local_store = CASStore::open(local_root.path()).await.unwrap();
    let mut client = connect_client(port, local_store.clone()).await;

    let ok = client.pull("main").await.unwrap();
    assert!(ok);

    let local_digest = local_store.refs().get("main").await.unwrap();
    assert_eq!(local_digest, digest);

    let dest = tempdir().unwrap();
    local_store.checkout(&digest, dest.path(), false).await.unwrap();
    let contents = tokio::fs::read(dest.path().join("payload")).await.unwrap();
    assert_eq!(contents, b"hello from remote");
}

#[tokio::test]
async fn pull_of_missing_ref_returns_false_without_creating_local_ref() {
    let remote_root = tempdir().unwrap();
    let remote_store = CASStore::open(remote_root.path()).await.unwrap();
    let port = support::spawn_server(remote_store).await;

    let local_root = tempdir().unwrap();
    let local_store = CASStore::open(local_root.path()).await.unwrap();
    let mut client = connect_client(port, local_store.clone()).await;

    let ok = client.pull("nonexistent").await.unwrap();
    assert!(!ok);
    assert!(local_store.refs().get("nonexistent").await.is_err());
}

#[tokio::test]
async fn push_then_pull_round_trips_through_separate_stores() {
    let source_root = tempdir().unwrap();
    let source_store = CASStore::open(source_root.path()).await.unwrap();
    let digest = build_single_file_tree(&source_store, b"pushed content").await;
    source_store.refs().set("release", &digest).await.unwrap();

    let relay_root = tempdir().unwrap();
    let relay_store = CASStore::open(relay_root.path()).await.unwrap();
    let port = support::spawn_server(relay_store.clone()).await;

    let mut pusher = connect_client(port, source_store.clone()).await;
    pusher.push(&["release".to_string()]).await.unwrap();

    assert_eq!(relay_store.refs().get("release").await.unwrap(), digest);

    let dest_root = tempdir().unwrap();
    let dest_store = CASStore::open(dest_root.path()).await.unwrap();
    let mut puller = connect_client(port, dest_store.clone()).await;
    assert!(puller.pull("release").await.unwrap());
    assert_eq!(dest_store.refs().get("release").await.unwrap(), digest);
}

#[tokio::test]
async fn push_is_a_noop_when_remote_already_matches() {
    let source_root = tempdir().unwrap();
    let source_store = CASStore::open(source_root.path()).await.unwrap();
    let digest = build_single_file_tree(&source_store, b"already there").await;
    source_store.refs().set("main", &digest).await.unwrap();

    let relay_root = tempdir().unwrap();
    let relay_store = CASStore::open(relay_root.path()).await.unwrap();
    relay_store.refs().set("main", &digest).await.unwrap();
    let port = support::spawn_server(relay_store.clone()).await;

    let mut pusher = connect_client(port, source_store.clone()).await;
    // The remote already has this exact digest; push must not error even
    // though none of the blobs were replicated ahead of time.
    pusher.push(&["main".to_string()]).await.unwrap();
    assert_eq!(relay_store.refs().get("main").await.unwrap(), digest);
}
