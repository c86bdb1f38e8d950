//! Garbage collection (spec §6, GC hooks; §4.3 `reachable`). The driver
//! itself holds no policy about *when* to run — callers invoke [`collect`]
//! under their own external exclusion (spec §5: "GC is expected to be run
//! with external exclusion"). Mirrors the callback-registry shape
//! `tvix_castore`'s `blobservice`/`directoryservice` pair exposes to
//! external owners, generalized into a single reachable-digest callback type.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;

use tracing::instrument;

use crate::cas_store::{CASStore, ReachableOptions};
use crate::digest::Digest;
use crate::errors::Error;

/// An external source of reachable digests (spec §6: "register a callback
/// producing reachable digests"). Used by collaborators that hold digests
/// not reachable from any `RefStore` entry — e.g. an in-flight build's
/// working set.
pub type ReachabilityCallback = Box<
    dyn Fn() -> Pin<Box<dyn Future<Output = Result<HashSet<Digest>, Error>> + Send>> + Send + Sync,
>;

/// Holds the external callbacks [`collect`] unions with the ref-reachable
/// set. Construct once, register every collaborator, then reuse across
/// collection runs.
#[derive(Default)]
pub struct GcRegistry {
    callbacks: Vec<ReachabilityCallback>,
}

impl GcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, callback: ReachabilityCallback) {
        self.callbacks.push(callback);
    }
}

/// Outcome of a [`collect`] run.
#[derive(Debug, Clone, Default)]
pub struct GcReport {
    /// Digests kept because some ref or registered callback reaches them.
    pub reachable_count: usize,
    /// Digests unlinked because nothing reaches them.
    pub swept: Vec<Digest>,
}

/// Unions the reachable set of every named ref in `store` with every
/// callback registered on `registry`, then deletes every on-disk object not
/// in that union (spec §6). Directory blobs and file blobs are swept
/// identically — both live in the same `BlobStore`.
#[instrument(skip(store, registry), err)]
pub async fn collect(store: &CASStore, registry: &GcRegistry) -> Result<GcReport, Error> {
    let mut live = HashSet::new();

    for name in store.refs().list().await? {
        let digest = match store.refs().get(&name).await {
            Ok(d) => d,
            Err(Error::RefMissing(_)) => continue,
            Err(e) => return Err(e),
        };
        let opts = ReachableOptions {
            update_mtime: false,
            check_exists: false,
        };
        live.extend(store.reachable(&digest, opts).await?);
    }

    for callback in &registry.callbacks {
        live.extend(callback().await?);
    }

    let mut swept = Vec::new();
    for digest in store.blobs().list_digests().await? {
        if !live.contains(&digest) {
            store.blobs().remove(&digest).await?;
            swept.push(digest);
        }
    }

    Ok(GcReport {
        reachable_count: live.len(),
        swept,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory_codec::DirectoryCodec;
    use crate::nodes::{Directory, FileNode, Node};

    async fn insert_dir(store: &CASStore, dir: &Directory) -> Digest {
        let bytes = DirectoryCodec::encode(dir);
        store.blobs().insert_bytes(&bytes).await.unwrap()
    }

    #[tokio::test]
    async fn sweeps_blobs_unreachable_from_any_ref() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CASStore::open(tmp.path()).await.unwrap();

        let kept_blob = store.blobs().insert_bytes(b"kept").await.unwrap();
        let mut kept_dir = Directory::new();
        kept_dir
            .add(Node::File(FileNode::new("f", kept_blob.clone(), false)))
            .unwrap();
        let kept_digest = insert_dir(&store, &kept_dir).await;
        store.refs().set("main", &kept_digest).await.unwrap();

        let orphan_blob = store.blobs().insert_bytes(b"orphan").await.unwrap();

        let registry = GcRegistry::new();
        let report = collect(&store, &registry).await.unwrap();

        assert!(report.swept.contains(&orphan_blob));
        assert!(!report.swept.contains(&kept_blob));
        assert!(!report.swept.contains(&kept_digest));
        assert!(store.blobs().contains(&kept_blob).await.unwrap());
        assert!(!store.blobs().contains(&orphan_blob).await.unwrap());
    }

    #[tokio::test]
    async fn registered_callback_keeps_blob_alive() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CASStore::open(tmp.path()).await.unwrap();

        let external_blob = store.blobs().insert_bytes(b"held externally").await.unwrap();

        let mut registry = GcRegistry::new();
        let held = external_blob.clone();
        registry.register(Box::new(move || {
            let held = held.clone();
            Box::pin(async move {
                let mut set = HashSet::new();
                set.insert(held);
                Ok(set)
            })
        }));

        let report = collect(&store, &registry).await.unwrap();
        assert!(!report.swept.contains(&external_blob));
        assert!(store.blobs().contains(&external_blob).await.unwrap());
    }

    #[tokio::test]
    async fn empty_store_collects_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CASStore::open(tmp.path()).await.unwrap();
        let registry = GcRegistry::new();
        let report = collect(&store, &registry).await.unwrap();
        assert_eq!(report.reachable_count, 0);
        assert!(report.swept.is_empty());
    }
}
