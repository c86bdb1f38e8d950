//! High-level tree operations composing [`BlobStore`], [`RefStore`] and
//! [`DirectoryCodec`] (spec §4.3, `CASStore`). Grounded on the traversal
//! shapes in `tvix_castore::directoryservice`'s recursive `get`/`put` walks,
//! generalized to the checkout/diff/reachability contract spec §4.3 and §9
//! describe.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tokio::io::AsyncReadExt;
use tracing::instrument;

use crate::blob_store::BlobStore;
use crate::digest::Digest;
use crate::directory_codec::DirectoryCodec;
use crate::errors::Error;
use crate::nodes::{Directory, Node};
use crate::ref_store::RefStore;

/// A self-contained handle bound to one CAS root (spec §9: "there is no
/// global state"). Callers create and destroy freely.
#[derive(Clone)]
pub struct CASStore {
    blobs: BlobStore,
    refs: RefStore,
    root: PathBuf,
}

/// Controls for [`CASStore::reachable`] (spec §4.3).
#[derive(Debug, Clone, Copy, Default)]
pub struct ReachableOptions {
    /// Touch every visited object's mtime, marking it recently used.
    pub update_mtime: bool,
    /// Raise `BlobMissing`/`DirectoryDecode` on the first absent object
    /// instead of silently omitting it from the result.
    pub check_exists: bool,
}

impl CASStore {
    /// Opens a CAS rooted at `root` (the directory laid out as
    /// `objects/`, `refs/heads/`, `tmp/` — spec §6), creating it if absent.
    #[instrument(skip_all, fields(root = %root.as_ref().display()), err)]
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, Error> {
        let root = root.as_ref().to_path_buf();
        let blobs = BlobStore::open(&root).await?;
        let refs = RefStore::open(root.join("refs")).await?;
        Ok(Self { blobs, refs, root })
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn refs(&self) -> &RefStore {
        &self.refs
    }

    /// Verifies the on-disk layout is present and writable. A supplemental
    /// sanity check run once at startup, ahead of `cascache.py`'s
    /// `preflight`.
    #[instrument(skip(self), err)]
    pub async fn preflight(&self) -> Result<(), Error> {
        for sub in ["objects", "tmp", "refs/heads"] {
            let path = self.root.join(sub);
            tokio::fs::create_dir_all(&path).await?;
            let probe = path.join(".preflight");
            tokio::fs::write(&probe, b"").await?;
            tokio::fs::remove_file(&probe).await?;
        }
        Ok(())
    }

    async fn load_directory(&self, digest: &Digest) -> Result<Directory, Error> {
        let mut file = self
            .blobs
            .open_read(digest)
            .await?
            .ok_or_else(|| Error::BlobMissing(digest.clone()))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).await?;
        DirectoryCodec::decode(&bytes)
    }

    /// Whether the directory blob named by `digest` is present locally, and
    /// (if `with_files`) whether every file and subdirectory it transitively
    /// references is present too. Mirrors `cascache.py`'s `contains_directory`.
    #[instrument(skip(self), fields(dir.digest = %digest, with_files), err)]
    pub async fn contains_directory(&self, digest: &Digest, with_files: bool) -> Result<bool, Error> {
        if !self.blobs.contains(digest).await? {
            return Ok(false);
        }
        if !with_files {
            return Ok(true);
        }

        let dir = self.load_directory(digest).await?;
        for file in dir.files() {
            if !self.blobs.contains(file.digest()).await? {
                return Ok(false);
            }
        }
        for subdir in dir.directories() {
            if !Box::pin(self.contains_directory(subdir.digest(), with_files)).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Resolves a slash-separated relative path under `digest` to the digest
    /// of the subdirectory it names. Mirrors `cascache.py`'s `get_subdir`.
    #[instrument(skip(self), fields(dir.digest = %digest, path), err)]
    pub async fn get_subdir(&self, digest: &Digest, path: &str) -> Result<Digest, Error> {
        let mut current = digest.clone();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let dir = self.load_directory(&current).await?;
            current = dir
                .directories()
                .find(|d| d.name() == segment)
                .map(|d| d.digest().clone())
                .ok_or_else(|| Error::VirtualDirectoryConflict(path.to_string()))?;
        }
        Ok(current)
    }

    /// Materializes the tree rooted at `digest` onto a real filesystem at
    /// `dest_path` (spec §4.3). `can_link` hardlinks file blobs instead of
    /// copying them; both modes preserve the executable bit.
    #[instrument(skip(self), fields(dir.digest = %digest, dest = %dest_path.as_ref().display(), can_link), err)]
    pub async fn checkout(
        &self,
        digest: &Digest,
        dest_path: impl AsRef<Path>,
        can_link: bool,
    ) -> Result<(), Error> {
        Box::pin(self.checkout_inner(digest, dest_path.as_ref(), can_link)).await
    }

    async fn checkout_inner(
        &self,
        digest: &Digest,
        dest_path: &Path,
        can_link: bool,
    ) -> Result<(), Error> {
        tokio::fs::create_dir_all(dest_path).await?;
        let dir = self.load_directory(digest).await?;

        for file in dir.files() {
            let dest = dest_path.join(file.name());
            if tokio::fs::try_exists(&dest).await? {
                return Err(Error::CheckoutConflict(dest.display().to_string()));
            }
            let src = self.blobs.path_of(file.digest());
            if can_link {
                tokio::fs::hard_link(&src, &dest).await?;
            } else {
                tokio::fs::copy(&src, &dest).await?;
            }
            if file.is_executable() {
                set_executable(&dest).await?;
            }
        }

        for subdir in dir.directories() {
            let dest = dest_path.join(subdir.name());
            if tokio::fs::try_exists(&dest).await? && !is_dir(&dest).await? {
                return Err(Error::CheckoutConflict(dest.display().to_string()));
            }
            Box::pin(self.checkout_inner(subdir.digest(), &dest, can_link)).await?;
        }

        for symlink in dir.symlinks() {
            let dest = dest_path.join(symlink.name());
            if tokio::fs::try_exists(&dest).await? {
                return Err(Error::CheckoutConflict(dest.display().to_string()));
            }
            make_symlink(symlink.target(), &dest).await?;
        }

        Ok(())
    }

    /// Diffs the trees named by `ref_a` and `ref_b`. Symlinks are excluded
    /// from the result (spec §4.3, behavioral carryover). Paths are relative
    /// to the tree root, ordered ascending within each output list.
    #[instrument(skip(self), fields(ref_a, ref_b), err)]
    pub async fn diff(
        &self,
        ref_a: &str,
        ref_b: &str,
    ) -> Result<(Vec<PathBuf>, Vec<PathBuf>, Vec<PathBuf>), Error> {
        let digest_a = self.refs.get(ref_a).await?;
        let digest_b = self.refs.get(ref_b).await?;

        let mut added = Vec::new();
        let mut removed = Vec::new();
        let mut modified = Vec::new();
        Box::pin(self.diff_inner(
            &digest_a,
            &digest_b,
            Path::new(""),
            &mut added,
            &mut removed,
            &mut modified,
        ))
        .await?;
        Ok((added, removed, modified))
    }

    async fn diff_inner(
        &self,
        digest_a: &Digest,
        digest_b: &Digest,
        prefix: &Path,
        added: &mut Vec<PathBuf>,
        removed: &mut Vec<PathBuf>,
        modified: &mut Vec<PathBuf>,
    ) -> Result<(), Error> {
        if digest_a == digest_b {
            return Ok(());
        }

        let dir_a = self.load_directory(digest_a).await?;
        let dir_b = self.load_directory(digest_b).await?;

        diff_files(dir_a.files().collect(), dir_b.files().collect(), prefix, added, removed, modified);

        let dirs_a: Vec<_> = dir_a.directories().collect();
        let dirs_b: Vec<_> = dir_b.directories().collect();
        let mut ia = 0;
        let mut ib = 0;
        while ia < dirs_a.len() || ib < dirs_b.len() {
            let a = dirs_a.get(ia);
            let b = dirs_b.get(ib);
            match (a, b) {
                (Some(a), Some(b)) if a.name() == b.name() => {
                    if a.digest() != b.digest() {
                        Box::pin(self.diff_inner(
                            a.digest(),
                            b.digest(),
                            &prefix.join(a.name()),
                            added,
                            removed,
                            modified,
                        ))
                        .await?;
                    }
                    ia += 1;
                    ib += 1;
                }
                (Some(a), Some(b)) if a.name() < b.name() => {
                    removed.push(prefix.join(a.name()));
                    ia += 1;
                }
                (Some(_), Some(_)) => {
                    added.push(prefix.join(b.unwrap().name()));
                    ib += 1;
                }
                (Some(a), None) => {
                    removed.push(prefix.join(a.name()));
                    ia += 1;
                }
                (None, Some(b)) => {
                    added.push(prefix.join(b.name()));
                    ib += 1;
                }
                (None, None) => unreachable!(),
            }
        }
        Ok(())
    }

    /// Depth-first, restartable enumeration of every digest that must be
    /// locally present to fully realize the tree rooted at `digest`: its own
    /// digest, then each file's digest, then the same recursively into each
    /// subdirectory not named in `excluded_subdirs` (spec §4.3).
    #[instrument(skip(self, excluded_subdirs), fields(dir.digest = %digest), err)]
    pub async fn required_blobs(
        &self,
        digest: &Digest,
        excluded_subdirs: &HashSet<String>,
    ) -> Result<Vec<Digest>, Error> {
        let mut out = Vec::new();
        Box::pin(self.required_blobs_inner(digest, excluded_subdirs, &mut out)).await?;
        Ok(out)
    }

    async fn required_blobs_inner(
        &self,
        digest: &Digest,
        excluded_subdirs: &HashSet<String>,
        out: &mut Vec<Digest>,
    ) -> Result<(), Error> {
        out.push(digest.clone());
        let dir = self.load_directory(digest).await?;
        for file in dir.files() {
            out.push(file.digest().clone());
        }
        for subdir in dir.directories() {
            if excluded_subdirs.contains(subdir.name()) {
                continue;
            }
            Box::pin(self.required_blobs_inner(subdir.digest(), excluded_subdirs, out)).await?;
        }
        Ok(())
    }

    /// The deduplicated union of `required_blobs(digest)`, used by GC (spec
    /// §4.3, §6 GC hooks).
    #[instrument(skip(self), fields(dir.digest = %digest), err)]
    pub async fn reachable(
        &self,
        digest: &Digest,
        opts: ReachableOptions,
    ) -> Result<HashSet<Digest>, Error> {
        let mut seen = HashSet::new();
        Box::pin(self.reachable_inner(digest, opts, &mut seen)).await?;
        Ok(seen)
    }

    async fn reachable_inner(
        &self,
        digest: &Digest,
        opts: ReachableOptions,
        seen: &mut HashSet<Digest>,
    ) -> Result<(), Error> {
        if !seen.insert(digest.clone()) {
            return Ok(());
        }

        if opts.check_exists && !self.blobs.contains(digest).await? {
            return Err(Error::BlobMissing(digest.clone()));
        }
        if opts.update_mtime {
            self.blobs.touch(digest).await?;
        }

        let dir = match self.load_directory(digest).await {
            Ok(dir) => dir,
            Err(Error::BlobMissing(_)) if !opts.check_exists => return Ok(()),
            Err(e) => return Err(e),
        };

        for file in dir.files() {
            if !seen.insert(file.digest().clone()) {
                continue;
            }
            if opts.check_exists && !self.blobs.contains(file.digest()).await? {
                return Err(Error::BlobMissing(file.digest().clone()));
            }
            if opts.update_mtime {
                self.blobs.touch(file.digest()).await?;
            }
        }
        for subdir in dir.directories() {
            Box::pin(self.reachable_inner(subdir.digest(), opts, seen)).await?;
        }
        Ok(())
    }
}

fn diff_files(
    files_a: Vec<&crate::nodes::FileNode>,
    files_b: Vec<&crate::nodes::FileNode>,
    prefix: &Path,
    added: &mut Vec<PathBuf>,
    removed: &mut Vec<PathBuf>,
    modified: &mut Vec<PathBuf>,
) {
    let mut ia = 0;
    let mut ib = 0;
    while ia < files_a.len() || ib < files_b.len() {
        let a = files_a.get(ia);
        let b = files_b.get(ib);
        match (a, b) {
            (Some(a), Some(b)) if a.name() == b.name() => {
                if a.digest() != b.digest() {
                    modified.push(prefix.join(a.name()));
                }
                ia += 1;
                ib += 1;
            }
            (Some(a), Some(b)) if a.name() < b.name() => {
                removed.push(prefix.join(a.name()));
                ia += 1;
            }
            (Some(_), Some(b)) => {
                added.push(prefix.join(b.name()));
                ib += 1;
            }
            (Some(a), None) => {
                removed.push(prefix.join(a.name()));
                ia += 1;
            }
            (None, Some(b)) => {
                added.push(prefix.join(b.name()));
                ib += 1;
            }
            (None, None) => unreachable!(),
        }
    }
}

async fn is_dir(path: &Path) -> Result<bool, Error> {
    Ok(tokio::fs::metadata(path).await?.is_dir())
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> Result<(), Error> {
    Ok(())
}

#[cfg(unix)]
async fn make_symlink(target: &str, dest: &Path) -> Result<(), Error> {
    tokio::fs::symlink(target, dest).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn make_symlink(_target: &str, _dest: &Path) -> Result<(), Error> {
    Err(Error::StoreIo(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "symlinks unsupported on this platform",
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::{DirectoryNode, FileNode, SymlinkNode};
    use pretty_assertions::assert_eq;

    async fn insert_dir(store: &CASStore, dir: &Directory) -> Digest {
        let bytes = DirectoryCodec::encode(dir);
        store.blobs.insert_bytes(&bytes).await.unwrap()
    }

    #[tokio::test]
    async fn empty_directory_round_trips_through_blobstore() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CASStore::open(tmp.path()).await.unwrap();
        let empty = Directory::new();
        let digest = insert_dir(&store, &empty).await;
        assert!(store.contains_directory(&digest, true).await.unwrap());
    }

    #[tokio::test]
    async fn checkout_single_file_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CASStore::open(tmp.path()).await.unwrap();

        let blob_digest = store.blobs.insert_bytes(b"hello").await.unwrap();
        let mut dir = Directory::new();
        dir.add(Node::File(FileNode::new("a", blob_digest, false)))
            .unwrap();
        let digest = insert_dir(&store, &dir).await;

        let dest = tmp.path().join("checkout");
        store.checkout(&digest, &dest, false).await.unwrap();
        let contents = tokio::fs::read(dest.join("a")).await.unwrap();
        assert_eq!(contents, b"hello");
    }

    #[tokio::test]
    async fn diff_reports_added_removed_modified() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CASStore::open(tmp.path()).await.unwrap();

        let h1 = store.blobs.insert_bytes(b"one").await.unwrap();
        let h1b = store.blobs.insert_bytes(b"one-changed").await.unwrap();
        let h2 = store.blobs.insert_bytes(b"two").await.unwrap();
        let h3 = store.blobs.insert_bytes(b"three").await.unwrap();

        let mut dir_a = Directory::new();
        dir_a.add(Node::File(FileNode::new("f1", h1.clone(), false))).unwrap();
        dir_a.add(Node::File(FileNode::new("f2", h2, false))).unwrap();
        let digest_a = insert_dir(&store, &dir_a).await;

        let mut dir_b = Directory::new();
        dir_b.add(Node::File(FileNode::new("f1", h1b, false))).unwrap();
        dir_b.add(Node::File(FileNode::new("f3", h3, false))).unwrap();
        let digest_b = insert_dir(&store, &dir_b).await;

        store.refs.set("a", &digest_a).await.unwrap();
        store.refs.set("b", &digest_b).await.unwrap();

        let (added, removed, modified) = store.diff("a", "b").await.unwrap();
        assert_eq!(added, vec![PathBuf::from("f3")]);
        assert_eq!(removed, vec![PathBuf::from("f2")]);
        assert_eq!(modified, vec![PathBuf::from("f1")]);
    }

    #[tokio::test]
    async fn required_blobs_excludes_named_subdirs() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CASStore::open(tmp.path()).await.unwrap();

        let leaf_digest = store.blobs.insert_bytes(b"leaf").await.unwrap();
        let mut sub = Directory::new();
        sub.add(Node::File(FileNode::new("leaf", leaf_digest.clone(), false)))
            .unwrap();
        let sub_digest = insert_dir(&store, &sub).await;

        let mut root = Directory::new();
        root.add(Node::Directory(DirectoryNode::new("skip", sub_digest.clone())))
            .unwrap();
        let root_digest = insert_dir(&store, &root).await;

        let mut excluded = HashSet::new();
        excluded.insert("skip".to_string());
        let blobs = store.required_blobs(&root_digest, &excluded).await.unwrap();
        assert!(blobs.contains(&root_digest));
        assert!(!blobs.contains(&sub_digest));
        assert!(!blobs.contains(&leaf_digest));

        let blobs_all = store.required_blobs(&root_digest, &HashSet::new()).await.unwrap();
        assert!(blobs_all.contains(&sub_digest));
        assert!(blobs_all.contains(&leaf_digest));
    }

    #[tokio::test]
    async fn reachable_check_exists_raises_on_missing_blob() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CASStore::open(tmp.path()).await.unwrap();

        let missing_digest = Digest::of_bytes(b"never inserted");
        let mut dir = Directory::new();
        dir.add(Node::File(FileNode::new("gone", missing_digest, false)))
            .unwrap();
        let digest = insert_dir(&store, &dir).await;

        let err = store
            .reachable(&digest, ReachableOptions { update_mtime: false, check_exists: true })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BlobMissing(_)));
    }

    #[tokio::test]
    async fn get_subdir_navigates_nested_path() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CASStore::open(tmp.path()).await.unwrap();

        let leaf = Directory::new();
        let leaf_digest = insert_dir(&store, &leaf).await;
        let mut mid = Directory::new();
        mid.add(Node::Directory(DirectoryNode::new("b", leaf_digest.clone())))
            .unwrap();
        let mid_digest = insert_dir(&store, &mid).await;
        let mut root = Directory::new();
        root.add(Node::Directory(DirectoryNode::new("a", mid_digest)))
            .unwrap();
        let root_digest = insert_dir(&store, &root).await;

        let resolved = store.get_subdir(&root_digest, "a/b").await.unwrap();
        assert_eq!(resolved, leaf_digest);
    }

    #[tokio::test]
    async fn checkout_writes_symlink_verbatim() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CASStore::open(tmp.path()).await.unwrap();

        let mut dir = Directory::new();
        dir.add(Node::Symlink(SymlinkNode::new("link", "target").unwrap()))
            .unwrap();
        let digest = insert_dir(&store, &dir).await;

        let dest = tmp.path().join("checkout");
        store.checkout(&digest, &dest, false).await.unwrap();

        #[cfg(unix)]
        {
            let target = tokio::fs::read_link(dest.join("link")).await.unwrap();
            assert_eq!(target, PathBuf::from("target"));
        }
    }
}
