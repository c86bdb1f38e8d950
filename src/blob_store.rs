//! Byte-addressed local persistence (spec §4.1, `BlobStore`). Blobs live at
//! `objects/<hh>/<rest>` under the store root; insertion stages bytes in a
//! temp file and hardlinks it into place, so concurrent inserts of identical
//! content converge on one object file without any in-process lock (spec
//! §5). Modeled on `tvix_castore::blobservice::SimpleFilesystemBlobService`,
//! adapted from a rename-based single on-disk name to the hardlink-based
//! atomic insert spec §4.1 calls for.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::instrument;

use crate::digest::{Digest, DigestHasher};
use crate::errors::Error;

#[derive(Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Opens (creating if absent) a `BlobStore` rooted at `root`, laying out
    /// `objects/` and `tmp/` beneath it (spec §6, on-disk layout).
    #[instrument(skip_all, fields(root = %root.as_ref().display()), err)]
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, Error> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(root.join("objects")).await?;
        tokio::fs::create_dir_all(root.join("tmp")).await?;
        Ok(Self { root })
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Pure function of the hash: `objects/<hash[0:2]>/<hash[2:]>`.
    pub fn path_of(&self, digest: &Digest) -> PathBuf {
        self.root
            .join("objects")
            .join(digest.shard_prefix())
            .join(digest.shard_rest())
    }

    #[instrument(skip(self), fields(blob.digest = %digest), err)]
    pub async fn contains(&self, digest: &Digest) -> Result<bool, Error> {
        Ok(tokio::fs::try_exists(self.path_of(digest)).await?)
    }

    /// Filters `digests` down to those absent locally (spec §4.1).
    pub async fn missing<'d>(
        &self,
        digests: impl IntoIterator<Item = &'d Digest>,
    ) -> Result<Vec<Digest>, Error> {
        let mut out = Vec::new();
        for d in digests {
            if !self.contains(d).await? {
                out.push(d.clone());
            }
        }
        Ok(out)
    }

    /// A scope-guarded named temp file under the store's tmp directory, mode
    /// 0644; removed on drop unless renamed/linked out first (spec §4.1).
    pub async fn temporary(&self) -> Result<async_tempfile::TempFile, Error> {
        let file = async_tempfile::TempFile::new_in(self.tmp_dir())
            .await
            .map_err(temp_err)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(file.file_path(), std::fs::Permissions::from_mode(0o644))
                .await?;
        }
        Ok(file)
    }

    /// Hashes `bytes`, stages them in a temp file, and hardlinks the result
    /// into place. If the final path already exists, the insert is a silent
    /// no-op: the content matches by construction (spec §4.1).
    #[instrument(skip(self, bytes), err)]
    pub async fn insert_bytes(&self, bytes: &[u8]) -> Result<Digest, Error> {
        let digest = Digest::of_bytes(bytes);
        if self.contains(&digest).await? {
            return Ok(digest);
        }

        let mut temp = self.temporary().await?;
        temp.write_all(bytes).await?;
        temp.flush().await?;
        self.link_into_place(temp.file_path(), &digest).await?;
        Ok(digest)
    }

    /// Streams the file at `path` into the store, computing its digest
    /// incrementally rather than buffering the whole file.
    #[instrument(skip(self), fields(path = %path.as_ref().display()), err)]
    pub async fn insert_path(&self, path: impl AsRef<Path>) -> Result<Digest, Error> {
        let mut src = tokio::fs::File::open(path.as_ref()).await?;
        let mut temp = self.temporary().await?;
        let mut hasher = DigestHasher::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            use tokio::io::AsyncReadExt;
            let n = src.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            temp.write_all(&buf[..n]).await?;
        }
        temp.flush().await?;
        let digest = hasher.finalize();

        if self.contains(&digest).await? {
            return Ok(digest);
        }
        self.link_into_place(temp.file_path(), &digest).await?;
        Ok(digest)
    }

    async fn link_into_place(&self, staged: &Path, digest: &Digest) -> Result<(), Error> {
        let final_path = self.path_of(digest);
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::hard_link(staged, &final_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(Error::StoreIo(e)),
        }
    }

    #[instrument(skip(self), fields(blob.digest = %digest), err)]
    pub async fn open_read(&self, digest: &Digest) -> Result<Option<tokio::fs::File>, Error> {
        match tokio::fs::File::open(self.path_of(digest)).await {
            Ok(f) => Ok(Some(f)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::StoreIo(e)),
        }
    }

    /// Marks the object's mtime as recently used; GC's `reachable(update_mtime)`
    /// mode calls this during traversal (spec §4.3).
    pub async fn touch(&self, digest: &Digest) -> Result<(), Error> {
        let path = self.path_of(digest);
        let now = filetime_now();
        tokio::task::spawn_blocking(move || filetime_set(&path, now))
            .await
            .map_err(|e| Error::StoreIo(std::io::Error::new(std::io::ErrorKind::Other, e)))??;
        Ok(())
    }

    /// Every object digest currently on disk, reconstructed from the
    /// `<hh>/<rest>` sharded layout rather than tracked separately (spec §6,
    /// on-disk layout). Used by GC's sweep phase.
    #[instrument(skip(self), err)]
    pub async fn list_digests(&self) -> Result<Vec<Digest>, Error> {
        let objects_dir = self.root.join("objects");
        tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            for entry in walkdir::WalkDir::new(&objects_dir).min_depth(2).max_depth(2) {
                let entry = entry.map_err(|e| {
                    std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let shard = entry
                    .path()
                    .parent()
                    .and_then(|p| p.file_name())
                    .and_then(|n| n.to_str())
                    .unwrap_or_default();
                let rest = entry.file_name().to_str().unwrap_or_default();
                let hash = format!("{shard}{rest}");
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                if let Ok(digest) = Digest::from_parts(hash, size) {
                    out.push(digest);
                }
            }
            Ok::<_, std::io::Error>(out)
        })
        .await
        .map_err(|e| Error::StoreIo(std::io::Error::new(std::io::ErrorKind::Other, e)))?
        .map_err(Error::StoreIo)
    }

    /// Unlinks the object named by `digest`. Missing objects are tolerated
    /// (already-collected). Used by GC's sweep phase.
    #[instrument(skip(self), fields(blob.digest = %digest), err)]
    pub async fn remove(&self, digest: &Digest) -> Result<(), Error> {
        match tokio::fs::remove_file(self.path_of(digest)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::StoreIo(e)),
        }
    }
}

fn temp_err(e: async_tempfile::Error) -> Error {
    match e {
        async_tempfile::Error::Io(io) => Error::StoreIo(io),
        other => Error::StoreIo(std::io::Error::new(std::io::ErrorKind::Other, other.to_string())),
    }
}

// A minimal, dependency-free mtime touch: we only need "now", not a specific
// timestamp, and avoid pulling in the `filetime` crate for one call site.
fn filetime_now() -> std::time::SystemTime {
    std::time::SystemTime::now()
}

fn filetime_set(path: &Path, time: std::time::SystemTime) -> std::io::Result<()> {
    let f = std::fs::OpenOptions::new().write(true).open(path)?;
    f.set_modified(time)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();

        let d1 = store.insert_bytes(b"hello").await.unwrap();
        let d2 = store.insert_bytes(b"hello").await.unwrap();
        assert_eq!(d1, d2);
        assert!(store.contains(&d1).await.unwrap());

        // Exactly one object file at path_of(digest).
        let path = store.path_of(&d1);
        assert!(path.is_file());
    }

    #[tokio::test]
    async fn hash_matches_sha256_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();
        let digest = store.insert_bytes(b"hello").await.unwrap();
        assert_eq!(
            digest.hash(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(digest.size(), 5);
    }

    #[tokio::test]
    async fn missing_filters_to_absent_digests() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();
        let present = store.insert_bytes(b"present").await.unwrap();
        let absent = Digest::of_bytes(b"absent");

        let missing = store.missing([&present, &absent]).await.unwrap();
        assert_eq!(missing, vec![absent]);
    }

    #[tokio::test]
    async fn insert_path_streams_and_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();

        let src = dir.path().join("src.txt");
        tokio::fs::write(&src, b"streamed content").await.unwrap();

        let digest = store.insert_path(&src).await.unwrap();
        let direct = Digest::of_bytes(b"streamed content");
        assert_eq!(digest, direct);
    }

    #[tokio::test]
    async fn list_digests_reflects_inserts_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();
        let a = store.insert_bytes(b"one").await.unwrap();
        let b = store.insert_bytes(b"two").await.unwrap();

        let listed = store.list_digests().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.contains(&a));
        assert!(listed.contains(&b));

        store.remove(&a).await.unwrap();
        let listed = store.list_digests().await.unwrap();
        assert_eq!(listed, vec![b]);

        // removing an already-absent digest is a no-op
        store.remove(&a).await.unwrap();
    }
}
