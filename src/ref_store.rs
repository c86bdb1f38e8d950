//! Named pointers into the store (spec §4.2, `RefStore`). A ref is a file
//! under `refs/heads/<name>` whose contents are a protocol-buffer-encoded
//! `Digest { hash, size_bytes }` message (spec §6, on-disk layout); updates
//! are write-to-temp-then-rename, same atomicity idiom `BlobStore` uses for
//! objects (spec §5).

use std::path::{Path, PathBuf};

use prost::Message;
use tracing::instrument;

use crate::digest::Digest;
use crate::errors::Error;
use crate::proto;

#[derive(Clone)]
pub struct RefStore {
    root: PathBuf,
}

impl RefStore {
    /// Opens (creating if absent) a `RefStore` rooted at `root`, with refs
    /// living under `root/heads/...` (spec §6: `refs/heads/<ref-name>`).
    #[instrument(skip_all, fields(root = %root.as_ref().display()), err)]
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, Error> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(root.join("heads")).await?;
        Ok(Self { root })
    }

    fn heads_dir(&self) -> PathBuf {
        self.root.join("heads")
    }

    /// Ref names may contain `/` (e.g. `builds/x86_64/latest`), which map to
    /// nested directories under `heads/`, mirroring how git lays out
    /// `refs/heads/<name>`.
    fn path_of(&self, name: &str) -> PathBuf {
        self.heads_dir().join(name)
    }

    #[instrument(skip(self), fields(ref.name = name), err)]
    pub async fn get(&self, name: &str) -> Result<Digest, Error> {
        let path = self.path_of(name);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::RefMissing(name.to_string()))
            }
            Err(e) => return Err(Error::StoreIo(e)),
        };
        proto::Digest::decode(bytes.as_slice())
            .ok()
            .and_then(|d| Digest::try_from(d).ok())
            .ok_or_else(|| Error::RefMissing(name.to_string()))
    }

    pub async fn contains(&self, name: &str) -> Result<bool, Error> {
        Ok(tokio::fs::try_exists(self.path_of(name)).await?)
    }

    /// Atomically points `name` at `digest`. Stages the new contents in a
    /// sibling temp file and renames over the final path so readers never
    /// observe a partially written ref (spec §4.2, §5).
    #[instrument(skip(self), fields(ref.name = name, ref.digest = %digest), err)]
    pub async fn set(&self, name: &str, digest: &Digest) -> Result<(), Error> {
        let path = self.path_of(name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = path.with_extension(format!("tmp-{}", std::process::id()));
        let wire = proto::Digest::from(digest.clone());
        tokio::fs::write(&tmp_path, wire.encode_to_vec()).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    /// Updates the ref's mtime without changing what it points at, used by
    /// GC's reachability walk to mark refs as recently used (spec §4.3).
    #[instrument(skip(self), fields(ref.name = name), err)]
    pub async fn touch(&self, name: &str) -> Result<(), Error> {
        let path = self.path_of(name);
        let now = std::time::SystemTime::now();
        tokio::task::spawn_blocking(move || {
            std::fs::OpenOptions::new()
                .write(true)
                .open(&path)?
                .set_modified(now)
        })
        .await
        .map_err(|e| Error::StoreIo(std::io::Error::new(std::io::ErrorKind::Other, e)))??;
        Ok(())
    }

    /// Removes `name`, then prunes now-empty ancestor directories up to (but
    /// not including) `heads/` itself. Missing entries at any step are
    /// tolerated; a non-empty ancestor halts the prune (spec §4.2).
    #[instrument(skip(self), fields(ref.name = name), err)]
    pub async fn remove(&self, name: &str) -> Result<(), Error> {
        let path = self.path_of(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::StoreIo(e)),
        }

        let heads = self.heads_dir();
        let mut dir = path.parent().map(Path::to_path_buf);
        while let Some(d) = dir {
            if d == heads || !d.starts_with(&heads) {
                break;
            }
            match tokio::fs::remove_dir(&d).await {
                Ok(()) => dir = d.parent().map(Path::to_path_buf),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    dir = d.parent().map(Path::to_path_buf)
                }
                Err(e) if e.raw_os_error() == Some(libc_enotempty()) => break,
                Err(_) => break,
            }
        }
        Ok(())
    }

    /// Lists all ref names currently set, in no particular order.
    pub async fn list(&self) -> Result<Vec<String>, Error> {
        let heads = self.heads_dir();
        let mut out = Vec::new();
        let mut stack = vec![heads.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(entry.path());
                } else if file_type.is_file() {
                    if let Ok(rel) = entry.path().strip_prefix(&heads) {
                        if let Some(name) = rel.to_str() {
                            out.push(name.to_string());
                        }
                    }
                }
            }
        }
        Ok(out)
    }
}

fn libc_enotempty() -> i32 {
    #[cfg(target_os = "linux")]
    {
        39
    }
    #[cfg(not(target_os = "linux"))]
    {
        66
    }
}
