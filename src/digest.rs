//! The [`Digest`]: a SHA-256 hash paired with the exact size of the payload
//! it names. Two digests are equal iff both fields match (spec §3, Digest).

use data_encoding::HEXLOWER;
use sha2::{Digest as _, Sha256};
use thiserror::Error;

/// Length, in hex characters, of a SHA-256 digest.
pub const SHA256_HEX_LEN: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DigestError {
    #[error("invalid digest hash length: {0}, expected {SHA256_HEX_LEN}")]
    InvalidHashLen(usize),
    #[error("hash is not lowercase hex: {0:?}")]
    NotLowerHex(String),
}

/// A `(hash, size)` pair uniquely naming a blob's content forever, under the
/// assumption that SHA-256 is collision-resistant.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    hash: String,
    size: u64,
}

impl Digest {
    /// Hashes `bytes` and builds the [Digest] naming it.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let hash = HEXLOWER.encode(&hasher.finalize());
        Self {
            hash,
            size: bytes.len() as u64,
        }
    }

    /// Builds a [Digest] from an already-known hash and size, validating the
    /// hash's shape (64 lowercase hex characters) but not its provenance.
    pub fn from_parts(hash: impl Into<String>, size: u64) -> Result<Self, DigestError> {
        let hash = hash.into();
        if hash.len() != SHA256_HEX_LEN {
            return Err(DigestError::InvalidHashLen(hash.len()));
        }
        if !hash.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
            return Err(DigestError::NotLowerHex(hash));
        }
        Ok(Self { hash, size })
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// The two-character shard prefix used to lay out `objects/<hh>/<rest>`.
    pub fn shard_prefix(&self) -> &str {
        &self.hash[..2]
    }

    /// The remaining 62 hex characters after the shard prefix.
    pub fn shard_rest(&self) -> &str {
        &self.hash[2..]
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.hash, self.size)
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Digest({}:{})", self.hash, self.size)
    }
}

/// Incremental SHA-256 hasher used by [`crate::blob_store::BlobStore`] so
/// writers don't need to buffer the whole blob to compute its digest.
#[derive(Default)]
pub struct DigestHasher {
    hasher: Sha256,
    size: u64,
}

impl DigestHasher {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
            size: 0,
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
        self.size += bytes.len() as u64;
    }

    pub fn finalize(self) -> Digest {
        let hash = HEXLOWER.encode(&self.hasher.finalize());
        Digest {
            hash,
            size: self.size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_determinism() {
        let d = Digest::of_bytes(b"hello");
        assert_eq!(
            d.hash(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(d.size(), 5);
    }

    #[test]
    fn shard_prefix_is_first_two_chars() {
        let d = Digest::of_bytes(b"hello");
        assert_eq!(d.shard_prefix().len(), 2);
        assert_eq!(
            format!("{}{}", d.shard_prefix(), d.shard_rest()),
            d.hash()
        );
    }

    #[test]
    fn rejects_bad_hash_len() {
        assert_eq!(
            Digest::from_parts("abcd", 0),
            Err(DigestError::InvalidHashLen(4))
        );
    }

    #[test]
    fn rejects_uppercase_hash() {
        let bad = "A".repeat(64);
        assert_eq!(
            Digest::from_parts(bad.clone(), 0),
            Err(DigestError::NotLowerHex(bad))
        );
    }

    /// `BlobStore::insert_path` drives `DigestHasher` from chunks read off an
    /// arbitrary `AsyncRead`, rather than buffering the whole blob; mock the
    /// reader side of that loop with `tokio_test::io::Builder` so the
    /// incremental digest is exercised against a source that yields content
    /// across multiple short reads instead of one contiguous slice.
    #[tokio::test]
    async fn incremental_hasher_matches_reader_split_across_chunks() {
        use tokio::io::AsyncReadExt;

        let mut reader = tokio_test::io::Builder::new()
            .read(b"hel")
            .read(b"lo wo")
            .read(b"rld")
            .build();

        let mut hasher = DigestHasher::new();
        let mut buf = [0u8; 4];
        loop {
            let n = reader.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        assert_eq!(hasher.finalize(), Digest::of_bytes(b"hello world"));
    }
}
