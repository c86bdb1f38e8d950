//! Generated Remote-Execution-v2-style wire messages, plus conversions
//! to/from the validated domain types in [`crate::nodes`]. Mirrors the
//! split `tvix-castore` keeps between `proto::Directory` (wire) and its
//! domain `Directory`/`Node` types.

use crate::digest::{Digest as DomainDigest, DigestError};
use crate::errors::ValidateDirectoryError;
use crate::nodes::{self, Node};

tonic::include_proto!("cas.engine.v1");

impl From<DomainDigest> for Digest {
    fn from(value: DomainDigest) -> Self {
        Digest {
            hash: value.hash().to_string(),
            size_bytes: value.size() as i64,
        }
    }
}

impl TryFrom<Digest> for DomainDigest {
    type Error = DigestError;

    fn try_from(value: Digest) -> Result<Self, Self::Error> {
        DomainDigest::from_parts(value.hash, value.size_bytes.max(0) as u64)
    }
}

impl From<nodes::FileNode> for FileNode {
    fn from(n: nodes::FileNode) -> Self {
        FileNode {
            name: n.name().to_string(),
            digest: Some(n.digest().clone().into()),
            is_executable: n.is_executable(),
        }
    }
}

impl From<nodes::DirectoryNode> for DirectoryNode {
    fn from(n: nodes::DirectoryNode) -> Self {
        DirectoryNode {
            name: n.name().to_string(),
            digest: Some(n.digest().clone().into()),
        }
    }
}

impl From<nodes::SymlinkNode> for SymlinkNode {
    fn from(n: nodes::SymlinkNode) -> Self {
        SymlinkNode {
            name: n.name().to_string(),
            target: n.target().to_string(),
        }
    }
}

impl From<nodes::Directory> for Directory {
    fn from(dir: nodes::Directory) -> Self {
        let mut out = Directory::default();
        for n in dir.nodes() {
            match n {
                Node::File(f) => out.files.push(f.into()),
                Node::Directory(d) => out.directories.push(d.into()),
                Node::Symlink(s) => out.symlinks.push(s.into()),
            }
        }
        out
    }
}

impl TryFrom<Directory> for nodes::Directory {
    type Error = ValidateDirectoryError;

    fn try_from(wire: Directory) -> Result<Self, Self::Error> {
        let mk_digest_err = |name: &str, e: DigestError| {
            ValidateDirectoryError::InvalidNode(
                name.to_string(),
                crate::errors::ValidateNodeError::InvalidDigest(e),
            )
        };

        let mut out = nodes::Directory::new();
        for f in wire.files {
            let digest: DomainDigest = f
                .digest
                .ok_or_else(|| {
                    ValidateDirectoryError::InvalidNode(
                        f.name.clone(),
                        crate::errors::ValidateNodeError::InvalidDigest(
                            DigestError::InvalidHashLen(0),
                        ),
                    )
                })?
                .try_into()
                .map_err(|e| mk_digest_err(&f.name, e))?;
            out.add(Node::File(nodes::FileNode::new(
                f.name,
                digest,
                f.is_executable,
            )))?;
        }
        for d in wire.directories {
            let digest: DomainDigest = d
                .digest
                .ok_or_else(|| {
                    ValidateDirectoryError::InvalidNode(
                        d.name.clone(),
                        crate::errors::ValidateNodeError::InvalidDigest(
                            DigestError::InvalidHashLen(0),
                        ),
                    )
                })?
                .try_into()
                .map_err(|e| mk_digest_err(&d.name, e))?;
            out.add(Node::Directory(nodes::DirectoryNode::new(d.name, digest)))?;
        }
        for s in wire.symlinks {
            let node = nodes::SymlinkNode::new(s.name, s.target).map_err(|e| {
                ValidateDirectoryError::InvalidNode(String::new(), e)
            })?;
            out.add(Node::Symlink(node))?;
        }

        out.validate()?;
        Ok(out)
    }
}
