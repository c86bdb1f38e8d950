//! In-memory representation of a [Directory] and the nodes it can hold,
//! mirroring the wire `Directory` message (spec §3) but as a validated,
//! always-sorted Rust structure. Conversions to/from the generated protobuf
//! types live in [`crate::proto`].

use crate::digest::Digest;
use crate::errors::{ValidateDirectoryError, ValidateNodeError};

/// Checks a node name for validity as a directory entry: no slashes, no null
/// bytes, not `.` or `..`, not empty.
pub(crate) fn validate_node_name(name: &str) -> Result<(), ValidateNodeError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('\0') || name.contains('/')
    {
        Err(ValidateNodeError::InvalidName(name.to_owned()))
    } else {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNode {
    name: String,
    digest: Digest,
    is_executable: bool,
}

impl FileNode {
    pub fn new(name: impl Into<String>, digest: Digest, is_executable: bool) -> Self {
        Self {
            name: name.into(),
            digest,
            is_executable,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn digest(&self) -> &Digest {
        &self.digest
    }
    pub fn is_executable(&self) -> bool {
        self.is_executable
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryNode {
    name: String,
    digest: Digest,
}

impl DirectoryNode {
    pub fn new(name: impl Into<String>, digest: Digest) -> Self {
        Self {
            name: name.into(),
            digest,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn digest(&self) -> &Digest {
        &self.digest
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymlinkNode {
    name: String,
    target: String,
}

impl SymlinkNode {
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Result<Self, ValidateNodeError> {
        let target = target.into();
        if target.is_empty() || target.contains('\0') {
            return Err(ValidateNodeError::InvalidSymlinkTarget(target));
        }
        Ok(Self {
            name: name.into(),
            target,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn target(&self) -> &str {
        &self.target
    }
}

/// A Node is either a [DirectoryNode], [FileNode] or [SymlinkNode]. Nodes
/// carry their own name so they can be sorted and compared uniformly when
/// merging the three lists of a [Directory].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    File(FileNode),
    Directory(DirectoryNode),
    Symlink(SymlinkNode),
}

pub trait NamedNode {
    fn get_name(&self) -> &str;
}

impl NamedNode for Node {
    fn get_name(&self) -> &str {
        match self {
            Node::File(n) => n.name(),
            Node::Directory(n) => n.name(),
            Node::Symlink(n) => n.name(),
        }
    }
}

impl Node {
    fn validate(&self) -> Result<(), ValidateNodeError> {
        match self {
            Node::File(n) => validate_node_name(&n.name),
            Node::Directory(n) => validate_node_name(&n.name),
            Node::Symlink(n) => {
                if n.target.is_empty() || n.target.contains('\0') {
                    return Err(ValidateNodeError::InvalidSymlinkTarget(n.target.clone()));
                }
                validate_node_name(&n.name)
            }
        }
    }
}

fn checked_sum(iter: impl IntoIterator<Item = u64>) -> Option<u64> {
    iter.into_iter().try_fold(0u64, |acc, i| acc.checked_add(i))
}

/// A Directory can contain Directory, File or Symlink nodes, each carrying a
/// name unique within the directory (spec §3, invariant DIR-2). The three
/// lists are always kept in ascending-by-name order (invariant DIR-3) as
/// entries are added via [`Directory::add`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Directory {
    files: Vec<FileNode>,
    directories: Vec<DirectoryNode>,
    symlinks: Vec<SymlinkNode>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.directories.is_empty() && self.symlinks.is_empty()
    }

    /// The number of direct entries (files + directories + symlinks).
    pub fn len(&self) -> u64 {
        (self.files.len() + self.directories.len() + self.symlinks.len()) as u64
    }

    pub fn files(&self) -> impl Iterator<Item = &FileNode> {
        self.files.iter()
    }

    pub fn directories(&self) -> impl Iterator<Item = &DirectoryNode> {
        self.directories.iter()
    }

    pub fn symlinks(&self) -> impl Iterator<Item = &SymlinkNode> {
        self.symlinks.iter()
    }

    pub fn get(&self, name: &str) -> Option<Node> {
        self.nodes().find(|n| n.get_name() == name)
    }

    /// Iterates over all nodes in strictly ascending name order by merging
    /// the three sorted lists, mirroring
    /// `tvix_castore::directoryservice::DirectoryNodesIterator`.
    pub fn nodes(&self) -> impl Iterator<Item = Node> + '_ {
        DirectoryNodesIter {
            files: self.files.iter().peekable(),
            directories: self.directories.iter().peekable(),
            symlinks: self.symlinks.iter().peekable(),
        }
    }

    /// Adds a node, preserving sorted order (invariant DIR-3). Errors if the
    /// name is invalid or already present in any of the three lists
    /// (invariant DIR-2).
    pub fn add(&mut self, node: Node) -> Result<(), ValidateDirectoryError> {
        node.validate()
            .map_err(|e| ValidateDirectoryError::InvalidNode(node.get_name().to_string(), e))?;

        if self.get(node.get_name()).is_some() {
            return Err(ValidateDirectoryError::DuplicateName(
                node.get_name().to_string(),
            ));
        }

        checked_sum([self.len(), 1]).ok_or(ValidateDirectoryError::SizeOverflow)?;

        match node {
            Node::File(n) => {
                let pos = self.files.partition_point(|e| e.name.as_str() < n.name.as_str());
                self.files.insert(pos, n);
            }
            Node::Directory(n) => {
                let pos = self
                    .directories
                    .partition_point(|e| e.name.as_str() < n.name.as_str());
                self.directories.insert(pos, n);
            }
            Node::Symlink(n) => {
                let pos = self.symlinks.partition_point(|e| e.name.as_str() < n.name.as_str());
                self.symlinks.insert(pos, n);
            }
        }
        Ok(())
    }

    /// Removes the named entry, regardless of which of the three lists it
    /// lives in. No-op if absent.
    pub fn remove(&mut self, name: &str) {
        self.files.retain(|n| n.name != name);
        self.directories.retain(|n| n.name != name);
        self.symlinks.retain(|n| n.name != name);
    }

    /// Validates name uniqueness, sort order, and node-level constraints.
    /// Decoders must call this (spec §3, invariant DIR-3 is only guaranteed
    /// on encode; decode must validate explicitly).
    pub fn validate(&self) -> Result<(), ValidateDirectoryError> {
        fn check_sorted_unique<N: NamedNode>(
            items: &[N],
        ) -> Result<(), ValidateDirectoryError> {
            let mut last: Option<&str> = None;
            for item in items {
                let name = item.get_name();
                if let Some(last) = last {
                    if name < last {
                        return Err(ValidateDirectoryError::WrongSorting(name.to_string()));
                    }
                    if name == last {
                        return Err(ValidateDirectoryError::DuplicateName(name.to_string()));
                    }
                }
                last = Some(name);
            }
            Ok(())
        }

        for n in &self.files {
            validate_node_name(&n.name)
                .map_err(|e| ValidateDirectoryError::InvalidNode(n.name.clone(), e))?;
        }
        for n in &self.directories {
            validate_node_name(&n.name)
                .map_err(|e| ValidateDirectoryError::InvalidNode(n.name.clone(), e))?;
        }
        for n in &self.symlinks {
            Node::Symlink(n.clone())
                .validate()
                .map_err(|e| ValidateDirectoryError::InvalidNode(n.name.clone(), e))?;
        }

        check_sorted_unique(&self.files)?;
        check_sorted_unique(&self.directories)?;
        check_sorted_unique(&self.symlinks)?;

        // cross-list uniqueness
        let mut seen = std::collections::HashSet::new();
        for name in self
            .files
            .iter()
            .map(|n| n.name.as_str())
            .chain(self.directories.iter().map(|n| n.name.as_str()))
            .chain(self.symlinks.iter().map(|n| n.name.as_str()))
        {
            if !seen.insert(name) {
                return Err(ValidateDirectoryError::DuplicateName(name.to_string()));
            }
        }

        Ok(())
    }
}

impl NamedNode for FileNode {
    fn get_name(&self) -> &str {
        &self.name
    }
}
impl NamedNode for DirectoryNode {
    fn get_name(&self) -> &str {
        &self.name
    }
}
impl NamedNode for SymlinkNode {
    fn get_name(&self) -> &str {
        &self.name
    }
}

struct DirectoryNodesIter<'a> {
    files: std::iter::Peekable<std::slice::Iter<'a, FileNode>>,
    directories: std::iter::Peekable<std::slice::Iter<'a, DirectoryNode>>,
    symlinks: std::iter::Peekable<std::slice::Iter<'a, SymlinkNode>>,
}

fn smaller_name<'a, A: NamedNode, B: NamedNode>(a: Option<&'a A>, b: Option<&'a B>) -> bool {
    match (a, b) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(a), Some(b)) => a.get_name() <= b.get_name(),
    }
}

impl Iterator for DirectoryNodesIter<'_> {
    type Item = Node;

    fn next(&mut self) -> Option<Self::Item> {
        // Pick whichever of the three peeked heads sorts first.
        let take_files = smaller_name(self.files.peek(), self.directories.peek())
            && smaller_name(self.files.peek(), self.symlinks.peek());
        if take_files {
            if let Some(n) = self.files.next() {
                return Some(Node::File(n.clone()));
            }
        }
        let take_dirs = smaller_name(self.directories.peek(), self.symlinks.peek());
        if take_dirs {
            if let Some(n) = self.directories.next() {
                return Some(Node::Directory(n.clone()));
            }
        }
        self.symlinks.next().cloned().map(Node::Symlink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;

    fn dummy_digest() -> Digest {
        Digest::of_bytes(b"dummy")
    }

    #[test]
    fn add_nodes_preserves_sort_order() {
        let mut d = Directory::new();
        d.add(Node::Directory(DirectoryNode::new("b", dummy_digest())))
            .unwrap();
        d.add(Node::Directory(DirectoryNode::new("a", dummy_digest())))
            .unwrap();
        d.add(Node::File(FileNode::new("z", dummy_digest(), false)))
            .unwrap();
        d.add(Node::Symlink(SymlinkNode::new("m", "a").unwrap()))
            .unwrap();

        let names: Vec<_> = d.nodes().map(|n| n.get_name().to_string()).collect();
        assert_eq!(names, vec!["a", "b", "m", "z"]);
        d.validate().expect("directory should validate");
    }

    #[test]
    fn add_duplicate_name_rejected() {
        let mut d = Directory::new();
        d.add(Node::Directory(DirectoryNode::new("a", dummy_digest())))
            .unwrap();
        let err = d
            .add(Node::File(FileNode::new("a", dummy_digest(), false)))
            .unwrap_err();
        assert_eq!(
            err,
            ValidateDirectoryError::DuplicateName("a".to_string())
        );
    }

    #[test]
    fn rejects_invalid_names() {
        let mut d = Directory::new();
        assert!(d
            .add(Node::Symlink(SymlinkNode::new("..", "x").unwrap()))
            .is_err());
        assert!(d
            .add(Node::File(FileNode::new("", dummy_digest(), false)))
            .is_err());
    }
}
