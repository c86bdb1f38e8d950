//! The mutable Merkle tree over immutable encoded Directory blobs (spec
//! §4.4, `VirtualDirectory`). Realized as spec §9 prefers: a single arena
//! owns every node in a tree; children hold indices into the arena rather
//! than `Rc` pointers to their parent, so a child never keeps its parent
//! alive and cycles are structurally impossible. `VirtualDirectory` itself
//! is a cheap `{arena, key}` handle into that arena.
//!
//! Not `Send`: spec §5 requires a working tree have exactly one logical
//! writer at a time, and an `Rc<RefCell<_>>`-backed handle enforces that at
//! the type level rather than by convention.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::Path;
use std::rc::Rc;

use tokio::io::AsyncReadExt;
use tracing::instrument;

use crate::blob_store::BlobStore;
use crate::digest::Digest;
use crate::directory_codec::DirectoryCodec;
use crate::errors::{Error, ValidateDirectoryError, ValidateNodeError};
use crate::nodes::{self, Directory, DirectoryNode, FileNode, NamedNode, Node, SymlinkNode};
use crate::path::{group_by_first_segment, split_first, symlink_segments};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct VKey(usize);

struct Entry {
    node: Node,
    child: Option<VKey>,
    modified: bool,
}

struct ArenaNode {
    parent: Option<VKey>,
    name_in_parent: Option<String>,
    digest: Option<Digest>,
    dirty: bool,
    entries: BTreeMap<String, Entry>,
}

impl ArenaNode {
    fn fresh(parent: Option<VKey>, name_in_parent: Option<String>) -> Self {
        Self {
            parent,
            name_in_parent,
            digest: None,
            dirty: false,
            entries: BTreeMap::new(),
        }
    }
}

struct Arena {
    nodes: Vec<ArenaNode>,
    blobs: BlobStore,
}

/// A report of what an import overwrote or skipped (spec §7: import
/// conflicts are recorded, not raised).
#[derive(Debug, Default, Clone)]
pub struct ImportReport {
    pub overwritten: Vec<String>,
    pub ignored: Vec<String>,
}

enum Kind {
    File,
    Directory,
    Symlink(String),
}

enum Resolved {
    Directory(VirtualDirectory),
    File,
    Missing,
}

#[derive(Clone)]
pub struct VirtualDirectory {
    arena: Rc<RefCell<Arena>>,
    key: VKey,
}

fn node_err(name: &str, e: ValidateNodeError) -> Error {
    Error::DirectoryDecode(ValidateDirectoryError::InvalidNode(name.to_string(), e))
}

impl VirtualDirectory {
    /// A fresh, empty, backing-less root (spec §3: "created... by opening a
    /// digest or by subdirectory descent" — this is the third case, a brand
    /// new tree with no backing digest at all yet).
    pub fn empty(blobs: BlobStore) -> Self {
        let arena = Arena {
            nodes: vec![ArenaNode::fresh(None, None)],
            blobs,
        };
        Self {
            arena: Rc::new(RefCell::new(arena)),
            key: VKey(0),
        }
    }

    /// Opens the tree rooted at `digest`, decoding its immediate entries
    /// eagerly; subdirectories are materialized lazily on first descent
    /// (spec §9).
    #[instrument(skip(blobs), fields(dir.digest = %digest), err)]
    pub async fn open(blobs: BlobStore, digest: &Digest) -> Result<Self, Error> {
        let vd = Self::empty(blobs);
        vd.load_self_from(digest).await?;
        Ok(vd)
    }

    async fn load_self_from(&self, digest: &Digest) -> Result<(), Error> {
        let dir = load_directory(&self.arena, digest).await?;
        let mut arena = self.arena.borrow_mut();
        let node = &mut arena.nodes[self.key.0];
        node.digest = Some(digest.clone());
        node.dirty = false;
        for n in dir.nodes() {
            let name = n.get_name().to_string();
            node.entries.insert(
                name,
                Entry {
                    node: n,
                    child: None,
                    modified: false,
                },
            );
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.arena.borrow().nodes[self.key.0].entries.is_empty()
    }

    pub fn has_parent(&self) -> bool {
        self.arena.borrow().nodes[self.key.0].parent.is_some()
    }

    /// The digest of this node's last-encoded state, or `None` if it has
    /// never been encoded (a brand new, never-committed directory).
    pub fn digest(&self) -> Option<Digest> {
        self.arena.borrow().nodes[self.key.0].digest.clone()
    }

    fn classify(&self, name: &str) -> Option<Kind> {
        let arena = self.arena.borrow();
        arena.nodes[self.key.0].entries.get(name).map(|e| match &e.node {
            Node::File(_) => Kind::File,
            Node::Directory(_) => Kind::Directory,
            Node::Symlink(s) => Kind::Symlink(s.target().to_string()),
        })
    }

    fn snapshot_entries(&self) -> Vec<(String, Node)> {
        let arena = self.arena.borrow();
        arena.nodes[self.key.0]
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.node.clone()))
            .collect()
    }

    fn snapshot_entries_with_modified(&self) -> Vec<(String, Node, bool)> {
        let arena = self.arena.borrow();
        arena.nodes[self.key.0]
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.node.clone(), v.modified))
            .collect()
    }

    fn remove_entry(&self, name: &str) {
        let mut arena = self.arena.borrow_mut();
        arena.nodes[self.key.0].entries.remove(name);
        arena.nodes[self.key.0].dirty = true;
    }

    fn insert_entry(&self, node: Node) -> Result<(), Error> {
        let name = node.get_name().to_string();
        nodes::validate_node_name(&name).map_err(|e| node_err(&name, e))?;
        let mut arena = self.arena.borrow_mut();
        arena.nodes[self.key.0].entries.insert(
            name,
            Entry {
                node,
                child: None,
                modified: true,
            },
        );
        arena.nodes[self.key.0].dirty = true;
        Ok(())
    }

    fn new_empty_child(&self, name: &str) -> Result<VirtualDirectory, Error> {
        nodes::validate_node_name(name).map_err(|e| node_err(name, e))?;
        let empty_digest = DirectoryCodec::digest(&Directory::new());
        let mut arena = self.arena.borrow_mut();
        let idx = arena.nodes.len();
        arena
            .nodes
            .push(ArenaNode::fresh(Some(self.key), Some(name.to_string())));
        arena.nodes[idx].digest = Some(empty_digest.clone());
        arena.nodes[self.key.0].entries.insert(
            name.to_string(),
            Entry {
                node: Node::Directory(DirectoryNode::new(name, empty_digest)),
                child: Some(VKey(idx)),
                modified: true,
            },
        );
        arena.nodes[self.key.0].dirty = true;
        Ok(VirtualDirectory {
            arena: self.arena.clone(),
            key: VKey(idx),
        })
    }

    fn adopt_directory_node(&self, dnode: DirectoryNode) -> Result<(), Error> {
        nodes::validate_node_name(dnode.name()).map_err(|e| node_err(dnode.name(), e))?;
        let name = dnode.name().to_string();
        let mut arena = self.arena.borrow_mut();
        arena.nodes[self.key.0].entries.insert(
            name,
            Entry {
                node: Node::Directory(dnode),
                child: None,
                modified: true,
            },
        );
        arena.nodes[self.key.0].dirty = true;
        Ok(())
    }

    /// Materializes (lazily, on first call) the child `VirtualDirectory` for
    /// an existing directory entry named `name`. Errors if absent or not a
    /// directory.
    async fn descend_one(&self, name: &str) -> Result<VirtualDirectory, Error> {
        let existing_key = {
            let arena = self.arena.borrow();
            match arena.nodes[self.key.0].entries.get(name) {
                Some(Entry { child: Some(k), .. }) => Some(*k),
                Some(Entry {
                    node: Node::Directory(_),
                    child: None,
                    ..
                }) => None,
                _ => return Err(Error::VirtualDirectoryConflict(name.to_string())),
            }
        };
        if let Some(k) = existing_key {
            return Ok(VirtualDirectory {
                arena: self.arena.clone(),
                key: k,
            });
        }

        let digest = {
            let arena = self.arena.borrow();
            match &arena.nodes[self.key.0].entries[name].node {
                Node::Directory(d) => d.digest().clone(),
                _ => unreachable!("checked above"),
            }
        };
        let dir = load_directory(&self.arena, &digest).await?;
        let new_key = {
            let mut arena = self.arena.borrow_mut();
            let idx = arena.nodes.len();
            let mut fresh = ArenaNode::fresh(Some(self.key), Some(name.to_string()));
            fresh.digest = Some(digest.clone());
            for n in dir.nodes() {
                let nm = n.get_name().to_string();
                fresh.entries.insert(
                    nm,
                    Entry {
                        node: n,
                        child: None,
                        modified: false,
                    },
                );
            }
            arena.nodes.push(fresh);
            arena.nodes[self.key.0].entries.get_mut(name).unwrap().child = Some(VKey(idx));
            VKey(idx)
        };
        Ok(VirtualDirectory {
            arena: self.arena.clone(),
            key: new_key,
        })
    }

    /// Ensures `name` exists as a subdirectory under this node, creating,
    /// following, or converting it per spec §4.4's `create_directory`.
    #[instrument(skip(self), fields(name), err)]
    pub async fn create_directory(&self, name: &str) -> Result<VirtualDirectory, Error> {
        match self.classify(name) {
            None => self.new_empty_child(name),
            Some(Kind::Directory) => self.descend_one(name).await,
            Some(Kind::File) => {
                self.remove_entry(name);
                self.new_empty_child(name)
            }
            Some(Kind::Symlink(target)) => match self.resolve_symlink(&target, false).await? {
                Resolved::Directory(vd) => Ok(vd),
                Resolved::File | Resolved::Missing => {
                    self.remove_entry(name);
                    self.new_empty_child(name)
                }
            },
        }
    }

    /// Descends a (possibly multi-segment) path, creating intermediate
    /// directories if `create` is set. Supplemented op, mirroring
    /// `_casbaseddirectory.py`'s `descend`.
    pub async fn descend(&self, path: &str, create: bool) -> Result<VirtualDirectory, Error> {
        let mut cur = self.clone();
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            cur = if create {
                cur.create_directory(seg).await?
            } else {
                cur.descend_one(seg).await?
            };
        }
        Ok(cur)
    }

    async fn find_root(&self) -> VirtualDirectory {
        let mut cur = self.clone();
        loop {
            let parent = cur.arena.borrow().nodes[cur.key.0].parent;
            match parent {
                Some(k) => {
                    cur = VirtualDirectory {
                        arena: cur.arena.clone(),
                        key: k,
                    }
                }
                None => return cur,
            }
        }
    }

    async fn ascend(&self) -> Result<VirtualDirectory, Error> {
        let parent = self.arena.borrow().nodes[self.key.0].parent;
        parent
            .map(|k| VirtualDirectory {
                arena: self.arena.clone(),
                key: k,
            })
            .ok_or_else(|| Error::BrokenSymlink("..".to_string(), "already at root".to_string()))
    }

    /// Resolves a symlink target (spec §4.4): absolute targets start from
    /// the tree root, relative targets from `self` (the directory holding
    /// the symlink). A chained symlink mid-path is unsupported.
    async fn resolve_symlink(&self, target: &str, create_missing: bool) -> Result<Resolved, Error> {
        let (absolute, segments) = symlink_segments(target);
        let mut cur = if absolute { self.find_root().await } else { self.clone() };

        for (i, seg) in segments.iter().enumerate() {
            let is_last = i + 1 == segments.len();
            if *seg == ".." {
                cur = cur.ascend().await?;
                continue;
            }
            match cur.classify(seg) {
                None => {
                    if create_missing {
                        cur = cur.new_empty_child(seg)?;
                    } else {
                        return Ok(Resolved::Missing);
                    }
                }
                Some(Kind::Symlink(_)) => return Err(Error::SymlinkChain(target.to_string())),
                Some(Kind::File) => {
                    if is_last {
                        return Ok(Resolved::File);
                    }
                    return Err(Error::BrokenSymlink(target.to_string(), seg.to_string()));
                }
                Some(Kind::Directory) => {
                    cur = cur.descend_one(seg).await?;
                }
            }
        }
        Ok(Resolved::Directory(cur))
    }

    /// Deletes or denies replacing `name`, per the overwrite policy (spec
    /// §4.4). Only ever invoked for file and symlink import entries —
    /// directory entries follow the separate, non-destructive merge rule in
    /// [`Self::ensure_plain_directory`].
    async fn check_replacement(&self, name: &str, report: &mut ImportReport) -> Result<bool, Error> {
        match self.classify(name) {
            None => Ok(true),
            Some(Kind::File) | Some(Kind::Symlink(_)) => {
                self.remove_entry(name);
                report.overwritten.push(name.to_string());
                Ok(true)
            }
            Some(Kind::Directory) => {
                let child = self.descend_one(name).await?;
                if child.is_empty() {
                    self.remove_entry(name);
                    report.overwritten.push(name.to_string());
                    Ok(true)
                } else {
                    report.ignored.push(name.to_string());
                    Ok(false)
                }
            }
        }
    }

    /// "if no entry exists, create empty subdirectory; if one exists of any
    /// kind, keep it" (spec §4.4). A non-directory conflict is recorded as
    /// ignored rather than overwritten — directories never clobber files.
    async fn ensure_plain_directory(
        &self,
        name: &str,
        report: &mut ImportReport,
    ) -> Result<Option<VirtualDirectory>, Error> {
        match self.classify(name) {
            None => Ok(Some(self.new_empty_child(name)?)),
            Some(Kind::Directory) => Ok(Some(self.descend_one(name).await?)),
            Some(_) => {
                report.ignored.push(name.to_string());
                Ok(None)
            }
        }
    }

    /// Imports a filesystem tree rooted at `source` into this node. When
    /// `filter` is given, only the listed relative paths are imported
    /// (spec §4.4).
    #[instrument(skip(self, filter), fields(source = %source.display()), err)]
    pub async fn import_from_filesystem(
        &self,
        source: &Path,
        filter: Option<&[String]>,
    ) -> Result<ImportReport, Error> {
        let mut report = ImportReport::default();
        match filter {
            None => Box::pin(self.import_fs_recursive(source, &mut report)).await?,
            Some(paths) => {
                for rel in paths {
                    Box::pin(self.import_fs_path(source, rel, &mut report)).await?;
                }
            }
        }
        Ok(report)
    }

    async fn import_fs_recursive(&self, source: &Path, report: &mut ImportReport) -> Result<(), Error> {
        let mut entries = tokio::fs::read_dir(source).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let file_type = entry.file_type().await?;
            if file_type.is_symlink() {
                self.import_fs_symlink(&entry.path(), &name, report).await?;
            } else if file_type.is_dir() {
                match self.ensure_plain_directory(&name, report).await? {
                    Some(child) => Box::pin(child.import_fs_recursive(&entry.path(), report)).await?,
                    None => {}
                }
            } else {
                self.import_fs_file(&entry.path(), &name, report).await?;
            }
        }
        Ok(())
    }

    async fn import_fs_path(
        &self,
        source_root: &Path,
        rel: &str,
        report: &mut ImportReport,
    ) -> Result<(), Error> {
        let (head, tail) = split_first(rel);
        match tail {
            Some(tail) => {
                let child = self.resolve_or_create_head(head).await?;
                Box::pin(child.import_fs_path(&source_root.join(head), tail, report)).await
            }
            None => {
                let full_path = source_root.join(head);
                let meta = tokio::fs::symlink_metadata(&full_path).await?;
                if meta.file_type().is_symlink() {
                    self.import_fs_symlink(&full_path, head, report).await
                } else if meta.file_type().is_dir() {
                    match self.ensure_plain_directory(head, report).await? {
                        Some(child) => Box::pin(child.import_fs_recursive(&full_path, report)).await,
                        None => Ok(()),
                    }
                } else {
                    self.import_fs_file(&full_path, head, report).await
                }
            }
        }
    }

    async fn resolve_or_create_head(&self, name: &str) -> Result<VirtualDirectory, Error> {
        match self.classify(name) {
            None => self.new_empty_child(name),
            Some(Kind::Directory) => self.descend_one(name).await,
            Some(Kind::File) => Err(Error::VirtualDirectoryConflict(name.to_string())),
            Some(Kind::Symlink(target)) => match self.resolve_symlink(&target, true).await? {
                Resolved::Directory(vd) => Ok(vd),
                Resolved::File | Resolved::Missing => {
                    Err(Error::BrokenSymlink(name.to_string(), target))
                }
            },
        }
    }

    async fn import_fs_symlink(&self, path: &Path, name: &str, report: &mut ImportReport) -> Result<(), Error> {
        if !self.check_replacement(name, report).await? {
            return Ok(());
        }
        let target = tokio::fs::read_link(path).await?;
        let target = target.to_string_lossy().to_string();
        let node = SymlinkNode::new(name, target).map_err(|e| node_err(name, e))?;
        self.insert_entry(Node::Symlink(node))
    }

    async fn import_fs_file(&self, path: &Path, name: &str, report: &mut ImportReport) -> Result<(), Error> {
        if !self.check_replacement(name, report).await? {
            return Ok(());
        }
        let is_executable = is_executable_by_owner(path).await?;
        let blobs = self.arena.borrow().blobs.clone();
        let digest = blobs.insert_path(path).await?;
        self.insert_entry(Node::File(FileNode::new(name, digest, is_executable)))
    }

    /// CAS-to-CAS import: adopts whole subtrees by digest where there is no
    /// local directory to merge into, avoiding per-file work (spec §4.4).
    #[instrument(skip(self, source, filter), err)]
    pub async fn import_from_directory(
        &self,
        source: &VirtualDirectory,
        filter: Option<&[String]>,
    ) -> Result<ImportReport, Error> {
        let mut report = ImportReport::default();
        match filter {
            None => Box::pin(self.import_cas_full(source, &mut report)).await?,
            Some(paths) => Box::pin(self.import_cas_partial(source, paths, &mut report)).await?,
        }
        Ok(report)
    }

    async fn import_cas_full(&self, source: &VirtualDirectory, report: &mut ImportReport) -> Result<(), Error> {
        for (name, node) in source.snapshot_entries() {
            match node {
                Node::Directory(dnode) => {
                    if matches!(self.classify(&name), Some(Kind::Directory)) {
                        let local_child = self.descend_one(&name).await?;
                        let source_child = source.descend_one(&name).await?;
                        Box::pin(local_child.import_cas_full(&source_child, report)).await?;
                    } else {
                        if self.classify(&name).is_some() {
                            self.remove_entry(&name);
                            report.overwritten.push(name.clone());
                        }
                        self.adopt_directory_node(dnode)?;
                    }
                }
                Node::File(f) => {
                    if self.classify(&name).is_some() {
                        self.remove_entry(&name);
                        report.overwritten.push(name.clone());
                    }
                    self.insert_entry(Node::File(f))?;
                }
                Node::Symlink(s) => {
                    if self.classify(&name).is_some() {
                        self.remove_entry(&name);
                        report.overwritten.push(name.clone());
                    }
                    self.insert_entry(Node::Symlink(s))?;
                }
            }
        }
        Ok(())
    }

    async fn import_cas_partial(
        &self,
        source: &VirtualDirectory,
        paths: &[String],
        report: &mut ImportReport,
    ) -> Result<(), Error> {
        for (head, sub_filter) in group_by_first_segment(paths) {
            let local_child = match self.classify(&head) {
                Some(Kind::Directory) => self.descend_one(&head).await?,
                None => self.new_empty_child(&head)?,
                Some(_) => {
                    report.ignored.push(head.clone());
                    continue;
                }
            };
            let source_child = match source.classify(&head) {
                Some(Kind::Directory) => source.descend_one(&head).await?,
                _ => {
                    report.ignored.push(head.clone());
                    continue;
                }
            };
            if sub_filter.is_empty() {
                Box::pin(local_child.import_cas_full(&source_child, report)).await?;
            } else {
                Box::pin(local_child.import_cas_partial(&source_child, &sub_filter, report)).await?;
            }
        }
        Ok(())
    }

    /// Re-encodes and persists every dirty node depth-first, leaves first.
    /// Part of the canonical post-import sequence (spec §4.4).
    #[instrument(skip(self), err)]
    pub async fn recompute_down(&self) -> Result<Digest, Error> {
        Box::pin(self.recompute_down_inner()).await
    }

    async fn recompute_down_inner(&self) -> Result<Digest, Error> {
        let child_keys: Vec<(String, VKey)> = {
            let arena = self.arena.borrow();
            arena.nodes[self.key.0]
                .entries
                .iter()
                .filter_map(|(name, e)| e.child.map(|k| (name.clone(), k)))
                .collect()
        };

        for (name, key) in child_keys {
            let child = VirtualDirectory {
                arena: self.arena.clone(),
                key,
            };
            let digest = Box::pin(child.recompute_down_inner()).await?;
            let mut arena = self.arena.borrow_mut();
            if let Some(entry) = arena.nodes[self.key.0].entries.get_mut(&name) {
                if let Node::Directory(d) = &entry.node {
                    if d.digest() != &digest {
                        entry.node = Node::Directory(DirectoryNode::new(name, digest));
                    }
                }
            }
        }

        self.encode_and_store_self().await
    }

    async fn encode_and_store_self(&self) -> Result<Digest, Error> {
        let dir = self.to_directory();
        let bytes = DirectoryCodec::encode(&dir);
        let digest = Digest::of_bytes(&bytes);
        let blobs = self.arena.borrow().blobs.clone();
        blobs.insert_bytes(&bytes).await?;

        let mut arena = self.arena.borrow_mut();
        arena.nodes[self.key.0].digest = Some(digest.clone());
        arena.nodes[self.key.0].dirty = false;
        Ok(digest)
    }

    fn to_directory(&self) -> Directory {
        let arena = self.arena.borrow();
        let mut dir = Directory::new();
        for entry in arena.nodes[self.key.0].entries.values() {
            dir.add(entry.node.clone())
                .expect("entries are validated on insertion");
        }
        dir
    }

    /// Re-encodes this node (incorporating its children's current digests)
    /// and recurses upward to the root. The canonical post-import step once
    /// `recompute_down` has run on a subtree with a parent (spec §4.4).
    #[instrument(skip(self), err)]
    pub async fn recompute_up(&self) -> Result<(), Error> {
        Box::pin(self.recompute_up_inner()).await
    }

    async fn recompute_up_inner(&self) -> Result<(), Error> {
        let child_keys: Vec<(String, VKey)> = {
            let arena = self.arena.borrow();
            arena.nodes[self.key.0]
                .entries
                .iter()
                .filter_map(|(name, e)| e.child.map(|k| (name.clone(), k)))
                .collect()
        };
        for (name, key) in child_keys {
            let child_digest = self.arena.borrow().nodes[key.0].digest.clone();
            if let Some(digest) = child_digest {
                let mut arena = self.arena.borrow_mut();
                if let Some(entry) = arena.nodes[self.key.0].entries.get_mut(&name) {
                    if let Node::Directory(d) = &entry.node {
                        if d.digest() != &digest {
                            entry.node = Node::Directory(DirectoryNode::new(name, digest));
                        }
                    }
                }
            }
        }

        self.encode_and_store_self().await?;

        let parent_key = self.arena.borrow().nodes[self.key.0].parent;
        if let Some(pk) = parent_key {
            let parent = VirtualDirectory {
                arena: self.arena.clone(),
                key: pk,
            };
            Box::pin(parent.recompute_up_inner()).await?;
        }
        Ok(())
    }

    /// `recompute_down()` followed by `recompute_up()` if a parent exists —
    /// the canonical sequence spec §4.4 calls for after `import_files`.
    pub async fn commit(&self) -> Result<Digest, Error> {
        let digest = self.recompute_down().await?;
        if self.has_parent() {
            self.recompute_up().await?;
        }
        Ok(digest)
    }

    /// Writes this subtree to a real filesystem at `dest_path` (spec
    /// §4.4). Pre-existing entries cause `ExportConflict`, except an
    /// already-existing directory, which is reused.
    #[instrument(skip(self), fields(dest = %dest_path.as_ref().display()), err)]
    pub async fn export_files(&self, dest_path: impl AsRef<Path>) -> Result<(), Error> {
        Box::pin(self.export_inner(dest_path.as_ref())).await
    }

    async fn export_inner(&self, dest_path: &Path) -> Result<(), Error> {
        if tokio::fs::try_exists(dest_path).await? {
            if !is_dir_path(dest_path).await? {
                return Err(Error::ExportConflict(dest_path.display().to_string()));
            }
        } else {
            tokio::fs::create_dir_all(dest_path).await?;
        }

        for (name, node) in self.snapshot_entries() {
            let dest = dest_path.join(&name);
            match node {
                Node::Directory(_) => {
                    let child = self.descend_one(&name).await?;
                    Box::pin(child.export_inner(&dest)).await?;
                }
                Node::File(f) => {
                    if tokio::fs::try_exists(&dest).await? {
                        return Err(Error::ExportConflict(dest.display().to_string()));
                    }
                    let blobs = self.arena.borrow().blobs.clone();
                    tokio::fs::copy(blobs.path_of(f.digest()), &dest).await?;
                    if f.is_executable() {
                        set_executable(&dest).await?;
                    }
                }
                Node::Symlink(s) => {
                    if tokio::fs::try_exists(&dest).await? {
                        return Err(Error::ExportConflict(dest.display().to_string()));
                    }
                    make_symlink(s.target(), &dest).await?;
                }
            }
        }
        Ok(())
    }

    /// All relative paths under this node, depth-first.
    pub async fn list_relative_paths(&self) -> Result<Vec<String>, Error> {
        Box::pin(self.list_inner(String::new(), false)).await
    }

    /// Relative paths of entries whose modified flag is set, depth-first.
    pub async fn list_modified_paths(&self) -> Result<Vec<String>, Error> {
        Box::pin(self.list_inner(String::new(), true)).await
    }

    async fn list_inner(&self, prefix: String, modified_only: bool) -> Result<Vec<String>, Error> {
        let mut out = Vec::new();
        for (name, node, modified) in self.snapshot_entries_with_modified() {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}/{name}")
            };
            if !modified_only || modified {
                out.push(path.clone());
            }
            if let Node::Directory(_) = node {
                let child = self.descend_one(&name).await?;
                let mut sub = Box::pin(child.list_inner(path, modified_only)).await?;
                out.append(&mut sub);
            }
        }
        Ok(out)
    }

    /// Clears the modified flag on every index entry in this subtree,
    /// recursively. Does not touch digests (spec §4.4).
    pub fn mark_unmodified(&self) {
        let child_keys: Vec<VKey> = {
            let mut arena = self.arena.borrow_mut();
            let node = &mut arena.nodes[self.key.0];
            for e in node.entries.values_mut() {
                e.modified = false;
            }
            node.entries.values().filter_map(|e| e.child).collect()
        };
        for k in child_keys {
            VirtualDirectory {
                arena: self.arena.clone(),
                key: k,
            }
            .mark_unmodified();
        }
    }
}

async fn load_directory(arena: &Rc<RefCell<Arena>>, digest: &Digest) -> Result<Directory, Error> {
    let blobs = arena.borrow().blobs.clone();
    let mut file = blobs
        .open_read(digest)
        .await?
        .ok_or_else(|| Error::BlobMissing(digest.clone()))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).await?;
    DirectoryCodec::decode(&bytes)
}

async fn is_dir_path(path: &Path) -> Result<bool, Error> {
    Ok(tokio::fs::metadata(path).await?.is_dir())
}

#[cfg(unix)]
async fn is_executable_by_owner(path: &Path) -> Result<bool, Error> {
    use std::os::unix::fs::PermissionsExt;
    let meta = tokio::fs::metadata(path).await?;
    Ok(meta.permissions().mode() & 0o100 != 0)
}

#[cfg(not(unix))]
async fn is_executable_by_owner(_path: &Path) -> Result<bool, Error> {
    Ok(false)
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
    use rstest::rstest;

    async fn blobs() -> BlobStore {
        let dir = Box::leak(Box::new(tempfile::tempdir().unwrap()));
        BlobStore::open(dir.path()).await.unwrap()
    }

    #[tokio::test]
    async fn create_directory_is_idempotent() {
        let vd = VirtualDirectory::empty(blobs().await);
        let a1 = vd.create_directory("a").await.unwrap();
        a1.commit().await.unwrap();
        let a2 = vd.create_directory("a").await.unwrap();
        assert_eq!(a1.digest(), a2.digest());
    }

    #[tokio::test]
    async fn create_directory_overwrites_file() {
        let vd = VirtualDirectory::empty(blobs().await);
        let blob_digest = {
            let arena = vd.arena.borrow();
            arena.blobs.clone()
        }
        .insert_bytes(b"hello")
        .await
        .unwrap();
        vd.insert_entry(Node::File(FileNode::new("a", blob_digest, false)))
            .unwrap();

        vd.create_directory("a").await.unwrap();
        assert!(matches!(vd.classify("a"), Some(Kind::Directory)));
    }

    #[tokio::test]
    async fn create_directory_through_symlink_to_directory_is_noop() {
        let vd = VirtualDirectory::empty(blobs().await);
        let b = vd.create_directory("b").await.unwrap();
        b.commit().await.unwrap();
        vd.insert_entry(Node::Symlink(SymlinkNode::new("a", "b").unwrap()))
            .unwrap();

        let resolved = vd.create_directory("a").await.unwrap();
        assert!(matches!(vd.classify("a"), Some(Kind::Symlink(_))));
        assert_eq!(resolved.digest(), b.digest());
    }

    #[tokio::test]
    async fn import_from_filesystem_hashes_files_and_symlinks() {
        let src = tempfile::tempdir().unwrap();
        tokio::fs::write(src.path().join("file.txt"), b"contents").await.unwrap();
        tokio::fs::create_dir(src.path().join("sub")).await.unwrap();
        tokio::fs::write(src.path().join("sub/nested.txt"), b"nested").await.unwrap();
        #[cfg(unix)]
        tokio::fs::symlink("file.txt", src.path().join("link")).await.unwrap();

        let vd = VirtualDirectory::empty(blobs().await);
        let report = vd.import_from_filesystem(src.path(), None).await.unwrap();
        assert!(report.overwritten.is_empty());

        let paths = vd.list_relative_paths().await.unwrap();
        assert!(paths.contains(&"file.txt".to_string()));
        assert!(paths.contains(&"sub".to_string()));
        assert!(paths.contains(&"sub/nested.txt".to_string()));
        #[cfg(unix)]
        assert!(paths.contains(&"link".to_string()));
    }

    #[tokio::test]
    async fn import_reports_ignored_for_nonempty_directory_conflict() {
        let blobs = blobs().await;
        let vd = VirtualDirectory::empty(blobs.clone());
        let sub = vd.create_directory("a").await.unwrap();
        sub.insert_entry(Node::File(FileNode::new(
            "keep",
            blobs.insert_bytes(b"keep").await.unwrap(),
            false,
        )))
        .unwrap();
        sub.commit().await.unwrap();

        let src = tempfile::tempdir().unwrap();
        tokio::fs::write(src.path().join("a"), b"now a file").await.unwrap();

        let report = vd
            .import_from_filesystem(src.path(), Some(&["a".to_string()]))
            .await
            .unwrap();
        assert_eq!(report.ignored, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn cas_to_cas_full_import_adopts_subtree_wholesale() {
        let blobs = blobs().await;
        let source_root = VirtualDirectory::empty(blobs.clone());
        let sub = source_root.create_directory("shared").await.unwrap();
        sub.insert_entry(Node::File(FileNode::new(
            "x",
            blobs.insert_bytes(b"x").await.unwrap(),
            false,
        )))
        .unwrap();
        sub.commit().await.unwrap();

        let dest_root = VirtualDirectory::empty(blobs.clone());
        let report = dest_root.import_from_directory(&source_root, None).await.unwrap();
        assert!(report.overwritten.is_empty());

        let paths = dest_root.list_relative_paths().await.unwrap();
        assert!(paths.contains(&"shared".to_string()));
        assert!(paths.contains(&"shared/x".to_string()));
    }

    #[tokio::test]
    async fn mark_unmodified_clears_flags_recursively() {
        let vd = VirtualDirectory::empty(blobs().await);
        let sub = vd.create_directory("a").await.unwrap();
        sub.insert_entry(Node::File(FileNode::new(
            "f",
            Digest::of_bytes(b"f"),
            false,
        )))
        .unwrap();

        assert!(!vd.list_modified_paths().await.unwrap().is_empty());
        vd.mark_unmodified();
        assert!(vd.list_modified_paths().await.unwrap().is_empty());
    }

    #[derive(Debug, Clone, Copy)]
    enum ConflictSetup {
        Absent,
        File,
        Symlink,
        EmptyDirectory,
        NonEmptyDirectory,
    }

    /// One case per conflict class of `check_replacement` (spec §4.4,
    /// S8): absent permits silently, a file/symlink/empty directory permits
    /// and overwrites, a non-empty directory denies and records `ignored`.
    #[rstest]
    #[case::absent(ConflictSetup::Absent, true, false)]
    #[case::file(ConflictSetup::File, true, true)]
    #[case::symlink(ConflictSetup::Symlink, true, true)]
    #[case::empty_directory(ConflictSetup::EmptyDirectory, true, true)]
    #[case::non_empty_directory(ConflictSetup::NonEmptyDirectory, false, false)]
    #[tokio::test]
    async fn check_replacement_matches_overwrite_policy(
        #[case] setup: ConflictSetup,
        #[case] permits: bool,
        #[case] overwrites: bool,
    ) {
        let vd = VirtualDirectory::empty(blobs().await);
        match setup {
            ConflictSetup::Absent => {}
            ConflictSetup::File => {
                vd.insert_entry(Node::File(FileNode::new("a", Digest::of_bytes(b"x"), false)))
                    .unwrap();
            }
            ConflictSetup::Symlink => {
                vd.insert_entry(Node::Symlink(SymlinkNode::new("a", "target").unwrap()))
                    .unwrap();
            }
            ConflictSetup::EmptyDirectory => {
                vd.create_directory("a").await.unwrap();
            }
            ConflictSetup::NonEmptyDirectory => {
                let sub = vd.create_directory("a").await.unwrap();
                sub.insert_entry(Node::File(FileNode::new(
                    "keep",
                    Digest::of_bytes(b"keep"),
                    false,
                )))
                .unwrap();
            }
        }

        let mut report = ImportReport::default();
        let permitted = vd.check_replacement("a", &mut report).await.unwrap();
        assert_eq!(permitted, permits);
        if overwrites {
            assert_eq!(report.overwritten, vec!["a".to_string()]);
            assert!(report.ignored.is_empty());
        } else if permits {
            assert!(report.overwritten.is_empty());
            assert!(report.ignored.is_empty());
        } else {
            assert_eq!(report.ignored, vec!["a".to_string()]);
            assert!(report.overwritten.is_empty());
        }
    }

    #[tokio::test]
    async fn export_then_reimport_round_trips_tree() {
        let blobs_store = blobs().await;
        let vd = VirtualDirectory::empty(blobs_store.clone());
        vd.insert_entry(Node::File(FileNode::new(
            "a",
            blobs_store.insert_bytes(b"hello").await.unwrap(),
            true,
        )))
        .unwrap();
        let digest = vd.commit().await.unwrap();

        let dest = tempfile::tempdir().unwrap();
        vd.export_files(dest.path()).await.unwrap();

        let vd2 = VirtualDirectory::empty(blobs_store.clone());
        vd2.import_from_filesystem(dest.path(), None).await.unwrap();
        let digest2 = vd2.commit().await.unwrap();
        assert_eq!(digest, digest2);
    }
}
