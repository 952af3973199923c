//! Shadow tree: an in-memory mirror of a watched directory subtree
//!
//! The root node represents the watched directory itself. Every operation
//! is addressed by a [`RelativePath`] whose first segment is the root's
//! name, so `data/a/f.txt` names `f.txt` inside `a` inside the root `data`.

use crate::error::{Error, Result};
use crate::hash::Checksum;
use crate::path::{RelativePath, SourcePath};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use ulid::Ulid;
use walkdir::WalkDir;

/// Per-node metadata
///
/// `checksum` is only meaningful for files and stays empty for directories.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub is_dir: bool,
    pub checksum: String,
}

impl Metadata {
    pub fn directory() -> Self {
        Self {
            is_dir: true,
            checksum: String::new(),
        }
    }

    pub fn file(checksum: String) -> Self {
        Self {
            is_dir: false,
            checksum,
        }
    }
}

/// A node of the shadow tree
///
/// `id` is assigned when the node is created and survives rename and move,
/// so downstream consumers can follow a node across path changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: Ulid,
    pub name: String,
    pub meta: Metadata,
    pub children: AHashMap<String, Node>,
}

impl Node {
    pub fn new(name: impl Into<String>, meta: Metadata, id: Option<Ulid>) -> Self {
        Self {
            id: id.unwrap_or_else(Ulid::new),
            name: name.into(),
            meta,
            children: AHashMap::new(),
        }
    }

    /// Empty root directory node for a watcher
    pub fn root(name: impl Into<String>) -> Self {
        Self::new(name, Metadata::directory(), None)
    }

    pub fn is_dir(&self) -> bool {
        self.meta.is_dir
    }

    /// Number of nodes in this subtree, including `self`
    pub fn node_count(&self) -> usize {
        1 + self.children.values().map(Node::node_count).sum::<usize>()
    }

    /// Relative paths of every directory in this subtree (pre-order)
    ///
    /// `at` is the relative path of `self`.
    pub fn directory_paths(&self, at: &RelativePath) -> Vec<RelativePath> {
        let mut out = Vec::new();
        self.collect_directories(at.clone(), &mut out);
        out
    }

    fn collect_directories(&self, at: RelativePath, out: &mut Vec<RelativePath>) {
        if !self.meta.is_dir {
            return;
        }
        let mut children: Vec<&Node> = self.children.values().collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        out.push(at.clone());
        for child in children {
            child.collect_directories(at.join(&child.name), out);
        }
    }

    /// Node at `path`, or `None` if absent. Never fails.
    pub fn search(&self, path: &RelativePath) -> Option<&Node> {
        let (first, rest) = path.segments().split_first()?;
        if *first != self.name {
            return None;
        }
        rest.iter()
            .try_fold(self, |node, segment| node.children.get(segment))
    }

    fn search_mut(&mut self, path: &RelativePath) -> Option<&mut Node> {
        let (first, rest) = path.segments().split_first()?;
        if *first != self.name {
            return None;
        }
        rest.iter()
            .try_fold(self, |node, segment| node.children.get_mut(segment))
    }

    /// Parent directory of `path` plus the leaf name, for non-root paths
    fn parent_dir_mut(&mut self, path: &RelativePath) -> Result<(&mut Node, String)> {
        if path.len() < 2 {
            return Err(if path.name() == Some(self.name.as_str()) {
                Error::RootImmutable(path.to_string())
            } else {
                Error::NotFound(path.to_string())
            });
        }
        let parent_path = path.parent();
        let parent = self
            .search_mut(&parent_path)
            .filter(|node| node.meta.is_dir)
            .ok_or_else(|| Error::NotFound(parent_path.to_string()))?;
        let name = path.name().unwrap_or_default().to_string();
        Ok((parent, name))
    }

    /// Create the node at `path` from `source`
    ///
    /// Every intermediate segment must already be a directory node and the
    /// final segment must be free. Directories are populated by descending
    /// into the source; `discovered` is called once for each directory node
    /// created, the new node itself included, in parent-before-child order.
    ///
    /// Addressing the root itself populates the (empty) root in place.
    pub fn create(
        &mut self,
        path: &RelativePath,
        source: &SourcePath,
        checksum: &dyn Checksum,
        id: Option<Ulid>,
        discovered: &mut dyn FnMut(&SourcePath),
    ) -> Result<&Node> {
        if path.len() == 1 && path.name() == Some(self.name.as_str()) {
            return self.populate_root(source, checksum, discovered);
        }

        let (parent, name) = self.parent_dir_mut(path)?;
        if parent.children.contains_key(&name) {
            return Err(Error::AlreadyExists(path.to_string()));
        }
        if !source.exists() {
            return Err(Error::PathDoesNotExist(source.as_path().to_path_buf()));
        }

        let node = if source.is_dir() {
            discovered(source);
            let mut dir = Node::new(name.clone(), Metadata::directory(), id);
            dir.populate(source, checksum, discovered);
            dir
        } else {
            Node::new(name.clone(), Metadata::file(checksum.checksum(source)?), id)
        };

        debug!(path = %path, is_dir = node.meta.is_dir, "created node");
        Ok(parent.children.entry(name).or_insert(node))
    }

    fn populate_root(
        &mut self,
        source: &SourcePath,
        checksum: &dyn Checksum,
        discovered: &mut dyn FnMut(&SourcePath),
    ) -> Result<&Node> {
        if !self.children.is_empty() {
            return Err(Error::AlreadyExists(self.name.clone()));
        }
        if !source.exists() {
            return Err(Error::PathDoesNotExist(source.as_path().to_path_buf()));
        }
        if !source.is_dir() {
            return Err(Error::NotDirectory(source.as_path().to_path_buf()));
        }

        discovered(source);
        self.populate(source, checksum, discovered);
        debug!(root = %self.name, nodes = self.node_count(), "populated root");
        Ok(self)
    }

    /// Mirror the real subtree below `source` into `self`
    ///
    /// Entries that vanish mid-walk are skipped; files that cannot be read
    /// are kept with an empty checksum so the tree still mirrors the layout.
    fn populate(
        &mut self,
        source: &SourcePath,
        checksum: &dyn Checksum,
        discovered: &mut dyn FnMut(&SourcePath),
    ) {
        let root = match source {
            SourcePath::Fs(root) => root,
            // Virtual directories have nothing to list
            SourcePath::Virtual { .. } => return,
        };

        let walker = WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name();

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("skipping unreadable entry under {}: {}", root.display(), e);
                    continue;
                }
            };

            let Ok(relative) = SourcePath::fs(entry.path()).exclude_prefix(source) else {
                continue;
            };
            let Some(parent) = descend_mut(self, &relative.parent()) else {
                // Parent was skipped earlier in the walk
                continue;
            };
            let name = relative.name().unwrap_or_default().to_string();
            let child_path = SourcePath::fs(entry.path());

            let node = if entry.file_type().is_dir() {
                discovered(&child_path);
                Node::new(name.clone(), Metadata::directory(), None)
            } else {
                match checksum.checksum(&child_path) {
                    Ok(sum) => Node::new(name.clone(), Metadata::file(sum), None),
                    Err(Error::PathDoesNotExist(_)) => continue,
                    Err(e) => {
                        warn!("{}", e);
                        Node::new(name.clone(), Metadata::file(String::new()), None)
                    }
                }
            };
            parent.children.insert(name, node);
        }
    }

    /// Recompute the checksum of the file node at `path`
    pub fn update(
        &mut self,
        path: &RelativePath,
        source: &SourcePath,
        checksum: &dyn Checksum,
    ) -> Result<&Node> {
        let node = self
            .search_mut(path)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        if node.meta.is_dir {
            return Err(Error::IsDirectory(path.to_string()));
        }
        node.meta.checksum = checksum.checksum(source)?;
        Ok(node)
    }

    /// Detach and return the subtree at `path`
    pub fn remove(&mut self, path: &RelativePath) -> Result<Node> {
        let (parent, name) = self.parent_dir_mut(path)?;
        let removed = parent
            .children
            .remove(&name)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        debug!(path = %path, nodes = removed.node_count(), "removed node");
        Ok(removed)
    }

    /// Rename a node within its parent directory
    pub fn rename(&mut self, from: &RelativePath, to: &RelativePath) -> Result<&Node> {
        if from.len() >= 2 && to.len() >= 2 && from.parent() != to.parent() {
            return Err(Error::ParentMismatch {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        self.relocate(from, to)
    }

    /// Move a node anywhere in the tree, possibly to another parent
    pub fn move_node(&mut self, from: &RelativePath, to: &RelativePath) -> Result<&Node> {
        self.relocate(from, to)
    }

    /// Detach the subtree at `from` and reattach it at `to`
    ///
    /// All checks run before detaching, so a failed relocation leaves the
    /// tree untouched. Node ids and descendant metadata are preserved.
    fn relocate(&mut self, from: &RelativePath, to: &RelativePath) -> Result<&Node> {
        if from.len() < 2 {
            return Err(Error::RootImmutable(from.to_string()));
        }
        if to.starts_with(from) {
            return Err(Error::IntoOwnSubtree {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        if self.search(from).is_none() {
            return Err(Error::NotFound(from.to_string()));
        }
        {
            let (target_parent, target_name) = self.parent_dir_mut(to)?;
            if target_parent.children.contains_key(&target_name) {
                return Err(Error::AlreadyExists(to.to_string()));
            }
        }

        let mut node = self.remove(from)?;
        let (target_parent, target_name) = self.parent_dir_mut(to)?;
        node.name = target_name.clone();
        debug!(from = %from, to = %to, "relocated node");
        Ok(target_parent.children.entry(target_name).or_insert(node))
    }
}

/// Walk down from `node` through the given child segments
fn descend_mut<'a>(node: &'a mut Node, path: &RelativePath) -> Option<&'a mut Node> {
    path.segments()
        .iter()
        .try_fold(node, |node, segment| node.children.get_mut(segment))
}
