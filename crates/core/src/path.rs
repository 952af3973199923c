//! Path abstraction over real and virtual filesystem paths
//!
//! Every tree operation is addressed by a [`RelativePath`]: the segments of
//! a [`SourcePath`] below the watcher's base directory (the parent of the
//! watched root), so the root itself is addressed by its own name.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Ordered path segments relative to a base directory
///
/// Uses SmallVec so typical shallow paths never touch the heap for the
/// segment list itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelativePath {
    segments: SmallVec<[String; 8]>,
}

impl RelativePath {
    /// The empty path (addresses the base itself)
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse a `/`-separated path, ignoring empty and `.` segments
    pub fn parse(path: &str) -> Self {
        path.split('/')
            .filter(|s| !s.is_empty() && *s != ".")
            .map(str::to_string)
            .collect()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Last segment, if any
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Path with the last segment removed (empty stays empty)
    pub fn parent(&self) -> Self {
        let mut segments = self.segments.clone();
        segments.pop();
        Self { segments }
    }

    pub fn join(&self, name: &str) -> Self {
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        Self { segments }
    }

    /// True if `prefix` is a (not necessarily strict) leading run of segments
    pub fn starts_with(&self, prefix: &RelativePath) -> bool {
        self.segments.len() >= prefix.segments.len()
            && self.segments[..prefix.segments.len()] == prefix.segments[..]
    }

    /// Segments remaining after `prefix`, or `None` if it is not a prefix
    pub fn strip_prefix(&self, prefix: &RelativePath) -> Option<Self> {
        if !self.starts_with(prefix) {
            return None;
        }
        Some(self.segments[prefix.segments.len()..].iter().cloned().collect())
    }
}

impl FromIterator<String> for RelativePath {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self {
            segments: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

/// A path on the real filesystem or in a host-defined virtual namespace
///
/// Real paths answer `exists`/`is_dir` from live filesystem state. Virtual
/// paths always exist and carry their directory-ness with them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourcePath {
    Fs(PathBuf),
    Virtual { path: PathBuf, is_dir: bool },
}

impl SourcePath {
    pub fn fs(path: impl Into<PathBuf>) -> Self {
        Self::Fs(path.into())
    }

    pub fn virtual_dir(path: impl Into<PathBuf>) -> Self {
        Self::Virtual {
            path: path.into(),
            is_dir: true,
        }
    }

    pub fn virtual_file(path: impl Into<PathBuf>) -> Self {
        Self::Virtual {
            path: path.into(),
            is_dir: false,
        }
    }

    pub fn as_path(&self) -> &Path {
        match self {
            Self::Fs(path) => path,
            Self::Virtual { path, .. } => path,
        }
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self, Self::Virtual { .. })
    }

    pub fn is_dir(&self) -> bool {
        match self {
            Self::Fs(path) => path.is_dir(),
            Self::Virtual { is_dir, .. } => *is_dir,
        }
    }

    pub fn exists(&self) -> bool {
        match self {
            // symlink_metadata so dangling links still count as present
            Self::Fs(path) => path.symlink_metadata().is_ok(),
            Self::Virtual { .. } => true,
        }
    }

    /// Leaf name (empty for a filesystem root)
    pub fn name(&self) -> String {
        self.as_path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Parent path of the same variant; a root is its own parent
    pub fn parent(&self) -> Self {
        let parent = self
            .as_path()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.as_path().to_path_buf());
        match self {
            Self::Fs(_) => Self::Fs(parent),
            Self::Virtual { .. } => Self::virtual_dir(parent),
        }
    }

    /// Child path of the same variant
    ///
    /// `is_dir` only matters for virtual paths; real paths consult the disk.
    pub fn join(&self, name: &str, is_dir: bool) -> Self {
        let path = self.as_path().join(name);
        match self {
            Self::Fs(_) => Self::Fs(path),
            Self::Virtual { .. } => Self::Virtual { path, is_dir },
        }
    }

    /// Rebuild an absolute path from a relative one under `self`
    pub fn resolve(&self, relative: &RelativePath, is_dir: bool) -> Self {
        let mut path = self.as_path().to_path_buf();
        for segment in relative.segments() {
            path.push(segment);
        }
        match self {
            Self::Fs(_) => Self::Fs(path),
            Self::Virtual { .. } => Self::Virtual { path, is_dir },
        }
    }

    /// The same path after `from` was relocated to `to`
    ///
    /// `None` when `self` is not `from` or below it.
    pub fn rebase(&self, from: &SourcePath, to: &SourcePath) -> Option<Self> {
        let rest = self.as_path().strip_prefix(from.as_path()).ok()?;
        let mut path = to.as_path().to_path_buf();
        if !rest.as_os_str().is_empty() {
            path.push(rest);
        }
        Some(match self {
            Self::Fs(_) => Self::Fs(path),
            Self::Virtual { is_dir, .. } => Self::Virtual {
                path,
                is_dir: *is_dir,
            },
        })
    }

    /// Path of `self` relative to `base`
    ///
    /// Yields the empty path for `base` itself and fails with
    /// [`Error::InvalidPath`] when `base` is not a prefix of `self`.
    pub fn exclude_prefix(&self, base: &SourcePath) -> Result<RelativePath> {
        let rest = self
            .as_path()
            .strip_prefix(base.as_path())
            .map_err(|_| Error::InvalidPath {
                path: self.as_path().to_path_buf(),
                base: base.as_path().to_path_buf(),
            })?;

        rest.components()
            .filter_map(|component| match component {
                Component::Normal(segment) => Some(Ok(segment.to_string_lossy().into_owned())),
                Component::CurDir => None,
                _ => Some(Err(Error::InvalidPath {
                    path: self.as_path().to_path_buf(),
                    base: base.as_path().to_path_buf(),
                })),
            })
            .collect::<Result<RelativePath>>()
    }
}

impl fmt::Display for SourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_path().display())
    }
}
