//! Error kinds shared by the path abstraction and the shadow tree

use std::path::PathBuf;

/// Errors produced by path arithmetic and shadow tree mutations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The watched root is not a directory
    #[error("input path is not a directory: {0}")]
    NotDirectory(PathBuf),

    /// The watched root has no leaf name to anchor relative paths
    #[error("cannot watch a path without a name: {0}")]
    UnnamedRoot(PathBuf),

    /// The source path vanished before it could be mirrored
    #[error("path does not exist: {0}")]
    PathDoesNotExist(PathBuf),

    /// A tree operation addressed a node that is not in the tree
    #[error("node not found: {0}")]
    NotFound(String),

    /// A tree operation addressed a slot that is already occupied
    #[error("node already exists: {0}")]
    AlreadyExists(String),

    /// Prefix exclusion was given a base that is not a prefix of the path
    #[error("{path} is not under {base}")]
    InvalidPath { path: PathBuf, base: PathBuf },

    /// Directories carry no content and are never written
    #[error("cannot update directory node: {0}")]
    IsDirectory(String),

    /// Rename endpoints must share a parent; crossing parents is a move
    #[error("rename crosses parent directories: {from} -> {to}")]
    ParentMismatch { from: String, to: String },

    /// The watched root can only be populated, never detached
    #[error("operation not permitted on the tree root: {0}")]
    RootImmutable(String),

    /// A move would place a node inside its own subtree
    #[error("cannot move {from} into its own subtree at {to}")]
    IntoOwnSubtree { from: String, to: String },

    /// Hashing a file failed
    #[error("failed to checksum {path}: {source}")]
    Checksum {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Snapshot I/O or encoding failed
    #[error("snapshot error: {0}")]
    Snapshot(String),
}

/// Result type used throughout shadow-core
pub type Result<T> = std::result::Result<T, Error>;
