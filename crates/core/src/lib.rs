//! shadow-core - in-memory mirror of a watched directory subtree
//!
//! This crate provides:
//! - Path abstraction over real and virtual paths
//! - BLAKE3 content checksums for file nodes
//! - The shadow tree and its point mutations
//! - Tree snapshots for restore after restart

pub mod error;
pub mod hash;
pub mod path;
pub mod snapshot;
pub mod tree;

// Re-export main types for convenience
pub use error::{Error, Result};
pub use hash::{Blake3Checksum, Checksum};
pub use path::{RelativePath, SourcePath};
pub use tree::{Metadata, Node};
