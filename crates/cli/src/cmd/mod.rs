//! CLI command implementations

pub mod show;
pub mod tree;
pub mod watch;
