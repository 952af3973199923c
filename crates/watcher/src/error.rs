//! Errors surfaced by the tree watcher

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    /// A shadow tree operation failed (not found, already exists, ...)
    #[error(transparent)]
    Tree(#[from] shadow_core::Error),

    /// The notification source rejected a watch add or remove
    #[error("failed to {action} watch for {path}: {reason}")]
    WatchRegistrationFailed {
        action: &'static str,
        path: PathBuf,
        reason: String,
    },

    /// An event the watcher has no handling for
    #[error("unhandled event kind {kind} for {path}")]
    UnhandledEventKind { kind: String, path: String },

    /// Error delivered by the notification source itself
    #[error("notification source error: {0}")]
    Source(String),

    /// A publish timed out because the consumer is not draining a stream
    #[error("output stream stalled, dropped {0}")]
    OutputStalled(String),

    #[error("tree watcher must be started inside a tokio runtime")]
    NoRuntime,

    #[error("tree watcher is closed")]
    Closed,

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result type for watcher operations
pub type Result<T> = std::result::Result<T, WatcherError>;
