//! Notification sources feeding the tree watcher
//!
//! A source owns per-directory watch registrations and delivers
//! [`SourceEvent`]s on an unbounded channel. [`NotifySource`] is backed by
//! the platform watcher from `notify`; [`ManualSource`] is driven by hand and
//! serves virtual trees and tests.

use crate::error::{Result, WatcherError};
use crate::event::{RawNotification, RawOp};
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind as NotifyKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use shadow_core::SourcePath;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// What a notification source delivers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    Notification(RawNotification),
    /// A notification of a kind the watcher cannot map
    Unhandled { kind: String, path: Option<PathBuf> },
    Error(String),
}

/// Per-directory watch registration
///
/// Registrations are non-recursive: the watcher registers every directory
/// of the mirrored subtree individually.
pub trait NotificationSource: Send + 'static {
    fn register_directory(&mut self, path: &Path) -> Result<()>;

    fn unregister_directory(&mut self, path: &Path) -> Result<()>;

    /// Release every registration. Later registrations fail with `Closed`.
    fn close(&mut self);

    /// Whether a directory moved under another parent must be registered
    /// again under its new path
    fn rewatch_on_move(&self) -> bool {
        true
    }
}

/// Source backed by the platform's recommended `notify` watcher
pub struct NotifySource {
    watcher: Option<RecommendedWatcher>,
}

impl NotifySource {
    /// Create the platform watcher and the channel its events arrive on
    pub fn new() -> Result<(Self, mpsc::UnboundedReceiver<SourceEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();

        let watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            match result {
                Ok(event) => {
                    for translated in translate(&event) {
                        // Receiver gone means the watcher is shutting down
                        let _ = tx.send(translated);
                    }
                }
                Err(e) => {
                    let _ = tx.send(SourceEvent::Error(e.to_string()));
                }
            }
        })
        .map_err(|e| WatcherError::Source(format!("failed to create watcher: {}", e)))?;

        Ok((
            Self {
                watcher: Some(watcher),
            },
            rx,
        ))
    }
}

impl NotificationSource for NotifySource {
    fn register_directory(&mut self, path: &Path) -> Result<()> {
        let watcher = self.watcher.as_mut().ok_or(WatcherError::Closed)?;
        watcher
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|e| WatcherError::WatchRegistrationFailed {
                action: "add",
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }

    fn unregister_directory(&mut self, path: &Path) -> Result<()> {
        let watcher = self.watcher.as_mut().ok_or(WatcherError::Closed)?;
        match watcher.unwatch(path) {
            Ok(()) => Ok(()),
            // The kernel drops watches of deleted directories on its own
            Err(e) if matches!(e.kind, notify::ErrorKind::WatchNotFound) || !path.exists() => {
                debug!("Watch for {} already gone: {}", path.display(), e);
                Ok(())
            }
            Err(e) => Err(WatcherError::WatchRegistrationFailed {
                action: "remove",
                path: path.to_path_buf(),
                reason: e.to_string(),
            }),
        }
    }

    fn close(&mut self) {
        // Dropping the watcher removes all kernel watches
        self.watcher = None;
    }
}

/// Map a `notify` event onto raw notifications
pub fn translate(event: &notify::Event) -> Vec<SourceEvent> {
    if event.need_rescan() {
        return vec![SourceEvent::Error(
            "notification queue overflowed, tree must be resynchronized".to_string(),
        )];
    }

    let op = match event.kind {
        NotifyKind::Create(_) => RawOp::Create,
        NotifyKind::Remove(_) => RawOp::Remove,
        NotifyKind::Modify(ModifyKind::Metadata(_)) => RawOp::Chmod,
        NotifyKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => RawOp::Rename,
            RenameMode::To => RawOp::Create,
            // Both halves are also delivered on their own
            RenameMode::Both => return Vec::new(),
            RenameMode::Any | RenameMode::Other => {
                return event
                    .paths
                    .iter()
                    .map(|p| {
                        let op = if p.exists() {
                            RawOp::Create
                        } else {
                            RawOp::Rename
                        };
                        notification(op, p)
                    })
                    .collect();
            }
        },
        NotifyKind::Modify(_) => RawOp::Write,
        NotifyKind::Access(_) => return Vec::new(),
        NotifyKind::Any | NotifyKind::Other => {
            let kind = format!("{:?}", event.kind);
            if event.paths.is_empty() {
                return vec![SourceEvent::Unhandled { kind, path: None }];
            }
            return event
                .paths
                .iter()
                .map(|p| SourceEvent::Unhandled {
                    kind: kind.clone(),
                    path: Some(p.clone()),
                })
                .collect();
        }
    };

    event.paths.iter().map(|p| notification(op, p)).collect()
}

fn notification(op: RawOp, path: &Path) -> SourceEvent {
    SourceEvent::Notification(RawNotification::new(op, SourcePath::fs(path)))
}

#[derive(Debug, Default)]
struct ManualState {
    watched: BTreeSet<PathBuf>,
    rejected: BTreeSet<PathBuf>,
    closed: bool,
}

/// Hand-driven source
///
/// Registrations are recorded instead of reaching the kernel, and
/// notifications are injected through the paired [`ManualHandle`].
pub struct ManualSource {
    state: Arc<Mutex<ManualState>>,
    rewatch_on_move: bool,
}

/// Control side of a [`ManualSource`]
#[derive(Clone)]
pub struct ManualHandle {
    state: Arc<Mutex<ManualState>>,
    tx: mpsc::UnboundedSender<SourceEvent>,
}

impl ManualSource {
    pub fn new() -> (Self, ManualHandle, mpsc::UnboundedReceiver<SourceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(ManualState::default()));
        (
            Self {
                state: Arc::clone(&state),
                rewatch_on_move: true,
            },
            ManualHandle { state, tx },
            rx,
        )
    }

    /// Mimic platforms whose watches follow a directory when it moves
    pub fn with_rewatch_on_move(mut self, rewatch: bool) -> Self {
        self.rewatch_on_move = rewatch;
        self
    }
}

impl NotificationSource for ManualSource {
    fn register_directory(&mut self, path: &Path) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(WatcherError::Closed);
        }
        if state.rejected.contains(path) {
            return Err(WatcherError::WatchRegistrationFailed {
                action: "add",
                path: path.to_path_buf(),
                reason: "rejected".to_string(),
            });
        }
        state.watched.insert(path.to_path_buf());
        Ok(())
    }

    fn unregister_directory(&mut self, path: &Path) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(WatcherError::Closed);
        }
        state.watched.remove(path);
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.watched.clear();
    }

    fn rewatch_on_move(&self) -> bool {
        self.rewatch_on_move
    }
}

impl ManualHandle {
    /// Deliver a raw notification as if the platform reported it
    pub fn notify(&self, op: RawOp, path: SourcePath) -> bool {
        self.send(SourceEvent::Notification(RawNotification::new(op, path)))
    }

    pub fn send(&self, event: SourceEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    /// Make future registrations of `path` fail
    pub fn reject(&self, path: impl Into<PathBuf>) {
        self.state.lock().rejected.insert(path.into());
    }

    /// Directories currently registered with the source
    pub fn watched(&self) -> BTreeSet<PathBuf> {
        self.state.lock().watched.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}
