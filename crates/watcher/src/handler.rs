//! Applies semantic events to the shadow tree
//!
//! [`State`] is everything the watcher's single mutation lock guards: the
//! tree, the notification source and the set of registered directories.
//! A directory is registered exactly while it is a directory node, so every
//! mutation that adds, drops or relocates directories updates the watch set
//! in the same critical section.

use crate::error::{Result, WatcherError};
use crate::event::{Event, EventKind, Transaction};
use crate::source::NotificationSource;
use shadow_core::{Checksum, Node, RelativePath, SourcePath};
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Result of an accepted event
#[derive(Debug)]
pub(crate) struct Applied {
    pub transaction: Transaction,
    /// Watch registration failures that did not undo the mutation
    pub side_errors: Vec<WatcherError>,
}

impl Applied {
    fn new(transaction: Transaction) -> Self {
        Self {
            transaction,
            side_errors: Vec::new(),
        }
    }
}

pub(crate) struct State<S> {
    pub tree: Node,
    pub source: S,
    pub watched: BTreeSet<PathBuf>,
}

impl<S: NotificationSource> State<S> {
    pub fn new(tree: Node, source: S) -> Self {
        Self {
            tree,
            source,
            watched: BTreeSet::new(),
        }
    }

    /// Apply one event; `base` is the parent of the watched root
    pub fn apply(&mut self, base: &SourcePath, checksum: &dyn Checksum, event: Event) -> Result<Applied> {
        let from = event.from.exclude_prefix(base)?;
        debug!(kind = %event.kind, path = %from, "applying event");

        match event.kind {
            EventKind::Create => self.create(checksum, &from, &event),
            EventKind::Write => {
                let node = self.tree.update(&from, &event.from, checksum)?.clone();
                Ok(Applied::new(Transaction::new(EventKind::Write, from, None, node)))
            }
            EventKind::Remove => self.remove(base, from),
            EventKind::Rename | EventKind::Move => {
                let Some(to) = event.to.as_ref() else {
                    return Err(WatcherError::UnhandledEventKind {
                        kind: format!("{} without destination", event.kind),
                        path: event.from.to_string(),
                    });
                };
                let to = to.exclude_prefix(base)?;
                self.relocate(base, event.kind, from, to)
            }
        }
    }

    fn create(&mut self, checksum: &dyn Checksum, path: &RelativePath, event: &Event) -> Result<Applied> {
        if let Some(existing) = self.tree.search(path) {
            // Read in already by the new directory above it
            if event.covered {
                return Ok(Applied::new(Transaction::new(
                    EventKind::Create,
                    path.clone(),
                    None,
                    existing.clone(),
                )));
            }
            // Atomic saves replace a file in place; the new contents are a write
            if !existing.is_dir() && event.from.exists() && !event.from.is_dir() {
                let node = self.tree.update(path, &event.from, checksum)?.clone();
                return Ok(Applied::new(Transaction::new(
                    EventKind::Write,
                    path.clone(),
                    None,
                    node,
                )));
            }
        }

        // Directories are registered as they are discovered, before their
        // contents are read, so nothing created mid-walk goes unnoticed.
        // After the first failure the rest of this descent stays unwatched.
        let mut failure: Option<WatcherError> = None;
        let source = &mut self.source;
        let watched = &mut self.watched;
        let node = self
            .tree
            .create(
                path,
                &event.from,
                checksum,
                event.extra.map(|extra| extra.id),
                &mut |dir| {
                    if failure.is_some() {
                        return;
                    }
                    match source.register_directory(dir.as_path()) {
                        Ok(()) => {
                            watched.insert(dir.as_path().to_path_buf());
                        }
                        Err(e) => {
                            warn!("Stopping watch registration under {}: {}", dir, e);
                            failure = Some(e);
                        }
                    }
                },
            )?
            .clone();

        let mut applied = Applied::new(Transaction::new(EventKind::Create, path.clone(), None, node));
        applied.side_errors.extend(failure);
        Ok(applied)
    }

    fn remove(&mut self, base: &SourcePath, path: RelativePath) -> Result<Applied> {
        let removed = self.tree.remove(&path)?;

        let mut side_errors = Vec::new();
        for dir in removed.directory_paths(&path) {
            let dir = absolute(base, &dir);
            self.watched.remove(&dir);
            if let Err(e) = self.source.unregister_directory(&dir) {
                warn!("{}", e);
                side_errors.push(e);
            }
        }

        Ok(Applied {
            transaction: Transaction::new(EventKind::Remove, path, None, removed),
            side_errors,
        })
    }

    fn relocate(
        &mut self,
        base: &SourcePath,
        kind: EventKind,
        from: RelativePath,
        to: RelativePath,
    ) -> Result<Applied> {
        let node = match kind {
            EventKind::Rename => self.tree.rename(&from, &to)?,
            _ => self.tree.move_node(&from, &to)?,
        }
        .clone();

        let mut side_errors = Vec::new();
        if node.is_dir() {
            let rewatch = kind == EventKind::Rename || self.source.rewatch_on_move();
            let old_dirs = node.directory_paths(&from);
            let new_dirs = node.directory_paths(&to);

            for (old, new) in old_dirs.iter().zip(&new_dirs) {
                let old = absolute(base, old);
                let new = absolute(base, new);
                self.watched.remove(&old);

                if !rewatch {
                    self.watched.insert(new);
                    continue;
                }
                // Drop the old registration first: backends keyed by inode
                // hand back the same watch for the new path
                if let Err(e) = self.source.unregister_directory(&old) {
                    warn!("{}", e);
                    side_errors.push(e);
                }
                match self.source.register_directory(&new) {
                    Ok(()) => {
                        self.watched.insert(new);
                    }
                    Err(e) => {
                        warn!("{}", e);
                        side_errors.push(e);
                    }
                }
            }
        }

        Ok(Applied {
            transaction: Transaction::new(kind, to, Some(from), node),
            side_errors,
        })
    }
}

fn absolute(base: &SourcePath, relative: &RelativePath) -> PathBuf {
    base.resolve(relative, true).as_path().to_path_buf()
}
