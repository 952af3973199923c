//! Raw notifications, semantic events and published transactions

use serde::{Deserialize, Serialize};
use shadow_core::{Node, RelativePath, SourcePath};
use std::fmt;
use ulid::Ulid;

/// Primitive operation reported by a notification source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RawOp {
    Create,
    Write,
    Remove,
    /// The path was renamed away (the old name)
    Rename,
    /// Metadata-only change; never reaches the tree
    Chmod,
}

impl RawOp {
    /// Operations after which the path is gone from its old location
    pub fn is_removal(self) -> bool {
        matches!(self, RawOp::Remove | RawOp::Rename)
    }
}

/// A low-level, possibly fragmented notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNotification {
    pub op: RawOp,
    pub path: SourcePath,
}

impl RawNotification {
    pub fn new(op: RawOp, path: SourcePath) -> Self {
        Self { op, path }
    }
}

/// Kind of a semantic event and of the transaction it produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Create,
    Write,
    Remove,
    Rename,
    Move,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EventKind::Create => "create",
            EventKind::Write => "write",
            EventKind::Remove => "remove",
            EventKind::Rename => "rename",
            EventKind::Move => "move",
        };
        f.write_str(label)
    }
}

/// Value a host can attach to an event to correlate the created node
/// with its own records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraPayload {
    /// Id given to the node instead of a freshly generated one
    pub id: Ulid,
}

/// A coalesced operation ready to be applied to the shadow tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub from: SourcePath,
    /// Destination for `Rename` and `Move`
    pub to: Option<SourcePath>,
    pub extra: Option<ExtraPayload>,
    /// A directory created earlier in the same batch may already have
    /// added this node while reading its contents
    pub covered: bool,
}

impl Event {
    fn new(kind: EventKind, from: SourcePath, to: Option<SourcePath>) -> Self {
        Self {
            kind,
            from,
            to,
            extra: None,
            covered: false,
        }
    }

    pub fn create(path: SourcePath) -> Self {
        Self::new(EventKind::Create, path, None)
    }

    pub fn write(path: SourcePath) -> Self {
        Self::new(EventKind::Write, path, None)
    }

    pub fn remove(path: SourcePath) -> Self {
        Self::new(EventKind::Remove, path, None)
    }

    pub fn rename(from: SourcePath, to: SourcePath) -> Self {
        Self::new(EventKind::Rename, from, Some(to))
    }

    pub fn move_to(from: SourcePath, to: SourcePath) -> Self {
        Self::new(EventKind::Move, from, Some(to))
    }

    pub fn covered(mut self) -> Self {
        self.covered = true;
        self
    }

    pub fn with_extra(mut self, extra: ExtraPayload) -> Self {
        self.extra = Some(extra);
        self
    }
}

/// Published record of an event successfully applied to the tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub kind: EventKind,
    /// Relative path of the node after the event
    pub path: RelativePath,
    /// Relative path before a rename or move
    pub previous: Option<RelativePath>,
    /// Snapshot of the affected node (the detached subtree for removals)
    pub node: Node,
}

impl Transaction {
    pub fn new(kind: EventKind, path: RelativePath, previous: Option<RelativePath>, node: Node) -> Self {
        Self {
            kind,
            path,
            previous,
            node,
        }
    }
}
