//! Per-path debouncing and event coalescing
//!
//! Raw notifications are queued as they arrive and reclassified into
//! semantic events when the drain ticker fires:
//! - `Chmod` is discarded
//! - a removal immediately followed by a `Create` of another path with the
//!   same arrival tag becomes a `Rename` (same parent) or `Move`
//! - runs of notifications on one path fold into their terminal state
//! - creates and writes queued below a renamed directory follow it to its
//!   new location
//! - events keep the order in which their paths were first observed

use crate::event::{Event, EventKind, RawNotification, RawOp};
use ahash::AHashMap;
use parking_lot::Mutex;
use shadow_core::SourcePath;
use std::path::{Path, PathBuf};

/// What the tree knew about a notification's subject when it arrived
///
/// `checksum` is the content checksum: the tree's stored value for
/// removals and a fresh one for creates. Directories have none.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArrivalTag {
    pub checksum: String,
    pub is_dir: bool,
    /// The path was already mirrored in the tree
    pub in_tree: bool,
}

#[derive(Debug)]
struct Pending {
    raw: RawNotification,
    tag: ArrivalTag,
}

/// Buffers raw notifications between drains
#[derive(Debug, Default)]
pub struct Debouncer {
    pending: Mutex<Vec<Pending>>,
}

impl Debouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a raw notification
    pub fn append(&self, raw: RawNotification, tag: ArrivalTag) {
        self.pending.lock().push(Pending { raw, tag });
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Take the queue and reclassify it into ordered semantic events
    pub fn drain(&self) -> Vec<Event> {
        let batch = std::mem::take(&mut *self.pending.lock());
        coalesce(batch)
    }
}

#[derive(Debug)]
struct Slot {
    kind: EventKind,
    from: SourcePath,
    to: Option<SourcePath>,
    /// The subject was in the tree before this batch touched it
    known: bool,
    /// Sits below a directory created earlier in the batch
    covered: bool,
}

impl Slot {
    fn new(kind: EventKind, from: SourcePath, known: bool) -> Self {
        Self {
            kind,
            from,
            to: None,
            known,
            covered: false,
        }
    }

    fn into_event(self) -> Event {
        let event = match (self.kind, self.to) {
            (EventKind::Rename, Some(to)) => Event::rename(self.from, to),
            (EventKind::Move, Some(to)) => Event::move_to(self.from, to),
            (EventKind::Create, _) => Event::create(self.from),
            (EventKind::Write, _) => Event::write(self.from),
            _ => Event::remove(self.from),
        };
        if self.covered {
            event.covered()
        } else {
            event
        }
    }
}

fn coalesce(batch: Vec<Pending>) -> Vec<Event> {
    let mut slots: Vec<Option<Slot>> = Vec::with_capacity(batch.len());
    // Path -> index of the slot later notifications on that path fold into
    let mut open: AHashMap<PathBuf, usize> = AHashMap::new();

    let mut queue = batch
        .into_iter()
        .filter(|p| p.raw.op != RawOp::Chmod)
        .peekable();

    while let Some(item) = queue.next() {
        // Directories carry no checksum, so only an explicit rename pairs them
        let pairable = item.raw.op == RawOp::Rename || !item.tag.is_dir;
        if item.raw.op.is_removal() && item.tag.in_tree && pairable {
            let paired = queue.next_if(|next| {
                next.raw.op == RawOp::Create
                    && next.raw.path != item.raw.path
                    && next.tag.is_dir == item.tag.is_dir
                    && next.tag.checksum == item.tag.checksum
            });
            if let Some(dest) = paired {
                relocate(&mut slots, &mut open, item.raw.path, dest.raw.path);
                continue;
            }
        }

        let path = item.raw.path.as_path().to_path_buf();

        // Removing a path removes everything below it
        if item.raw.op.is_removal() {
            drop_descendants(&mut slots, &mut open, &path);
        }

        let Some(&index) = open.get(&path) else {
            open_slot(&mut slots, &mut open, path, item, None);
            continue;
        };
        let Some(slot) = slots[index].as_mut() else {
            open_slot(&mut slots, &mut open, path, item, None);
            continue;
        };

        match (slot.kind, item.raw.op) {
            (EventKind::Create, RawOp::Remove | RawOp::Rename) => {
                if slot.known {
                    slot.kind = EventKind::Remove;
                    slot.covered = false;
                } else {
                    // Created and gone within one drain: nothing to apply
                    slots[index] = None;
                    open.remove(&path);
                }
            }
            (EventKind::Write, RawOp::Remove | RawOp::Rename) => slot.kind = EventKind::Remove,
            (EventKind::Remove, RawOp::Create | RawOp::Write) => {
                // The path is replaced after the pending removal runs
                open_slot(&mut slots, &mut open, path, item, Some(false));
            }
            // Create+Write, Write+Write, Remove+Remove and duplicates keep
            // the slot's kind; contents are read when the event is applied
            _ => {}
        }
    }

    slots.into_iter().flatten().map(Slot::into_event).collect()
}

/// Record a paired removal and creation
///
/// The pair is a barrier for both endpoints. Pending creates and writes
/// at or below `from` are replayed under `to` after it, and nothing queued
/// earlier folds into later notifications under either path.
fn relocate(
    slots: &mut Vec<Option<Slot>>,
    open: &mut AHashMap<PathBuf, usize>,
    from: SourcePath,
    to: SourcePath,
) {
    // A new ancestor reads the destination from disk when it is created,
    // so only the old location is left to drop
    if has_pending_create_ancestor(slots, open, to.as_path()) {
        drop_descendants(slots, open, from.as_path());
        if let Some(index) = open.remove(from.as_path()) {
            slots[index] = None;
        }
        close_subtree(open, to.as_path());
        slots.push(Some(Slot::new(EventKind::Remove, from, true)));
        slots.push(Some(Slot {
            covered: true,
            ..Slot::new(EventKind::Create, to.clone(), false)
        }));
        open.insert(to.as_path().to_path_buf(), slots.len() - 1);
        return;
    }

    let mut below: Vec<usize> = open
        .iter()
        .filter(|(path, _)| path.starts_with(from.as_path()))
        .map(|(_, &index)| index)
        .collect();
    below.sort_unstable();
    close_subtree(open, from.as_path());
    close_subtree(open, to.as_path());

    let carried: Vec<Slot> = below
        .into_iter()
        .filter_map(|index| {
            let pending = slots[index]
                .as_ref()
                .is_some_and(|slot| matches!(slot.kind, EventKind::Create | EventKind::Write));
            if pending {
                slots[index].take()
            } else {
                None
            }
        })
        .collect();

    let kind = if from.as_path().parent() == to.as_path().parent() {
        EventKind::Rename
    } else {
        EventKind::Move
    };
    slots.push(Some(Slot {
        to: Some(to.clone()),
        ..Slot::new(kind, from.clone(), true)
    }));

    for mut slot in carried {
        let Some(rebased) = slot.from.rebase(&from, &to) else {
            continue;
        };
        slot.from = rebased;
        let path = slot.from.as_path().to_path_buf();
        slots.push(Some(slot));
        open.insert(path, slots.len() - 1);
    }
}

fn open_slot(
    slots: &mut Vec<Option<Slot>>,
    open: &mut AHashMap<PathBuf, usize>,
    path: PathBuf,
    item: Pending,
    known: Option<bool>,
) {
    let kind = match item.raw.op {
        RawOp::Create => EventKind::Create,
        RawOp::Write => EventKind::Write,
        _ => EventKind::Remove,
    };
    let covered = kind == EventKind::Create && has_pending_create_ancestor(slots, open, &path);
    slots.push(Some(Slot {
        covered,
        ..Slot::new(kind, item.raw.path, known.unwrap_or(item.tag.in_tree))
    }));
    open.insert(path, slots.len() - 1);
}

fn has_pending_create_ancestor(
    slots: &[Option<Slot>],
    open: &AHashMap<PathBuf, usize>,
    path: &Path,
) -> bool {
    path.ancestors().skip(1).any(|ancestor| {
        open.get(ancestor)
            .and_then(|&i| slots[i].as_ref())
            .is_some_and(|slot| slot.kind == EventKind::Create && !slot.known)
    })
}

fn drop_descendants(slots: &mut [Option<Slot>], open: &mut AHashMap<PathBuf, usize>, path: &Path) {
    open.retain(|candidate, &mut index| {
        if candidate != path && candidate.starts_with(path) {
            slots[index] = None;
            false
        } else {
            true
        }
    });
}

/// Stop folding into slots at or below `path`
fn close_subtree(open: &mut AHashMap<PathBuf, usize>, path: &Path) {
    open.retain(|candidate, _| !candidate.starts_with(path));
}

/// One-to-one translation used by the legacy immediate dispatch mode
///
/// No coalescing happens: `Chmod` is dropped and a rename is applied as a
/// removal once its old path is gone.
pub fn immediate_event(raw: &RawNotification) -> Option<Event> {
    match raw.op {
        RawOp::Create => Some(Event::create(raw.path.clone())),
        RawOp::Write => Some(Event::write(raw.path.clone())),
        RawOp::Remove => Some(Event::remove(raw.path.clone())),
        RawOp::Rename if !raw.path.exists() => Some(Event::remove(raw.path.clone())),
        RawOp::Rename | RawOp::Chmod => None,
    }
}
