//! Change notifications queued by the manager for views and menus.

use std::collections::BTreeMap;

use crate::{
    change::ChangeKind,
    txn::TransactionRecord,
    types::{Handle, ObjectType, Timestamp},
};

/// Notification drained with [`crate::core::manager::UndoManager::drain_signals`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// Objects of one type were added, updated or deleted.
    Objects {
        /// Affected table.
        object_type: ObjectType,
        /// What happened to the handles.
        action: ChangeKind,
        /// Affected handles, first-touch order.
        handles: Vec<Handle>,
    },
    /// Label for the undo action, `None` when nothing can be undone.
    UndoLabel(Option<String>),
    /// Label for the redo action, `None` when nothing can be redone.
    RedoLabel(Option<String>),
    /// The current history position moved.
    HistoryChanged {
        /// Undo stack depth.
        undo_count: usize,
        /// Redo stack depth.
        redo_count: usize,
    },
    /// Both stacks were emptied.
    Cleared {
        /// New history timestamp.
        history_timestamp: Timestamp,
    },
    /// A write-through transaction was aborted; views of this type must reload.
    Rebuild {
        /// Affected table.
        object_type: ObjectType,
    },
}

#[derive(Default)]
struct Touched {
    added: Vec<Handle>,
    updated: Vec<Handle>,
    deleted: Vec<Handle>,
}

fn push_unique(list: &mut Vec<Handle>, handle: &str) {
    if !list.iter().any(|h| h == handle) {
        list.push(handle.to_string());
    }
}

/// Object signals for applying `record` forward, or backward when `undo`.
///
/// Deletes come first, then adds, then updates; within each action types
/// follow [`ObjectType`] order. Adds and updates skip handles the same
/// transaction ends up deleting. Reference entries are not signalled.
pub fn object_signals(record: &TransactionRecord, undo: bool) -> Vec<Signal> {
    let mut by_type: BTreeMap<ObjectType, Touched> = BTreeMap::new();
    for change in record.changes() {
        if change.object_type() == ObjectType::Reference {
            continue;
        }
        let touched = by_type.entry(change.object_type()).or_default();
        let list = match change.kind() {
            ChangeKind::Add => &mut touched.added,
            ChangeKind::Update => &mut touched.updated,
            ChangeKind::Delete => &mut touched.deleted,
        };
        push_unique(list, change.handle());
    }

    let mut out = Vec::new();
    for action in [ChangeKind::Delete, ChangeKind::Add, ChangeKind::Update] {
        for (object_type, touched) in &by_type {
            // Undoing swaps creations and deletions.
            let (gone, appeared) = if undo {
                (&touched.added, &touched.deleted)
            } else {
                (&touched.deleted, &touched.added)
            };
            let handles: Vec<Handle> = match action {
                ChangeKind::Delete => gone.clone(),
                ChangeKind::Add => appeared.iter().filter(|h| !gone.contains(h)).cloned().collect(),
                ChangeKind::Update => touched
                    .updated
                    .iter()
                    .filter(|h| !gone.contains(h))
                    .cloned()
                    .collect(),
            };
            if !handles.is_empty() {
                out.push(Signal::Objects {
                    object_type: *object_type,
                    action,
                    handles,
                });
            }
        }
    }
    out
}

pub(crate) fn undo_label(record: Option<&TransactionRecord>) -> Signal {
    Signal::UndoLabel(record.map(|r| format!("Undo {}", r.description())))
}

pub(crate) fn redo_label(record: Option<&TransactionRecord>) -> Signal {
    Signal::RedoLabel(record.map(|r| format!("Redo {}", r.description())))
}
