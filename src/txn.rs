//! Logical transaction record and its persisted envelope.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{
    change::{ChangeError, ChangeRecord, ReplayStep},
    types::{Handle, ObjectType, Timestamp},
};

/// Version number for serialized [`StoredTransactionEnvelope`] payloads.
pub const HISTORY_FORMAT_VERSION: u16 = 1;

/// Ordered batch of changes forming one undo/redo unit.
///
/// Insertion order is application order. Once handed to the history the
/// record is only reachable through shared references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    description: String,
    timestamp: Option<Timestamp>,
    #[serde(default)]
    batch: bool,
    changes: Vec<ChangeRecord>,
}

impl TransactionRecord {
    /// Creates an empty record.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            timestamp: None,
            batch: false,
            changes: Vec::new(),
        }
    }

    pub(crate) fn new_batch(description: impl Into<String>) -> Self {
        Self {
            batch: true,
            ..Self::new(description)
        }
    }

    /// Appends a change.
    pub fn add_change(
        &mut self,
        object_type: ObjectType,
        handle: impl Into<Handle>,
        old_value: Option<Vec<u8>>,
        new_value: Option<Vec<u8>>,
    ) -> Result<(), ChangeError> {
        let change = ChangeRecord::new(object_type, handle, old_value, new_value)?;
        self.changes.push(change);
        Ok(())
    }

    pub(crate) fn push(&mut self, change: ChangeRecord) {
        self.changes.push(change);
    }

    /// Changes in insertion order; used by redo.
    pub fn forward_iter(&self) -> impl Iterator<Item = ReplayStep<'_>> + '_ {
        self.changes.iter().map(ChangeRecord::step)
    }

    /// Changes in reverse insertion order with old and new swapped; used by undo.
    pub fn reverse_iter(&self) -> impl Iterator<Item = ReplayStep<'_>> + '_ {
        self.changes.iter().rev().map(|c| c.step().swapped())
    }

    /// Recorded changes in insertion order.
    pub fn changes(&self) -> &[ChangeRecord] {
        &self.changes
    }

    /// Number of changes.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// True when no change was recorded.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Human-readable label.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Commit time, `None` until committed.
    pub fn timestamp(&self) -> Option<Timestamp> {
        self.timestamp
    }

    /// True for a non-undoable bulk transaction.
    pub fn is_batch(&self) -> bool {
        self.batch
    }

    /// Distinct object types touched, in [`ObjectType`] order.
    pub fn touched_types(&self) -> BTreeSet<ObjectType> {
        self.changes.iter().map(ChangeRecord::object_type).collect()
    }

    pub(crate) fn seal(&mut self, description: Option<&str>, timestamp: Timestamp) {
        if let Some(description) = description {
            self.description = description.to_string();
        }
        self.timestamp = Some(timestamp);
    }
}

/// Versioned wrapper for stable history-log decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTransactionEnvelope {
    /// Payload format version.
    pub format_version: u16,
    /// Wrapped record.
    pub record: TransactionRecord,
}

impl StoredTransactionEnvelope {
    /// Constructs an envelope using [`HISTORY_FORMAT_VERSION`].
    pub fn new(record: TransactionRecord) -> Self {
        Self {
            format_version: HISTORY_FORMAT_VERSION,
            record,
        }
    }
}
