//! Object-level change records and their replay view.

use serde::{Deserialize, Serialize};

use crate::types::{Handle, ObjectType};

/// Classification of one change by which side is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    /// No prior value: the object was created.
    Add,
    /// Both values present.
    Update,
    /// No new value: the object was removed.
    Delete,
}

impl ChangeKind {
    fn of(old_value: Option<&[u8]>, new_value: Option<&[u8]>) -> Option<Self> {
        match (old_value, new_value) {
            (None, Some(_)) => Some(ChangeKind::Add),
            (Some(_), Some(_)) => Some(ChangeKind::Update),
            (Some(_), None) => Some(ChangeKind::Delete),
            (None, None) => None,
        }
    }
}

/// Rejected change construction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChangeError {
    /// Both the old and the new value were `None`.
    #[error("change to {object_type} {handle} has neither an old nor a new value")]
    InvalidChange {
        /// Table of the rejected change.
        object_type: ObjectType,
        /// Handle of the rejected change.
        handle: Handle,
    },
}

/// One atomic mutation to one object.
///
/// Values are opaque serialized blobs; they are replayed verbatim and never
/// interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawChange")]
pub struct ChangeRecord {
    object_type: ObjectType,
    handle: Handle,
    old_value: Option<Vec<u8>>,
    new_value: Option<Vec<u8>>,
}

#[derive(Deserialize)]
struct RawChange {
    object_type: ObjectType,
    handle: Handle,
    old_value: Option<Vec<u8>>,
    new_value: Option<Vec<u8>>,
}

impl TryFrom<RawChange> for ChangeRecord {
    type Error = ChangeError;

    fn try_from(raw: RawChange) -> Result<Self, Self::Error> {
        ChangeRecord::new(raw.object_type, raw.handle, raw.old_value, raw.new_value)
    }
}

impl ChangeRecord {
    /// Builds a change, rejecting the case where both values are `None`.
    pub fn new(
        object_type: ObjectType,
        handle: impl Into<Handle>,
        old_value: Option<Vec<u8>>,
        new_value: Option<Vec<u8>>,
    ) -> Result<Self, ChangeError> {
        let handle = handle.into();
        if old_value.is_none() && new_value.is_none() {
            return Err(ChangeError::InvalidChange {
                object_type,
                handle,
            });
        }
        Ok(Self {
            object_type,
            handle,
            old_value,
            new_value,
        })
    }

    /// Table of the affected object.
    pub fn object_type(&self) -> ObjectType {
        self.object_type
    }

    /// Handle of the affected object.
    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// Prior state, `None` for a creation.
    pub fn old_value(&self) -> Option<&[u8]> {
        self.old_value.as_deref()
    }

    /// New state, `None` for a deletion.
    pub fn new_value(&self) -> Option<&[u8]> {
        self.new_value.as_deref()
    }

    /// Add, update or delete.
    pub fn kind(&self) -> ChangeKind {
        self.step().kind()
    }

    /// Borrowed replay view of this change in its original direction.
    pub fn step(&self) -> ReplayStep<'_> {
        ReplayStep {
            object_type: self.object_type,
            handle: &self.handle,
            old_value: self.old_value.as_deref(),
            new_value: self.new_value.as_deref(),
        }
    }
}

/// Borrowed view of one change as it is about to be applied to a store.
///
/// `new_value == None` means the step deletes the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStep<'a> {
    /// Table of the affected object.
    pub object_type: ObjectType,
    /// Handle of the affected object.
    pub handle: &'a str,
    /// State the store holds before the step.
    pub old_value: Option<&'a [u8]>,
    /// State the store holds after the step.
    pub new_value: Option<&'a [u8]>,
}

impl<'a> ReplayStep<'a> {
    /// Same step with old and new values exchanged.
    pub fn swapped(self) -> Self {
        Self {
            old_value: self.new_value,
            new_value: self.old_value,
            ..self
        }
    }

    /// Add, update or delete, as seen in this direction.
    pub fn kind(&self) -> ChangeKind {
        // ChangeRecord::new guarantees at least one side is present.
        ChangeKind::of(self.old_value, self.new_value).unwrap_or(ChangeKind::Update)
    }
}
