//! Shared identifiers and the object-type enum.

use std::{
    fmt,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

/// Opaque unique identifier of one stored object.
pub type Handle = String;
/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;
/// Identifier of a session whose history may be persisted.
pub type SessionId = String;
/// Engine transaction identifier.
pub type TxnId = u64;

/// Table/collection an object lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    /// Individual person.
    Person,
    /// Family grouping.
    Family,
    /// Dated event.
    Event,
    /// Location.
    Place,
    /// Information source.
    Source,
    /// Citation of a source.
    Citation,
    /// Repository holding sources.
    Repository,
    /// Media object.
    Media,
    /// Free-form note.
    Note,
    /// Tag.
    Tag,
    /// Back-reference map entry.
    Reference,
}

impl ObjectType {
    /// Every object type, in signal emission order.
    pub const ALL: [ObjectType; 11] = [
        ObjectType::Person,
        ObjectType::Family,
        ObjectType::Event,
        ObjectType::Place,
        ObjectType::Source,
        ObjectType::Citation,
        ObjectType::Repository,
        ObjectType::Media,
        ObjectType::Note,
        ObjectType::Tag,
        ObjectType::Reference,
    ];

    /// Stable lowercase name used as a table key.
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectType::Person => "person",
            ObjectType::Family => "family",
            ObjectType::Event => "event",
            ObjectType::Place => "place",
            ObjectType::Source => "source",
            ObjectType::Citation => "citation",
            ObjectType::Repository => "repository",
            ObjectType::Media => "media",
            ObjectType::Note => "note",
            ObjectType::Tag => "tag",
            ObjectType::Reference => "reference",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing an unknown object type name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown object type: {0}")]
pub struct UnknownObjectType(pub String);

impl FromStr for ObjectType {
    type Err = UnknownObjectType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ObjectType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownObjectType(s.to_string()))
    }
}

pub(crate) fn now_ms() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
