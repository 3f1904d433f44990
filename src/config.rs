//! History configuration.

use serde::{Deserialize, Serialize};

use crate::types::SessionId;

/// Tunables for an [`crate::core::manager::UndoManager`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Maximum undo depth; the oldest record is evicted past it.
    pub history_limit: Option<usize>,
    /// Mirror the stacks into the store's history log when it has one.
    pub persist_history: bool,
    /// Key of the persisted history.
    pub session_id: SessionId,
    /// Keep zero-change records on the undo stack.
    pub allow_empty_commits: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            history_limit: None,
            persist_history: false,
            session_id: "default".to_string(),
            allow_empty_commits: true,
        }
    }
}
