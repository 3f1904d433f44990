//! Object store contract the undo manager replays through.
//!
//! An adapter owns the primary tables, the secondary indexes and an
//! engine-level transaction mechanism. Every write made by the manager
//! carries the [`EngineTxn`] returned by [`ObjectStore::begin_txn`], so one
//! logical transaction lands atomically. Readers that need a stable view use
//! a [`StoreCursor`], which never observes a partially applied transaction.

/// Copy-on-write in-memory engine.
pub mod memory;
/// SQLite engine.
pub mod sqlite;

use serde::{Deserialize, Serialize};

use crate::{
    txn::TransactionRecord,
    types::{Handle, ObjectType, TxnId},
};

/// Failure inside a storage engine.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// SQLite reported an error.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// History log encode/decode failure.
    #[error("history payload: {0}")]
    Serde(#[from] serde_json::Error),
    /// A write was attempted against a read-only store.
    #[error("store is read-only")]
    ReadOnly,
    /// A second engine transaction was requested while one is active.
    #[error("engine transaction {0} is still active")]
    TxnActive(TxnId),
    /// The transaction token does not match the active transaction.
    #[error("engine transaction {0} is not active")]
    StaleTxn(TxnId),
    /// Lookup against an index that was never registered.
    #[error("unknown secondary index: {0}")]
    UnknownIndex(String),
    /// `put_at_current` on a cursor with no current row.
    #[error("cursor has no current row")]
    NoCurrentRow,
    /// Any other engine failure.
    #[error("{0}")]
    Message(String),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Token for one open engine transaction.
///
/// Not `Clone`: exactly one owner may commit or roll it back.
#[derive(Debug, PartialEq, Eq)]
pub struct EngineTxn {
    id: TxnId,
}

impl EngineTxn {
    /// Wraps an engine-assigned id. Adapters mint these in `begin_txn`.
    pub fn new(id: TxnId) -> Self {
        Self { id }
    }

    /// Engine-assigned id.
    pub fn id(&self) -> TxnId {
        self.id
    }
}

/// Derives secondary keys from an opaque object blob.
pub type KeyExtractor = fn(&[u8]) -> Vec<String>;

/// Secondary index registered with an adapter, e.g. surname to person handles.
#[derive(Debug, Clone, Copy)]
pub struct SecondaryIndex {
    /// Index name used by [`ObjectStore::lookup`].
    pub name: &'static str,
    /// Table the index covers.
    pub object_type: ObjectType,
    /// Key derivation.
    pub extract: KeyExtractor,
}

/// Which history stack a log entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HistoryStack {
    /// Committed, undoable records.
    Undo,
    /// Undone, redoable records.
    Redo,
}

impl HistoryStack {
    /// Stable name used as a log key.
    pub fn as_str(self) -> &'static str {
        match self {
            HistoryStack::Undo => "undo",
            HistoryStack::Redo => "redo",
        }
    }
}

/// One mutation of the persisted history, written in the same engine
/// transaction as the object writes it accompanies.
#[derive(Debug, Clone, Copy)]
pub enum HistoryOp<'a> {
    /// Append a record at the tail.
    Push {
        /// Target stack.
        stack: HistoryStack,
        /// Record to append.
        record: &'a TransactionRecord,
    },
    /// Remove the tail record.
    Pop {
        /// Target stack.
        stack: HistoryStack,
    },
    /// Remove the head (oldest) record.
    EvictOldest {
        /// Target stack.
        stack: HistoryStack,
    },
    /// Remove every record of one stack, or of both when `None`.
    Clear {
        /// Target stack.
        stack: Option<HistoryStack>,
    },
}

/// Both stacks as reloaded from a history log, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistedHistory {
    /// Undo stack, tail is most recent.
    pub undo: Vec<TransactionRecord>,
    /// Redo stack, tail is most recently undone.
    pub redo: Vec<TransactionRecord>,
}

/// Primary-table, index and engine-transaction primitives.
///
/// `get` reads the writer's view, including writes of the active engine
/// transaction. Secondary indexes are maintained inside `put`/`delete`.
pub trait ObjectStore: Send {
    /// True when the store was opened read-only.
    fn is_read_only(&self) -> bool;

    /// Starts an engine transaction. Only one may be active.
    fn begin_txn(&mut self) -> StoreResult<EngineTxn>;
    /// Makes every write of `txn` durable and visible to new readers.
    fn commit_txn(&mut self, txn: &EngineTxn) -> StoreResult<()>;
    /// Discards every write of `txn`.
    fn rollback_txn(&mut self, txn: &EngineTxn) -> StoreResult<()>;

    /// Current value of one object.
    fn get(&self, object_type: ObjectType, handle: &str) -> StoreResult<Option<Vec<u8>>>;
    /// Inserts or replaces one object.
    fn put(
        &mut self,
        object_type: ObjectType,
        handle: &str,
        value: &[u8],
        txn: &EngineTxn,
    ) -> StoreResult<()>;
    /// Removes one object; absent handles are ignored.
    fn delete(&mut self, object_type: ObjectType, handle: &str, txn: &EngineTxn) -> StoreResult<()>;

    /// Handles stored under `key` in the named index, sorted.
    fn lookup(&self, index: &str, key: &str) -> StoreResult<Vec<Handle>>;
    /// Opens a snapshot cursor over committed objects of one table.
    fn cursor(&self, object_type: ObjectType) -> StoreResult<Box<dyn StoreCursor>>;

    /// Mirrors history mutations into the store's log. No-op by default.
    fn log_history(
        &mut self,
        _session: &str,
        _ops: &[HistoryOp<'_>],
        _txn: &EngineTxn,
    ) -> StoreResult<()> {
        Ok(())
    }

    /// Reloads the persisted stacks for a session, `None` without a log.
    fn load_history(&self, _session: &str) -> StoreResult<Option<PersistedHistory>> {
        Ok(None)
    }
}

/// Key-ordered cursor over a committed snapshot of one table.
pub trait StoreCursor: Send {
    /// Table being iterated.
    fn object_type(&self) -> ObjectType;

    /// Advances to the next row; `None` once exhausted or closed.
    fn next_entry(&mut self) -> StoreResult<Option<(Handle, Vec<u8>)>>;

    /// Row the cursor last returned.
    fn current(&self) -> Option<(&str, &[u8])>;

    /// Releases the snapshot. Further calls to `next_entry` return `None`.
    fn close(&mut self) -> StoreResult<()>;

    /// Writes `value` for the current row through `store` inside `txn`.
    ///
    /// The cursor keeps iterating its original snapshot.
    fn put_at_current(
        &self,
        store: &mut dyn ObjectStore,
        value: &[u8],
        txn: &EngineTxn,
    ) -> StoreResult<()> {
        let (handle, _) = self.current().ok_or(StoreError::NoCurrentRow)?;
        store.put(self.object_type(), handle, value, txn)
    }
}
