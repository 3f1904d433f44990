//! Undo/redo manager over an [`ObjectStore`].
//!
//! One manager belongs to one open database. It runs the per-transaction
//! state machine (`IDLE -> RECORDING -> IDLE`), writes each recorded change
//! through the store inside the engine transaction started by `open`, and
//! replays committed records backward (undo) or forward (redo) inside a
//! fresh engine transaction.
//!
//! Storage failures are never retried. A failed `commit` leaves the
//! transaction recording so the caller can `abort`; a failed `undo`/`redo`
//! rolls its engine transaction back and leaves both stacks as they were.

use tracing::{debug, trace, warn};

use crate::{
    change::{ChangeError, ChangeKind, ChangeRecord, ReplayStep},
    config::HistoryConfig,
    store::{
        EngineTxn, HistoryOp, HistoryStack, ObjectStore, StoreCursor, StoreError, StoreResult,
    },
    txn::TransactionRecord,
    types::{Handle, ObjectType, Timestamp, TxnId, now_ms},
};

use super::{
    history::UndoHistory,
    signals::{Signal, object_signals, redo_label, undo_label},
};

/// Errors surfaced by [`UndoManager`].
#[derive(Debug, thiserror::Error)]
pub enum UndoError {
    /// A change with neither old nor new value.
    #[error(transparent)]
    InvalidChange(#[from] ChangeError),
    /// `open` (or undo/redo/clear) while a transaction is recording.
    #[error("transaction \"{0}\" is still in progress")]
    TransactionInProgress(String),
    /// `record`/`commit` without an open transaction.
    #[error("no transaction is in progress")]
    NoActiveTransaction,
    /// Write attempted against a read-only store.
    #[error("database is read-only")]
    ReadOnly,
    /// The engine failed to apply, commit or roll back.
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
}

/// Identifies the transaction returned by [`UndoManager::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionHandle {
    txn_id: TxnId,
    batch: bool,
}

impl TransactionHandle {
    /// Underlying engine transaction id.
    pub fn id(&self) -> TxnId {
        self.txn_id
    }

    /// True for a non-undoable bulk transaction.
    pub fn is_batch(&self) -> bool {
        self.batch
    }
}

struct Recording {
    record: TransactionRecord,
    txn: EngineTxn,
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Undo,
    Redo,
}

/// Linear undo/redo history bound to one object store.
pub struct UndoManager {
    store: Box<dyn ObjectStore>,
    history: UndoHistory,
    recording: Option<Recording>,
    config: HistoryConfig,
    pending_signals: Vec<Signal>,
}

impl UndoManager {
    /// Manager with default configuration and empty history.
    pub fn new(store: Box<dyn ObjectStore>) -> Self {
        let config = HistoryConfig::default();
        Self {
            store,
            history: UndoHistory::new(config.history_limit),
            recording: None,
            config,
            pending_signals: Vec::new(),
        }
    }

    /// Manager with explicit configuration, reloading persisted history when enabled.
    pub fn open_with_config(
        store: Box<dyn ObjectStore>,
        config: HistoryConfig,
    ) -> Result<Self, UndoError> {
        let persisted = if config.persist_history {
            store.load_history(&config.session_id)?
        } else {
            None
        };
        let history = match persisted {
            Some(persisted) => UndoHistory::restore(config.history_limit, persisted),
            None => UndoHistory::new(config.history_limit),
        };
        debug!(
            session = %config.session_id,
            undo = history.undo_count(),
            redo = history.redo_count(),
            "undo manager opened"
        );
        Ok(Self {
            store,
            history,
            recording: None,
            config,
            pending_signals: Vec::new(),
        })
    }

    /// Begins recording an undoable transaction.
    pub fn open(&mut self, description: &str) -> Result<TransactionHandle, UndoError> {
        self.begin(TransactionRecord::new(description))
    }

    /// Begins a bulk transaction that is not undoable and clears history on commit.
    pub fn open_batch(&mut self, description: &str) -> Result<TransactionHandle, UndoError> {
        self.begin(TransactionRecord::new_batch(description))
    }

    fn begin(&mut self, record: TransactionRecord) -> Result<TransactionHandle, UndoError> {
        self.ensure_idle()?;
        if self.store.is_read_only() {
            return Err(UndoError::ReadOnly);
        }
        let txn = self.store.begin_txn()?;
        let handle = TransactionHandle {
            txn_id: txn.id(),
            batch: record.is_batch(),
        };
        debug!(
            description = record.description(),
            batch = record.is_batch(),
            txn = txn.id(),
            "transaction opened"
        );
        self.recording = Some(Recording { record, txn });
        Ok(handle)
    }

    /// Writes one change through the store and appends it to the open record.
    pub fn record(
        &mut self,
        object_type: ObjectType,
        handle: impl Into<Handle>,
        old_value: Option<Vec<u8>>,
        new_value: Option<Vec<u8>>,
    ) -> Result<(), UndoError> {
        let Some(active) = self.recording.as_mut() else {
            return Err(UndoError::NoActiveTransaction);
        };
        let change = ChangeRecord::new(object_type, handle, old_value, new_value)?;
        apply_step(self.store.as_mut(), change.step(), &active.txn)?;
        active.record.push(change);
        Ok(())
    }

    /// Stores `value`, recording a create or an update against the current value.
    pub fn commit_object(
        &mut self,
        object_type: ObjectType,
        handle: &str,
        value: Vec<u8>,
    ) -> Result<ChangeKind, UndoError> {
        self.ensure_recording()?;
        let old = self.store.get(object_type, handle)?;
        let kind = if old.is_some() {
            ChangeKind::Update
        } else {
            ChangeKind::Add
        };
        self.record(object_type, handle, old, Some(value))?;
        Ok(kind)
    }

    /// Removes an object, recording its current value. Returns false if absent.
    pub fn remove_object(&mut self, object_type: ObjectType, handle: &str) -> Result<bool, UndoError> {
        self.ensure_recording()?;
        let Some(old) = self.store.get(object_type, handle)? else {
            return Ok(false);
        };
        self.record(object_type, handle, Some(old), None)?;
        Ok(true)
    }

    /// Rewrites the cursor's current row inside the open transaction.
    ///
    /// The cursor keeps iterating its snapshot, so a table can be rewritten
    /// while it is being walked.
    pub fn commit_at_cursor(
        &mut self,
        cursor: &dyn StoreCursor,
        value: Vec<u8>,
    ) -> Result<ChangeKind, UndoError> {
        let (handle, _) = cursor.current().ok_or(StoreError::NoCurrentRow)?;
        self.commit_object(cursor.object_type(), handle, value)
    }

    /// Finalizes the open transaction and pushes it onto the undo stack.
    pub fn commit(&mut self, description: Option<&str>) -> Result<(), UndoError> {
        let mut active = self
            .recording
            .take()
            .ok_or(UndoError::NoActiveTransaction)?;
        active.record.seal(description, now_ms());

        let batch = active.record.is_batch();
        let undoable = !batch && self.config.history_limit != Some(0);
        let keep = undoable && (self.config.allow_empty_commits || !active.record.is_empty());

        if let Err(err) = self.finish_commit(&active, keep) {
            self.recording = Some(active);
            return Err(err.into());
        }

        let Recording { record, .. } = active;
        if batch {
            debug!(description = record.description(), changes = record.len(), "batch committed");
            self.history.clear();
            self.pending_signals.push(Signal::Cleared {
                history_timestamp: self.history.history_timestamp(),
            });
            self.queue_position(true);
            return Ok(());
        }

        self.pending_signals.extend(object_signals(&record, false));
        if keep {
            debug!(description = record.description(), changes = record.len(), "transaction committed");
            if let Some(evicted) = self.history.push_committed(record) {
                debug!(description = evicted.description(), "oldest undo record evicted");
            }
            self.queue_position(true);
        } else {
            debug!(description = record.description(), "transaction committed without history entry");
        }
        Ok(())
    }

    fn finish_commit(&mut self, active: &Recording, keep: bool) -> StoreResult<()> {
        if self.config.persist_history {
            let mut ops = Vec::new();
            if active.record.is_batch() {
                ops.push(HistoryOp::Clear { stack: None });
            } else if keep {
                ops.push(HistoryOp::Clear {
                    stack: Some(HistoryStack::Redo),
                });
                if self.history.would_evict() {
                    ops.push(HistoryOp::EvictOldest {
                        stack: HistoryStack::Undo,
                    });
                }
                ops.push(HistoryOp::Push {
                    stack: HistoryStack::Undo,
                    record: &active.record,
                });
            }
            if !ops.is_empty() {
                self.store
                    .log_history(&self.config.session_id, &ops, &active.txn)?;
            }
        }
        self.store.commit_txn(&active.txn)
    }

    /// Discards the open transaction and rolls back its engine writes.
    ///
    /// Without an open transaction this is a no-op.
    pub fn abort(&mut self) -> Result<(), UndoError> {
        let Some(active) = self.recording.take() else {
            return Ok(());
        };
        debug!(
            description = active.record.description(),
            changes = active.record.len(),
            "transaction aborted"
        );
        if !active.record.is_batch() {
            for object_type in active.record.touched_types() {
                if object_type != ObjectType::Reference {
                    self.pending_signals.push(Signal::Rebuild { object_type });
                }
            }
        }
        self.store.rollback_txn(&active.txn)?;
        Ok(())
    }

    /// Reverts the most recent committed transaction.
    ///
    /// Returns `Ok(false)` when the store is read-only or there is nothing to undo.
    pub fn undo(&mut self, update_history: bool) -> Result<bool, UndoError> {
        self.ensure_idle()?;
        if self.store.is_read_only() {
            return Ok(false);
        }
        let Some(record) = self.history.pop_undo() else {
            return Ok(false);
        };
        if let Err(err) = self.replay(&record, Direction::Undo) {
            self.history.push_undo(record);
            return Err(err.into());
        }
        debug!(description = record.description(), changes = record.len(), "undo applied");
        self.pending_signals.extend(object_signals(&record, true));
        self.history.push_redo(record);
        self.queue_position(update_history);
        Ok(true)
    }

    /// Reapplies the most recently undone transaction.
    ///
    /// Returns `Ok(false)` when the store is read-only or there is nothing to redo.
    pub fn redo(&mut self, update_history: bool) -> Result<bool, UndoError> {
        self.ensure_idle()?;
        if self.store.is_read_only() {
            return Ok(false);
        }
        let Some(record) = self.history.pop_redo() else {
            return Ok(false);
        };
        if let Err(err) = self.replay(&record, Direction::Redo) {
            self.history.push_redo(record);
            return Err(err.into());
        }
        debug!(description = record.description(), changes = record.len(), "redo applied");
        self.pending_signals.extend(object_signals(&record, false));
        self.history.push_undo(record);
        self.queue_position(update_history);
        Ok(true)
    }

    fn replay(&mut self, record: &TransactionRecord, direction: Direction) -> StoreResult<()> {
        let txn = self.store.begin_txn()?;
        let result = self
            .replay_in(record, direction, &txn)
            .and_then(|()| self.store.commit_txn(&txn));
        if let Err(err) = result {
            if let Err(rollback_err) = self.store.rollback_txn(&txn) {
                warn!(error = %rollback_err, "rollback after failed replay failed");
            }
            return Err(err);
        }
        Ok(())
    }

    fn replay_in(
        &mut self,
        record: &TransactionRecord,
        direction: Direction,
        txn: &EngineTxn,
    ) -> StoreResult<()> {
        let store = self.store.as_mut();
        let (from, to) = match direction {
            Direction::Undo => {
                for step in record.reverse_iter() {
                    apply_step(store, step, txn)?;
                }
                (HistoryStack::Undo, HistoryStack::Redo)
            }
            Direction::Redo => {
                for step in record.forward_iter() {
                    apply_step(store, step, txn)?;
                }
                (HistoryStack::Redo, HistoryStack::Undo)
            }
        };
        if self.config.persist_history {
            let ops = [
                HistoryOp::Pop { stack: from },
                HistoryOp::Push { stack: to, record },
            ];
            store.log_history(&self.config.session_id, &ops, txn)?;
        }
        Ok(())
    }

    /// Empties both stacks. Object tables are not touched.
    pub fn clear(&mut self) -> Result<(), UndoError> {
        self.ensure_idle()?;
        if self.config.persist_history && !self.store.is_read_only() {
            let txn = self.store.begin_txn()?;
            let ops = [HistoryOp::Clear { stack: None }];
            let result = self
                .store
                .log_history(&self.config.session_id, &ops, &txn)
                .and_then(|()| self.store.commit_txn(&txn));
            if let Err(err) = result {
                if let Err(rollback_err) = self.store.rollback_txn(&txn) {
                    warn!(error = %rollback_err, "rollback after failed history clear failed");
                }
                return Err(err.into());
            }
        }
        self.history.clear();
        debug!("undo history cleared");
        self.pending_signals.push(Signal::Cleared {
            history_timestamp: self.history.history_timestamp(),
        });
        self.queue_position(true);
        Ok(())
    }

    /// Number of undoable transactions.
    pub fn undo_count(&self) -> usize {
        self.history.undo_count()
    }

    /// Number of redoable transactions.
    pub fn redo_count(&self) -> usize {
        self.history.redo_count()
    }

    /// Time of the last `clear`, or of construction.
    pub fn history_timestamp(&self) -> Timestamp {
        self.history.history_timestamp()
    }

    /// Both stacks, read-only.
    pub fn history(&self) -> &UndoHistory {
        &self.history
    }

    /// "Undo <description>" for the next undo, if any.
    pub fn undo_label(&self) -> Option<String> {
        self.history
            .undo_tail()
            .map(|r| format!("Undo {}", r.description()))
    }

    /// "Redo <description>" for the next redo, if any.
    pub fn redo_label(&self) -> Option<String> {
        self.history
            .redo_tail()
            .map(|r| format!("Redo {}", r.description()))
    }

    /// True while a transaction is recording.
    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    /// Changes recorded so far in the open transaction.
    pub fn pending(&self) -> Option<&TransactionRecord> {
        self.recording.as_ref().map(|r| &r.record)
    }

    /// True when the underlying store is read-only.
    pub fn is_read_only(&self) -> bool {
        self.store.is_read_only()
    }

    /// Active configuration.
    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    /// Writer's view of one object, including uncommitted recorded changes.
    pub fn get(&self, object_type: ObjectType, handle: &str) -> Result<Option<Vec<u8>>, UndoError> {
        Ok(self.store.get(object_type, handle)?)
    }

    /// Secondary index lookup.
    pub fn lookup(&self, index: &str, key: &str) -> Result<Vec<Handle>, UndoError> {
        Ok(self.store.lookup(index, key)?)
    }

    /// Snapshot cursor over committed objects of one table.
    pub fn cursor(&self, object_type: ObjectType) -> Result<Box<dyn StoreCursor>, UndoError> {
        Ok(self.store.cursor(object_type)?)
    }

    /// Takes every queued signal, oldest first.
    pub fn drain_signals(&mut self) -> Vec<Signal> {
        std::mem::take(&mut self.pending_signals)
    }

    /// Aborts any open transaction and hands the store back.
    pub fn close(mut self) -> Result<Box<dyn ObjectStore>, UndoError> {
        self.abort()?;
        debug!(
            undo = self.history.undo_count(),
            redo = self.history.redo_count(),
            "undo manager closed"
        );
        Ok(self.store)
    }

    fn ensure_idle(&self) -> Result<(), UndoError> {
        match &self.recording {
            Some(active) => Err(UndoError::TransactionInProgress(
                active.record.description().to_string(),
            )),
            None => Ok(()),
        }
    }

    fn ensure_recording(&self) -> Result<(), UndoError> {
        if self.recording.is_none() {
            return Err(UndoError::NoActiveTransaction);
        }
        Ok(())
    }

    fn queue_position(&mut self, update_history: bool) {
        self.pending_signals.push(undo_label(self.history.undo_tail()));
        self.pending_signals.push(redo_label(self.history.redo_tail()));
        if update_history {
            self.pending_signals.push(Signal::HistoryChanged {
                undo_count: self.history.undo_count(),
                redo_count: self.history.redo_count(),
            });
        }
    }
}

fn apply_step(store: &mut dyn ObjectStore, step: ReplayStep<'_>, txn: &EngineTxn) -> StoreResult<()> {
    trace!(
        object_type = %step.object_type,
        handle = step.handle,
        kind = ?step.kind(),
        "apply change"
    );
    match step.new_value {
        Some(value) => store.put(step.object_type, step.handle, value, txn),
        None => store.delete(step.object_type, step.handle, txn),
    }
}
