use crate::{
    store::PersistedHistory,
    txn::TransactionRecord,
    types::{Timestamp, now_ms},
};

/// Linear undo/redo history. A record lives in at most one stack.
#[derive(Debug)]
pub struct UndoHistory {
    undo: Vec<TransactionRecord>,
    redo: Vec<TransactionRecord>,
    limit: Option<usize>,
    history_timestamp: Timestamp,
}

impl UndoHistory {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            undo: Vec::new(),
            redo: Vec::new(),
            limit,
            history_timestamp: now_ms(),
        }
    }

    pub fn restore(limit: Option<usize>, persisted: PersistedHistory) -> Self {
        let mut history = Self::new(limit);
        history.undo = persisted.undo;
        history.redo = persisted.redo;
        if let Some(limit) = limit {
            let excess = history.undo.len().saturating_sub(limit);
            history.undo.drain(..excess);
        }
        history
    }

    pub fn undo_count(&self) -> usize {
        self.undo.len()
    }

    pub fn redo_count(&self) -> usize {
        self.redo.len()
    }

    pub fn history_timestamp(&self) -> Timestamp {
        self.history_timestamp
    }

    pub fn undo_records(&self) -> &[TransactionRecord] {
        &self.undo
    }

    pub fn redo_records(&self) -> &[TransactionRecord] {
        &self.redo
    }

    pub fn undo_tail(&self) -> Option<&TransactionRecord> {
        self.undo.last()
    }

    pub fn redo_tail(&self) -> Option<&TransactionRecord> {
        self.redo.last()
    }

    /// True when pushing one more committed record evicts the oldest.
    pub fn would_evict(&self) -> bool {
        self.limit.is_some_and(|limit| self.undo.len() >= limit)
    }

    /// Pushes a fresh commit: drops the redo branch and enforces the limit.
    /// Returns the evicted record, if any.
    pub(crate) fn push_committed(&mut self, record: TransactionRecord) -> Option<TransactionRecord> {
        self.redo.clear();
        let evicted = if self.would_evict() && !self.undo.is_empty() {
            Some(self.undo.remove(0))
        } else {
            None
        };
        if self.limit != Some(0) {
            self.undo.push(record);
        }
        evicted
    }

    pub(crate) fn pop_undo(&mut self) -> Option<TransactionRecord> {
        self.undo.pop()
    }

    pub(crate) fn pop_redo(&mut self) -> Option<TransactionRecord> {
        self.redo.pop()
    }

    pub(crate) fn push_undo(&mut self, record: TransactionRecord) {
        self.undo.push(record);
    }

    pub(crate) fn push_redo(&mut self, record: TransactionRecord) {
        self.redo.push(record);
    }

    pub(crate) fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
        self.history_timestamp = now_ms();
    }
}
