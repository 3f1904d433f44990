//! Copy-on-write in-memory object store.
//!
//! Committed state is an immutable table snapshot behind an `Arc`. An
//! engine transaction works on a private copy which `commit_txn` publishes
//! in one pointer swap, so cursors and readers holding the previous snapshot
//! never see a partially applied transaction.

use std::{
    collections::{BTreeMap, BTreeSet},
    ops::Bound,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::trace;

use crate::types::{Handle, ObjectType, TxnId};

use super::{EngineTxn, ObjectStore, SecondaryIndex, StoreCursor, StoreError, StoreResult};

#[derive(Debug, Clone, Default)]
struct Tables {
    objects: HashMap<ObjectType, BTreeMap<Handle, Vec<u8>>>,
    secondary: HashMap<&'static str, HashMap<String, BTreeSet<Handle>>>,
}

impl Tables {
    fn get(&self, object_type: ObjectType, handle: &str) -> Option<&Vec<u8>> {
        self.objects.get(&object_type)?.get(handle)
    }

    fn lookup(&self, index: &str, key: &str) -> Vec<Handle> {
        self.secondary
            .get(index)
            .and_then(|keys| keys.get(key))
            .map(|handles| handles.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[derive(Debug)]
struct Working {
    id: TxnId,
    tables: Tables,
}

type Shared = Arc<RwLock<Arc<Tables>>>;

/// Switches that make the next engine call fail, for exercising error paths.
#[derive(Debug, Clone, Default)]
pub struct FaultInjector {
    fail_commit: Arc<AtomicBool>,
    fail_write: Arc<AtomicBool>,
}

impl FaultInjector {
    /// The next `commit_txn` returns an error and leaves the transaction open.
    pub fn fail_next_commit(&self) {
        self.fail_commit.store(true, Ordering::SeqCst);
    }

    /// The next `put` or `delete` returns an error without writing.
    pub fn fail_next_write(&self) {
        self.fail_write.store(true, Ordering::SeqCst);
    }

    fn take_commit(&self) -> bool {
        self.fail_commit.swap(false, Ordering::SeqCst)
    }

    fn take_write(&self) -> bool {
        self.fail_write.swap(false, Ordering::SeqCst)
    }
}

/// In-memory [`ObjectStore`] used by tests and scratch sessions.
#[derive(Debug)]
pub struct MemoryStore {
    committed: Shared,
    working: Option<Working>,
    indexes: Vec<SecondaryIndex>,
    read_only: bool,
    next_txn_id: TxnId,
    faults: FaultInjector,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Empty writable store without secondary indexes.
    pub fn new() -> Self {
        Self {
            committed: Arc::new(RwLock::new(Arc::new(Tables::default()))),
            working: None,
            indexes: Vec::new(),
            read_only: false,
            next_txn_id: 1,
            faults: FaultInjector::default(),
        }
    }

    /// Registers a secondary index. Must be called before any write.
    pub fn with_index(mut self, index: SecondaryIndex) -> Self {
        self.indexes.push(index);
        self
    }

    /// Read-only adapter over the same committed data.
    pub fn read_only_view(&self) -> Self {
        Self {
            committed: Arc::clone(&self.committed),
            working: None,
            indexes: self.indexes.clone(),
            read_only: true,
            next_txn_id: 1,
            faults: FaultInjector::default(),
        }
    }

    /// Handle for reading committed snapshots from another thread.
    pub fn reader(&self) -> MemoryReader {
        MemoryReader {
            committed: Arc::clone(&self.committed),
        }
    }

    /// Fault switches shared with this store.
    pub fn faults(&self) -> FaultInjector {
        self.faults.clone()
    }

    fn snapshot(&self) -> Arc<Tables> {
        Arc::clone(&*self.committed.read())
    }

    fn working_for(&mut self, txn: &EngineTxn) -> StoreResult<&mut Working> {
        self.working
            .as_mut()
            .filter(|w| w.id == txn.id())
            .ok_or(StoreError::StaleTxn(txn.id()))
    }

    fn check_write(&self) -> StoreResult<()> {
        if self.faults.take_write() {
            return Err(StoreError::Message("injected write failure".to_string()));
        }
        Ok(())
    }
}

fn reindex(
    indexes: &[SecondaryIndex],
    tables: &mut Tables,
    object_type: ObjectType,
    handle: &str,
    old: Option<&[u8]>,
    new: Option<&[u8]>,
) {
    for index in indexes.iter().filter(|i| i.object_type == object_type) {
        let keys = tables.secondary.entry(index.name).or_default();
        if let Some(old) = old {
            for key in (index.extract)(old) {
                if let Some(handles) = keys.get_mut(&key) {
                    handles.remove(handle);
                    if handles.is_empty() {
                        keys.remove(&key);
                    }
                }
            }
        }
        if let Some(new) = new {
            for key in (index.extract)(new) {
                keys.entry(key).or_default().insert(handle.to_string());
            }
        }
    }
}

impl ObjectStore for MemoryStore {
    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn begin_txn(&mut self) -> StoreResult<EngineTxn> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        if let Some(working) = &self.working {
            return Err(StoreError::TxnActive(working.id));
        }
        let id = self.next_txn_id;
        self.next_txn_id += 1;
        let tables = Tables::clone(&self.snapshot());
        self.working = Some(Working { id, tables });
        trace!(txn = id, "memory txn begin");
        Ok(EngineTxn::new(id))
    }

    fn commit_txn(&mut self, txn: &EngineTxn) -> StoreResult<()> {
        self.working_for(txn)?;
        if self.faults.take_commit() {
            return Err(StoreError::Message("injected commit failure".to_string()));
        }
        if let Some(working) = self.working.take() {
            *self.committed.write() = Arc::new(working.tables);
        }
        trace!(txn = txn.id(), "memory txn commit");
        Ok(())
    }

    fn rollback_txn(&mut self, txn: &EngineTxn) -> StoreResult<()> {
        self.working_for(txn)?;
        self.working = None;
        trace!(txn = txn.id(), "memory txn rollback");
        Ok(())
    }

    fn get(&self, object_type: ObjectType, handle: &str) -> StoreResult<Option<Vec<u8>>> {
        if let Some(working) = &self.working {
            return Ok(working.tables.get(object_type, handle).cloned());
        }
        Ok(self.snapshot().get(object_type, handle).cloned())
    }

    fn put(
        &mut self,
        object_type: ObjectType,
        handle: &str,
        value: &[u8],
        txn: &EngineTxn,
    ) -> StoreResult<()> {
        self.check_write()?;
        let indexes = self.indexes.clone();
        let working = self.working_for(txn)?;
        let old = working
            .tables
            .objects
            .entry(object_type)
            .or_default()
            .insert(handle.to_string(), value.to_vec());
        reindex(
            &indexes,
            &mut working.tables,
            object_type,
            handle,
            old.as_deref(),
            Some(value),
        );
        Ok(())
    }

    fn delete(&mut self, object_type: ObjectType, handle: &str, txn: &EngineTxn) -> StoreResult<()> {
        self.check_write()?;
        let indexes = self.indexes.clone();
        let working = self.working_for(txn)?;
        let old = working
            .tables
            .objects
            .get_mut(&object_type)
            .and_then(|table| table.remove(handle));
        if let Some(old) = old {
            reindex(&indexes, &mut working.tables, object_type, handle, Some(&old), None);
        }
        Ok(())
    }

    fn lookup(&self, index: &str, key: &str) -> StoreResult<Vec<Handle>> {
        if !self.indexes.iter().any(|i| i.name == index) {
            return Err(StoreError::UnknownIndex(index.to_string()));
        }
        if let Some(working) = &self.working {
            return Ok(working.tables.lookup(index, key));
        }
        Ok(self.snapshot().lookup(index, key))
    }

    fn cursor(&self, object_type: ObjectType) -> StoreResult<Box<dyn StoreCursor>> {
        Ok(Box::new(MemoryCursor::new(self.snapshot(), object_type)))
    }
}

/// Thread-safe reader over the committed state of a [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryReader {
    committed: Shared,
}

impl MemoryReader {
    /// Committed value of one object.
    pub fn get(&self, object_type: ObjectType, handle: &str) -> Option<Vec<u8>> {
        self.committed.read().get(object_type, handle).cloned()
    }

    /// Snapshot cursor over one table.
    pub fn cursor(&self, object_type: ObjectType) -> MemoryCursor {
        MemoryCursor::new(Arc::clone(&*self.committed.read()), object_type)
    }
}

/// Cursor pinned to one committed [`MemoryStore`] snapshot.
#[derive(Debug)]
pub struct MemoryCursor {
    snapshot: Option<Arc<Tables>>,
    object_type: ObjectType,
    current: Option<(Handle, Vec<u8>)>,
    done: bool,
}

impl MemoryCursor {
    fn new(snapshot: Arc<Tables>, object_type: ObjectType) -> Self {
        Self {
            snapshot: Some(snapshot),
            object_type,
            current: None,
            done: false,
        }
    }
}

impl StoreCursor for MemoryCursor {
    fn object_type(&self) -> ObjectType {
        self.object_type
    }

    fn next_entry(&mut self) -> StoreResult<Option<(Handle, Vec<u8>)>> {
        let Some(snapshot) = &self.snapshot else {
            return Ok(None);
        };
        if self.done {
            return Ok(None);
        }
        let next = snapshot.objects.get(&self.object_type).and_then(|table| {
            let mut range = match &self.current {
                Some((last, _)) => {
                    table.range::<str, _>((Bound::Excluded(last.as_str()), Bound::Unbounded))
                }
                None => table.range::<str, _>(..),
            };
            range.next().map(|(h, v)| (h.clone(), v.clone()))
        });
        if next.is_none() {
            self.done = true;
        }
        self.current = next.clone();
        Ok(next)
    }

    fn current(&self) -> Option<(&str, &[u8])> {
        self.current
            .as_ref()
            .map(|(handle, value)| (handle.as_str(), value.as_slice()))
    }

    fn close(&mut self) -> StoreResult<()> {
        self.snapshot = None;
        self.current = None;
        Ok(())
    }
}
