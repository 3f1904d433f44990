//! SQLite-backed object store with an in-database history log.

use std::{
    collections::{BTreeMap, VecDeque},
    path::{Path, PathBuf},
    time::Duration,
};

use hashbrown::HashMap;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{
    txn::{HISTORY_FORMAT_VERSION, StoredTransactionEnvelope, TransactionRecord},
    types::{Handle, ObjectType, TxnId, now_ms},
};

use super::{
    EngineTxn, HistoryOp, HistoryStack, ObjectStore, PersistedHistory, SecondaryIndex,
    StoreCursor, StoreError, StoreResult,
};

/// Connection settings for [`SqliteStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteOptions {
    /// Open without write access; no schema is created.
    pub read_only: bool,
    /// Use WAL journaling. Cursors over a WAL file hold their own read
    /// connection; otherwise they materialize the committed rows at begin.
    pub wal: bool,
    /// Value for `PRAGMA synchronous`.
    pub synchronous: String,
    /// How long a connection waits on a locked database.
    pub busy_timeout_ms: u64,
    /// Rows fetched per cursor round trip.
    pub cursor_page_size: usize,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            wal: true,
            synchronous: "NORMAL".to_string(),
            busy_timeout_ms: 5_000,
            cursor_page_size: 256,
        }
    }
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    format_version: u16,
    record: &'a TransactionRecord,
}

/// SQLite implementation of [`ObjectStore`].
///
/// Engine transactions are `BEGIN IMMEDIATE` / `COMMIT` / `ROLLBACK` on the
/// writer connection. Cursors over a WAL file open their own read-only
/// connection and hold a read transaction, which pins the snapshot that was
/// current when the cursor began. In-memory and rollback-journal stores copy
/// the committed rows at begin instead: the writer remembers the first
/// pre-image of every row it touches in the open transaction, and the copy
/// puts those back. A rollback-journal reader would otherwise hold a shared
/// lock that makes the writer's `COMMIT` fail.
pub struct SqliteStore {
    conn: Connection,
    path: Option<PathBuf>,
    options: SqliteOptions,
    indexes: Vec<SecondaryIndex>,
    active: Option<TxnId>,
    next_txn_id: TxnId,
    pre_images: HashMap<(ObjectType, Handle), Option<Vec<u8>>>,
}

impl SqliteStore {
    /// Opens or creates a store at `path`.
    pub fn open(path: impl AsRef<Path>, options: SqliteOptions) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = if options.read_only {
            Connection::open_with_flags(
                &path,
                OpenFlags::SQLITE_OPEN_READ_ONLY
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?
        } else {
            Connection::open(&path)?
        };
        debug!(path = %path.display(), read_only = options.read_only, "opened sqlite store");
        Self::init_connection(conn, Some(path), options)
    }

    /// Opens a private in-memory store.
    pub fn open_in_memory(options: SqliteOptions) -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(conn, None, options)
    }

    fn init_connection(
        conn: Connection,
        path: Option<PathBuf>,
        options: SqliteOptions,
    ) -> StoreResult<Self> {
        conn.busy_timeout(Duration::from_millis(options.busy_timeout_ms))?;
        if !options.read_only {
            conn.execute_batch(include_str!("schema.sql"))?;
            if options.wal {
                conn.pragma_update(None, "journal_mode", "WAL")?;
            }
            conn.pragma_update(None, "synchronous", options.synchronous.as_str())?;
        }
        Ok(Self {
            conn,
            path,
            options,
            indexes: Vec::new(),
            active: None,
            next_txn_id: 1,
            pre_images: HashMap::new(),
        })
    }

    /// Registers a secondary index. Existing rows are not back-filled.
    pub fn with_index(mut self, index: SecondaryIndex) -> Self {
        self.indexes.push(index);
        self
    }

    /// Number of objects stored in one table.
    pub fn count(&self, object_type: ObjectType) -> StoreResult<usize> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM objects WHERE object_type = ?1",
            params![object_type.as_str()],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    fn check_txn(&self, txn: &EngineTxn) -> StoreResult<()> {
        if self.active == Some(txn.id()) {
            Ok(())
        } else {
            Err(StoreError::StaleTxn(txn.id()))
        }
    }

    fn remember_pre_image(&mut self, object_type: ObjectType, handle: &str) -> StoreResult<()> {
        let key = (object_type, handle.to_string());
        if !self.pre_images.contains_key(&key) {
            let before = self.get(object_type, handle)?;
            self.pre_images.insert(key, before);
        }
        Ok(())
    }

    fn pins_snapshot_with_reader(&self) -> bool {
        self.path.is_some() && self.options.wal
    }

    fn reindex(&self, object_type: ObjectType, handle: &str, value: Option<&[u8]>) -> StoreResult<()> {
        let mut indexes = self.indexes.iter().filter(|i| i.object_type == object_type).peekable();
        if indexes.peek().is_none() {
            return Ok(());
        }
        self.conn
            .prepare_cached("DELETE FROM secondary WHERE object_type = ?1 AND handle = ?2")?
            .execute(params![object_type.as_str(), handle])?;
        let Some(value) = value else {
            return Ok(());
        };
        let mut stmt = self.conn.prepare_cached(
            "INSERT OR IGNORE INTO secondary(index_name, key, object_type, handle) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for index in indexes {
            for key in (index.extract)(value) {
                stmt.execute(params![index.name, key, object_type.as_str(), handle])?;
            }
        }
        Ok(())
    }

    fn apply_history_op(&self, session: &str, op: &HistoryOp<'_>) -> StoreResult<()> {
        match op {
            HistoryOp::Push { stack, record } => {
                let payload = serde_json::to_vec(&EnvelopeRef {
                    format_version: HISTORY_FORMAT_VERSION,
                    record,
                })?;
                let ts_ms = record.timestamp().unwrap_or_else(now_ms);
                self.conn
                    .prepare_cached(
                        "INSERT INTO history(session, stack, position, ts_ms, payload) \
                         VALUES (?1, ?2, (SELECT COALESCE(MAX(position), 0) + 1 FROM history \
                         WHERE session = ?1 AND stack = ?2), ?3, ?4)",
                    )?
                    .execute(params![session, stack.as_str(), ts_ms as i64, payload])?;
            }
            HistoryOp::Pop { stack } => {
                self.conn
                    .prepare_cached(
                        "DELETE FROM history WHERE session = ?1 AND stack = ?2 AND position = \
                         (SELECT MAX(position) FROM history WHERE session = ?1 AND stack = ?2)",
                    )?
                    .execute(params![session, stack.as_str()])?;
            }
            HistoryOp::EvictOldest { stack } => {
                self.conn
                    .prepare_cached(
                        "DELETE FROM history WHERE session = ?1 AND stack = ?2 AND position = \
                         (SELECT MIN(position) FROM history WHERE session = ?1 AND stack = ?2)",
                    )?
                    .execute(params![session, stack.as_str()])?;
            }
            HistoryOp::Clear { stack: Some(stack) } => {
                self.conn
                    .prepare_cached("DELETE FROM history WHERE session = ?1 AND stack = ?2")?
                    .execute(params![session, stack.as_str()])?;
            }
            HistoryOp::Clear { stack: None } => {
                self.conn
                    .prepare_cached("DELETE FROM history WHERE session = ?1")?
                    .execute(params![session])?;
            }
        }
        Ok(())
    }
}

impl ObjectStore for SqliteStore {
    fn is_read_only(&self) -> bool {
        self.options.read_only
    }

    fn begin_txn(&mut self) -> StoreResult<EngineTxn> {
        if self.options.read_only {
            return Err(StoreError::ReadOnly);
        }
        if let Some(id) = self.active {
            return Err(StoreError::TxnActive(id));
        }
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        let id = self.next_txn_id;
        self.next_txn_id += 1;
        self.active = Some(id);
        trace!(txn = id, "sqlite txn begin");
        Ok(EngineTxn::new(id))
    }

    fn commit_txn(&mut self, txn: &EngineTxn) -> StoreResult<()> {
        self.check_txn(txn)?;
        self.conn.execute_batch("COMMIT")?;
        self.active = None;
        self.pre_images.clear();
        trace!(txn = txn.id(), "sqlite txn commit");
        Ok(())
    }

    fn rollback_txn(&mut self, txn: &EngineTxn) -> StoreResult<()> {
        self.check_txn(txn)?;
        let res = self.conn.execute_batch("ROLLBACK");
        if res.is_ok() || self.conn.is_autocommit() {
            self.active = None;
            self.pre_images.clear();
        }
        trace!(txn = txn.id(), ok = res.is_ok(), "sqlite txn rollback");
        res.map_err(StoreError::from)
    }

    fn get(&self, object_type: ObjectType, handle: &str) -> StoreResult<Option<Vec<u8>>> {
        let value = self
            .conn
            .prepare_cached("SELECT value FROM objects WHERE object_type = ?1 AND handle = ?2")?
            .query_row(params![object_type.as_str(), handle], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    fn put(
        &mut self,
        object_type: ObjectType,
        handle: &str,
        value: &[u8],
        txn: &EngineTxn,
    ) -> StoreResult<()> {
        self.check_txn(txn)?;
        self.remember_pre_image(object_type, handle)?;
        self.conn
            .prepare_cached(
                "INSERT INTO objects(object_type, handle, value) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(object_type, handle) DO UPDATE SET value = excluded.value",
            )?
            .execute(params![object_type.as_str(), handle, value])?;
        self.reindex(object_type, handle, Some(value))
    }

    fn delete(&mut self, object_type: ObjectType, handle: &str, txn: &EngineTxn) -> StoreResult<()> {
        self.check_txn(txn)?;
        self.remember_pre_image(object_type, handle)?;
        self.conn
            .prepare_cached("DELETE FROM objects WHERE object_type = ?1 AND handle = ?2")?
            .execute(params![object_type.as_str(), handle])?;
        self.reindex(object_type, handle, None)
    }

    fn lookup(&self, index: &str, key: &str) -> StoreResult<Vec<Handle>> {
        if !self.indexes.iter().any(|i| i.name == index) {
            return Err(StoreError::UnknownIndex(index.to_string()));
        }
        let mut stmt = self.conn.prepare_cached(
            "SELECT handle FROM secondary WHERE index_name = ?1 AND key = ?2 ORDER BY handle",
        )?;
        let rows = stmt.query_map(params![index, key], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn cursor(&self, object_type: ObjectType) -> StoreResult<Box<dyn StoreCursor>> {
        let cursor = match &self.path {
            Some(path) if self.pins_snapshot_with_reader() => {
                SqliteCursor::open(path, object_type, &self.options)?
            }
            _ => SqliteCursor::materialized(&self.conn, object_type, &self.pre_images)?,
        };
        Ok(Box::new(cursor))
    }

    fn log_history(
        &mut self,
        session: &str,
        ops: &[HistoryOp<'_>],
        txn: &EngineTxn,
    ) -> StoreResult<()> {
        self.check_txn(txn)?;
        for op in ops {
            self.apply_history_op(session, op)?;
        }
        Ok(())
    }

    fn load_history(&self, session: &str) -> StoreResult<Option<PersistedHistory>> {
        let mut stmt = self.conn.prepare(
            "SELECT stack, payload FROM history WHERE session = ?1 ORDER BY stack, position ASC",
        )?;
        let rows = stmt.query_map(params![session], |row| {
            let stack: String = row.get(0)?;
            let payload: Vec<u8> = row.get(1)?;
            let record = decode_history_payload(&payload).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    payload.len(),
                    rusqlite::types::Type::Blob,
                    Box::new(std::io::Error::other(err)),
                )
            })?;
            Ok((stack, record))
        })?;

        let mut history = PersistedHistory::default();
        for row in rows {
            let (stack, record) = row?;
            if stack == HistoryStack::Undo.as_str() {
                history.undo.push(record);
            } else if stack == HistoryStack::Redo.as_str() {
                history.redo.push(record);
            } else {
                return Err(StoreError::Message(format!("unknown history stack: {stack}")));
            }
        }
        Ok(Some(history))
    }
}

fn decode_history_payload(payload: &[u8]) -> Result<TransactionRecord, String> {
    let envelope: StoredTransactionEnvelope = serde_json::from_slice(payload)
        .map_err(|e| format!("history payload decode failed: {e}"))?;
    if envelope.format_version != HISTORY_FORMAT_VERSION {
        return Err(format!(
            "unsupported history format version: {}",
            envelope.format_version
        ));
    }
    Ok(envelope.record)
}

/// Key-ordered cursor over one table of a [`SqliteStore`].
pub struct SqliteCursor {
    conn: Option<Connection>,
    object_type: ObjectType,
    page: VecDeque<(Handle, Vec<u8>)>,
    page_size: usize,
    last: Option<Handle>,
    current: Option<(Handle, Vec<u8>)>,
    exhausted: bool,
}

impl SqliteCursor {
    fn open(path: &Path, object_type: ObjectType, options: &SqliteOptions) -> StoreResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(Duration::from_millis(options.busy_timeout_ms))?;
        conn.execute_batch("BEGIN DEFERRED")?;
        let mut cursor = Self {
            conn: Some(conn),
            object_type,
            page: VecDeque::new(),
            page_size: options.cursor_page_size.max(1),
            last: None,
            current: None,
            exhausted: false,
        };
        // The first read inside the transaction pins the snapshot.
        cursor.fetch_page()?;
        Ok(cursor)
    }

    /// Copies the committed rows of one table, undoing the writer's
    /// uncommitted changes with their pre-images.
    fn materialized(
        conn: &Connection,
        object_type: ObjectType,
        pre_images: &HashMap<(ObjectType, Handle), Option<Vec<u8>>>,
    ) -> StoreResult<Self> {
        let mut stmt = conn.prepare(
            "SELECT handle, value FROM objects WHERE object_type = ?1 ORDER BY handle",
        )?;
        let rows = stmt.query_map(params![object_type.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let mut rows_by_handle = BTreeMap::new();
        for row in rows {
            let (handle, value) = row?;
            rows_by_handle.insert(handle, value);
        }
        for ((table, handle), before) in pre_images {
            if *table != object_type {
                continue;
            }
            match before {
                Some(value) => rows_by_handle.insert(handle.clone(), value.clone()),
                None => rows_by_handle.remove(handle),
            };
        }
        Ok(Self {
            conn: None,
            object_type,
            page: rows_by_handle.into_iter().collect(),
            page_size: 0,
            last: None,
            current: None,
            exhausted: true,
        })
    }

    fn fetch_page(&mut self) -> StoreResult<()> {
        if self.exhausted {
            return Ok(());
        }
        let Some(conn) = &self.conn else {
            self.exhausted = true;
            return Ok(());
        };
        let mut stmt = conn.prepare_cached(
            "SELECT handle, value FROM objects WHERE object_type = ?1 \
             AND (?2 IS NULL OR handle > ?2) ORDER BY handle LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![self.object_type.as_str(), self.last, self.page_size as i64],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)),
        )?;
        let mut fetched = Vec::with_capacity(self.page_size);
        for row in rows {
            fetched.push(row?);
        }
        if fetched.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some((handle, _)) = fetched.last() {
            self.last = Some(handle.clone());
        }
        self.page.extend(fetched);
        Ok(())
    }
}

impl StoreCursor for SqliteCursor {
    fn object_type(&self) -> ObjectType {
        self.object_type
    }

    fn next_entry(&mut self) -> StoreResult<Option<(Handle, Vec<u8>)>> {
        if self.page.is_empty() {
            self.fetch_page()?;
        }
        let next = self.page.pop_front();
        self.current = next.clone();
        Ok(next)
    }

    fn current(&self) -> Option<(&str, &[u8])> {
        self.current
            .as_ref()
            .map(|(handle, value)| (handle.as_str(), value.as_slice()))
    }

    fn close(&mut self) -> StoreResult<()> {
        self.page.clear();
        self.current = None;
        self.exhausted = true;
        if let Some(conn) = self.conn.take() {
            conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }
}
