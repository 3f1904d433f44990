//! Transactional undo/redo history over a pluggable object store.
//!
//! # Examples
//!
//! In-memory usage with [`core::manager::UndoManager`]:
//! ```
//! use undodb::{
//!     core::manager::UndoManager,
//!     store::memory::MemoryStore,
//!     types::ObjectType,
//! };
//!
//! let mut manager = UndoManager::new(Box::new(MemoryStore::new()));
//! manager.open("Add person").expect("open");
//! manager
//!     .record(ObjectType::Person, "H1", None, Some(b"Smith".to_vec()))
//!     .expect("record");
//! manager.commit(None).expect("commit");
//!
//! assert!(manager.undo(true).expect("undo"));
//! assert_eq!(manager.get(ObjectType::Person, "H1").expect("get"), None);
//! assert!(manager.redo(true).expect("redo"));
//! assert_eq!(
//!     manager.get(ObjectType::Person, "H1").expect("get"),
//!     Some(b"Smith".to_vec())
//! );
//! ```
//!
//! Runtime usage with a SQLite store and persisted history:
//! ```no_run
//! use undodb::{
//!     config::HistoryConfig,
//!     core::manager::UndoManager,
//!     runtime::handle::{spawn_session, RuntimeConfig},
//!     store::sqlite::{SqliteOptions, SqliteStore},
//!     types::ObjectType,
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let store = SqliteStore::open("family.db", SqliteOptions::default()).expect("open sqlite");
//! let config = HistoryConfig { persist_history: true, ..HistoryConfig::default() };
//! let manager = UndoManager::open_with_config(Box::new(store), config).expect("manager");
//! let handle = spawn_session(manager, RuntimeConfig::default());
//! handle.open("Edit person").await.expect("open");
//! handle
//!     .commit_object(ObjectType::Person, "H1", b"Jones".to_vec())
//!     .await
//!     .expect("commit object");
//! handle.commit(None).await.expect("commit");
//! handle.shutdown().await.expect("shutdown");
//! # }
//! ```
#![warn(missing_docs)]

/// Object-level change records.
pub mod change;
/// History tunables.
pub mod config;
/// Undo history, signals and the transaction manager.
pub mod core;
/// Single-writer async session handle.
pub mod runtime;
/// Object store contract and engines.
pub mod store;
/// Transaction records and their persisted envelope.
pub mod txn;
/// Shared identifiers and enums.
pub mod types;
