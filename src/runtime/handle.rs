use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;

use crate::{
    change::ChangeKind,
    core::{
        manager::{TransactionHandle, UndoError, UndoManager},
        signals::Signal,
    },
    types::{Handle, ObjectType},
};

/// Errors returned by [`SessionHandle`] calls.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The manager rejected or failed the command.
    #[error(transparent)]
    Undo(#[from] UndoError),
    /// The session loop is gone, after a shutdown or a panic.
    #[error("session loop has stopped")]
    ChannelClosed,
}

/// Channel sizes for [`spawn_session`]. Zero is treated as one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Commands that may queue before callers wait.
    pub command_queue_bound: usize,
    /// Signals kept for slow subscribers before they lag.
    pub signal_buffer: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command_queue_bound: 256,
            signal_buffer: 1024,
        }
    }
}

/// Snapshot of the manager's history position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryStatus {
    /// Records available to undo.
    pub undo_count: usize,
    /// Records available to redo.
    pub redo_count: usize,
    /// A transaction is open.
    pub recording: bool,
    /// The store refuses writes.
    pub read_only: bool,
    /// `"Undo <description>"` for the next undo.
    pub undo_label: Option<String>,
    /// `"Redo <description>"` for the next redo.
    pub redo_label: Option<String>,
}

/// Cloneable handle that marshals every call onto the session's writer thread.
#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::Sender<Command>,
    signals_tx: broadcast::Sender<Signal>,
}

type Reply<T> = oneshot::Sender<Result<T, UndoError>>;

enum Command {
    Open {
        description: String,
        batch: bool,
        resp: Reply<TransactionHandle>,
    },
    Record {
        object_type: ObjectType,
        handle: Handle,
        old_value: Option<Vec<u8>>,
        new_value: Option<Vec<u8>>,
        resp: Reply<()>,
    },
    CommitObject {
        object_type: ObjectType,
        handle: Handle,
        value: Vec<u8>,
        resp: Reply<ChangeKind>,
    },
    RemoveObject {
        object_type: ObjectType,
        handle: Handle,
        resp: Reply<bool>,
    },
    Commit {
        description: Option<String>,
        resp: Reply<()>,
    },
    Abort {
        resp: Reply<()>,
    },
    Undo {
        update_history: bool,
        resp: Reply<bool>,
    },
    Redo {
        update_history: bool,
        resp: Reply<bool>,
    },
    Clear {
        resp: Reply<()>,
    },
    Get {
        object_type: ObjectType,
        handle: Handle,
        resp: Reply<Option<Vec<u8>>>,
    },
    Lookup {
        index: String,
        key: String,
        resp: Reply<Vec<Handle>>,
    },
    Status {
        resp: oneshot::Sender<HistoryStatus>,
    },
    Shutdown {
        resp: Reply<UndoManager>,
    },
}

/// Moves `manager` onto a dedicated blocking thread and returns its handle.
///
/// Commands run strictly in arrival order. Signals drained after each command
/// are broadcast before the command's reply is sent.
pub fn spawn_session(manager: UndoManager, config: RuntimeConfig) -> SessionHandle {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(config.command_queue_bound.max(1));
    let (signals_tx, _) = broadcast::channel::<Signal>(config.signal_buffer.max(1));

    let signals_loop = signals_tx.clone();

    tokio::task::spawn_blocking(move || {
        let mut manager = manager;
        while let Some(cmd) = cmd_rx.blocking_recv() {
            if let Some(resp) = handle_command(cmd, &mut manager, &signals_loop) {
                let res = manager.abort();
                publish(&mut manager, &signals_loop);
                let _ = resp.send(res.map(|()| manager));
                debug!("session loop shut down");
                return;
            }
        }
        // Every handle was dropped; an open transaction rolls back with the store.
        debug!("session loop stopped");
    });

    SessionHandle { cmd_tx, signals_tx }
}

impl SessionHandle {
    /// Receives every signal published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.signals_tx.subscribe()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// See [`UndoManager::open`].
    pub async fn open(&self, description: impl Into<String>) -> Result<TransactionHandle, RuntimeError> {
        let description = description.into();
        Ok(self
            .request(|resp| Command::Open {
                description,
                batch: false,
                resp,
            })
            .await??)
    }

    /// See [`UndoManager::open_batch`].
    pub async fn open_batch(
        &self,
        description: impl Into<String>,
    ) -> Result<TransactionHandle, RuntimeError> {
        let description = description.into();
        Ok(self
            .request(|resp| Command::Open {
                description,
                batch: true,
                resp,
            })
            .await??)
    }

    /// See [`UndoManager::record`].
    pub async fn record(
        &self,
        object_type: ObjectType,
        handle: impl Into<Handle>,
        old_value: Option<Vec<u8>>,
        new_value: Option<Vec<u8>>,
    ) -> Result<(), RuntimeError> {
        let handle = handle.into();
        Ok(self
            .request(|resp| Command::Record {
                object_type,
                handle,
                old_value,
                new_value,
                resp,
            })
            .await??)
    }

    /// See [`UndoManager::commit_object`].
    pub async fn commit_object(
        &self,
        object_type: ObjectType,
        handle: impl Into<Handle>,
        value: Vec<u8>,
    ) -> Result<ChangeKind, RuntimeError> {
        let handle = handle.into();
        Ok(self
            .request(|resp| Command::CommitObject {
                object_type,
                handle,
                value,
                resp,
            })
            .await??)
    }

    /// See [`UndoManager::remove_object`].
    pub async fn remove_object(
        &self,
        object_type: ObjectType,
        handle: impl Into<Handle>,
    ) -> Result<bool, RuntimeError> {
        let handle = handle.into();
        Ok(self
            .request(|resp| Command::RemoveObject {
                object_type,
                handle,
                resp,
            })
            .await??)
    }

    /// Commits the open transaction, optionally renaming it.
    pub async fn commit(&self, description: Option<String>) -> Result<(), RuntimeError> {
        Ok(self
            .request(|resp| Command::Commit { description, resp })
            .await??)
    }

    /// See [`UndoManager::abort`].
    pub async fn abort(&self) -> Result<(), RuntimeError> {
        Ok(self.request(|resp| Command::Abort { resp }).await??)
    }

    /// See [`UndoManager::undo`].
    pub async fn undo(&self, update_history: bool) -> Result<bool, RuntimeError> {
        Ok(self
            .request(|resp| Command::Undo {
                update_history,
                resp,
            })
            .await??)
    }

    /// See [`UndoManager::redo`].
    pub async fn redo(&self, update_history: bool) -> Result<bool, RuntimeError> {
        Ok(self
            .request(|resp| Command::Redo {
                update_history,
                resp,
            })
            .await??)
    }

    /// See [`UndoManager::clear`].
    pub async fn clear(&self) -> Result<(), RuntimeError> {
        Ok(self.request(|resp| Command::Clear { resp }).await??)
    }

    /// Reads one object as the writer sees it.
    pub async fn get(
        &self,
        object_type: ObjectType,
        handle: impl Into<Handle>,
    ) -> Result<Option<Vec<u8>>, RuntimeError> {
        let handle = handle.into();
        Ok(self
            .request(|resp| Command::Get {
                object_type,
                handle,
                resp,
            })
            .await??)
    }

    /// See [`UndoManager::lookup`].
    pub async fn lookup(
        &self,
        index: impl Into<String>,
        key: impl Into<String>,
    ) -> Result<Vec<Handle>, RuntimeError> {
        let (index, key) = (index.into(), key.into());
        Ok(self
            .request(|resp| Command::Lookup { index, key, resp })
            .await??)
    }

    /// Current counts, labels and flags.
    pub async fn status(&self) -> Result<HistoryStatus, RuntimeError> {
        self.request(|resp| Command::Status { resp }).await
    }

    /// Stops the loop, aborting any open transaction, and returns the manager.
    pub async fn shutdown(&self) -> Result<UndoManager, RuntimeError> {
        Ok(self.request(|resp| Command::Shutdown { resp }).await??)
    }
}

/// Runs one command. Returns the reply channel when the command is a shutdown.
fn handle_command(
    cmd: Command,
    manager: &mut UndoManager,
    signals_tx: &broadcast::Sender<Signal>,
) -> Option<Reply<UndoManager>> {
    match cmd {
        Command::Open {
            description,
            batch,
            resp,
        } => {
            let res = if batch {
                manager.open_batch(&description)
            } else {
                manager.open(&description)
            };
            respond(manager, signals_tx, resp, res);
        }
        Command::Record {
            object_type,
            handle,
            old_value,
            new_value,
            resp,
        } => {
            let res = manager.record(object_type, handle, old_value, new_value);
            respond(manager, signals_tx, resp, res);
        }
        Command::CommitObject {
            object_type,
            handle,
            value,
            resp,
        } => {
            let res = manager.commit_object(object_type, &handle, value);
            respond(manager, signals_tx, resp, res);
        }
        Command::RemoveObject {
            object_type,
            handle,
            resp,
        } => {
            let res = manager.remove_object(object_type, &handle);
            respond(manager, signals_tx, resp, res);
        }
        Command::Commit { description, resp } => {
            let res = manager.commit(description.as_deref());
            respond(manager, signals_tx, resp, res);
        }
        Command::Abort { resp } => {
            let res = manager.abort();
            respond(manager, signals_tx, resp, res);
        }
        Command::Undo {
            update_history,
            resp,
        } => {
            let res = manager.undo(update_history);
            respond(manager, signals_tx, resp, res);
        }
        Command::Redo {
            update_history,
            resp,
        } => {
            let res = manager.redo(update_history);
            respond(manager, signals_tx, resp, res);
        }
        Command::Clear { resp } => {
            let res = manager.clear();
            respond(manager, signals_tx, resp, res);
        }
        Command::Get {
            object_type,
            handle,
            resp,
        } => {
            let res = manager.get(object_type, &handle);
            respond(manager, signals_tx, resp, res);
        }
        Command::Lookup { index, key, resp } => {
            let res = manager.lookup(&index, &key);
            respond(manager, signals_tx, resp, res);
        }
        Command::Status { resp } => {
            let _ = resp.send(HistoryStatus {
                undo_count: manager.undo_count(),
                redo_count: manager.redo_count(),
                recording: manager.is_recording(),
                read_only: manager.is_read_only(),
                undo_label: manager.undo_label(),
                redo_label: manager.redo_label(),
            });
        }
        Command::Shutdown { resp } => return Some(resp),
    }
    None
}

fn respond<T>(
    manager: &mut UndoManager,
    signals_tx: &broadcast::Sender<Signal>,
    resp: Reply<T>,
    res: Result<T, UndoError>,
) {
    publish(manager, signals_tx);
    let _ = resp.send(res);
}

fn publish(manager: &mut UndoManager, signals_tx: &broadcast::Sender<Signal>) {
    for signal in manager.drain_signals() {
        let _ = signals_tx.send(signal);
    }
}
