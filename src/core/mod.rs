//! Undo/redo history, change signals and the transaction manager.

/// Linear undo/redo stacks.
pub mod history;
/// Transaction state machine and replay.
pub mod manager;
/// Notifications for views and menus.
pub mod signals;
