//! Single-writer async runtime over an undo manager.

/// Handle and command loop implementation.
pub mod handle;
