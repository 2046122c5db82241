//! Stable exit codes for `vflow` commands.

/// Command succeeded; inputs are valid or the gate passed.
pub const OK: i32 = 0;
/// Invalid inputs, unreadable files or any other error.
pub const INVALID: i32 = 1;
/// `vflow gate` evaluated the node and acceptance failed.
pub const GATE_FAILED: i32 = 2;
