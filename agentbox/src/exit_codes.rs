//! Stable exit codes for agentbox CLI commands.

/// Command succeeded; for `run`, every task completed.
pub const OK: i32 = 0;
/// Invalid usage, config, or input.
pub const INVALID: i32 = 1;
/// `agentbox run`: at least one task failed or was not found.
pub const TASK_FAILED: i32 = 2;
