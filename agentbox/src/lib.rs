//! Ephemeral execution environments for coding-agent tasks.
//!
//! A task attempt runs as one blocking pipeline: stale environments are
//! reaped, a fresh environment is launched under retry, supervised until it
//! exits or times out, and its marker-delimited console output is decoded
//! into commit, diff, patch and per-file snapshots that are written back to
//! the task store.
//!
//! - **[`core`]**: Pure, deterministic logic (types, output parser, reap
//!   policy, naming, status machine, error taxonomy). No I/O.
//! - **[`io`]**: Side-effecting adapters (config, child processes, the
//!   container engine, the task store, the in-environment script).
//!
//! Orchestration modules ([`command`], [`reaper`], [`launcher`],
//! [`supervisor`], [`result_writer`], [`pipeline`]) tie the two together.

pub mod command;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod launcher;
pub mod logging;
pub mod pipeline;
pub mod reaper;
pub mod result_writer;
pub mod supervisor;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
