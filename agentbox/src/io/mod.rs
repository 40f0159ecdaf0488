//! I/O adapters for the pipeline: configuration, child processes, the
//! container engine, the task store, and the in-environment script.

pub mod config;
pub mod docker;
pub mod engine;
pub mod process;
pub mod script;
pub mod store;
