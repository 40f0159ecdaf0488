//! Deterministic, pure logic shared by the pipeline.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests; wall-clock time
//! and randomness are passed in by the caller.

pub mod backoff;
pub mod error;
pub mod lifecycle;
pub mod naming;
pub mod parser;
pub mod reap_policy;
pub mod types;
