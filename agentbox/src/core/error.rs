//! Failure taxonomy for a task attempt.
//!
//! Each variant renders the message written to the task's `error` field, so
//! the `Display` strings are part of the stored contract.

use thiserror::Error;

/// Problems detected before any environment is created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("Unsupported agent: {0}. Only claude is supported.")]
    UnsupportedAgent(String),
    #[error("No user prompt found in chat messages")]
    MissingPrompt,
}

/// Terminal failure of one task attempt.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// Environment creation kept failing until the retry bound.
    #[error("Failed to create environment after {attempts} attempts: {source:#}")]
    Launch {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    /// The environment was still running at the supervision ceiling.
    #[error("Environment execution timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// The in-environment script exited non-zero; `output` is its console log.
    #[error("Environment exited with code {exit_code}: {output}")]
    Execution { exit_code: i64, output: String },

    #[error("{0:#}")]
    Other(#[from] anyhow::Error),
}

impl TaskError {
    /// Short machine-friendly label used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            TaskError::Configuration(_) => "configuration",
            TaskError::Launch { .. } => "launch",
            TaskError::Timeout { .. } => "timeout",
            TaskError::Execution { .. } => "execution",
            TaskError::Other(_) => "other",
        }
    }
}
