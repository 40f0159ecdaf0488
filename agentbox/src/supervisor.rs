//! EnvironmentSupervisor: wait, collect output, and always tear down.

use std::time::Duration;

use anyhow::Context;
use tracing::{debug, error, info, instrument, warn};

use crate::core::error::TaskError;
use crate::core::types::Environment;
use crate::io::engine::{Engine, Removal, WaitOutcome};

/// Exit code and console output of a finished environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Supervision {
    pub exit_code: i64,
    pub output: String,
}

pub struct Supervisor<'a, E: Engine + ?Sized> {
    engine: &'a E,
    timeout: Duration,
}

impl<'a, E: Engine + ?Sized> Supervisor<'a, E> {
    pub fn new(engine: &'a E, timeout: Duration) -> Self {
        Self { engine, timeout }
    }

    /// Block until `env` exits or the timeout elapses.
    ///
    /// Logs are fetched before teardown on every path, and the environment is
    /// removed on every path. Teardown problems are logged, never returned.
    #[instrument(skip_all, fields(name = %env.name, id = env.short_id()))]
    pub fn supervise(&self, env: &Environment) -> Result<Supervision, TaskError> {
        let waited = self.engine.wait(&env.id, self.timeout);
        let output = match self.engine.logs(&env.id) {
            Ok(output) => output,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "failed to retrieve logs");
                format!("Failed to retrieve logs: {err:#}")
            }
        };
        debug!(output_bytes = output.len(), "collected environment output");

        let exited_normally = matches!(waited, Ok(WaitOutcome::Exited(_)));
        self.teardown(env, exited_normally);

        match waited {
            Ok(WaitOutcome::Exited(exit_code)) => {
                info!(exit_code, "environment finished");
                Ok(Supervision { exit_code, output })
            }
            Ok(WaitOutcome::TimedOut) => {
                warn!(timeout_secs = self.timeout.as_secs(), "environment timed out");
                Err(TaskError::Timeout {
                    timeout_secs: self.timeout.as_secs(),
                })
            }
            Err(err) => Err(TaskError::Other(err.context("wait for environment"))),
        }
    }

    /// Graceful removal first when the environment has exited, then forced.
    fn teardown(&self, env: &Environment, graceful_first: bool) {
        if graceful_first {
            match self.engine.remove(&env.id, false) {
                Removal::Removed | Removal::AlreadyGone => {
                    debug!("environment removed");
                    return;
                }
                Removal::Failed(err) => {
                    warn!(err = %format!("{err:#}"), "graceful removal failed, forcing");
                }
            }
        }
        match self.engine.remove(&env.id, true) {
            Removal::Removed | Removal::AlreadyGone => debug!("environment force-removed"),
            Removal::Failed(err) => {
                error!(err = %format!("{err:#}"), "failed to remove environment, giving up");
            }
        }
    }
}

/// Run the supervisor and attach context to unexpected engine errors.
pub fn supervise_with_timeout<E: Engine + ?Sized>(
    engine: &E,
    env: &Environment,
    timeout: Duration,
) -> Result<Supervision, TaskError> {
    Supervisor::new(engine, timeout)
        .supervise(env)
        .map_err(|err| match err {
            TaskError::Other(inner) => {
                TaskError::Other(inner.context(format!("supervise {}", env.name)))
            }
            other => other,
        })
}
