//! EnvironmentLauncher: create and start an environment under bounded retry.

use std::collections::BTreeMap;
use std::path::Path;
use std::thread;

use anyhow::anyhow;
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::command::EnvironmentPlan;
use crate::core::backoff::backoff_delay;
use crate::core::error::TaskError;
use crate::core::naming::environment_name;
use crate::core::types::{Environment, TaskId, short_id};
use crate::io::config::AgentboxConfig;
use crate::io::engine::{CopySpec, CreateError, CreateSpec, Engine, Removal};
use crate::reaper::Reaper;

/// Label carrying the task id on every launched environment.
pub const TASK_ID_LABEL: &str = "agentbox.task-id";

pub struct Launcher<'a, E: Engine + ?Sized> {
    engine: &'a E,
    config: &'a AgentboxConfig,
}

impl<'a, E: Engine + ?Sized> Launcher<'a, E> {
    pub fn new(engine: &'a E, config: &'a AgentboxConfig) -> Self {
        Self { engine, config }
    }

    /// Create, populate and start an environment for `task_id`.
    ///
    /// A name conflict regenerates the name and runs a reaper sweep before the
    /// next attempt. Any other failure is retried with the same name until the
    /// attempt bound, after which the last error is surfaced.
    #[instrument(skip_all, fields(task_id))]
    pub fn launch(
        &self,
        task_id: TaskId,
        plan: &EnvironmentPlan,
        staged_inputs: &Path,
    ) -> Result<Environment, TaskError> {
        let max_attempts = self.config.launch.max_attempts;
        let mut tried: Vec<String> = Vec::new();
        let mut name = self.fresh_name(task_id, &tried);
        let mut last_err = None;

        for attempt in 1..=max_attempts {
            tried.push(name.clone());
            let spec = self.create_spec(task_id, &name, plan);
            match self.try_launch(&spec, plan, staged_inputs) {
                Ok(env) => {
                    info!(attempt, name = %env.name, id = env.short_id(), "environment started");
                    return Ok(env);
                }
                Err(CreateError::NameConflict(conflicting)) => {
                    warn!(attempt, name = %conflicting, "name conflict, regenerating name");
                    last_err = Some(anyhow!("environment name {conflicting} is already in use"));
                    name = self.fresh_name(task_id, &tried);
                    Reaper::from_config(self.engine, self.config).reap();
                }
                Err(CreateError::Other(err)) => {
                    warn!(attempt, name = %name, err = %format!("{err:#}"), "environment launch failed");
                    last_err = Some(err);
                }
            }
            if attempt < max_attempts {
                let delay = backoff_delay(self.config.launch.backoff_base(), attempt - 1);
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
            }
        }

        Err(TaskError::Launch {
            attempts: max_attempts,
            source: last_err.unwrap_or_else(|| anyhow!("no launch attempts were made")),
        })
    }

    fn try_launch(
        &self,
        spec: &CreateSpec,
        plan: &EnvironmentPlan,
        staged_inputs: &Path,
    ) -> Result<Environment, CreateError> {
        let id = self.engine.create(spec)?;
        let copy = CopySpec {
            source_dir: staged_inputs.to_path_buf(),
            dest_dir: plan.input_dir.clone(),
        };
        let started = self
            .engine
            .copy_into(&id, &copy)
            .and_then(|()| self.engine.start(&id));
        if let Err(err) = started {
            // Never leave a half-launched environment behind for the next attempt.
            match self.engine.remove(&id, true) {
                Removal::Failed(remove_err) => warn!(
                    id = short_id(&id),
                    err = %format!("{remove_err:#}"),
                    "failed to remove half-launched environment"
                ),
                Removal::Removed | Removal::AlreadyGone => {}
            }
            return Err(CreateError::Other(err));
        }
        Ok(Environment {
            id,
            name: spec.name.clone(),
        })
    }

    fn create_spec(&self, task_id: TaskId, name: &str, plan: &EnvironmentPlan) -> CreateSpec {
        let engine = &self.config.engine;
        CreateSpec {
            name: name.to_string(),
            image: engine.image.clone(),
            working_dir: engine.working_dir.clone(),
            network: engine.network.clone(),
            limits: self.config.limits.clone(),
            env: plan.env.clone(),
            labels: BTreeMap::from([(TASK_ID_LABEL.to_string(), task_id.to_string())]),
            command: plan.command.clone(),
        }
    }

    fn fresh_name(&self, task_id: TaskId, tried: &[String]) -> String {
        loop {
            let name = environment_name(
                &self.config.engine.name_prefix,
                task_id,
                Utc::now().timestamp(),
                rand::random::<u32>(),
            );
            if !tried.contains(&name) {
                return name;
            }
        }
    }
}
