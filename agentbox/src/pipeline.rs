//! One task attempt: build -> reap -> launch -> supervise -> parse -> write.

use chrono::Utc;
use tracing::{error, info, instrument, warn};

use crate::command::{AgentPreferences, CommandBuilder, Secrets};
use crate::core::error::TaskError;
use crate::core::parser::parse;
use crate::core::types::{ParsedResult, Task, TaskKey, TaskStatus, short_id};
use crate::io::config::AgentboxConfig;
use crate::io::engine::Engine;
use crate::io::store::TaskStore;
use crate::launcher::Launcher;
use crate::reaper::Reaper;
use crate::result_writer::ResultWriter;
use crate::supervisor::supervise_with_timeout;

/// Final result of one attempt, as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed { commit_hash: Option<String> },
    Failed { error: String },
    /// The task does not exist or belongs to another user.
    NotFound,
    /// The task was already finished, or another attempt still owns it.
    Skipped { status: TaskStatus },
}

impl TaskOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, TaskOutcome::Failed { .. } | TaskOutcome::NotFound)
    }
}

/// Runs task attempts against a shared engine and store.
///
/// Both handles are borrowed, so one runner can be used from several threads
/// at once; every attempt owns its own environment.
pub struct TaskRunner<'a, E: Engine + ?Sized, S: TaskStore + ?Sized> {
    engine: &'a E,
    store: &'a S,
    config: &'a AgentboxConfig,
    secrets: &'a Secrets,
}

impl<'a, E: Engine + ?Sized, S: TaskStore + ?Sized> TaskRunner<'a, E, S> {
    pub fn new(
        engine: &'a E,
        store: &'a S,
        config: &'a AgentboxConfig,
        secrets: &'a Secrets,
    ) -> Self {
        Self {
            engine,
            store,
            config,
            secrets,
        }
    }

    /// Run one attempt. Every failure is written to the store as `failed`
    /// before returning; the task is never left `running`.
    #[instrument(skip_all, fields(task = %key))]
    pub fn run(&self, key: &TaskKey) -> TaskOutcome {
        let task = match self.store.get_task(key) {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!("task not found");
                return TaskOutcome::NotFound;
            }
            Err(err) => {
                let error = format!("{err:#}");
                error!(err = %error, "failed to load task");
                return TaskOutcome::Failed { error };
            }
        };
        if task.status.is_terminal() {
            warn!(status = %task.status, "task already finished, skipping");
            return TaskOutcome::Skipped {
                status: task.status,
            };
        }
        if task.status == TaskStatus::Running && self.attempt_in_progress(&task) {
            warn!(container = ?task.container_id, "task owned by another attempt, skipping");
            return TaskOutcome::Skipped {
                status: task.status,
            };
        }

        let mut writer = ResultWriter::new(self.store, key.clone(), task.status);
        if let Err(err) = writer.mark_running() {
            let err = TaskError::Other(err.context("mark task running"));
            writer.fail(&err);
            return TaskOutcome::Failed {
                error: err.to_string(),
            };
        }
        info!(repo = %task.repo_url, branch = %task.target_branch, "task started");

        let parsed = match self.execute(&task, &mut writer) {
            Ok(parsed) => parsed,
            Err(err) => {
                writer.fail(&err);
                return TaskOutcome::Failed {
                    error: err.to_string(),
                };
            }
        };

        let commit_hash = parsed.commit_hash.clone();
        if let Err(err) = writer.complete(parsed, Utc::now()) {
            let err = TaskError::Other(err.context("store task result"));
            writer.fail(&err);
            return TaskOutcome::Failed {
                error: err.to_string(),
            };
        }
        TaskOutcome::Completed { commit_hash }
    }

    /// A `running` task belongs to another attempt until its recorded
    /// environment is gone. Without a recorded environment the other attempt
    /// may still be launching.
    fn attempt_in_progress(&self, task: &Task) -> bool {
        let Some(container_id) = task.container_id.as_deref() else {
            return true;
        };
        match self.engine.inspect(container_id) {
            Ok(_) => true,
            Err(err) => {
                info!(
                    container = short_id(container_id),
                    err = %format!("{err:#}"),
                    "recorded environment is gone, taking over running task"
                );
                false
            }
        }
    }

    fn execute(
        &self,
        task: &Task,
        writer: &mut ResultWriter<'_, S>,
    ) -> Result<ParsedResult, TaskError> {
        let user = match self.store.get_user(&task.user_id) {
            Ok(user) => user,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "failed to load user preferences");
                None
            }
        };
        let preferences = AgentPreferences::from_user(user.as_ref());
        let plan = CommandBuilder::new(&self.config.engine, &self.config.git).build(
            task,
            self.secrets,
            &preferences,
        )?;

        Reaper::from_config(self.engine, self.config).reap();

        let staged = plan.stage()?;
        let env = Launcher::new(self.engine, self.config).launch(task.id, &plan, staged.path())?;
        if let Err(err) = writer.record_container(&env.id) {
            warn!(err = %format!("{err:#}"), "failed to record container id");
        }

        let supervision = supervise_with_timeout(self.engine, &env, self.config.supervise.timeout())?;
        if supervision.exit_code != 0 {
            return Err(TaskError::Execution {
                exit_code: supervision.exit_code,
                output: supervision.output,
            });
        }
        Ok(parse(&supervision.output))
    }
}
