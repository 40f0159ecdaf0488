//! TaskResultWriter: maps pipeline results onto task store updates.
//!
//! The writer tracks the task's status for the current attempt and refuses
//! any write that would break `queued -> running -> completed|failed`.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use crate::core::error::TaskError;
use crate::core::lifecycle::check_transition;
use crate::core::types::{ExecutionMetadata, ParsedResult, TaskKey, TaskStatus, TaskUpdate};
use crate::io::store::TaskStore;

pub struct ResultWriter<'a, S: TaskStore + ?Sized> {
    store: &'a S,
    key: TaskKey,
    status: TaskStatus,
}

impl<'a, S: TaskStore + ?Sized> ResultWriter<'a, S> {
    /// `status` is the status the task currently has in the store.
    pub fn new(store: &'a S, key: TaskKey, status: TaskStatus) -> Self {
        Self { store, key, status }
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn mark_running(&mut self) -> Result<()> {
        self.write(TaskUpdate::status(TaskStatus::Running))
    }

    pub fn record_container(&mut self, container_id: &str) -> Result<()> {
        self.write(TaskUpdate {
            status: Some(TaskStatus::Running),
            container_id: Some(container_id.to_string()),
            ..TaskUpdate::default()
        })
    }

    /// Store a successful result. A run that changed nothing still completes.
    pub fn complete(&mut self, parsed: ParsedResult, completed_at: DateTime<Utc>) -> Result<()> {
        info!(
            task = %self.key,
            commit_hash = parsed.commit_hash.as_deref().unwrap_or(""),
            changed_files = parsed.changed_files.len(),
            "task completed"
        );
        self.write(completed_update(parsed, completed_at))
    }

    /// Record a failure. Store errors are logged and swallowed; there is no
    /// one left to report them to.
    pub fn fail(&mut self, err: &TaskError) {
        let message = err.to_string();
        error!(task = %self.key, kind = err.kind(), "task failed");
        if let Err(write_err) = self.write(TaskUpdate::failed(message)) {
            error!(
                task = %self.key,
                err = %format!("{write_err:#}"),
                "failed to record task failure"
            );
        }
    }

    fn write(&mut self, update: TaskUpdate) -> Result<()> {
        let next = update.status.unwrap_or(self.status);
        check_transition(self.status, next).map_err(|msg| anyhow!("task {}: {msg}", self.key))?;
        self.store.update_task(&self.key, &update)?;
        debug!(task = %self.key, from = %self.status, to = %next, "task status written");
        self.status = next;
        Ok(())
    }
}

/// Store update for a successful run.
pub fn completed_update(parsed: ParsedResult, completed_at: DateTime<Utc>) -> TaskUpdate {
    TaskUpdate {
        status: Some(TaskStatus::Completed),
        commit_hash: Some(parsed.commit_hash),
        git_diff: Some(parsed.git_diff),
        git_patch: Some(parsed.git_patch),
        changed_files: Some(parsed.changed_files),
        execution_metadata: Some(ExecutionMetadata {
            file_changes: parsed.file_changes,
            completed_at,
        }),
        ..TaskUpdate::default()
    }
}
