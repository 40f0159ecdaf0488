//! Shared deterministic types for the task pipeline.
//!
//! These mirror the records owned by the task store and the values exchanged
//! between pipeline stages. They carry no I/O and must serialize stably.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Numeric task identifier assigned by whoever enqueued the task.
pub type TaskId = u64;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coding agents the pipeline knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    Claude,
}

impl AgentKind {
    /// Resolve the store's free-form `agent` field. Unknown names yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "claude" => Some(AgentKind::Claude),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
        }
    }

    /// Environment variable that carries the agent's API key.
    pub fn api_key_var(self) -> &'static str {
        match self {
            AgentKind::Claude => "ANTHROPIC_API_KEY",
        }
    }

    /// Agent-specific flag that disables interactive prompts.
    pub fn noninteractive_var(self) -> &'static str {
        match self {
            AgentKind::Claude => "ANTHROPIC_NONINTERACTIVE",
        }
    }

    /// Home-relative directory and file name for the agent's credential file.
    pub fn credentials_location(self) -> (&'static str, &'static str) {
        match self {
            AgentKind::Claude => (".claude", ".credentials.json"),
        }
    }

    /// Shell invocation that runs the agent non-interactively, reading the
    /// prompt on stdin.
    pub fn invocation(self) -> &'static str {
        match self {
            AgentKind::Claude => "claude --print --allowedTools \"Edit,Bash\"",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_agent() -> String {
    AgentKind::Claude.as_str().to_string()
}

/// Author of a chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
}

/// A unit of work as stored by the task store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub user_id: String,
    #[serde(default = "default_agent")]
    pub agent: String,
    pub repo_url: String,
    pub target_branch: String,
    #[serde(default)]
    pub chat_messages: Vec<ChatMessage>,
    pub status: TaskStatus,
    #[serde(default)]
    pub container_id: Option<String>,
    #[serde(default)]
    pub commit_hash: Option<String>,
    #[serde(default)]
    pub git_diff: Option<String>,
    #[serde(default)]
    pub git_patch: Option<String>,
    #[serde(default)]
    pub changed_files: Vec<String>,
    #[serde(default)]
    pub execution_metadata: Option<ExecutionMetadata>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Task {
    /// The first user-authored message, if it has any content.
    pub fn prompt(&self) -> Option<&str> {
        self.chat_messages
            .iter()
            .find(|msg| msg.role == "user")
            .map(|msg| msg.content.as_str())
            .filter(|content| !content.trim().is_empty())
    }
}

/// Owner-scoped key used for every task store call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub task_id: TaskId,
    pub user_id: String,
}

impl TaskKey {
    pub fn new(task_id: TaskId, user_id: impl Into<String>) -> Self {
        Self {
            task_id,
            user_id: user_id.into(),
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.task_id, self.user_id)
    }
}

/// Partial task update. `None` fields are left untouched by the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    /// Outer `Some(None)` clears the stored hash (a run that made no commit).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_diff: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_patch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changed_files: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_metadata: Option<ExecutionMetadata>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Failed),
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Apply the present fields onto `task`.
    pub fn apply_to(&self, task: &mut Task) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(error) = &self.error {
            task.error = Some(error.clone());
        }
        if let Some(container_id) = &self.container_id {
            task.container_id = Some(container_id.clone());
        }
        if let Some(commit_hash) = &self.commit_hash {
            task.commit_hash = commit_hash.clone();
        }
        if let Some(diff) = &self.git_diff {
            task.git_diff = Some(diff.clone());
        }
        if let Some(patch) = &self.git_patch {
            task.git_patch = Some(patch.clone());
        }
        if let Some(files) = &self.changed_files {
            task.changed_files = files.clone();
        }
        if let Some(meta) = &self.execution_metadata {
            task.execution_metadata = Some(meta.clone());
        }
    }
}

/// Before/after snapshot of one file touched by the agent.
///
/// `before == None` means the file did not exist; `after == None` means it
/// was deleted.
///
/// Content is decoded line by line, so it is not byte-exact: a trailing
/// newline is not preserved (`"hello\n"` and `"hello"` read back the same),
/// and a file whose whole content is a sentinel line such as
/// `FILE_NOT_EXISTS` reads back as `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub filename: String,
    pub before: Option<String>,
    pub after: Option<String>,
}

/// Extra result data stored alongside a completed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub file_changes: Vec<FileChange>,
    pub completed_at: DateTime<Utc>,
}

/// Structured data decoded from an environment's console output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedResult {
    pub commit_hash: Option<String>,
    pub git_diff: String,
    pub git_patch: String,
    pub changed_files: Vec<String>,
    pub file_changes: Vec<FileChange>,
}

impl ParsedResult {
    /// True when the agent ran but left the repository untouched.
    pub fn is_noop(&self) -> bool {
        self.commit_hash.is_none() && self.changed_files.is_empty()
    }
}

/// A user record; only preferences are consumed by the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub preferences: BTreeMap<String, Value>,
}

/// Engine-reported state of an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    #[serde(other)]
    Unknown,
}

impl EnvironmentStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "created" => EnvironmentStatus::Created,
            "running" => EnvironmentStatus::Running,
            "paused" => EnvironmentStatus::Paused,
            "restarting" => EnvironmentStatus::Restarting,
            "removing" => EnvironmentStatus::Removing,
            "exited" => EnvironmentStatus::Exited,
            "dead" => EnvironmentStatus::Dead,
            _ => EnvironmentStatus::Unknown,
        }
    }
}

/// A created environment handed from the launcher to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub id: String,
    pub name: String,
}

impl Environment {
    /// Abbreviated id for log lines.
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }
}

/// Inspection snapshot used by the reaper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentInfo {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub status: EnvironmentStatus,
}

/// Resource ceilings applied to every environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Memory ceiling in the engine's syntax (e.g. `2g`).
    pub memory: String,
    /// Relative CPU weight.
    pub cpu_shares: u32,
    pub nofile_soft: u64,
    pub nofile_hard: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory: "2g".to_string(),
            cpu_shares: 1024,
            nofile_soft: 1024,
            nofile_hard: 2048,
        }
    }
}

pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(12) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}
