//! Test-only fixtures and fakes for the engine and the task store.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::command::{AgentPreferences, CommandBuilder, EnvironmentPlan, Secrets};
use crate::core::parser;
use crate::core::types::{
    ChatMessage, EnvironmentInfo, EnvironmentStatus, Task, TaskId, TaskKey, TaskStatus,
    TaskUpdate, User,
};
use crate::io::config::AgentboxConfig;
use crate::io::engine::{CopySpec, CreateError, CreateSpec, Engine, Removal, WaitOutcome};
use crate::io::store::TaskStore;

/// A queued task with a prompt, owned by `user_id`.
pub fn task(id: TaskId, user_id: &str) -> Task {
    Task {
        id,
        user_id: user_id.to_string(),
        agent: "claude".to_string(),
        repo_url: "https://github.com/acme/widgets.git".to_string(),
        target_branch: "main".to_string(),
        chat_messages: vec![ChatMessage {
            role: "user".to_string(),
            content: "Add a README".to_string(),
        }],
        status: TaskStatus::Queued,
        container_id: None,
        commit_hash: None,
        git_diff: None,
        git_patch: None,
        changed_files: Vec::new(),
        execution_metadata: None,
        error: None,
    }
}

/// A user whose agent preferences are `agent_prefs`.
pub fn user_with_preferences(id: &str, agent_prefs: Value) -> User {
    User {
        id: id.to_string(),
        preferences: BTreeMap::from([(crate::command::PREFERENCES_KEY.to_string(), agent_prefs)]),
    }
}

/// Default config without launch backoff delays.
pub fn test_config() -> AgentboxConfig {
    let mut config = AgentboxConfig::default();
    config.launch.backoff_base_ms = 0;
    config
}

pub fn test_secrets() -> Secrets {
    Secrets {
        agent_api_key: Some("sk-test".to_string()),
        github_token: None,
    }
}

/// Plan for `task(1, "alice")` under [`test_config`].
pub fn test_plan() -> EnvironmentPlan {
    let config = test_config();
    CommandBuilder::new(&config.engine, &config.git)
        .build(&task(1, "alice"), &test_secrets(), &AgentPreferences::default())
        .expect("plan builds")
}

/// Builds console output in the marker format the task script emits.
#[derive(Debug, Default)]
pub struct ConsoleBuilder {
    lines: Vec<String>,
}

impl ConsoleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn line(mut self, line: &str) -> Self {
        self.lines.push(line.to_string());
        self
    }

    fn block(mut self, start: &str, body: &str, end: &str) -> Self {
        self.lines.push(start.to_string());
        if !body.is_empty() {
            self.lines.extend(body.split('\n').map(str::to_string));
        }
        self.lines.push(end.to_string());
        self
    }

    pub fn commit_hash(self, hash: &str) -> Self {
        self.line(&format!("{}{hash}", parser::COMMIT_HASH_PREFIX))
    }

    pub fn patch(self, patch: &str) -> Self {
        self.block(parser::PATCH_START, patch, parser::PATCH_END)
    }

    pub fn diff(self, diff: &str) -> Self {
        self.block(parser::DIFF_START, diff, parser::DIFF_END)
    }

    pub fn changed_files(self, files: &[&str]) -> Self {
        self.block(
            parser::CHANGED_FILES_START,
            &files.join("\n"),
            parser::CHANGED_FILES_END,
        )
    }

    /// `(filename, before, after)`; `None` renders the matching sentinel.
    pub fn file_changes(mut self, files: &[(&str, Option<&str>, Option<&str>)]) -> Self {
        self.lines.push(parser::FILE_CHANGES_START.to_string());
        for (name, before, after) in files {
            self.lines.push(format!("{}{name}", parser::FILE_PREFIX));
            self = self.block(
                parser::BEFORE_START,
                before.unwrap_or(parser::FILE_NOT_EXISTS),
                parser::BEFORE_END,
            );
            self = self.block(
                parser::AFTER_START,
                after.unwrap_or(parser::FILE_DELETED),
                parser::AFTER_END,
            );
            self.lines.push(parser::FILE_END.to_string());
        }
        self.lines.push(parser::FILE_CHANGES_END.to_string());
        self
    }

    /// Every section with no content, as printed when nothing changed.
    pub fn empty_sections(self) -> Self {
        self.patch("").diff("").changed_files(&[]).file_changes(&[])
    }

    pub fn build(self) -> String {
        let mut out = self.lines.join("\n");
        out.push('\n');
        out
    }
}

/// Scripted result for the next `create` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateStep {
    Conflict,
    Error,
}

/// One recorded `remove` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveCall {
    pub id: String,
    pub force: bool,
}

#[derive(Debug)]
struct FakeEnvironment {
    info: EnvironmentInfo,
    staged: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct FakeState {
    environments: Vec<FakeEnvironment>,
    next_id: u32,
    create_steps: VecDeque<CreateStep>,
    create_attempts: Vec<CreateSpec>,
    created: Vec<CreateSpec>,
    copies: Vec<(String, String)>,
    started: Vec<String>,
    removals: Vec<RemoveCall>,
    logs_requested: Vec<String>,
    waits: BTreeMap<String, WaitOutcome>,
    logs: BTreeMap<String, String>,
    default_wait: Option<WaitOutcome>,
    default_logs: String,
    fail_list: bool,
    fail_inspect: BTreeSet<String>,
    fail_remove: BTreeSet<String>,
    fail_wait: BTreeSet<String>,
    fail_logs: BTreeSet<String>,
    fail_next_copy: bool,
    fail_next_start: bool,
}

impl FakeState {
    fn find_mut(&mut self, id: &str) -> Option<&mut FakeEnvironment> {
        self.environments.iter_mut().find(|env| env.info.id == id)
    }
}

/// In-memory engine with scripted outcomes and a call log.
///
/// Environments created through `create` get ids `env-1`, `env-2`, ...
/// `wait` returns the scripted outcome for the id, else the default
/// (`Exited(0)` unless changed).
#[derive(Debug, Default)]
pub struct FakeEngine {
    state: Mutex<FakeState>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake engine lock")
    }

    pub fn add_environment(
        &self,
        id: &str,
        name: &str,
        status: EnvironmentStatus,
        created_at: DateTime<Utc>,
    ) {
        self.state().environments.push(FakeEnvironment {
            info: EnvironmentInfo {
                id: id.to_string(),
                name: name.to_string(),
                created_at,
                status,
            },
            staged: BTreeMap::new(),
        });
    }

    /// Add a running environment created now; returns its id.
    pub fn add_running(&self, name: &str) -> String {
        let id = {
            let mut state = self.state();
            state.next_id += 1;
            format!("env-{}", state.next_id)
        };
        self.add_environment(&id, name, EnvironmentStatus::Running, Utc::now());
        id
    }

    pub fn environment_ids(&self) -> Vec<String> {
        self.state()
            .environments
            .iter()
            .map(|env| env.info.id.clone())
            .collect()
    }

    pub fn status_of(&self, id: &str) -> Option<EnvironmentStatus> {
        self.state()
            .environments
            .iter()
            .find(|env| env.info.id == id)
            .map(|env| env.info.status.clone())
    }

    pub fn push_create_steps(&self, step: CreateStep, count: usize) {
        let mut state = self.state();
        for _ in 0..count {
            state.create_steps.push_back(step);
        }
    }

    pub fn script_wait(&self, id: &str, outcome: WaitOutcome) {
        self.state().waits.insert(id.to_string(), outcome);
    }

    pub fn set_default_wait(&self, outcome: WaitOutcome) {
        self.state().default_wait = Some(outcome);
    }

    pub fn script_logs(&self, id: &str, logs: &str) {
        self.state().logs.insert(id.to_string(), logs.to_string());
    }

    pub fn set_default_logs(&self, logs: &str) {
        self.state().default_logs = logs.to_string();
    }

    pub fn fail_list(&self) {
        self.state().fail_list = true;
    }

    pub fn fail_inspect(&self, id: &str) {
        self.state().fail_inspect.insert(id.to_string());
    }

    pub fn fail_remove(&self, id: &str) {
        self.state().fail_remove.insert(id.to_string());
    }

    pub fn fail_wait(&self, id: &str) {
        self.state().fail_wait.insert(id.to_string());
    }

    pub fn fail_logs(&self, id: &str) {
        self.state().fail_logs.insert(id.to_string());
    }

    pub fn fail_next_copy(&self) {
        self.state().fail_next_copy = true;
    }

    pub fn fail_next_start(&self) {
        self.state().fail_next_start = true;
    }

    /// Every `CreateSpec` passed to `create`, including rejected ones.
    pub fn create_attempts(&self) -> Vec<CreateSpec> {
        self.state().create_attempts.clone()
    }

    /// `CreateSpec`s whose `create` call succeeded.
    pub fn created_specs(&self) -> Vec<CreateSpec> {
        self.state().created.clone()
    }

    /// `(id, destination)` for every successful copy.
    pub fn copies(&self) -> Vec<(String, String)> {
        self.state().copies.clone()
    }

    /// Contents of a file copied into `id`, keyed by file name.
    pub fn staged_file(&self, id: &str, name: &str) -> Option<String> {
        let state = self.state();
        state
            .environments
            .iter()
            .find(|env| env.info.id == id)
            .and_then(|env| env.staged.get(name).cloned())
    }

    pub fn started(&self) -> Vec<String> {
        self.state().started.clone()
    }

    pub fn removals(&self) -> Vec<RemoveCall> {
        self.state().removals.clone()
    }

    pub fn logs_requested(&self) -> Vec<String> {
        self.state().logs_requested.clone()
    }
}

impl Engine for FakeEngine {
    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let state = self.state();
        if state.fail_list {
            return Err(anyhow!("scripted list failure"));
        }
        Ok(state
            .environments
            .iter()
            .filter(|env| env.info.name.contains(prefix))
            .map(|env| env.info.id.clone())
            .collect())
    }

    fn inspect(&self, id: &str) -> Result<EnvironmentInfo> {
        let state = self.state();
        if state.fail_inspect.contains(id) {
            return Err(anyhow!("scripted inspect failure"));
        }
        state
            .environments
            .iter()
            .find(|env| env.info.id == id)
            .map(|env| env.info.clone())
            .ok_or_else(|| anyhow!("No such container: {id}"))
    }

    fn create(&self, spec: &CreateSpec) -> Result<String, CreateError> {
        let mut state = self.state();
        state.create_attempts.push(spec.clone());
        match state.create_steps.pop_front() {
            Some(CreateStep::Conflict) => return Err(CreateError::NameConflict(spec.name.clone())),
            Some(CreateStep::Error) => {
                return Err(CreateError::Other(anyhow!("scripted create failure")));
            }
            None => {}
        }
        state.next_id += 1;
        let id = format!("env-{}", state.next_id);
        state.created.push(spec.clone());
        state.environments.push(FakeEnvironment {
            info: EnvironmentInfo {
                id: id.clone(),
                name: spec.name.clone(),
                created_at: Utc::now(),
                status: EnvironmentStatus::Created,
            },
            staged: BTreeMap::new(),
        });
        Ok(id)
    }

    fn copy_into(&self, id: &str, copy: &CopySpec) -> Result<()> {
        let mut staged = BTreeMap::new();
        for entry in fs::read_dir(&copy.source_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            staged.insert(name, fs::read_to_string(entry.path())?);
        }
        let mut state = self.state();
        if std::mem::take(&mut state.fail_next_copy) {
            return Err(anyhow!("scripted copy failure"));
        }
        let env = state
            .find_mut(id)
            .ok_or_else(|| anyhow!("No such container: {id}"))?;
        env.staged = staged;
        state.copies.push((id.to_string(), copy.dest_dir.clone()));
        Ok(())
    }

    fn start(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        if std::mem::take(&mut state.fail_next_start) {
            return Err(anyhow!("scripted start failure"));
        }
        let env = state
            .find_mut(id)
            .ok_or_else(|| anyhow!("No such container: {id}"))?;
        env.info.status = EnvironmentStatus::Running;
        state.started.push(id.to_string());
        Ok(())
    }

    fn wait(&self, id: &str, _timeout: Duration) -> Result<WaitOutcome> {
        let mut state = self.state();
        if state.fail_wait.contains(id) {
            return Err(anyhow!("scripted wait failure"));
        }
        let outcome = state
            .waits
            .get(id)
            .copied()
            .or(state.default_wait)
            .unwrap_or(WaitOutcome::Exited(0));
        if let WaitOutcome::Exited(_) = outcome
            && let Some(env) = state.find_mut(id)
        {
            env.info.status = EnvironmentStatus::Exited;
        }
        Ok(outcome)
    }

    fn logs(&self, id: &str) -> Result<String> {
        let mut state = self.state();
        state.logs_requested.push(id.to_string());
        if state.fail_logs.contains(id) {
            return Err(anyhow!("scripted logs failure"));
        }
        Ok(state
            .logs
            .get(id)
            .cloned()
            .unwrap_or_else(|| state.default_logs.clone()))
    }

    fn remove(&self, id: &str, force: bool) -> Removal {
        let mut state = self.state();
        state.removals.push(RemoveCall {
            id: id.to_string(),
            force,
        });
        if state.fail_remove.contains(id) {
            return Removal::Failed(anyhow!("scripted remove failure"));
        }
        let Some(pos) = state.environments.iter().position(|env| env.info.id == id) else {
            return Removal::AlreadyGone;
        };
        let running = state.environments[pos].info.status == EnvironmentStatus::Running;
        if running && !force {
            return Removal::Failed(anyhow!("cannot remove a running environment"));
        }
        state.environments.remove(pos);
        Removal::Removed
    }
}

/// In-memory task store with an update log.
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<BTreeMap<TaskId, Task>>,
    users: Mutex<BTreeMap<String, User>>,
    updates: Mutex<Vec<TaskUpdate>>,
    fail_updates: Mutex<bool>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_task(&self, task: Task) {
        self.tasks.lock().expect("tasks lock").insert(task.id, task);
    }

    pub fn insert_user(&self, user: User) {
        self.users
            .lock()
            .expect("users lock")
            .insert(user.id.clone(), user);
    }

    /// Current stored copy, ignoring ownership.
    pub fn task(&self, key: &TaskKey) -> Option<Task> {
        self.tasks
            .lock()
            .expect("tasks lock")
            .get(&key.task_id)
            .cloned()
    }

    /// Status values written, in order.
    pub fn status_history(&self) -> Vec<TaskStatus> {
        self.updates
            .lock()
            .expect("updates lock")
            .iter()
            .filter_map(|update| update.status)
            .collect()
    }

    pub fn fail_updates(&self) {
        *self.fail_updates.lock().expect("fail lock") = true;
    }
}

impl TaskStore for MemoryTaskStore {
    fn get_task(&self, key: &TaskKey) -> Result<Option<Task>> {
        Ok(self
            .task(key)
            .filter(|task| task.user_id == key.user_id))
    }

    fn update_task(&self, key: &TaskKey, update: &TaskUpdate) -> Result<()> {
        if *self.fail_updates.lock().expect("fail lock") {
            return Err(anyhow!("scripted update failure"));
        }
        let mut tasks = self.tasks.lock().expect("tasks lock");
        let task = tasks
            .get_mut(&key.task_id)
            .filter(|task| task.user_id == key.user_id)
            .ok_or_else(|| anyhow!("task {key} not found"))?;
        update.apply_to(task);
        self.updates.lock().expect("updates lock").push(update.clone());
        Ok(())
    }

    fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        Ok(self.users.lock().expect("users lock").get(user_id).cloned())
    }
}
