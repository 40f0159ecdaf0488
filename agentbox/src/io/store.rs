//! Task store seam and the JSON-file implementation.
//!
//! Layout under the store directory:
//!
//! ```text
//! tasks/<task_id>.json   one task document, schema-validated on every load
//! users/<user_id>.json   one user document (preferences only)
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::{Draft, Validator};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::types::{Task, TaskKey, TaskUpdate, User};

const TASK_SCHEMA: &str = include_str!("../../schemas/task.schema.json");

/// Owner-scoped access to task and user records.
pub trait TaskStore: Send + Sync {
    /// Fetch a task. Returns `None` when it does not exist or belongs to a
    /// different user.
    fn get_task(&self, key: &TaskKey) -> Result<Option<Task>>;
    /// Apply a partial update to an existing task.
    fn update_task(&self, key: &TaskKey, update: &TaskUpdate) -> Result<()>;
    fn get_user(&self, user_id: &str) -> Result<Option<User>>;
}

/// Directory of JSON documents, one per task and per user.
pub struct FileTaskStore {
    root: PathBuf,
    validator: Validator,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for FileTaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileTaskStore")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl FileTaskStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let schema: Value = serde_json::from_str(TASK_SCHEMA).context("parse task schema")?;
        let validator = jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(&schema)
            .context("compile task schema")?;
        Ok(Self {
            root: root.into(),
            validator,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn task_path(&self, task_id: u64) -> PathBuf {
        self.root.join("tasks").join(format!("{task_id}.json"))
    }

    fn user_path(&self, user_id: &str) -> Result<PathBuf> {
        if user_id.is_empty()
            || user_id.starts_with('.')
            || user_id.contains(['/', '\\'])
        {
            bail!("invalid user id {user_id:?}");
        }
        Ok(self.root.join("users").join(format!("{user_id}.json")))
    }

    /// Insert or replace a task document.
    pub fn put_task(&self, task: &Task) -> Result<()> {
        let _guard = self.lock()?;
        self.write_task(task)
    }

    /// Insert or replace a user document.
    pub fn put_user(&self, user: &User) -> Result<()> {
        let path = self.user_path(&user.id)?;
        let _guard = self.lock()?;
        write_json(&path, &serde_json::to_value(user)?)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| anyhow!("task store lock poisoned"))
    }

    fn load_task(&self, task_id: u64) -> Result<Option<Task>> {
        let path = self.task_path(task_id);
        if !path.exists() {
            return Ok(None);
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read task {}", path.display()))?;
        let value: Value = serde_json::from_str(&contents)
            .with_context(|| format!("parse task {}", path.display()))?;
        self.validate(&value)
            .with_context(|| format!("validate task {}", path.display()))?;
        let task: Task = serde_json::from_value(value)
            .with_context(|| format!("deserialize task {}", path.display()))?;
        Ok(Some(task))
    }

    fn write_task(&self, task: &Task) -> Result<()> {
        let value = serde_json::to_value(task)?;
        self.validate(&value)
            .with_context(|| format!("validate task {}", task.id))?;
        write_json(&self.task_path(task.id), &value)
    }

    fn validate(&self, value: &Value) -> Result<()> {
        let messages: Vec<String> = self
            .validator
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect();
        if !messages.is_empty() {
            bail!("schema validation failed:\n- {}", messages.join("\n- "));
        }
        Ok(())
    }
}

impl TaskStore for FileTaskStore {
    fn get_task(&self, key: &TaskKey) -> Result<Option<Task>> {
        let Some(task) = self.load_task(key.task_id)? else {
            debug!(task = %key, "task not found");
            return Ok(None);
        };
        if task.user_id != key.user_id {
            warn!(task = %key, "task belongs to a different user");
            return Ok(None);
        }
        Ok(Some(task))
    }

    #[instrument(skip_all, fields(task = %key))]
    fn update_task(&self, key: &TaskKey, update: &TaskUpdate) -> Result<()> {
        let _guard = self.lock()?;
        let mut task = self
            .load_task(key.task_id)?
            .filter(|task| task.user_id == key.user_id)
            .ok_or_else(|| anyhow!("task {key} not found"))?;
        update.apply_to(&mut task);
        self.write_task(&task)?;
        debug!(status = %task.status, "task updated");
        Ok(())
    }

    fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        let path = self.user_path(user_id)?;
        if !path.exists() {
            return Ok(None);
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read user {}", path.display()))?;
        let user: User = serde_json::from_str(&contents)
            .with_context(|| format!("parse user {}", path.display()))?;
        Ok(Some(user))
    }
}

/// Pretty-print `value` and atomically replace `path` (temp file + rename).
fn write_json(path: &Path, value: &Value) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("store path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write temp {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
