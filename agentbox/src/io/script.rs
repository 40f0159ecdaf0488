//! In-environment task script.
//!
//! The script is a static template. Only configuration constants are
//! interpolated (each through the `sh` quoting filter); per-task data is read
//! from files staged in [`INPUT_DIR`].

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::parser;
use crate::core::types::AgentKind;
use crate::io::config::{EngineConfig, GitConfig};

const RUN_TASK_TEMPLATE: &str = include_str!("scripts/run_task.sh.j2");

/// Directory inside the environment that receives the staged inputs.
pub const INPUT_DIR: &str = "/tmp/agentbox-input";
/// File name of the rendered script inside the input directory.
pub const SCRIPT_FILE: &str = "run_task.sh";

/// Values interpolated into the script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptParams {
    pub agent: AgentKind,
    pub input_dir: String,
    pub repo_dir: String,
    pub prompt_path: String,
    pub author_name: String,
    pub author_email: String,
}

impl ScriptParams {
    pub fn from_config(agent: AgentKind, engine: &EngineConfig, git: &GitConfig) -> Self {
        Self {
            agent,
            input_dir: INPUT_DIR.to_string(),
            repo_dir: format!("{}/repo", engine.working_dir.trim_end_matches('/')),
            prompt_path: "/tmp/prompt.txt".to_string(),
            author_name: git.author_name.clone(),
            author_email: git.author_email.clone(),
        }
    }
}

#[derive(Serialize)]
struct Markers {
    commit_hash_prefix: &'static str,
    patch_start: &'static str,
    patch_end: &'static str,
    diff_start: &'static str,
    diff_end: &'static str,
    changed_files_start: &'static str,
    changed_files_end: &'static str,
    file_changes_start: &'static str,
    file_changes_end: &'static str,
    file_prefix: &'static str,
    before_start: &'static str,
    before_end: &'static str,
    after_start: &'static str,
    after_end: &'static str,
    file_end: &'static str,
    file_not_exists: &'static str,
    file_deleted: &'static str,
}

const MARKERS: Markers = Markers {
    commit_hash_prefix: parser::COMMIT_HASH_PREFIX,
    patch_start: parser::PATCH_START,
    patch_end: parser::PATCH_END,
    diff_start: parser::DIFF_START,
    diff_end: parser::DIFF_END,
    changed_files_start: parser::CHANGED_FILES_START,
    changed_files_end: parser::CHANGED_FILES_END,
    file_changes_start: parser::FILE_CHANGES_START,
    file_changes_end: parser::FILE_CHANGES_END,
    file_prefix: parser::FILE_PREFIX,
    before_start: parser::BEFORE_START,
    before_end: parser::BEFORE_END,
    after_start: parser::AFTER_START,
    after_end: parser::AFTER_END,
    file_end: parser::FILE_END,
    file_not_exists: parser::FILE_NOT_EXISTS,
    file_deleted: parser::FILE_DELETED,
};

/// Single-quote a value for POSIX shells.
pub fn sh_quote(value: String) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Render the task script.
pub fn render_script(params: &ScriptParams) -> Result<String> {
    let mut env = Environment::new();
    env.add_filter("sh", sh_quote);
    env.add_template(SCRIPT_FILE, RUN_TASK_TEMPLATE)
        .context("load task script template")?;
    let template = env.get_template(SCRIPT_FILE)?;
    let (credentials_dir, credentials_file) = params.agent.credentials_location();
    let mut rendered = template
        .render(context! {
            input_dir => params.input_dir,
            repo_dir => params.repo_dir,
            prompt_path => params.prompt_path,
            author_name => params.author_name,
            author_email => params.author_email,
            credentials_dir => credentials_dir,
            credentials_file => credentials_file,
            agent_invocation => params.agent.invocation(),
            m => MARKERS,
        })
        .context("render task script")?;
    rendered.push('\n');
    Ok(rendered)
}

/// Entry command that runs the staged script.
pub fn entry_command(input_dir: &str) -> Vec<String> {
    vec!["bash".to_string(), format!("{input_dir}/{SCRIPT_FILE}")]
}
