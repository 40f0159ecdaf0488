//! CommandBuilder: environment variables, staged inputs and the task script.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tempfile::TempDir;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::core::error::{ConfigurationError, TaskError};
use crate::core::types::{AgentKind, Task, User};
use crate::io::config::{EngineConfig, GitConfig};
use crate::io::script::{self, ScriptParams};

/// Preferences key holding the agent settings.
pub const PREFERENCES_KEY: &str = "claudeCode";

/// Flags that keep tools inside the environment from prompting.
const NONINTERACTIVE_ENV: [(&str, &str); 6] = [
    ("CI", "true"),
    ("TERM", "dumb"),
    ("NO_COLOR", "1"),
    ("FORCE_COLOR", "0"),
    ("NONINTERACTIVE", "1"),
    ("DEBIAN_FRONTEND", "noninteractive"),
];

/// Host-side secrets. Values never appear in `Debug` output or logs.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secrets {
    pub agent_api_key: Option<String>,
    pub github_token: Option<String>,
}

impl Secrets {
    /// Read `ANTHROPIC_API_KEY` and `GITHUB_TOKEN` from the process environment.
    pub fn from_env() -> Self {
        let read = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            agent_api_key: read(AgentKind::Claude.api_key_var()),
            github_token: read("GITHUB_TOKEN"),
        }
    }
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("Secrets")
            .field("agent_api_key", &redact(&self.agent_api_key))
            .field("github_token", &redact(&self.github_token))
            .finish()
    }
}

/// Agent settings taken from a user's preferences.
#[derive(Clone, Default, PartialEq)]
pub struct AgentPreferences {
    /// Overrides merged last into the environment.
    pub env: BTreeMap<String, String>,
    /// Credential document written into the environment, when non-empty.
    pub credentials: Option<Map<String, Value>>,
}

impl fmt::Debug for AgentPreferences {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentPreferences")
            .field("env_keys", &self.env.keys().collect::<Vec<_>>())
            .field("has_credentials", &self.credentials.is_some())
            .finish()
    }
}

impl AgentPreferences {
    pub fn from_user(user: Option<&User>) -> Self {
        user.and_then(|u| u.preferences.get(PREFERENCES_KEY))
            .map(Self::from_value)
            .unwrap_or_default()
    }

    /// Accepts `{ "env": {..}, "credentials": {..} }` as well as the older
    /// flat map of environment variables.
    pub fn from_value(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            warn!("agent preferences are not an object, ignoring");
            return Self::default();
        };
        let structured = ["env", "credentials"]
            .iter()
            .any(|key| obj.get(*key).is_some_and(is_truthy));
        let env = if structured {
            obj.get("env")
                .and_then(Value::as_object)
                .map(env_from_map)
                .unwrap_or_default()
        } else {
            env_from_map(obj)
        };
        let credentials = if structured {
            obj.get("credentials")
                .and_then(Value::as_object)
                .filter(|creds| !creds.is_empty())
                .cloned()
        } else {
            None
        };
        Self { env, credentials }
    }
}

/// Truthiness as the settings UI sees it: `null`, `false`, `0` and `""` do not
/// mark a structured document.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn env_from_map(map: &Map<String, Value>) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    for (key, value) in map {
        let rendered = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => {
                warn!(key = %key, "skipping non-scalar environment override");
                continue;
            }
        };
        env.insert(key.clone(), rendered);
    }
    env
}

/// Per-task data transferred into the environment as files.
#[derive(Clone, PartialEq, Eq)]
pub struct TaskInputs {
    pub prompt: String,
    pub commit_message: String,
    pub repo_url: String,
    pub branch: String,
    pub credentials: Option<String>,
}

impl fmt::Debug for TaskInputs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskInputs")
            .field("prompt_chars", &self.prompt.chars().count())
            .field("commit_message", &self.commit_message)
            .field("branch", &self.branch)
            .field("has_credentials", &self.credentials.is_some())
            .finish_non_exhaustive()
    }
}

/// Everything the launcher needs to start one task's environment.
#[derive(Clone, PartialEq, Eq)]
pub struct EnvironmentPlan {
    pub agent: AgentKind,
    pub env: BTreeMap<String, String>,
    pub script: String,
    pub inputs: TaskInputs,
    pub command: Vec<String>,
    pub input_dir: String,
}

impl fmt::Debug for EnvironmentPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvironmentPlan")
            .field("agent", &self.agent)
            .field("env_keys", &self.env.keys().collect::<Vec<_>>())
            .field("inputs", &self.inputs)
            .field("command", &self.command)
            .finish_non_exhaustive()
    }
}

impl EnvironmentPlan {
    /// Write the inputs and the script into a fresh host directory.
    pub fn stage(&self) -> Result<TempDir> {
        let dir = tempfile::Builder::new()
            .prefix("agentbox-input-")
            .tempdir()
            .context("create input staging directory")?;
        self.stage_into(dir.path())?;
        Ok(dir)
    }

    pub fn stage_into(&self, dir: &Path) -> Result<()> {
        let write = |name: &str, contents: &str| {
            let path = dir.join(name);
            fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
        };
        write(script::SCRIPT_FILE, &self.script)?;
        write("prompt.txt", &self.inputs.prompt)?;
        write("commit_message.txt", &self.inputs.commit_message)?;
        write("repo_url", &self.inputs.repo_url)?;
        write("branch", &self.inputs.branch)?;
        if let Some(credentials) = &self.inputs.credentials {
            write("credentials.json", credentials)?;
        }
        debug!(dir = %dir.display(), "staged task inputs");
        Ok(())
    }
}

/// Assembles the environment variables, inputs and script for a task.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    engine: EngineConfig,
    git: GitConfig,
}

impl CommandBuilder {
    pub fn new(engine: &EngineConfig, git: &GitConfig) -> Self {
        Self {
            engine: engine.clone(),
            git: git.clone(),
        }
    }

    #[instrument(skip_all, fields(task_id = task.id, agent = %task.agent))]
    pub fn build(
        &self,
        task: &Task,
        secrets: &Secrets,
        preferences: &AgentPreferences,
    ) -> Result<EnvironmentPlan, TaskError> {
        let agent = AgentKind::parse(&task.agent)
            .ok_or_else(|| ConfigurationError::UnsupportedAgent(task.agent.clone()))?;
        let prompt = task.prompt().ok_or(ConfigurationError::MissingPrompt)?;

        let env = build_env(agent, secrets, preferences);
        debug!(env_keys = ?env.keys().collect::<Vec<_>>(), "environment variables assembled");

        let credentials = match &preferences.credentials {
            Some(creds) => Some(
                serde_json::to_string(creds).context("serialize agent credentials")?,
            ),
            None => None,
        };
        let inputs = TaskInputs {
            prompt: prompt.to_string(),
            commit_message: commit_message(prompt, self.git.commit_message_chars),
            repo_url: authenticated_url(
                &task.repo_url,
                secrets.github_token.as_deref(),
                &self.git.token_hosts,
            ),
            branch: task.target_branch.clone(),
            credentials,
        };

        let params = ScriptParams::from_config(agent, &self.engine, &self.git);
        let script = script::render_script(&params)?;
        Ok(EnvironmentPlan {
            agent,
            env,
            script,
            inputs,
            command: script::entry_command(&params.input_dir),
            input_dir: params.input_dir,
        })
    }
}

/// Fixed flags, then agent credentials, then user overrides (which win).
pub fn build_env(
    agent: AgentKind,
    secrets: &Secrets,
    preferences: &AgentPreferences,
) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = NONINTERACTIVE_ENV
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    match &secrets.agent_api_key {
        Some(key) => {
            env.insert(agent.api_key_var().to_string(), key.clone());
        }
        None => warn!(var = agent.api_key_var(), "agent API key not set on host"),
    }
    env.insert(agent.noninteractive_var().to_string(), "1".to_string());
    env.extend(preferences.env.clone());
    env
}

/// `Claude: ` followed by at most `max_chars` characters of the prompt.
pub fn commit_message(prompt: &str, max_chars: usize) -> String {
    let prefix: String = prompt.chars().take(max_chars).collect();
    format!("Claude: {prefix}")
}

/// Embed `token` as the URL user for https remotes on one of `hosts`.
/// Anything else is returned unchanged.
pub fn authenticated_url(repo_url: &str, token: Option<&str>, hosts: &[String]) -> String {
    let Some(token) = token else {
        return repo_url.to_string();
    };
    let Ok(mut url) = Url::parse(repo_url) else {
        return repo_url.to_string();
    };
    let host_matches = url
        .host_str()
        .is_some_and(|host| hosts.iter().any(|h| h.eq_ignore_ascii_case(host)));
    if url.scheme() != "https" || !host_matches || !url.username().is_empty() {
        return repo_url.to_string();
    }
    if url.set_username(token).is_err() {
        return repo_url.to_string();
    }
    url.to_string()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::core::types::ChatMessage;
    use crate::io::config::AgentboxConfig;
    use crate::test_support::{task, user_with_preferences};

    fn builder() -> CommandBuilder {
        let cfg = AgentboxConfig::default();
        CommandBuilder::new(&cfg.engine, &cfg.git)
    }

    fn secrets() -> Secrets {
        Secrets {
            agent_api_key: Some("sk-ant-123".to_string()),
            github_token: Some("ghp_abc".to_string()),
        }
    }

    #[test]
    fn env_layers_flags_credentials_and_overrides() {
        let prefs = AgentPreferences {
            env: BTreeMap::from([
                ("TERM".to_string(), "xterm".to_string()),
                ("ANTHROPIC_BASE_URL".to_string(), "https://proxy".to_string()),
            ]),
            credentials: None,
        };
        let env = build_env(AgentKind::Claude, &secrets(), &prefs);
        assert_eq!(env["CI"], "true");
        assert_eq!(env["DEBIAN_FRONTEND"], "noninteractive");
        assert_eq!(env["ANTHROPIC_API_KEY"], "sk-ant-123");
        assert_eq!(env["ANTHROPIC_NONINTERACTIVE"], "1");
        assert_eq!(env["TERM"], "xterm");
        assert_eq!(env["ANTHROPIC_BASE_URL"], "https://proxy");
    }

    #[test]
    fn user_override_beats_host_api_key() {
        let prefs = AgentPreferences {
            env: BTreeMap::from([("ANTHROPIC_API_KEY".to_string(), "user-key".to_string())]),
            credentials: None,
        };
        let env = build_env(AgentKind::Claude, &secrets(), &prefs);
        assert_eq!(env["ANTHROPIC_API_KEY"], "user-key");
    }

    #[test]
    fn preferences_accept_structured_and_flat_shapes() {
        let structured = AgentPreferences::from_value(&json!({
            "env": {"FOO": "bar", "RETRIES": 3},
            "credentials": {"token": "t"}
        }));
        assert_eq!(structured.env["FOO"], "bar");
        assert_eq!(structured.env["RETRIES"], "3");
        assert!(structured.credentials.is_some());

        let flat = AgentPreferences::from_value(&json!({"FOO": "bar"}));
        assert_eq!(flat.env["FOO"], "bar");
        assert!(flat.credentials.is_none());
    }

    #[test]
    fn falsy_structure_keys_keep_the_flat_shape() {
        for marker in [json!(null), json!(false), json!("")] {
            let prefs =
                AgentPreferences::from_value(&json!({ "credentials": marker, "FOO": "bar" }));
            assert_eq!(prefs.env["FOO"], "bar");
            assert!(prefs.credentials.is_none());
        }
        let prefs = AgentPreferences::from_value(&json!({"env": null, "FOO": "bar"}));
        assert_eq!(prefs.env["FOO"], "bar");
    }

    #[test]
    fn empty_or_null_credentials_are_absent() {
        for creds in [json!({}), json!(null), json!(""), json!([1])] {
            let prefs = AgentPreferences::from_value(&json!({ "credentials": creds }));
            assert!(prefs.credentials.is_none());
        }
    }

    #[test]
    fn preferences_from_user_reads_agent_key() {
        let user = user_with_preferences("alice", json!({"env": {"X": "1"}}));
        assert_eq!(AgentPreferences::from_user(Some(&user)).env["X"], "1");
        assert_eq!(AgentPreferences::from_user(None), AgentPreferences::default());
    }

    #[test]
    fn token_is_embedded_for_configured_hosts_only() {
        let hosts = vec!["github.com".to_string()];
        assert_eq!(
            authenticated_url("https://github.com/o/r.git", Some("tok"), &hosts),
            "https://tok@github.com/o/r.git"
        );
        assert_eq!(
            authenticated_url("https://gitlab.com/o/r.git", Some("tok"), &hosts),
            "https://gitlab.com/o/r.git"
        );
        assert_eq!(
            authenticated_url("git@github.com:o/r.git", Some("tok"), &hosts),
            "git@github.com:o/r.git"
        );
        assert_eq!(
            authenticated_url("https://github.com/o/r.git", None, &hosts),
            "https://github.com/o/r.git"
        );
    }

    #[test]
    fn commit_message_truncates_by_chars() {
        assert_eq!(commit_message("fix it", 100), "Claude: fix it");
        let long = "é".repeat(150);
        let msg = commit_message(&long, 100);
        assert_eq!(msg.chars().count(), "Claude: ".len() + 100);
    }

    #[test]
    fn build_rejects_unsupported_agent() {
        let mut task = task(1, "alice");
        task.agent = "codex".to_string();
        let err = builder()
            .build(&task, &secrets(), &AgentPreferences::default())
            .expect_err("unsupported");
        assert_eq!(
            err.to_string(),
            "Unsupported agent: codex. Only claude is supported."
        );
    }

    #[test]
    fn build_requires_prompt() {
        let mut task = task(1, "alice");
        task.chat_messages = vec![ChatMessage {
            role: "assistant".to_string(),
            content: "hello".to_string(),
        }];
        let err = builder()
            .build(&task, &secrets(), &AgentPreferences::default())
            .expect_err("missing prompt");
        assert!(matches!(
            err,
            TaskError::Configuration(ConfigurationError::MissingPrompt)
        ));
    }

    #[test]
    fn prompt_and_credentials_stay_out_of_the_script() {
        let mut task = task(1, "alice");
        task.chat_messages[0].content = "it's EOF\n'; rm -rf / #".to_string();
        let prefs = AgentPreferences::from_value(&json!({"credentials": {"k": "secret-cred"}}));
        let plan = builder().build(&task, &secrets(), &prefs).expect("build");

        assert!(!plan.script.contains("rm -rf"));
        assert!(!plan.script.contains("secret-cred"));
        assert!(!plan.script.contains("ghp_abc"));
        assert_eq!(plan.inputs.prompt, "it's EOF\n'; rm -rf / #");
        assert_eq!(plan.inputs.credentials.as_deref(), Some(r#"{"k":"secret-cred"}"#));
        assert_eq!(plan.command, ["bash", "/tmp/agentbox-input/run_task.sh"]);

        let temp = tempfile::tempdir().expect("tempdir");
        plan.stage_into(temp.path()).expect("stage");
        let staged = |name: &str| fs::read_to_string(temp.path().join(name)).expect(name);
        assert_eq!(staged("prompt.txt"), "it's EOF\n'; rm -rf / #");
        assert_eq!(staged("repo_url"), "https://ghp_abc@github.com/acme/widgets.git");
        assert_eq!(staged("branch"), "main");
        assert!(staged("commit_message.txt").starts_with("Claude: it's EOF"));
        assert!(temp.path().join("credentials.json").exists());
        assert!(temp.path().join("run_task.sh").exists());
    }

    #[test]
    fn secrets_debug_is_redacted() {
        let rendered = format!("{:?}", secrets());
        assert!(!rendered.contains("sk-ant-123"));
        assert!(rendered.contains("<redacted>"));
    }
}
