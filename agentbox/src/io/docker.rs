//! Docker CLI adapter implementing [`Engine`].
//!
//! Every call shells out to the configured binary and is bounded by a timeout,
//! so a wedged daemon cannot stall the pipeline indefinitely.

use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::core::types::{EnvironmentInfo, EnvironmentStatus, short_id};
use crate::io::config::EngineConfig;
use crate::io::engine::{CopySpec, CreateError, CreateSpec, Engine, Removal, WaitOutcome};
use crate::io::process::{CommandOutput, run_command_with_timeout};

static NAME_CONFLICT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)conflict.*(already in use|already exists)").expect("valid regex")
});

static ALREADY_GONE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(no such container|removal of container .* is already in progress)")
        .expect("valid regex")
});

/// Engine backed by the `docker` command-line client.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    binary: String,
    command_timeout: Duration,
    logs_timeout: Duration,
    output_limit_bytes: usize,
}

impl DockerEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            command_timeout: config.command_timeout(),
            logs_timeout: config.logs_timeout(),
            output_limit_bytes: config.output_limit_bytes,
        }
    }

    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        cmd
    }

    fn run(&self, cmd: Command, timeout: Duration) -> Result<CommandOutput> {
        let args = describe_args(&cmd);
        let out = run_command_with_timeout(cmd, timeout, self.output_limit_bytes)
            .with_context(|| format!("{} {args}", self.binary))?;
        if out.timed_out {
            return Err(anyhow!(
                "{} {args} timed out after {}s",
                self.binary,
                timeout.as_secs()
            ));
        }
        Ok(out)
    }

    fn run_checked(&self, cmd: Command, timeout: Duration) -> Result<String> {
        let args = describe_args(&cmd);
        let out = self.run(cmd, timeout)?;
        if !out.success() {
            return Err(command_failure(&self.binary, &args, &out));
        }
        Ok(out.stdout_text())
    }
}

fn describe_args(cmd: &Command) -> String {
    cmd.get_args()
        .take(2)
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn command_failure(binary: &str, args: &str, out: &CommandOutput) -> anyhow::Error {
    let stderr = out.stderr_text();
    anyhow!(
        "{binary} {args} failed (exit={:?}): {}",
        out.status.code(),
        stderr.trim()
    )
}

/// Arguments for `docker create`. Env values are deliberately absent: only
/// `-e KEY` is passed and the value is read from the client's environment.
pub fn create_args(spec: &CreateSpec) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--workdir".to_string(),
        spec.working_dir.clone(),
        "--network".to_string(),
        spec.network.clone(),
        "--memory".to_string(),
        spec.limits.memory.clone(),
        "--cpu-shares".to_string(),
        spec.limits.cpu_shares.to_string(),
        "--ulimit".to_string(),
        format!(
            "nofile={}:{}",
            spec.limits.nofile_soft, spec.limits.nofile_hard
        ),
    ];
    for (key, value) in &spec.labels {
        args.push("--label".to_string());
        args.push(format!("{key}={value}"));
    }
    for key in spec.env.keys() {
        args.push("-e".to_string());
        args.push(key.clone());
    }
    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectRecord {
    id: String,
    name: String,
    created: String,
    state: InspectState,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    status: String,
}

/// Decode `docker inspect` output for a single environment.
pub fn parse_inspect(raw: &str) -> Result<EnvironmentInfo> {
    let records: Vec<InspectRecord> =
        serde_json::from_str(raw).context("parse docker inspect output")?;
    let record = records
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("docker inspect returned no records"))?;
    let created_at = DateTime::parse_from_rfc3339(&record.created)
        .with_context(|| format!("parse creation time {:?}", record.created))?
        .with_timezone(&Utc);
    Ok(EnvironmentInfo {
        id: record.id,
        name: record.name.trim_start_matches('/').to_string(),
        created_at,
        status: EnvironmentStatus::parse(&record.state.status),
    })
}

impl Engine for DockerEngine {
    #[instrument(skip_all, fields(prefix))]
    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let filter = format!("name={prefix}");
        let cmd = self.command(["ps", "-a", "--filter", &filter, "--format", "{{.ID}}"]);
        let stdout = self.run_checked(cmd, self.command_timeout)?;
        let ids: Vec<String> = stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        debug!(count = ids.len(), "listed environments");
        Ok(ids)
    }

    fn inspect(&self, id: &str) -> Result<EnvironmentInfo> {
        let cmd = self.command(["inspect", "--type", "container", id]);
        let stdout = self.run_checked(cmd, self.command_timeout)?;
        parse_inspect(&stdout)
    }

    #[instrument(skip_all, fields(name = %spec.name))]
    fn create(&self, spec: &CreateSpec) -> Result<String, CreateError> {
        let mut cmd = self.command(create_args(spec));
        cmd.envs(&spec.env);
        debug!(env_keys = ?spec.env.keys().collect::<Vec<_>>(), "creating environment");
        let out = self.run(cmd, self.command_timeout)?;
        if !out.status.success() {
            let stderr = out.stderr_text();
            if NAME_CONFLICT.is_match(&stderr) {
                warn!(name = %spec.name, "environment name conflict");
                return Err(CreateError::NameConflict(spec.name.clone()));
            }
            return Err(command_failure(&self.binary, "create", &out).into());
        }
        let id = out.stdout_text().trim().to_string();
        if id.is_empty() {
            return Err(anyhow!("{} create returned no id", self.binary).into());
        }
        debug!(id = short_id(&id), "environment created");
        Ok(id)
    }

    fn copy_into(&self, id: &str, copy: &CopySpec) -> Result<()> {
        // Trailing "/." copies the directory contents, creating the destination.
        let source = format!("{}/.", copy.source_dir.display());
        let dest = format!("{id}:{}", copy.dest_dir);
        let cmd = self.command(["cp".to_string(), source, dest]);
        self.run_checked(cmd, self.command_timeout)?;
        Ok(())
    }

    fn start(&self, id: &str) -> Result<()> {
        let cmd = self.command(["start", id]);
        self.run_checked(cmd, self.command_timeout)?;
        Ok(())
    }

    #[instrument(skip_all, fields(id = short_id(id), timeout_secs = timeout.as_secs()))]
    fn wait(&self, id: &str, timeout: Duration) -> Result<WaitOutcome> {
        let cmd = self.command(["wait", id]);
        let out = run_command_with_timeout(cmd, timeout, self.output_limit_bytes)
            .with_context(|| format!("{} wait", self.binary))?;
        if out.timed_out {
            return Ok(WaitOutcome::TimedOut);
        }
        if !out.status.success() {
            return Err(command_failure(&self.binary, "wait", &out));
        }
        let raw = out.stdout_text();
        let code = raw
            .trim()
            .parse::<i64>()
            .with_context(|| format!("parse exit code {:?}", raw.trim()))?;
        Ok(WaitOutcome::Exited(code))
    }

    fn logs(&self, id: &str) -> Result<String> {
        let cmd = self.command(["logs", id]);
        let out = self.run(cmd, self.logs_timeout)?;
        if !out.status.success() {
            return Err(command_failure(&self.binary, "logs", &out));
        }
        Ok(out.combined_text("logs"))
    }

    fn remove(&self, id: &str, force: bool) -> Removal {
        let mut args = vec!["rm"];
        if force {
            args.push("-f");
        }
        args.push(id);
        let out = match self.run(self.command(args), self.command_timeout) {
            Ok(out) => out,
            Err(err) => return Removal::Failed(err),
        };
        if out.status.success() {
            return Removal::Removed;
        }
        if ALREADY_GONE.is_match(&out.stderr_text()) {
            debug!(id = short_id(id), "environment already gone");
            return Removal::AlreadyGone;
        }
        Removal::Failed(command_failure(&self.binary, "rm", &out))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::core::types::ResourceLimits;

    fn spec() -> CreateSpec {
        CreateSpec {
            name: "agentbox-task-7-1700000000-0000abcd".to_string(),
            image: "img:latest".to_string(),
            working_dir: "/workspace".to_string(),
            network: "bridge".to_string(),
            limits: ResourceLimits::default(),
            env: BTreeMap::from([
                ("ANTHROPIC_API_KEY".to_string(), "sk-secret".to_string()),
                ("CI".to_string(), "true".to_string()),
            ]),
            labels: BTreeMap::from([("agentbox.task-id".to_string(), "7".to_string())]),
            command: vec!["bash".to_string(), "-c".to_string(), "echo hi".to_string()],
        }
    }

    #[test]
    fn create_args_carry_limits_and_env_keys_only() {
        let args = create_args(&spec());
        let joined = args.join(" ");
        assert!(joined.starts_with("create --name agentbox-task-7-1700000000-0000abcd"));
        assert!(joined.contains("--memory 2g"));
        assert!(joined.contains("--cpu-shares 1024"));
        assert!(joined.contains("--ulimit nofile=1024:2048"));
        assert!(joined.contains("--label agentbox.task-id=7"));
        assert!(joined.contains("-e ANTHROPIC_API_KEY -e CI"));
        assert!(!joined.contains("sk-secret"));
        assert!(!args.iter().any(|a| a == "-i" || a == "-t" || a == "-it"));
        assert_eq!(&args[args.len() - 4..], ["img:latest", "bash", "-c", "echo hi"]);
    }

    #[test]
    fn parse_inspect_strips_leading_slash() {
        let raw = r#"[{"Id":"abc123","Name":"/agentbox-task-1-1-00000001",
            "Created":"2024-05-01T10:00:00.123456789Z","State":{"Status":"exited"}}]"#;
        let info = parse_inspect(raw).expect("parse");
        assert_eq!(info.id, "abc123");
        assert_eq!(info.name, "agentbox-task-1-1-00000001");
        assert_eq!(info.status, EnvironmentStatus::Exited);
        assert_eq!(info.created_at.to_rfc3339(), "2024-05-01T10:00:00.123456789+00:00");
    }

    #[test]
    fn parse_inspect_rejects_empty_array() {
        assert!(parse_inspect("[]").is_err());
    }

    #[test]
    fn conflict_and_gone_patterns() {
        assert!(NAME_CONFLICT.is_match(
            "Error response from daemon: Conflict. The container name \"/x\" is already in use by container \"abc\"."
        ));
        assert!(!NAME_CONFLICT.is_match("Error: image not found"));
        assert!(ALREADY_GONE.is_match("Error response from daemon: No such container: abc"));
    }
}
