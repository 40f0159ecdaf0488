//! Agentbox configuration stored in `agentbox.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::ResourceLimits;

/// Default config file name, resolved against the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "agentbox.toml";

/// Agentbox configuration (TOML).
///
/// Every table is optional; missing fields default to the values the worker
/// runs with in production.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentboxConfig {
    pub engine: EngineConfig,
    pub limits: ResourceLimits,
    pub launch: LaunchConfig,
    pub supervise: SuperviseConfig,
    pub reaper: ReaperConfig,
    pub git: GitConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Container CLI to invoke (`docker` or a compatible binary).
    pub binary: String,
    /// Image every task environment is created from.
    pub image: String,
    /// Name prefix shared by every task environment; the reaper filters on it.
    pub name_prefix: String,
    pub working_dir: String,
    pub network: String,
    /// Upper bound for every engine call other than waiting and log retrieval.
    pub command_timeout_secs: u64,
    pub logs_timeout_secs: u64,
    /// Console output kept in memory per environment.
    pub output_limit_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            image: "claude-code-automation:latest".to_string(),
            name_prefix: "agentbox-task-".to_string(),
            working_dir: "/workspace".to_string(),
            network: "bridge".to_string(),
            command_timeout_secs: 120,
            logs_timeout_secs: 120,
            output_limit_bytes: 16_000_000,
        }
    }
}

impl EngineConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn logs_timeout(&self) -> Duration {
        Duration::from_secs(self.logs_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LaunchConfig {
    /// Total creation attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failed attempt; doubles per attempt.
    pub backoff_base_ms: u64,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 1000,
        }
    }
}

impl LaunchConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SuperviseConfig {
    /// Hard ceiling on how long an environment may run.
    pub timeout_secs: u64,
}

impl Default for SuperviseConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30 * 60,
        }
    }
}

impl SuperviseConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReaperConfig {
    /// Environments older than this are destroyed regardless of status.
    pub max_age_secs: u64,
    /// Environments still `created` within this window belong to a launch in
    /// progress and are left alone.
    pub created_grace_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            max_age_secs: 2 * 60 * 60,
            created_grace_secs: 5 * 60,
        }
    }
}

impl ReaperConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn created_grace(&self) -> Duration {
        Duration::from_secs(self.created_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitConfig {
    pub author_name: String,
    pub author_email: String,
    /// Hosts whose https clone URLs get the access token embedded.
    pub token_hosts: Vec<String>,
    /// Prompt characters kept in the commit message.
    pub commit_message_chars: usize,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            author_name: "Claude Code Automation".to_string(),
            author_email: "claude-code@automation.com".to_string(),
            token_hosts: vec!["github.com".to_string()],
            commit_message_chars: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory of the JSON task store.
    pub dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".agentbox/store"),
        }
    }
}

impl AgentboxConfig {
    pub fn validate(&self) -> Result<()> {
        if self.engine.binary.trim().is_empty() {
            return Err(anyhow!("engine.binary must be non-empty"));
        }
        if self.engine.image.trim().is_empty() {
            return Err(anyhow!("engine.image must be non-empty"));
        }
        if self.engine.name_prefix.trim().is_empty() {
            return Err(anyhow!("engine.name_prefix must be non-empty"));
        }
        if self.engine.command_timeout_secs == 0 || self.engine.logs_timeout_secs == 0 {
            return Err(anyhow!("engine timeouts must be > 0"));
        }
        if self.engine.output_limit_bytes == 0 {
            return Err(anyhow!("engine.output_limit_bytes must be > 0"));
        }
        if self.limits.nofile_soft > self.limits.nofile_hard {
            return Err(anyhow!("limits.nofile_soft must not exceed limits.nofile_hard"));
        }
        if self.launch.max_attempts == 0 {
            return Err(anyhow!("launch.max_attempts must be > 0"));
        }
        if self.supervise.timeout_secs == 0 {
            return Err(anyhow!("supervise.timeout_secs must be > 0"));
        }
        if self.reaper.max_age_secs == 0 {
            return Err(anyhow!("reaper.max_age_secs must be > 0"));
        }
        if self.reaper.created_grace_secs >= self.reaper.max_age_secs {
            return Err(anyhow!(
                "reaper.created_grace_secs must be less than reaper.max_age_secs"
            ));
        }
        if self.git.commit_message_chars == 0 {
            return Err(anyhow!("git.commit_message_chars must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AgentboxConfig::default()`.
pub fn load_config(path: &Path) -> Result<AgentboxConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config file missing, using defaults");
        let cfg = AgentboxConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AgentboxConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, AgentboxConfig::default());
        assert_eq!(cfg.supervise.timeout(), Duration::from_secs(1800));
        assert_eq!(cfg.reaper.max_age(), Duration::from_secs(7200));
        assert_eq!(cfg.reaper.created_grace(), Duration::from_secs(300));
        assert_eq!(cfg.launch.max_attempts, 5);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("agentbox.toml");
        fs::write(
            &path,
            "[engine]\nimage = \"custom:1\"\n\n[limits]\nmemory = \"4g\"\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.engine.image, "custom:1");
        assert_eq!(cfg.engine.name_prefix, "agentbox-task-");
        assert_eq!(cfg.limits.memory, "4g");
        assert_eq!(cfg.limits.cpu_shares, 1024);
    }

    #[test]
    fn rejects_inverted_nofile_limits() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("agentbox.toml");
        fs::write(&path, "[limits]\nnofile_soft = 4096\nnofile_hard = 1024\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("nofile_soft"));
    }

    #[test]
    fn rejects_grace_longer_than_max_age() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("agentbox.toml");
        fs::write(&path, "[reaper]\nmax_age_secs = 60\ncreated_grace_secs = 60\n")
            .expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("created_grace_secs"));
    }

    #[test]
    fn rejects_zero_attempts() {
        let cfg = AgentboxConfig {
            launch: LaunchConfig {
                max_attempts: 0,
                ..LaunchConfig::default()
            },
            ..AgentboxConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
