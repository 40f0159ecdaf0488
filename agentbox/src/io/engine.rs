//! Container engine seam.
//!
//! The pipeline only talks to environments through [`Engine`]; the Docker CLI
//! implementation lives in [`crate::io::docker`] and tests script a fake.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

use crate::core::types::{EnvironmentInfo, ResourceLimits};

/// Everything needed to create one environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSpec {
    pub name: String,
    pub image: String,
    pub working_dir: String,
    pub network: String,
    pub limits: ResourceLimits,
    /// Environment variables for the workload. Values are passed through the
    /// engine client's own environment, never on its command line.
    pub env: BTreeMap<String, String>,
    /// Labels attached to the environment.
    pub labels: BTreeMap<String, String>,
    /// Command run as the environment's entry process.
    pub command: Vec<String>,
}

/// Why a create call failed.
#[derive(Debug, thiserror::Error)]
pub enum CreateError {
    #[error("environment name {0} is already in use")]
    NameConflict(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result of waiting on an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited(i64),
    TimedOut,
}

/// Result of a remove call. Removing an environment that is already gone is
/// not a failure.
#[derive(Debug)]
pub enum Removal {
    Removed,
    AlreadyGone,
    Failed(anyhow::Error),
}

/// Host directory whose contents are copied into an environment before start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopySpec {
    pub source_dir: PathBuf,
    pub dest_dir: String,
}

pub trait Engine: Send + Sync {
    /// Ids of every environment (any state) whose name starts with `prefix`.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
    fn inspect(&self, id: &str) -> Result<EnvironmentInfo>;
    /// Create a stopped environment and return its id.
    fn create(&self, spec: &CreateSpec) -> Result<String, CreateError>;
    fn copy_into(&self, id: &str, copy: &CopySpec) -> Result<()>;
    fn start(&self, id: &str) -> Result<()>;
    /// Block until the environment exits or `timeout` elapses.
    fn wait(&self, id: &str, timeout: Duration) -> Result<WaitOutcome>;
    /// Combined console output: stdout followed by stderr.
    fn logs(&self, id: &str) -> Result<String>;
    fn remove(&self, id: &str, force: bool) -> Removal;
}
