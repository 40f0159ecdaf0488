//! Environment naming convention.
//!
//! Every environment launched for a task is named
//! `<prefix><task-id>-<unix-seconds>-<8 hex chars>`. The shared prefix is what
//! the reaper filters on; the timestamp and random suffix keep names unique
//! across retries and concurrent attempts.

use crate::core::types::TaskId;

/// Build an environment name from its parts.
pub fn environment_name(prefix: &str, task_id: TaskId, unix_secs: i64, suffix: u32) -> String {
    format!("{prefix}{task_id}-{unix_secs}-{suffix:08x}")
}

/// True if `name` follows the convention for `prefix`.
///
/// Engines report names with a leading `/`; it is ignored here.
pub fn is_managed_name(prefix: &str, name: &str) -> bool {
    let name = name.strip_prefix('/').unwrap_or(name);
    !prefix.is_empty() && name.starts_with(prefix)
}

/// Extract the task id embedded in a managed name.
pub fn task_id_from_name(prefix: &str, name: &str) -> Option<TaskId> {
    let name = name.strip_prefix('/').unwrap_or(name);
    let rest = name.strip_prefix(prefix)?;
    let (id, _) = rest.split_once('-')?;
    id.parse().ok()
}
