//! Task status state machine.
//!
//! ```text
//! queued ──> running ──> completed
//!               └──────> failed
//! ```
//!
//! `failed` is also reachable directly from `queued` so that a task rejected
//! before it starts running is never left queued. Terminal states are final.

use crate::core::types::TaskStatus;

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Whether the pipeline may move a task from `self` to `next`.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Queued, TaskStatus::Running)
                | (TaskStatus::Queued, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
        )
    }
}

/// Validate a transition, returning a description of the violation.
pub fn check_transition(from: TaskStatus, to: TaskStatus) -> Result<(), String> {
    if from.can_transition_to(to) {
        return Ok(());
    }
    Err(format!("invalid task status transition {from} -> {to}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions_are_allowed() {
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Failed));
    }

    #[test]
    fn terminal_states_are_final() {
        for terminal in [TaskStatus::Completed, TaskStatus::Failed] {
            assert!(terminal.is_terminal());
            for next in [
                TaskStatus::Queued,
                TaskStatus::Running,
                TaskStatus::Completed,
                TaskStatus::Failed,
            ] {
                assert!(check_transition(terminal, next).is_err());
            }
        }
    }

    #[test]
    fn cannot_complete_without_running() {
        let err = check_transition(TaskStatus::Queued, TaskStatus::Completed).unwrap_err();
        assert_eq!(err, "invalid task status transition queued -> completed");
    }
}
