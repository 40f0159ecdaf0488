//! Decision rule for destroying stale environments.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::core::types::{EnvironmentInfo, EnvironmentStatus};

/// Why an environment is due for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapReason {
    /// Not running: exited, dead, or created but never started.
    Inactive,
    /// Stuck in a restart loop.
    Restarting,
    /// Alive longer than the age threshold.
    Expired,
}

/// Age of an environment at `now`; clock skew into the future counts as zero.
pub fn age(created_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - created_at).to_std().unwrap_or(Duration::ZERO)
}

/// Return the reason `info` should be destroyed, or `None` to keep it.
///
/// Status is checked first so the reported reason reflects the most specific
/// cause; any environment older than `max_age` is destroyed regardless.
/// A `created` environment no older than `created_grace` is still being
/// populated by its launcher and is kept.
pub fn reap_reason(
    info: &EnvironmentInfo,
    now: DateTime<Utc>,
    max_age: Duration,
    created_grace: Duration,
) -> Option<ReapReason> {
    let age = age(info.created_at, now);
    match info.status {
        EnvironmentStatus::Created if age <= created_grace => return None,
        EnvironmentStatus::Exited | EnvironmentStatus::Dead | EnvironmentStatus::Created => {
            return Some(ReapReason::Inactive);
        }
        EnvironmentStatus::Restarting => return Some(ReapReason::Restarting),
        _ => {}
    }
    if age > max_age {
        return Some(ReapReason::Expired);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const TWO_HOURS: Duration = Duration::from_secs(2 * 60 * 60);
    const NO_GRACE: Duration = Duration::ZERO;
    const GRACE: Duration = Duration::from_secs(300);

    fn info(status: EnvironmentStatus, age_secs: i64, now: DateTime<Utc>) -> EnvironmentInfo {
        EnvironmentInfo {
            id: "abc".to_string(),
            name: "agentbox-task-1-0-00000000".to_string(),
            created_at: now - chrono::Duration::seconds(age_secs),
            status,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).single().expect("valid time")
    }

    #[test]
    fn young_running_environment_is_kept() {
        let now = now();
        assert_eq!(
            reap_reason(&info(EnvironmentStatus::Running, 60, now), now, TWO_HOURS, NO_GRACE),
            None
        );
    }

    #[test]
    fn old_environment_is_reaped_regardless_of_status() {
        let now = now();
        for status in [
            EnvironmentStatus::Running,
            EnvironmentStatus::Paused,
            EnvironmentStatus::Unknown,
        ] {
            let reason = reap_reason(&info(status, 2 * 3600 + 1, now), now, TWO_HOURS, NO_GRACE);
            assert_eq!(reason, Some(ReapReason::Expired));
        }
    }

    #[test]
    fn exactly_threshold_age_is_kept() {
        let now = now();
        assert_eq!(
            reap_reason(&info(EnvironmentStatus::Running, 2 * 3600, now), now, TWO_HOURS, NO_GRACE),
            None
        );
    }

    #[test]
    fn inactive_and_restarting_are_reaped_when_young() {
        let now = now();
        for status in [
            EnvironmentStatus::Exited,
            EnvironmentStatus::Dead,
            EnvironmentStatus::Created,
        ] {
            assert_eq!(
                reap_reason(&info(status, 5, now), now, TWO_HOURS, NO_GRACE),
                Some(ReapReason::Inactive)
            );
        }
        assert_eq!(
            reap_reason(&info(EnvironmentStatus::Restarting, 5, now), now, TWO_HOURS, NO_GRACE),
            Some(ReapReason::Restarting)
        );
    }

    #[test]
    fn created_environment_within_grace_is_kept() {
        let now = now();
        assert_eq!(
            reap_reason(&info(EnvironmentStatus::Created, 30, now), now, TWO_HOURS, GRACE),
            None
        );
        assert_eq!(
            reap_reason(&info(EnvironmentStatus::Created, 301, now), now, TWO_HOURS, GRACE),
            Some(ReapReason::Inactive)
        );
        assert_eq!(
            reap_reason(&info(EnvironmentStatus::Exited, 30, now), now, TWO_HOURS, GRACE),
            Some(ReapReason::Inactive)
        );
    }

    #[test]
    fn future_creation_time_counts_as_zero_age() {
        let now = now();
        assert_eq!(
            age(now + chrono::Duration::seconds(30), now),
            Duration::ZERO
        );
    }
}
