//! EnvironmentReaper: destroy stale environments left by earlier attempts.
//!
//! The sweep covers every environment carrying the workflow prefix, not only
//! the current task's. Removal of an environment that is already gone counts
//! as success, so concurrent sweeps from independent pipelines are safe
//! without any cross-process lock.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::core::naming::{is_managed_name, task_id_from_name};
use crate::core::reap_policy::reap_reason;
use crate::core::types::short_id;
use crate::io::config::AgentboxConfig;
use crate::io::engine::{Engine, Removal};

pub struct Reaper<'a, E: Engine + ?Sized> {
    engine: &'a E,
    prefix: &'a str,
    max_age: Duration,
    created_grace: Duration,
}

impl<'a, E: Engine + ?Sized> Reaper<'a, E> {
    pub fn new(engine: &'a E, prefix: &'a str, max_age: Duration) -> Self {
        Self {
            engine,
            prefix,
            max_age,
            created_grace: Duration::ZERO,
        }
    }

    /// Reaper using the configured prefix, age threshold and creation grace.
    pub fn from_config(engine: &'a E, config: &'a AgentboxConfig) -> Self {
        Self::new(engine, &config.engine.name_prefix, config.reaper.max_age())
            .with_created_grace(config.reaper.created_grace())
    }

    /// Keep `created` environments younger than `grace`: a concurrent launcher
    /// may still be copying inputs into them.
    pub fn with_created_grace(mut self, grace: Duration) -> Self {
        self.created_grace = grace;
        self
    }

    /// Sweep once using the current time. Returns the number of environments
    /// destroyed. Never fails; problems with individual entries are logged.
    pub fn reap(&self) -> usize {
        self.reap_at(Utc::now())
    }

    #[instrument(skip_all, fields(prefix = %self.prefix))]
    pub fn reap_at(&self, now: DateTime<Utc>) -> usize {
        let ids = match self.engine.list(self.prefix) {
            Ok(ids) => ids,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "failed to list environments");
                return 0;
            }
        };

        let mut destroyed = 0;
        for id in ids {
            match self.engine.inspect(&id) {
                Ok(info) => {
                    if !is_managed_name(self.prefix, &info.name) {
                        debug!(id = short_id(&id), name = %info.name, "skipping unmanaged environment");
                        continue;
                    }
                    let reason = reap_reason(&info, now, self.max_age, self.created_grace);
                    let Some(reason) = reason else {
                        continue;
                    };
                    debug!(
                        id = short_id(&id),
                        task_id = ?task_id_from_name(self.prefix, &info.name),
                        ?reason,
                        "reaping environment"
                    );
                    if self.destroy(&id) {
                        destroyed += 1;
                    }
                }
                Err(err) => {
                    warn!(
                        id = short_id(&id),
                        err = %format!("{err:#}"),
                        "inspect failed, forcing removal"
                    );
                    if self.destroy(&id) {
                        destroyed += 1;
                    }
                }
            }
        }

        if destroyed > 0 {
            info!(destroyed, "reaped stale environments");
        }
        destroyed
    }

    fn destroy(&self, id: &str) -> bool {
        match self.engine.remove(id, true) {
            Removal::Removed => true,
            Removal::AlreadyGone => {
                debug!(id = short_id(id), "environment already removed");
                false
            }
            Removal::Failed(err) => {
                warn!(id = short_id(id), err = %format!("{err:#}"), "failed to remove environment");
                false
            }
        }
    }
}
