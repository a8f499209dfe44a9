use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings for one [`Engine::run_tasks`](crate::Engine::run_tasks) call.
///
/// Deserializes from partial documents; missing fields keep their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Number of tasks run at the same time.
    pub max_workers: usize,
    /// How long a task may keep retrying transient errors.
    pub max_task_duration: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Re-run tasks holding soft references once everything else is done.
    pub patch_soft_references: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_workers: 10,
            // There is no safe generic fallback for a half-created resource,
            // so keep retrying for a very long time.
            max_task_duration: Duration::from_secs(365 * 24 * 60 * 60),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            patch_soft_references: true,
        }
    }
}

impl RunOptions {
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_max_task_duration(mut self, max_task_duration: Duration) -> Self {
        self.max_task_duration = max_task_duration;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    pub fn with_patch_soft_references(mut self, patch: bool) -> Self {
        self.patch_soft_references = patch;
        self
    }
}
