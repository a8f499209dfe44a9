//! Retrying transient task errors with exponential backoff.

use std::thread;
use std::time::Instant;

use tracing::warn;

use crate::core::TaskKey;
use crate::error::TaskError;
use crate::options::RunOptions;

/// Runs `operation` until it returns anything but a transient error.
///
/// The delay starts at `initial_backoff` and doubles up to `max_backoff`. A
/// retry that would end past `max_task_duration` is not attempted; the task
/// fails with [`TaskError::RetriesExhausted`] instead.
pub(super) fn with_retry<T, F>(
    key: &TaskKey,
    options: &RunOptions,
    mut operation: F,
) -> Result<T, TaskError>
where
    F: FnMut() -> Result<T, TaskError>,
{
    let started = Instant::now();
    let mut delay = options.initial_backoff;
    let mut attempts = 0;

    loop {
        attempts += 1;
        match operation() {
            Err(err) if err.is_transient() => {
                if started.elapsed().saturating_add(delay) > options.max_task_duration {
                    return Err(TaskError::RetriesExhausted {
                        attempts,
                        last: Box::new(err),
                    });
                }

                warn!(task = %key, attempt = attempts, "{err}, retrying in {delay:?}");
                thread::sleep(delay);
                delay = delay.saturating_mul(2).min(options.max_backoff);
            }
            result => return result,
        }
    }
}
