use std::fmt;

use thiserror::Error;

use crate::core::TaskKey;

/// Errors detected while assembling the task graph. These always abort the
/// run before anything is mutated.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("task '{0}' was registered more than once")]
    DuplicateTask(TaskKey),

    #[error("task '{from}' references '{to}', which is not part of this run")]
    UnresolvedReference { from: TaskKey, to: TaskKey },

    #[error("dependency cycle between tasks: {}", Members(.members))]
    Cycle { members: Vec<TaskKey> },
}

/// Error raised by one task, classified by how the runner treats it.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Throttling, eventual consistency lag, dropped connections. Retried
    /// with backoff until the task's duration budget runs out.
    #[error("transient: {0:#}")]
    Transient(anyhow::Error),

    /// Fails this task and its dependants; siblings keep running.
    #[error("{0:#}")]
    Terminal(anyhow::Error),

    /// Fails this task and stops the runner from dispatching new work.
    #[error("fatal: {0:#}")]
    Fatal(anyhow::Error),

    /// The credentials in use may not read or change the resource.
    #[error("access denied: {0:#}")]
    AccessDenied(anyhow::Error),

    #[error("resource '{0}' is required to exist but was not found")]
    RequiredResourceMissing(TaskKey),

    #[error("not run because dependency '{0}' failed")]
    DependencyFailed(TaskKey),

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<TaskError> },

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("not started, the run stopped after a fatal error")]
    Aborted,
}

impl TaskError {
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        Self::Transient(err.into())
    }

    pub fn terminal(err: impl Into<anyhow::Error>) -> Self {
        Self::Terminal(err.into())
    }

    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        Self::Fatal(err.into())
    }

    pub fn access_denied(err: impl Into<anyhow::Error>) -> Self {
        Self::AccessDenied(err.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Fatal errors stop the whole run from making further progress.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_) | Self::RequiredResourceMissing(_))
    }

    pub fn is_access_denied(&self) -> bool {
        matches!(self, Self::AccessDenied(_))
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        Self::Terminal(err)
    }
}

/// One failed task and the last error it produced.
#[derive(Debug)]
pub struct TaskFailure {
    pub key: TaskKey,
    pub error: TaskError,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.key, self.error)
    }
}

/// The run-level error. A run never reports partial success.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("{} task(s) failed:\n{}", .0.len(), Failures(.0))]
    TasksFailed(Vec<TaskFailure>),

    #[error("no task can make progress; still pending: {}", Members(.remaining))]
    Stalled { remaining: Vec<TaskKey> },

    #[error("failed to start the worker pool")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Target(#[from] TargetError),
}

impl RunError {
    /// Every failed task, empty for the non task-level variants.
    pub fn failures(&self) -> &[TaskFailure] {
        match self {
            Self::TasksFailed(failures) => failures,
            _ => &[],
        }
    }
}

#[derive(Debug, Error)]
pub enum DeletionError {
    #[error("listing existing '{kind}' resources:\n{source}")]
    Inventory {
        kind: &'static str,
        #[source]
        source: TaskError,
    },

    #[error("existing resource '{0}' was reported twice")]
    DuplicateResource(TaskKey),
}

#[derive(Debug, Error)]
pub enum TargetError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("output variable '{0}' was defined twice")]
    DuplicateOutput(String),

    #[error("'{0}' is referenced but not generated, and declares no id")]
    NotGenerated(TaskKey),
}

/// Anything that can stop [`apply`](crate::apply) short of a report.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Deletion(#[from] DeletionError),

    #[error(transparent)]
    Run(#[from] RunError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown lifecycle '{0}'")]
    UnknownLifecycle(String),

    #[error("unknown target '{0}'")]
    UnknownTarget(String),

    #[error("unknown phase '{0}'")]
    UnknownPhase(String),

    #[error("expected 'kind=Lifecycle', got '{0}'")]
    MalformedOverride(String),
}

struct Members<'a>(&'a [TaskKey]);

impl fmt::Display for Members<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, key) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" -> ")?;
            }
            write!(f, "{key}")?;
        }
        Ok(())
    }
}

struct Failures<'a>(&'a [TaskFailure]);

impl fmt::Display for Failures<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for failure in self.0 {
            writeln!(f, "  {failure}")?;
        }
        Ok(())
    }
}
