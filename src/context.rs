use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::core::{Dynamic, TaskKey};
use crate::engine::TaskRef;
use crate::error::TaskError;

/// Which reconciliation pass a task runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pass {
    Main,
    /// Re-run of tasks holding soft references, after every task is done.
    Patch,
}

/// Realized task states, filled in as tasks complete.
///
/// Writers are workers finishing a task, readers are workers resolving
/// references; a task's entry is written before any of its dependants is
/// dispatched.
#[derive(Default)]
pub(crate) struct Outputs {
    inner: RwLock<HashMap<TaskKey, Dynamic>>,
}

impl Outputs {
    pub(crate) fn insert(&self, key: TaskKey, state: Dynamic) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, state);
    }

    pub(crate) fn get(&self, key: &TaskKey) -> Option<Dynamic> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

/// Everything a task can reach while it runs.
///
/// Created per task attempt. The cloud handle `C` is shared by all workers,
/// so whatever it wraps has to be safe to use concurrently.
pub struct Context<'a, C> {
    /// Cloud API handle supplied by the caller.
    pub cloud: &'a C,
    key: &'a TaskKey,
    target: &'static str,
    check_existing: bool,
    pass: Pass,
    outputs: &'a Outputs,
}

impl<'a, C> Context<'a, C> {
    pub(crate) fn new(
        cloud: &'a C,
        key: &'a TaskKey,
        target: &'static str,
        check_existing: bool,
        pass: Pass,
        outputs: &'a Outputs,
    ) -> Self {
        Self {
            cloud,
            key,
            target,
            check_existing,
            pass,
            outputs,
        }
    }

    /// Key of the task being run.
    pub fn key(&self) -> &TaskKey {
        self.key
    }

    /// Name of the target the run renders to, e.g. `direct`.
    pub fn target(&self) -> &'static str {
        self.target
    }

    /// Whether the target looks existing resources up at all.
    pub fn check_existing(&self) -> bool {
        self.check_existing
    }

    /// True while soft references are being patched.
    pub fn is_patch_pass(&self) -> bool {
        self.pass == Pass::Patch
    }

    /// Realized state of a hard dependency.
    ///
    /// Hard dependencies always finish first, so a miss here means the task
    /// tried to resolve something it never declared.
    pub fn resolve<T>(&self, reference: &TaskRef<T>) -> Result<Arc<T>, TaskError>
    where
        T: Send + Sync + 'static,
    {
        self.try_resolve(reference).ok_or_else(|| {
            TaskError::fatal(anyhow::anyhow!(
                "'{}' resolved '{}' before it completed",
                self.key,
                reference.key()
            ))
        })
    }

    /// Realized state of a task if it has completed, the way soft
    /// references are read.
    pub fn try_resolve<T>(&self, reference: &TaskRef<T>) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.outputs
            .get(reference.key())
            .and_then(|state| state.downcast::<T>().ok())
    }

    /// Realized states of every task in `references`, or `None` while any of
    /// them is still pending.
    ///
    /// A field derived from soft references should stay `None` until this
    /// returns `Some`, so the main pass treats it as "don't care" and leaves
    /// the existing value alone until the patch pass fills it in.
    pub fn try_resolve_all<T>(&self, references: &[TaskRef<T>]) -> Option<Vec<Arc<T>>>
    where
        T: Send + Sync + 'static,
    {
        references
            .iter()
            .map(|reference| self.try_resolve(reference))
            .collect()
    }
}
