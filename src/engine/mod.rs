mod delta;
mod handle;
mod references;
mod runner;

use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::context::Context;
use crate::core::{Dynamic, TaskKey};
use crate::deletion::Deletion;
use crate::error::TaskError;
use crate::lifecycle::Lifecycle;

pub use crate::engine::delta::{Action, Delta, FieldChange};
pub use crate::engine::handle::TaskRef;
pub use crate::engine::handle::references_in;
pub(crate) use crate::engine::handle::rewrite_references;
pub use crate::engine::references::{EdgeKind, References};
pub use crate::engine::runner::{Engine, RunReport, Summary, TaskExecution, TaskOutcome};

/// The stable name of a task type, used as the first half of a [`TaskKey`].
///
/// Kept apart from [`Task`] so that a [`TaskRef`] can be named before the
/// cloud handle type is known.
pub trait Kind {
    const KIND: &'static str;
}

/// A unit of desired state for one infrastructure resource.
///
/// The task value itself is the desired state. `find` returns the actual
/// state as another value of the same type, so the engine can compare the two
/// field by field (see [`Delta`]). Fields that are `None` in the desired
/// state, typically cloud-assigned identifiers, are never compared.
///
/// References to other tasks are [`TaskRef`] fields; the engine discovers
/// them through [`References`], usually implemented with
/// [`impl_references!`](crate::impl_references).
///
/// `C` is the cloud handle the producers pass to the engine. The engine never
/// looks inside it.
pub trait Task<C = ()>:
    Kind + References + Serialize + Clone + Debug + Send + Sync + 'static
{
    /// Name of the task, unique within its kind.
    fn name(&self) -> &str;

    fn lifecycle(&self) -> Lifecycle {
        Lifecycle::Sync
    }

    /// Ordering requirements that are not visible as a [`TaskRef`] field.
    fn extra_dependencies(&self) -> Vec<TaskKey> {
        Vec::new()
    }

    /// The desired state with values from referenced tasks filled in.
    ///
    /// Called once per attempt, after every hard dependency is done.
    fn desired(&self, _ctx: &Context<'_, C>) -> Result<Self, TaskError> {
        Ok(self.clone())
    }

    /// Looks the resource up. A missing resource is `Ok(None)`, never an error.
    fn find(&self, ctx: &Context<'_, C>) -> Result<Option<Self>, TaskError>;

    /// Rejects changes the resource cannot accept, e.g. an immutable field.
    fn check_changes(&self, _actual: Option<&Self>, _delta: &Delta) -> Result<(), TaskError> {
        Ok(())
    }

    /// Applies `delta` against the cloud API and returns the realized state,
    /// including any cloud-assigned identifiers dependants need.
    fn render_direct(
        &self,
        ctx: &Context<'_, C>,
        actual: Option<&Self>,
        delta: &Delta,
    ) -> Result<Self, TaskError>;

    /// Resource type in generated Terraform, e.g. `aws_vpc`.
    fn terraform_type(&self) -> &'static str {
        Self::KIND
    }

    /// Resource type in generated CloudFormation, e.g. `AWS::EC2::VPC`.
    fn cloudformation_type(&self) -> &'static str {
        Self::KIND
    }
}

/// The type-erased view of a [`Task`] the engine and targets work with.
///
/// Implemented for every `Task` by a blanket impl; there is no reason to
/// implement it by hand.
pub trait AnyTask<C>: Send + Sync {
    fn key(&self) -> TaskKey;

    fn declared_lifecycle(&self) -> Lifecycle;

    fn visit_references(&self, visitor: &mut dyn FnMut(&TaskKey, EdgeKind));

    fn extra_dependencies(&self) -> Vec<TaskKey>;

    fn terraform_type(&self) -> &'static str;

    fn cloudformation_type(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;

    fn desired(&self, ctx: &Context<'_, C>) -> Result<Dynamic, TaskError>;

    fn find(&self, ctx: &Context<'_, C>) -> Result<Option<Dynamic>, TaskError>;

    fn to_value(&self, state: &Dynamic) -> Result<Value, TaskError>;

    /// The task as declared, before any references are resolved.
    fn declared_value(&self) -> Result<Value, TaskError>;

    fn check_changes(
        &self,
        desired: &Dynamic,
        actual: Option<&Dynamic>,
        delta: &Delta,
    ) -> Result<(), TaskError>;

    fn render_direct(
        &self,
        ctx: &Context<'_, C>,
        desired: &Dynamic,
        actual: Option<&Dynamic>,
        delta: &Delta,
    ) -> Result<Dynamic, TaskError>;
}

fn downcast<'a, T: 'static>(
    key: impl Fn() -> TaskKey,
    state: &'a Dynamic,
) -> Result<&'a T, TaskError> {
    state.downcast_ref::<T>().ok_or_else(|| {
        TaskError::fatal(anyhow::anyhow!(
            "state for '{}' is not a {}",
            key(),
            std::any::type_name::<T>()
        ))
    })
}

// This is where the type erasure happens.
impl<C, T> AnyTask<C> for T
where
    T: Task<C>,
{
    fn key(&self) -> TaskKey {
        TaskKey::new(T::KIND, self.name())
    }

    fn declared_lifecycle(&self) -> Lifecycle {
        <T as Task<C>>::lifecycle(self)
    }

    fn visit_references(&self, visitor: &mut dyn FnMut(&TaskKey, EdgeKind)) {
        References::visit_references(self, visitor);
    }

    fn extra_dependencies(&self) -> Vec<TaskKey> {
        <T as Task<C>>::extra_dependencies(self)
    }

    fn terraform_type(&self) -> &'static str {
        <T as Task<C>>::terraform_type(self)
    }

    fn cloudformation_type(&self) -> &'static str {
        <T as Task<C>>::cloudformation_type(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn desired(&self, ctx: &Context<'_, C>) -> Result<Dynamic, TaskError> {
        Ok(Arc::new(<T as Task<C>>::desired(self, ctx)?))
    }

    fn find(&self, ctx: &Context<'_, C>) -> Result<Option<Dynamic>, TaskError> {
        Ok(<T as Task<C>>::find(self, ctx)?.map(|actual| Arc::new(actual) as Dynamic))
    }

    fn to_value(&self, state: &Dynamic) -> Result<Value, TaskError> {
        let state = downcast::<T>(|| AnyTask::<C>::key(self), state)?;
        serde_json::to_value(state).map_err(TaskError::fatal)
    }

    fn declared_value(&self) -> Result<Value, TaskError> {
        serde_json::to_value(self).map_err(TaskError::fatal)
    }

    fn check_changes(
        &self,
        desired: &Dynamic,
        actual: Option<&Dynamic>,
        delta: &Delta,
    ) -> Result<(), TaskError> {
        let key = || AnyTask::<C>::key(self);
        let desired = downcast::<T>(key, desired)?;
        let actual = actual.map(|a| downcast::<T>(key, a)).transpose()?;
        <T as Task<C>>::check_changes(desired, actual, delta)
    }

    fn render_direct(
        &self,
        ctx: &Context<'_, C>,
        desired: &Dynamic,
        actual: Option<&Dynamic>,
        delta: &Delta,
    ) -> Result<Dynamic, TaskError> {
        let key = || AnyTask::<C>::key(self);
        let desired = downcast::<T>(key, desired)?;
        let actual = actual.map(|a| downcast::<T>(key, a)).transpose()?;
        Ok(Arc::new(<T as Task<C>>::render_direct(
            desired, ctx, actual, delta,
        )?))
    }
}

/// A task together with the lifecycle it runs under after overrides.
pub(crate) struct TaskNode<C> {
    pub task: Arc<dyn AnyTask<C>>,
    pub lifecycle: Lifecycle,
}

impl<C> Clone for TaskNode<C> {
    fn clone(&self) -> Self {
        Self {
            task: self.task.clone(),
            lifecycle: self.lifecycle,
        }
    }
}

/// One vertex of the task graph. Deletions are synthetic tasks so they go
/// through the same scheduling and failure handling as everything else.
pub(crate) enum Node<C> {
    Task(TaskNode<C>),
    Delete(Arc<Deletion<C>>),
}

impl<C> Node<C> {
    pub(crate) fn key(&self) -> TaskKey {
        match self {
            Node::Task(node) => node.task.key(),
            Node::Delete(deletion) => deletion.key().clone(),
        }
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        match self {
            Node::Task(node) => node.lifecycle,
            Node::Delete(deletion) => deletion.lifecycle(),
        }
    }

    pub(crate) fn label(&self) -> String {
        match self {
            Node::Task(node) => node.task.key().to_string(),
            Node::Delete(deletion) => format!("delete {}", deletion.key()),
        }
    }

    /// Every key this node must wait for, with the kind of edge.
    pub(crate) fn dependencies(&self) -> Vec<(TaskKey, EdgeKind)> {
        match self {
            Node::Task(node) => {
                let mut deps = Vec::new();
                AnyTask::visit_references(&*node.task, &mut |key, kind| {
                    deps.push((key.clone(), kind))
                });
                deps.extend(
                    AnyTask::extra_dependencies(&*node.task)
                        .into_iter()
                        .map(|key| (key, EdgeKind::Hard)),
                );
                deps
            }
            Node::Delete(deletion) => deletion
                .after()
                .iter()
                .map(|key| (key.clone(), EdgeKind::Hard))
                .collect(),
        }
    }
}

impl<C> Clone for Node<C> {
    fn clone(&self) -> Self {
        match self {
            Node::Task(node) => Node::Task(node.clone()),
            Node::Delete(deletion) => Node::Delete(deletion.clone()),
        }
    }
}
