use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::core::TaskKey;
use crate::deletion::Inventory;
use crate::engine::{AnyTask, Node, Task, TaskNode, TaskRef};
use crate::error::BuildError;
use crate::lifecycle::LifecycleOverrides;

/// The flat collection of tasks for one run.
///
/// Producers add every task they want reconciled, in any order; references
/// between tasks are plain [`TaskRef`]s and only need to point at something
/// in the map by the time [`TaskGraph::build`](crate::TaskGraph::build) runs.
///
/// ```rust,ignore
/// let mut tasks: TaskMap<Cloud> = TaskMap::new();
/// let vpc = tasks.add(Vpc { name: "main".into(), cidr: "10.0.0.0/16".into(), id: None })?;
/// tasks.add(Subnet { name: "a".into(), vpc, cidr: "10.0.1.0/24".into(), id: None })?;
/// ```
pub struct TaskMap<C> {
    pub(crate) nodes: BTreeMap<TaskKey, Node<C>>,
    pub(crate) inventories: Vec<Arc<dyn Inventory<C>>>,
}

impl<C> TaskMap<C> {
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
            inventories: Vec::new(),
        }
    }

    /// Adds a task and returns a reference other tasks can hold.
    pub fn add<T>(&mut self, task: T) -> Result<TaskRef<T>, BuildError>
    where
        T: Task<C>,
    {
        let key = AnyTask::<C>::key(&task);
        if self.nodes.contains_key(&key) {
            return Err(BuildError::DuplicateTask(key));
        }

        let lifecycle = AnyTask::<C>::declared_lifecycle(&task);
        self.nodes.insert(
            key.clone(),
            Node::Task(TaskNode {
                task: Arc::new(task),
                lifecycle,
            }),
        );

        Ok(TaskRef::from_key(key))
    }

    pub(crate) fn insert_node(&mut self, node: Node<C>) {
        self.nodes.insert(node.key(), node);
    }

    /// The task as it was added.
    pub fn get<T>(&self, reference: &TaskRef<T>) -> Option<&T>
    where
        T: Task<C>,
    {
        match self.nodes.get(reference.key())? {
            Node::Task(node) => node.task.as_any().downcast_ref::<T>(),
            Node::Delete(_) => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn node(&self, key: &TaskKey) -> Option<&Node<C>> {
        self.nodes.get(key)
    }

    pub fn contains(&self, key: &TaskKey) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &TaskKey> {
        self.nodes.keys()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Replaces the lifecycle of every task whose kind has an override.
    pub fn apply_lifecycle_overrides(&mut self, overrides: &LifecycleOverrides) {
        if overrides.is_empty() {
            return;
        }

        for (key, node) in &mut self.nodes {
            if let Node::Task(node) = node
                && let Some(lifecycle) = overrides.get(key.kind())
            {
                debug!(task = %key, "lifecycle overridden: {} -> {lifecycle}", node.lifecycle);
                node.lifecycle = lifecycle;
            }
        }
    }

    /// Registers how existing resources of one kind are listed and deleted.
    pub fn register_inventory(&mut self, inventory: impl Inventory<C> + 'static) {
        self.inventories.push(Arc::new(inventory));
    }
}

impl<C> Default for TaskMap<C> {
    fn default() -> Self {
        Self::new()
    }
}
