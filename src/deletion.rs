//! Finding and ordering the deletion of orphaned resources.
//!
//! A resource is orphaned when it exists in the cloud, belongs to the
//! cluster, and no task in the current [`TaskMap`] has its key. Every orphan
//! the lifecycle policy lets go becomes a synthetic deletion task in the same
//! map, so it is scheduled, retried and reported exactly like any other task.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::blueprint::TaskMap;
use crate::context::Context;
use crate::core::TaskKey;
use crate::engine::Node;
use crate::error::{DeletionError, TaskError};
use crate::lifecycle::{Lifecycle, LifecycleOverrides};

/// A resource found in the cloud, as reported by an [`Inventory`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingResource {
    /// The key the resource's task would have.
    pub key: TaskKey,
    /// Cloud-assigned identifier.
    pub id: String,
    /// Other existing resources this one uses, e.g. the subnet of an instance.
    pub depends_on: Vec<TaskKey>,
}

/// Lists and deletes the existing resources of one kind.
///
/// Producers register one inventory per kind they manage; kinds without an
/// inventory are never considered for deletion.
pub trait Inventory<C>: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Every resource of this kind that belongs to the cluster.
    fn list(&self, cloud: &C) -> Result<Vec<ExistingResource>, TaskError>;

    fn delete(&self, ctx: &Context<'_, C>, resource: &ExistingResource) -> Result<(), TaskError>;
}

/// A planned deletion of one orphaned resource.
pub struct Deletion<C> {
    resource: ExistingResource,
    lifecycle: Lifecycle,
    after: Vec<TaskKey>,
    inventory: Arc<dyn Inventory<C>>,
}

impl<C> Deletion<C> {
    pub fn key(&self) -> &TaskKey {
        &self.resource.key
    }

    pub fn resource(&self) -> &ExistingResource {
        &self.resource
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Nodes that have to finish before this resource can go.
    pub fn after(&self) -> &[TaskKey] {
        &self.after
    }

    pub fn inventory(&self) -> &dyn Inventory<C> {
        self.inventory.as_ref()
    }
}

impl<C> fmt::Debug for Deletion<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deletion")
            .field("resource", &self.resource)
            .field("lifecycle", &self.lifecycle)
            .field("after", &self.after)
            .finish()
    }
}

impl<C> TaskMap<C> {
    /// Lists existing resources through every registered inventory and adds
    /// a deletion task for each orphan the lifecycle overrides allow to go.
    ///
    /// Must run after every desired task is in the map. Returns the number of
    /// deletion tasks added.
    pub fn find_deletions(
        &mut self,
        cloud: &C,
        overrides: &LifecycleOverrides,
    ) -> Result<usize, DeletionError> {
        let mut existing = BTreeMap::new();
        for inventory in &self.inventories {
            let resources = inventory
                .list(cloud)
                .map_err(|source| DeletionError::Inventory {
                    kind: inventory.kind(),
                    source,
                })?;

            for resource in resources {
                if existing.contains_key(&resource.key) {
                    return Err(DeletionError::DuplicateResource(resource.key));
                }
                existing.insert(resource.key.clone(), (resource, inventory.clone()));
            }
        }

        let orphans: BTreeSet<&TaskKey> = existing
            .keys()
            .filter(|key| !self.contains(key))
            .collect();

        let mut planned = BTreeSet::new();
        for &key in &orphans {
            let lifecycle = overrides.get(key.kind()).unwrap_or_default();
            match lifecycle {
                Lifecycle::Sync | Lifecycle::WarnIfInsufficientAccess => {
                    planned.insert(key);
                }
                Lifecycle::ExistsAndWarnIfChanges => {
                    warn!(resource = %key, "would delete, but lifecycle is {lifecycle}");
                }
                Lifecycle::ExistsAndValidates | Lifecycle::Ignore => {
                    debug!(resource = %key, "orphaned, left alone ({lifecycle})");
                }
            }
        }

        // A live task whose lifecycle forbids changes never moves its resource
        // off anything it uses.
        let pinned = |user: &TaskKey| match self.nodes.get(user) {
            Some(node @ Node::Task(_)) => !node.lifecycle().allows_mutation(),
            _ => false,
        };

        // An orphan still used by a resource that stays has to stay too.
        loop {
            let blocked: Vec<&TaskKey> = planned
                .iter()
                .copied()
                .filter(|&key| {
                    existing.values().any(|(user, _)| {
                        let kept = if orphans.contains(&user.key) {
                            !planned.contains(&user.key)
                        } else {
                            pinned(&user.key)
                        };
                        user.depends_on.contains(key) && kept
                    })
                })
                .collect();

            if blocked.is_empty() {
                break;
            }
            for key in blocked {
                warn!(resource = %key, "not deleting, still used by a resource that is kept");
                planned.remove(key);
            }
        }

        let mut deletions = Vec::with_capacity(planned.len());
        for &key in &planned {
            let (resource, inventory) = &existing[key];
            let after = existing
                .values()
                .filter(|(user, _)| user.depends_on.contains(key))
                .map(|(user, _)| user.key.clone())
                .filter(|user| planned.contains(user) || self.contains(user))
                .collect();

            deletions.push(Deletion {
                resource: resource.clone(),
                lifecycle: overrides.get(key.kind()).unwrap_or_default(),
                after,
                inventory: inventory.clone(),
            });
        }

        let count = deletions.len();
        for deletion in deletions {
            info!(resource = %deletion.key(), id = %deletion.resource.id, "planning deletion");
            self.insert_node(Node::Delete(Arc::new(deletion)));
        }

        Ok(count)
    }
}
