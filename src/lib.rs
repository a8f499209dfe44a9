#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod blueprint;
mod context;
mod core;
mod deletion;
mod engine;
mod error;
mod graph;
mod lifecycle;
mod options;
mod target;
#[cfg(test)]
mod testing;
mod utils;

pub use crate::blueprint::TaskMap;
pub use crate::context::Context;
pub use crate::core::{Dynamic, TaskKey};
pub use crate::deletion::{Deletion, ExistingResource, Inventory};
pub use crate::engine::{
    Action, AnyTask, Delta, EdgeKind, Engine, FieldChange, Kind, References, RunReport, Summary,
    Task, TaskExecution, TaskOutcome, TaskRef, references_in,
};
pub use crate::error::*;
pub use crate::graph::TaskGraph;
pub use crate::lifecycle::{Lifecycle, LifecycleOverrides, Phase, PhaseLifecycles, TargetKind};
pub use crate::options::RunOptions;
pub use crate::target::{
    CloudFormationTarget, DirectTarget, DryRunTarget, PlannedChange, Target, TerraformTarget,
};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;

/// Runs one full reconcile of `map` against `target`.
///
/// Applies the lifecycle overrides, plans the deletion of orphaned resources
/// when the target looks at existing state, resolves the graph and runs it.
pub fn apply<C>(
    cloud: &C,
    mut map: TaskMap<C>,
    target: &dyn Target<C>,
    overrides: &LifecycleOverrides,
    options: &RunOptions,
) -> Result<RunReport, ApplyError>
where
    C: Send + Sync,
{
    map.apply_lifecycle_overrides(overrides);

    if target.check_existing() {
        let deletions = map.find_deletions(cloud, overrides)?;
        tracing::info!(deletions, "planned deletions");
    }

    let graph = TaskGraph::build(map)?;
    let report = Engine::new(cloud, target).run_tasks(&graph, options)?;
    Ok(report)
}
