//! Where the changes of a run go.
//!
//! A run renders every task to exactly one [`Target`]. [`DirectTarget`]
//! changes the cloud, [`DryRunTarget`] only reports, and the two IaC targets
//! collect their documents while tasks render and write them out in
//! [`Target::finish`].

mod cloudformation;
mod direct;
mod dryrun;
mod terraform;

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use crate::context::Context;
use crate::core::{Dynamic, TaskKey};
use crate::deletion::Deletion;
use crate::engine::{AnyTask, Delta, Node, references_in};
use crate::error::{TargetError, TaskError};
use crate::graph::TaskGraph;

pub use cloudformation::CloudFormationTarget;
pub use direct::DirectTarget;
pub use dryrun::{DryRunTarget, PlannedChange};
pub use terraform::TerraformTarget;

pub trait Target<C>: Send + Sync {
    /// Short name used in logs, e.g. `terraform`.
    fn name(&self) -> &'static str;

    /// Whether tasks look up existing resources before rendering. Targets
    /// that generate IaC from a blank slate return `false`, which also turns
    /// deletion planning off.
    fn check_existing(&self) -> bool {
        true
    }

    /// Reconciles one task whose delta is not a no-op.
    ///
    /// Returns the realized state when the target produced one; `None` makes
    /// the desired state visible to dependants instead.
    fn render(
        &self,
        ctx: &Context<'_, C>,
        task: &dyn AnyTask<C>,
        desired: &Dynamic,
        actual: Option<&Dynamic>,
        delta: &Delta,
    ) -> Result<Option<Dynamic>, TaskError>;

    fn delete(&self, ctx: &Context<'_, C>, deletion: &Deletion<C>) -> Result<(), TaskError>;

    /// Called once after every task rendered successfully.
    fn finish(&self, _graph: &TaskGraph<C>) -> Result<(), TargetError> {
        Ok(())
    }
}

/// The task behind `key`, if it is a live task and not a deletion.
fn task_in<'g, C>(graph: &'g TaskGraph<C>, key: &TaskKey) -> Option<&'g dyn AnyTask<C>> {
    match graph.node(key)? {
        Node::Task(node) => Some(node.task.as_ref()),
        Node::Delete(_) => None,
    }
}

/// Literal ids for the references in `values` that point outside the
/// generated document.
///
/// Tasks that only validate or watch an existing resource are never
/// generated, so a reference to one becomes the `id` it declares.
fn external_ids<'v, C>(
    graph: &TaskGraph<C>,
    generated: &BTreeMap<TaskKey, Value>,
    values: impl IntoIterator<Item = &'v Value>,
) -> Result<HashMap<TaskKey, Value>, TargetError> {
    let mut ids = HashMap::new();
    for key in values.into_iter().flat_map(references_in) {
        if generated.contains_key(&key) || ids.contains_key(&key) {
            continue;
        }
        let id = task_in(graph, &key)
            .and_then(|task| task.declared_value().ok())
            .and_then(|declared| declared.get("id").filter(|id| !id.is_null()).cloned())
            .ok_or_else(|| TargetError::NotGenerated(key.clone()))?;
        ids.insert(key, id);
    }
    Ok(ids)
}

/// Keeps only `[A-Za-z0-9_-]`, the characters IaC resource names accept.
pub(crate) fn sanitize_name(name: &str) -> String {
    let mut clean: String = name
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '-' => c,
            _ => '-',
        })
        .collect();

    if !clean.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') {
        clean.insert(0, '_');
    }
    clean
}
