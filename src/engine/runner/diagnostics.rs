use std::collections::BTreeMap;
use std::fmt::{self, Write};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::core::TaskKey;
use crate::graph::TaskGraph;

/// What happened to one task. For targets that don't touch the cloud,
/// `Created`, `Updated` and `Deleted` describe the planned change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TaskOutcome {
    Created,
    Updated { fields: Vec<String> },
    Unchanged,
    Deleted,
    Skipped { reason: String },
    Warned { message: String },
}

impl TaskOutcome {
    /// Whether the outcome stands for a change to the resource.
    pub fn is_change(&self) -> bool {
        matches!(self, Self::Created | Self::Updated { .. } | Self::Deleted)
    }

    fn color(&self) -> &'static str {
        match self {
            Self::Created => "#90EE90",
            Self::Updated { .. } => "#FFD700",
            Self::Deleted => "#FF7F7F",
            Self::Unchanged => "#D3D3D3",
            Self::Skipped { .. } => "#ADD8E6",
            Self::Warned { .. } => "#FFA500",
        }
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Updated { fields } => write!(f, "updated ({})", fields.join(", ")),
            Self::Unchanged => f.write_str("unchanged"),
            Self::Deleted => f.write_str("deleted"),
            Self::Skipped { reason } => write!(f, "skipped: {reason}"),
            Self::Warned { message } => write!(f, "warning: {message}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// Counts of task outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub warned: usize,
}

impl Summary {
    pub fn changes(&self) -> usize {
        self.created + self.updated + self.deleted
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} created, {} updated, {} deleted, {} unchanged, {} skipped, {} warnings",
            self.created, self.updated, self.deleted, self.unchanged, self.skipped, self.warned
        )
    }
}

/// Result of a successful run.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Final outcome of every task, including deletions.
    pub outcomes: BTreeMap<TaskKey, TaskOutcome>,
    /// Timing of the last execution of every task that ran.
    pub execution_times: BTreeMap<TaskKey, TaskExecution>,
}

impl RunReport {
    pub fn outcome(&self, key: &TaskKey) -> Option<&TaskOutcome> {
        self.outcomes.get(key)
    }

    pub fn summary(&self) -> Summary {
        let mut summary = Summary::default();
        for outcome in self.outcomes.values() {
            let count = match outcome {
                TaskOutcome::Created => &mut summary.created,
                TaskOutcome::Updated { .. } => &mut summary.updated,
                TaskOutcome::Unchanged => &mut summary.unchanged,
                TaskOutcome::Deleted => &mut summary.deleted,
                TaskOutcome::Skipped { .. } => &mut summary.skipped,
                TaskOutcome::Warned { .. } => &mut summary.warned,
            };
            *count += 1;
        }
        summary
    }

    /// Tasks whose outcome is a change, in key order.
    pub fn changes(&self) -> impl Iterator<Item = (&TaskKey, &TaskOutcome)> {
        self.outcomes.iter().filter(|(_, outcome)| outcome.is_change())
    }

    /// Renders the task graph as a Mermaid diagram, color-coded by outcome.
    ///
    /// * **Green**: created
    /// * **Gold**: updated
    /// * **Red**: deleted
    /// * **Grey**: unchanged
    /// * **Blue**: skipped
    /// * **Orange**: warned
    pub fn render_mermaid<C>(&self, graph: &TaskGraph<C>) -> String {
        let mut f = String::new();
        // Writing into a String cannot fail.
        let _ = self.write_mermaid(&mut f, graph);
        f
    }

    fn write_mermaid<C>(&self, f: &mut String, graph: &TaskGraph<C>) -> fmt::Result {
        writeln!(f, "graph LR")?;

        for index in graph.graph.node_indices() {
            let node = &graph.graph[index];
            let key = node.key();
            let name = node.label().replace('"', "\\\"");

            match self.outcomes.get(&key) {
                Some(outcome) => {
                    let timing = self
                        .execution_times
                        .get(&key)
                        .map(|exec| format!(" {:.2?}", exec.duration))
                        .unwrap_or_default();
                    let outcome = outcome.to_string().replace('"', "'");
                    writeln!(f, "    {}[\"{name}\\n{outcome}{timing}\"]", index.index())?;
                    writeln!(f, "    style {} fill:{}", index.index(), self.color(&key))?;
                }
                None => writeln!(f, "    {}[\"{name}\"]", index.index())?,
            }
        }

        for edge in graph.graph.raw_edges() {
            writeln!(
                f,
                "    {} --> {}",
                edge.source().index(),
                edge.target().index()
            )?;
        }

        for (from, to) in graph.soft_indices() {
            writeln!(f, "    {} -.-> {}", to.index(), from.index())?;
        }

        Ok(())
    }

    fn color(&self, key: &TaskKey) -> &'static str {
        self.outcomes
            .get(key)
            .map(TaskOutcome::color)
            .unwrap_or("#FFFFFF")
    }
}
