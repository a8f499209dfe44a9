use std::fmt::{self, Write as _};
use std::io::{self, Write};
use std::sync::{Mutex, PoisonError};

use console::Style;
use serde_json::Value;

use crate::context::Context;
use crate::core::{Dynamic, TaskKey};
use crate::deletion::Deletion;
use crate::engine::{Action, AnyTask, Delta, FieldChange, rewrite_references};
use crate::error::{TargetError, TaskError};
use crate::graph::TaskGraph;
use crate::target::Target;

const ANSI_GREEN: Style = Style::new().green();
const ANSI_YELLOW: Style = Style::new().yellow();
const ANSI_RED: Style = Style::new().red();
const ANSI_DIM: Style = Style::new().dim();

/// A change the dry run would have made.
#[derive(Debug, Clone, PartialEq)]
pub enum PlannedChange {
    Create { key: TaskKey, desired: Value },
    Update { key: TaskKey, changes: Vec<FieldChange> },
    Delete { key: TaskKey, id: String },
}

impl PlannedChange {
    pub fn key(&self) -> &TaskKey {
        match self {
            Self::Create { key, .. } | Self::Update { key, .. } | Self::Delete { key, .. } => key,
        }
    }
}

/// Looks up existing resources like a real run, but only records what it
/// would change and prints the plan in [`Target::finish`].
pub struct DryRunTarget {
    planned: Mutex<Vec<PlannedChange>>,
    out: Mutex<Box<dyn Write + Send>>,
}

impl DryRunTarget {
    /// A dry run that prints its plan to stdout.
    pub fn new() -> Self {
        Self::with_writer(io::stdout())
    }

    pub fn with_writer(out: impl Write + Send + 'static) -> Self {
        Self {
            planned: Mutex::new(Vec::new()),
            out: Mutex::new(Box::new(out)),
        }
    }

    /// Everything recorded so far, in key order.
    pub fn planned(&self) -> Vec<PlannedChange> {
        let mut planned = self
            .planned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        planned.sort_by(|a, b| a.key().cmp(b.key()));
        planned
    }

    /// The human readable plan `finish` prints.
    pub fn render_report(&self) -> String {
        let mut f = String::new();
        // Writing into a String cannot fail.
        let _ = self.write_report(&mut f);
        f
    }

    fn write_report(&self, f: &mut String) -> fmt::Result {
        let planned = self.planned();
        if planned.is_empty() {
            return writeln!(f, "No changes need to be applied");
        }

        let creates: Vec<_> = planned
            .iter()
            .filter(|change| matches!(change, PlannedChange::Create { .. }))
            .collect();
        if !creates.is_empty() {
            writeln!(f, "{}", ANSI_GREEN.apply_to("Will create resources:"))?;
            for change in creates {
                writeln!(f, "  {}", change.key())?;
            }
            writeln!(f)?;
        }

        let updates: Vec<_> = planned
            .iter()
            .filter_map(|change| match change {
                PlannedChange::Update { key, changes } => Some((key, changes)),
                _ => None,
            })
            .collect();
        if !updates.is_empty() {
            writeln!(f, "{}", ANSI_YELLOW.apply_to("Will modify resources:"))?;
            for (key, changes) in updates {
                writeln!(f, "  {key}")?;
                for change in changes {
                    writeln!(
                        f,
                        "    {:<20} {} -> {}",
                        change.field,
                        ANSI_DIM.apply_to(display_value(&change.actual)),
                        display_value(&change.desired)
                    )?;
                }
            }
            writeln!(f)?;
        }

        let deletes: Vec<_> = planned
            .iter()
            .filter_map(|change| match change {
                PlannedChange::Delete { key, id } => Some((key, id)),
                _ => None,
            })
            .collect();
        if !deletes.is_empty() {
            writeln!(f, "{}", ANSI_RED.apply_to("Will delete items:"))?;
            for (key, id) in deletes {
                writeln!(f, "  {key}\t{}", ANSI_DIM.apply_to(id))?;
            }
            writeln!(f)?;
        }

        Ok(())
    }

    fn record(&self, change: PlannedChange) {
        self.planned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(change);
    }
}

impl Default for DryRunTarget {
    fn default() -> Self {
        Self::new()
    }
}

/// References print as the key they point at.
fn display_value(value: &Value) -> String {
    match rewrite_references(value, &|key| Value::String(key.to_string())) {
        Value::String(text) => text,
        other => other.to_string(),
    }
}

impl<C> Target<C> for DryRunTarget {
    fn name(&self) -> &'static str {
        "dryrun"
    }

    fn render(
        &self,
        _ctx: &Context<'_, C>,
        _task: &dyn AnyTask<C>,
        _desired: &Dynamic,
        _actual: Option<&Dynamic>,
        delta: &Delta,
    ) -> Result<Option<Dynamic>, TaskError> {
        match delta.action {
            Action::Create => self.record(PlannedChange::Create {
                key: delta.key.clone(),
                desired: delta.desired.clone(),
            }),
            Action::Update => self.record(PlannedChange::Update {
                key: delta.key.clone(),
                changes: delta.changes.clone(),
            }),
            Action::NoChange => {}
        }
        Ok(None)
    }

    fn delete(&self, _ctx: &Context<'_, C>, deletion: &Deletion<C>) -> Result<(), TaskError> {
        self.record(PlannedChange::Delete {
            key: deletion.key().clone(),
            id: deletion.resource().id.clone(),
        });
        Ok(())
    }

    fn finish(&self, _graph: &TaskGraph<C>) -> Result<(), TargetError> {
        let report = self.render_report();
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        out.write_all(report.as_bytes())?;
        out.flush()?;
        Ok(())
    }
}
