use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A type-erased, thread-safe container.
///
/// Every task output lives in the engine as one of these. Typed access goes
/// through [`TaskRef`](crate::TaskRef), which knows the concrete type.
pub type Dynamic = Arc<dyn Any + Send + Sync>;

/// Identity of a task within one run: the task kind plus the task name.
///
/// Keys order by kind first, then by name, which gives reports and generated
/// IaC documents a stable layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
    kind: Cow<'static, str>,
    name: String,
}

impl TaskKey {
    pub fn new(kind: impl Into<Cow<'static, str>>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// The resource kind, e.g. `vpc` or `security_group`.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The task name, unique within its kind.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parses the `kind/name` form produced by `Display`.
    pub fn parse(text: &str) -> Option<Self> {
        let (kind, name) = text.split_once('/')?;
        if kind.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(kind.to_string(), name))
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}
