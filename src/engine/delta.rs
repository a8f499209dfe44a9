use serde::Serialize;
use serde_json::Value;

use crate::core::TaskKey;

/// What reconciling one task will do to its resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Action {
    Create,
    Update,
    NoChange,
}

/// One top-level field whose actual value differs from the desired one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    pub field: String,
    /// `Value::Null` when the resource does not exist yet.
    pub actual: Value,
    pub desired: Value,
}

/// The difference between the desired and actual state of one resource.
///
/// Fields are compared at the top level of their JSON form. A field that is
/// `null` in the desired state is left to the cloud and never counts as a
/// change, which is what keeps cloud-assigned identifiers out of the diff.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Delta {
    pub key: TaskKey,
    pub action: Action,
    pub changes: Vec<FieldChange>,
    /// Desired state, with references still in `{"$ref": ..}` form.
    pub desired: Value,
    pub actual: Option<Value>,
}

impl Delta {
    pub fn compute(key: TaskKey, desired: Value, actual: Option<Value>) -> Self {
        let changes = diff_fields(&desired, actual.as_ref());
        let action = match (&actual, changes.is_empty()) {
            (None, _) => Action::Create,
            (Some(_), true) => Action::NoChange,
            (Some(_), false) => Action::Update,
        };

        Self {
            key,
            action,
            changes,
            desired,
            actual,
        }
    }

    /// True when the resource already matches.
    pub fn is_noop(&self) -> bool {
        self.action == Action::NoChange
    }

    pub fn changed(&self, field: &str) -> bool {
        self.change(field).is_some()
    }

    pub fn change(&self, field: &str) -> Option<&FieldChange> {
        self.changes.iter().find(|change| change.field == field)
    }

    pub fn changed_fields(&self) -> Vec<String> {
        self.changes.iter().map(|c| c.field.clone()).collect()
    }
}

fn diff_fields(desired: &Value, actual: Option<&Value>) -> Vec<FieldChange> {
    let Value::Object(fields) = desired else {
        // Scalars and arrays compare as a whole.
        let actual = actual.cloned().unwrap_or(Value::Null);
        if desired.is_null() || *desired == actual {
            return Vec::new();
        }
        return vec![FieldChange {
            field: String::new(),
            actual,
            desired: desired.clone(),
        }];
    };

    fields
        .iter()
        .filter(|(_, value)| !value.is_null())
        .filter_map(|(field, value)| {
            let current = actual
                .and_then(|actual| actual.get(field))
                .cloned()
                .unwrap_or(Value::Null);

            (current != *value).then(|| FieldChange {
                field: field.clone(),
                actual: current,
                desired: value.clone(),
            })
        })
        .collect()
}
