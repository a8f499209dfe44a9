use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::core::TaskKey;
use crate::engine::Kind;
use crate::engine::references::{EdgeKind, References};

/// Field name a reference serializes under: `{"$ref": "vpc/main"}`.
pub(crate) const REF_FIELD: &str = "$ref";

/// A type-safe reference from one task to another.
///
/// A `TaskRef<T>` stored in a task field is how a task says it needs another
/// task's output. The resolver turns every reference into an edge of the task
/// graph, and at run time [`Context::resolve`](crate::Context::resolve) hands
/// out the referenced task's realized state as a `T`.
///
/// References are hard by default. A [`soft`](TaskRef::soft) reference never
/// orders the two tasks; the referencing task is patched in a second pass
/// instead, which is how security groups that allow traffic from each other
/// are expressed.
///
/// Two references are equal when they point at the same task, whether soft or
/// not. They serialize as `{"$ref": "kind/name"}`, so IaC targets can rewrite
/// them into their own reference syntax.
pub struct TaskRef<T> {
    key: TaskKey,
    edge: EdgeKind,
    _phantom: PhantomData<fn() -> T>,
}

impl<T: Kind> TaskRef<T> {
    /// Refers to the task of kind `T` with this name.
    pub fn named(name: impl Into<String>) -> Self {
        Self::from_key(TaskKey::new(T::KIND, name))
    }
}

impl<T> TaskRef<T> {
    pub(crate) fn from_key(key: TaskKey) -> Self {
        Self {
            key,
            edge: EdgeKind::Hard,
            _phantom: PhantomData,
        }
    }

    /// Key of the referenced task.
    pub fn key(&self) -> &TaskKey {
        &self.key
    }

    /// Turns this into a soft reference.
    ///
    /// Soft references add no ordering, so the referenced task may not have
    /// run yet when the holder's `desired` is computed in the main pass.
    /// Read them with [`Context::try_resolve_all`](crate::Context::try_resolve_all)
    /// and leave derived fields `None` while it returns `None`; the holder is
    /// re-run once everything exists.
    pub fn soft(mut self) -> Self {
        self.edge = EdgeKind::Soft;
        self
    }

    pub fn is_soft(&self) -> bool {
        self.edge == EdgeKind::Soft
    }
}

impl<T> Clone for TaskRef<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            edge: self.edge,
            _phantom: PhantomData,
        }
    }
}

impl<T> fmt::Debug for TaskRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.edge {
            EdgeKind::Hard => write!(f, "TaskRef({})", self.key),
            EdgeKind::Soft => write!(f, "TaskRef({}, soft)", self.key),
        }
    }
}

impl<T> PartialEq for TaskRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<T> Eq for TaskRef<T> {}

impl<T> Hash for TaskRef<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl<T> References for TaskRef<T> {
    fn visit_references(&self, visitor: &mut dyn FnMut(&TaskKey, EdgeKind)) {
        visitor(&self.key, self.edge);
    }
}

impl<T> Serialize for TaskRef<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(REF_FIELD, &self.key.to_string())?;
        map.end()
    }
}

impl<'de, T> Deserialize<'de> for TaskRef<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(rename = "$ref")]
            key: String,
        }

        let raw = Raw::deserialize(deserializer)?;
        let key = TaskKey::parse(&raw.key)
            .ok_or_else(|| D::Error::custom(format!("malformed task reference '{}'", raw.key)))?;
        Ok(Self::from_key(key))
    }
}

/// Recognizes a serialized [`TaskRef`].
fn as_reference(value: &Value) -> Option<TaskKey> {
    match value {
        Value::Object(map) if map.len() == 1 => TaskKey::parse(map.get(REF_FIELD)?.as_str()?),
        _ => None,
    }
}

/// Every task referenced anywhere inside a serialized task.
///
/// Handy for an [`Inventory`](crate::Inventory) that keeps the last applied
/// state of its resources as JSON and needs their `depends_on`.
pub fn references_in(value: &Value) -> Vec<TaskKey> {
    fn walk(value: &Value, found: &mut Vec<TaskKey>) {
        if let Some(key) = as_reference(value) {
            found.push(key);
            return;
        }
        match value {
            Value::Array(items) => items.iter().for_each(|item| walk(item, found)),
            Value::Object(map) => map.values().for_each(|item| walk(item, found)),
            _ => {}
        }
    }

    let mut found = Vec::new();
    walk(value, &mut found);
    found
}

/// Replaces every serialized reference with whatever `rewrite` returns for it.
/// Null object fields are dropped on the way, they mean "unset".
pub(crate) fn rewrite_references(value: &Value, rewrite: &dyn Fn(&TaskKey) -> Value) -> Value {
    if let Some(key) = as_reference(value) {
        return rewrite(&key);
    }
    match value {
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| rewrite_references(item, rewrite))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, item)| !item.is_null())
                .map(|(name, item)| (name.clone(), rewrite_references(item, rewrite)))
                .collect(),
        ),
        other => other.clone(),
    }
}
