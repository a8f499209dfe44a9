use std::collections::BTreeMap;
use std::fs;
use std::sync::{Mutex, PoisonError};

use anyhow::anyhow;
use camino::{Utf8Path, Utf8PathBuf};
use serde_json::{Map, Value, json};
use tracing::info;

use crate::context::Context;
use crate::core::{Dynamic, TaskKey};
use crate::deletion::Deletion;
use crate::engine::{AnyTask, Delta, rewrite_references};
use crate::error::{TargetError, TaskError};
use crate::graph::TaskGraph;
use crate::target::{Target, external_ids, sanitize_name, task_in};

const FILE_NAME: &str = "kubernetes.tf.json";

/// Generates Terraform JSON instead of changing the cloud.
///
/// Every task that would be created becomes a `resource.<type>.<name>` block;
/// references to other tasks become `${<type>.<name>.id}` interpolations.
/// Nothing is looked up, so tasks that only validate or watch existing
/// resources are skipped.
pub struct TerraformTarget {
    out_dir: Utf8PathBuf,
    resources: Mutex<BTreeMap<TaskKey, Value>>,
    outputs: Mutex<BTreeMap<String, Value>>,
}

impl TerraformTarget {
    pub fn new(out_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            resources: Mutex::new(BTreeMap::new()),
            outputs: Mutex::new(BTreeMap::new()),
        }
    }

    /// Path of the file written by `finish`.
    pub fn output_path(&self) -> Utf8PathBuf {
        self.out_dir.join(FILE_NAME)
    }

    /// Adds a Terraform `output`. The value may contain task references.
    pub fn add_output_variable(
        &self,
        name: impl Into<String>,
        value: Value,
    ) -> Result<(), TargetError> {
        let name = name.into();
        let mut outputs = self.outputs.lock().unwrap_or_else(PoisonError::into_inner);
        if outputs.contains_key(&name) {
            return Err(TargetError::DuplicateOutput(name));
        }
        outputs.insert(name, value);
        Ok(())
    }

    fn document<C>(&self, graph: &TaskGraph<C>) -> Result<Value, TargetError> {
        let resources = self.resources.lock().unwrap_or_else(PoisonError::into_inner);
        let outputs = self.outputs.lock().unwrap_or_else(PoisonError::into_inner);
        let external =
            external_ids(graph, &resources, resources.values().chain(outputs.values()))?;

        let type_of = |key: &TaskKey| {
            task_in(graph, key)
                .map(|task| task.terraform_type())
                .unwrap_or(key.kind())
                .to_string()
        };
        let interpolate = |key: &TaskKey| match external.get(key) {
            Some(id) => id.clone(),
            None => {
                let name = sanitize_name(key.name());
                Value::String(format!("${{{}.{name}.id}}", type_of(key)))
            }
        };

        let mut resource: Map<String, Value> = Map::new();
        for (key, body) in resources.iter() {
            let blocks = resource
                .entry(type_of(key))
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(blocks) = blocks {
                blocks.insert(
                    sanitize_name(key.name()),
                    rewrite_references(body, &interpolate),
                );
            }
        }

        let mut document = json!({ "resource": resource });

        if !outputs.is_empty() {
            let output: Map<String, Value> = outputs
                .iter()
                .map(|(name, value)| {
                    let value = rewrite_references(value, &interpolate);
                    (name.clone(), json!({ "value": value }))
                })
                .collect();
            document["output"] = Value::Object(output);
        }

        Ok(document)
    }
}

impl<C> Target<C> for TerraformTarget {
    fn name(&self) -> &'static str {
        "terraform"
    }

    fn check_existing(&self) -> bool {
        false
    }

    fn render(
        &self,
        _ctx: &Context<'_, C>,
        _task: &dyn AnyTask<C>,
        _desired: &Dynamic,
        _actual: Option<&Dynamic>,
        delta: &Delta,
    ) -> Result<Option<Dynamic>, TaskError> {
        self.resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(delta.key.clone(), delta.desired.clone());
        Ok(None)
    }

    fn delete(&self, _ctx: &Context<'_, C>, deletion: &Deletion<C>) -> Result<(), TaskError> {
        Err(TaskError::terminal(anyhow!(
            "terraform output cannot delete {}",
            deletion.key()
        )))
    }

    fn finish(&self, graph: &TaskGraph<C>) -> Result<(), TargetError> {
        let document = self.document(graph)?;
        write_json(&self.out_dir, FILE_NAME, &document)?;
        info!(path = %self.output_path(), "wrote terraform");
        Ok(())
    }
}

pub(super) fn write_json(dir: &Utf8Path, name: &str, document: &Value) -> Result<(), TargetError> {
    fs::create_dir_all(dir)?;
    let mut text = serde_json::to_string_pretty(document)?;
    text.push('\n');
    fs::write(dir.join(name), text)?;
    Ok(())
}
