use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use anyhow::anyhow;
use camino::Utf8PathBuf;
use serde_json::{Map, Value, json};
use tracing::info;

use crate::context::Context;
use crate::core::{Dynamic, TaskKey};
use crate::deletion::Deletion;
use crate::engine::{AnyTask, Delta, rewrite_references};
use crate::error::{TargetError, TaskError};
use crate::graph::TaskGraph;
use crate::target::terraform::write_json;
use crate::target::{Target, external_ids, task_in};

const FILE_NAME: &str = "kubernetes.json";

/// Generates a CloudFormation template instead of changing the cloud.
pub struct CloudFormationTarget {
    out_dir: Utf8PathBuf,
    resources: Mutex<BTreeMap<TaskKey, Value>>,
}

impl CloudFormationTarget {
    pub fn new(out_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            resources: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn output_path(&self) -> Utf8PathBuf {
        self.out_dir.join(FILE_NAME)
    }

    fn document<C>(&self, graph: &TaskGraph<C>) -> Result<Value, TargetError> {
        let resources = self.resources.lock().unwrap_or_else(PoisonError::into_inner);
        let external = external_ids(graph, &resources, resources.values())?;

        let type_of = |key: &TaskKey| {
            task_in(graph, key)
                .map(|task| task.cloudformation_type())
                .unwrap_or(key.kind())
                .to_string()
        };
        let reference = |key: &TaskKey| match external.get(key) {
            Some(id) => id.clone(),
            None => json!({ "Ref": logical_id(&type_of(key), key.name()) }),
        };

        let entries: Map<String, Value> = resources
            .iter()
            .map(|(key, properties)| {
                let kind = type_of(key);
                let entry = json!({
                    "Type": kind,
                    "Properties": rewrite_references(properties, &reference),
                });
                (logical_id(&kind, key.name()), entry)
            })
            .collect();

        Ok(json!({ "Resources": entries }))
    }
}

/// Logical ids may only contain ASCII letters and digits, e.g.
/// `AWSEC2VPCmain` for the VPC named `main`.
fn logical_id(kind: &str, name: &str) -> String {
    kind.chars()
        .chain(name.chars())
        .filter(char::is_ascii_alphanumeric)
        .collect()
}

impl<C> Target<C> for CloudFormationTarget {
    fn name(&self) -> &'static str {
        "cloudformation"
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
            "cloudformation output cannot delete {}",
            deletion.key()
        )))
    }

    fn finish(&self, graph: &TaskGraph<C>) -> Result<(), TargetError> {
        write_json(&self.out_dir, FILE_NAME, &self.document(graph)?)?;
        info!(path = %self.output_path(), "wrote cloudformation");
        Ok(())
    }
}
