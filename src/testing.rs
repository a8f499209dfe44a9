//! An in-memory cloud and a handful of network tasks for the unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::blueprint::TaskMap;
use crate::context::Context;
use crate::core::TaskKey;
use crate::deletion::{ExistingResource, Inventory};
use crate::engine::{AnyTask, Delta, Kind, Task, TaskRef, references_in};
use crate::error::TaskError;
use crate::impl_references;
use crate::lifecycle::Lifecycle;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Mutation {
    Create(TaskKey),
    Update(TaskKey, Vec<String>),
    Delete(TaskKey),
}

/// What the fake does the next time a resource is written.
#[derive(Debug, Clone)]
pub(crate) enum Failure {
    Terminal,
    Fatal,
    AccessDenied,
    /// Fail this many times, then succeed.
    Transient { times: u32 },
    Panic,
    /// Succeed, slowly.
    Slow(Duration),
}

#[derive(Default)]
pub(crate) struct FakeCloud {
    resources: Mutex<BTreeMap<TaskKey, Value>>,
    log: Mutex<Vec<Mutation>>,
    failures: Mutex<HashMap<TaskKey, Failure>>,
    finds: Mutex<HashMap<TaskKey, usize>>,
    next_id: AtomicU64,
}

impl FakeCloud {
    /// Stores a resource as if an earlier run had created it.
    pub fn seed<T: Task<FakeCloud>>(&self, resource: T) {
        let key = AnyTask::<FakeCloud>::key(&resource);
        let value = serde_json::to_value(&resource).unwrap();
        self.resources.lock().unwrap().insert(key, value);
    }

    pub fn fail(&self, key: TaskKey, failure: Failure) {
        self.failures.lock().unwrap().insert(key, failure);
    }

    pub fn stored<T: DeserializeOwned>(&self, key: &TaskKey) -> Option<T> {
        let value = self.resources.lock().unwrap().get(key).cloned()?;
        Some(serde_json::from_value(value).unwrap())
    }

    pub fn keys(&self) -> Vec<TaskKey> {
        self.resources.lock().unwrap().keys().cloned().collect()
    }

    pub fn mutations(&self) -> Vec<Mutation> {
        self.log.lock().unwrap().clone()
    }

    pub fn finds(&self, key: &TaskKey) -> usize {
        self.finds.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    pub fn register_inventories(&self, map: &mut TaskMap<FakeCloud>) {
        for kind in [Vpc::KIND, Subnet::KIND, Instance::KIND, SecurityGroup::KIND] {
            map.register_inventory(FakeInventory { kind });
        }
    }

    fn lookup<T: DeserializeOwned>(&self, key: &TaskKey) -> Result<Option<T>, TaskError> {
        *self.finds.lock().unwrap().entry(key.clone()).or_default() += 1;
        let value = self.resources.lock().unwrap().get(key).cloned();
        value
            .map(serde_json::from_value)
            .transpose()
            .map_err(TaskError::terminal)
    }

    fn apply<T>(&self, key: &TaskKey, desired: &T, delta: &Delta) -> Result<T, TaskError>
    where
        T: Serialize + DeserializeOwned,
    {
        self.inject(key)?;

        let mut value = serde_json::to_value(desired).map_err(TaskError::terminal)?;
        let mut resources = self.resources.lock().unwrap();
        let existing = resources.get(key);

        // Unset fields keep whatever the resource already has.
        if let (Some(existing), Value::Object(fields)) = (existing, &mut value) {
            for (field, current) in fields.iter_mut() {
                if current.is_null()
                    && let Some(kept) = existing.get(field)
                {
                    *current = kept.clone();
                }
            }
        }
        if value["id"].is_null() {
            let n = self.next_id.fetch_add(1, Ordering::SeqCst);
            value["id"] = Value::String(format!("{}-{n}", key.kind()));
        }

        let mutation = if existing.is_some() {
            Mutation::Update(key.clone(), delta.changed_fields())
        } else {
            Mutation::Create(key.clone())
        };
        resources.insert(key.clone(), value.clone());
        self.log.lock().unwrap().push(mutation);

        serde_json::from_value(value).map_err(TaskError::terminal)
    }

    fn remove(&self, key: &TaskKey) -> Result<(), TaskError> {
        self.inject(key)?;
        self.resources.lock().unwrap().remove(key);
        self.log.lock().unwrap().push(Mutation::Delete(key.clone()));
        Ok(())
    }

    fn inject(&self, key: &TaskKey) -> Result<(), TaskError> {
        let failure = match self.failures.lock().unwrap().get_mut(key) {
            Some(Failure::Transient { times: 0 }) | None => None,
            Some(Failure::Transient { times }) => {
                *times -= 1;
                Some(Failure::Transient { times: *times })
            }
            Some(failure) => Some(failure.clone()),
        };

        match failure {
            None => Ok(()),
            Some(Failure::Terminal) => Err(TaskError::terminal(anyhow!("{key}: invalid request"))),
            Some(Failure::Fatal) => Err(TaskError::fatal(anyhow!("{key}: credentials expired"))),
            Some(Failure::AccessDenied) => {
                Err(TaskError::access_denied(anyhow!("{key}: not authorized")))
            }
            Some(Failure::Transient { .. }) => {
                Err(TaskError::transient(anyhow!("{key}: request throttled")))
            }
            Some(Failure::Panic) => panic!("{key}: the fake fell over"),
            Some(Failure::Slow(delay)) => {
                thread::sleep(delay);
                Ok(())
            }
        }
    }
}

/// Keys of every mutated resource, in mutation order.
pub(crate) fn mutation_keys(mutations: &[Mutation]) -> Vec<TaskKey> {
    mutations
        .iter()
        .map(|mutation| match mutation {
            Mutation::Create(key) | Mutation::Update(key, _) | Mutation::Delete(key) => key.clone(),
        })
        .collect()
}

struct FakeInventory {
    kind: &'static str,
}

impl Inventory<FakeCloud> for FakeInventory {
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn list(&self, cloud: &FakeCloud) -> Result<Vec<ExistingResource>, TaskError> {
        let resources = cloud.resources.lock().unwrap();
        Ok(resources
            .iter()
            .filter(|(key, _)| key.kind() == self.kind)
            .map(|(key, value)| ExistingResource {
                key: key.clone(),
                id: value["id"].as_str().unwrap_or_default().to_string(),
                depends_on: references_in(value),
            })
            .collect())
    }

    fn delete(
        &self,
        ctx: &Context<'_, FakeCloud>,
        resource: &ExistingResource,
    ) -> Result<(), TaskError> {
        ctx.cloud.remove(&resource.key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Vpc {
    pub name: String,
    pub cidr: String,
    pub id: Option<String>,
    #[serde(skip)]
    pub lifecycle: Lifecycle,
}

impl_references!(Vpc {
    name,
    cidr,
    id,
    lifecycle
});

impl Vpc {
    pub fn new(name: impl Into<String>, cidr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cidr: cidr.into(),
            id: None,
            lifecycle: Lifecycle::Sync,
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_lifecycle(mut self, lifecycle: Lifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }
}

impl Kind for Vpc {
    const KIND: &'static str = "vpc";
}

impl Task<FakeCloud> for Vpc {
    fn name(&self) -> &str {
        &self.name
    }

    fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    fn find(&self, ctx: &Context<'_, FakeCloud>) -> Result<Option<Self>, TaskError> {
        ctx.cloud.lookup(ctx.key())
    }

    fn check_changes(&self, actual: Option<&Self>, delta: &Delta) -> Result<(), TaskError> {
        if actual.is_some() && delta.changed("cidr") {
            return Err(TaskError::terminal(anyhow!("the CIDR of a VPC cannot change")));
        }
        Ok(())
    }

    fn render_direct(
        &self,
        ctx: &Context<'_, FakeCloud>,
        _actual: Option<&Self>,
        delta: &Delta,
    ) -> Result<Self, TaskError> {
        ctx.cloud.apply(ctx.key(), self, delta)
    }

    fn terraform_type(&self) -> &'static str {
        "aws_vpc"
    }

    fn cloudformation_type(&self) -> &'static str {
        "AWS::EC2::VPC"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Subnet {
    pub name: String,
    pub cidr: String,
    pub vpc: TaskRef<Vpc>,
    pub vpc_id: Option<String>,
    pub id: Option<String>,
    #[serde(skip)]
    pub lifecycle: Lifecycle,
}

impl_references!(Subnet {
    name,
    cidr,
    vpc,
    vpc_id,
    id,
    lifecycle
});

impl Subnet {
    pub fn new(name: impl Into<String>, cidr: impl Into<String>, vpc: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cidr: cidr.into(),
            vpc: TaskRef::named(vpc),
            vpc_id: None,
            id: None,
            lifecycle: Lifecycle::Sync,
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_vpc_id(mut self, vpc_id: &str) -> Self {
        self.vpc_id = Some(vpc_id.into());
        self
    }

    pub fn with_lifecycle(mut self, lifecycle: Lifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }
}

impl Kind for Subnet {
    const KIND: &'static str = "subnet";
}

impl Task<FakeCloud> for Subnet {
    fn name(&self) -> &str {
        &self.name
    }

    fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    fn desired(&self, ctx: &Context<'_, FakeCloud>) -> Result<Self, TaskError> {
        let vpc = ctx.resolve(&self.vpc)?;
        Ok(Self {
            vpc_id: vpc.id.clone().or_else(|| self.vpc_id.clone()),
            ..self.clone()
        })
    }

    fn find(&self, ctx: &Context<'_, FakeCloud>) -> Result<Option<Self>, TaskError> {
        ctx.cloud.lookup(ctx.key())
    }

    fn render_direct(
        &self,
        ctx: &Context<'_, FakeCloud>,
        _actual: Option<&Self>,
        delta: &Delta,
    ) -> Result<Self, TaskError> {
        ctx.cloud.apply(ctx.key(), self, delta)
    }

    fn terraform_type(&self) -> &'static str {
        "aws_subnet"
    }

    fn cloudformation_type(&self) -> &'static str {
        "AWS::EC2::Subnet"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Instance {
    pub name: String,
    pub instance_type: String,
    pub subnet: TaskRef<Subnet>,
    pub subnet_id: Option<String>,
    pub security_groups: Vec<TaskRef<SecurityGroup>>,
    pub id: Option<String>,
    #[serde(skip)]
    pub lifecycle: Lifecycle,
}

impl_references!(Instance {
    name,
    instance_type,
    subnet,
    subnet_id,
    security_groups,
    id,
    lifecycle
});

impl Instance {
    pub fn new(name: impl Into<String>, subnet: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance_type: "t3.micro".into(),
            subnet: TaskRef::named(subnet),
            subnet_id: None,
            security_groups: Vec::new(),
            id: None,
            lifecycle: Lifecycle::Sync,
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_subnet_id(mut self, subnet_id: &str) -> Self {
        self.subnet_id = Some(subnet_id.into());
        self
    }

    pub fn with_instance_type(mut self, instance_type: &str) -> Self {
        self.instance_type = instance_type.into();
        self
    }

    pub fn with_security_group(mut self, group: &str) -> Self {
        self.security_groups.push(TaskRef::named(group));
        self
    }

    pub fn with_lifecycle(mut self, lifecycle: Lifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }
}

impl Kind for Instance {
    const KIND: &'static str = "instance";
}

impl Task<FakeCloud> for Instance {
    fn name(&self) -> &str {
        &self.name
    }

    fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    fn desired(&self, ctx: &Context<'_, FakeCloud>) -> Result<Self, TaskError> {
        let subnet = ctx.resolve(&self.subnet)?;
        Ok(Self {
            subnet_id: subnet.id.clone().or_else(|| self.subnet_id.clone()),
            ..self.clone()
        })
    }

    fn find(&self, ctx: &Context<'_, FakeCloud>) -> Result<Option<Self>, TaskError> {
        ctx.cloud.lookup(ctx.key())
    }

    fn render_direct(
        &self,
        ctx: &Context<'_, FakeCloud>,
        _actual: Option<&Self>,
        delta: &Delta,
    ) -> Result<Self, TaskError> {
        ctx.cloud.apply(ctx.key(), self, delta)
    }

    fn terraform_type(&self) -> &'static str {
        "aws_instance"
    }

    fn cloudformation_type(&self) -> &'static str {
        "AWS::EC2::Instance"
    }
}

/// A security group that admits traffic from other groups. Groups may admit
/// each other, so those references are soft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct SecurityGroup {
    pub name: String,
    pub vpc: TaskRef<Vpc>,
    pub allow_from: Vec<TaskRef<SecurityGroup>>,
    pub peer_ids: Option<Vec<String>>,
    pub id: Option<String>,
}

impl_references!(SecurityGroup {
    name,
    vpc,
    allow_from,
    peer_ids,
    id
});

impl SecurityGroup {
    pub fn new(name: impl Into<String>, vpc: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vpc: TaskRef::named(vpc),
            allow_from: Vec::new(),
            peer_ids: None,
            id: None,
        }
    }

    pub fn allow_from(mut self, group: &str) -> Self {
        self.allow_from.push(TaskRef::named(group).soft());
        self
    }
}

impl Kind for SecurityGroup {
    const KIND: &'static str = "security_group";
}

impl Task<FakeCloud> for SecurityGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn desired(&self, ctx: &Context<'_, FakeCloud>) -> Result<Self, TaskError> {
        let peer_ids = ctx.try_resolve_all(&self.allow_from).map(|groups| {
            groups
                .iter()
                .filter_map(|group| group.id.clone())
                .collect()
        });
        Ok(Self {
            peer_ids,
            ..self.clone()
        })
    }

    fn find(&self, ctx: &Context<'_, FakeCloud>) -> Result<Option<Self>, TaskError> {
        ctx.cloud.lookup(ctx.key())
    }

    fn render_direct(
        &self,
        ctx: &Context<'_, FakeCloud>,
        _actual: Option<&Self>,
        delta: &Delta,
    ) -> Result<Self, TaskError> {
        ctx.cloud.apply(ctx.key(), self, delta)
    }

    fn terraform_type(&self) -> &'static str {
        "aws_security_group"
    }

    fn cloudformation_type(&self) -> &'static str {
        "AWS::EC2::SecurityGroup"
    }
}

/// A task with nothing behind it, for wiring arbitrary graphs.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct Link {
    pub name: String,
    pub needs: Vec<TaskRef<Link>>,
    #[serde(skip)]
    pub extra: Vec<TaskKey>,
}

impl_references!(Link { name, needs, extra });

impl Link {
    pub fn new(name: &str, needs: impl IntoIterator<Item = &'static str>) -> Self {
        Self {
            name: name.into(),
            needs: needs.into_iter().map(TaskRef::named).collect(),
            extra: Vec::new(),
        }
    }

    pub fn after(mut self, key: TaskKey) -> Self {
        self.extra.push(key);
        self
    }
}

impl Kind for Link {
    const KIND: &'static str = "link";
}

impl Task<FakeCloud> for Link {
    fn name(&self) -> &str {
        &self.name
    }

    fn extra_dependencies(&self) -> Vec<TaskKey> {
        self.extra.clone()
    }

    fn find(&self, _: &Context<'_, FakeCloud>) -> Result<Option<Self>, TaskError> {
        Ok(None)
    }

    fn render_direct(
        &self,
        _: &Context<'_, FakeCloud>,
        _: Option<&Self>,
        _: &Delta,
    ) -> Result<Self, TaskError> {
        Ok(self.clone())
    }
}
