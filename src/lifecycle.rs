//! Lifecycle policies and the phase switches that pick them.
//!
//! A [`Lifecycle`] decides whether a task may mutate the resource it
//! describes, must merely find it, or is skipped altogether. Producers
//! usually don't pick lifecycles one by one; they group their tasks into
//! network, security and cluster tasks and ask [`PhaseLifecycles::resolve`]
//! which lifecycle each group gets for the current [`Phase`] and target.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Per-task policy governing whether and how a resource is reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Lifecycle {
    /// Create, update or delete the resource to match the task.
    #[default]
    Sync,
    /// The resource should exist; log a warning when it is missing or
    /// differs, but never change it.
    ExistsAndWarnIfChanges,
    /// The resource must exist and match. A missing resource fails the run.
    ExistsAndValidates,
    /// Skip the task entirely, neither finding nor rendering it.
    Ignore,
    /// Like `Sync`, but an access-denied error is downgraded to a warning.
    WarnIfInsufficientAccess,
}

impl Lifecycle {
    /// Whether the engine may ever call `render` for this lifecycle.
    pub fn allows_mutation(self) -> bool {
        matches!(self, Self::Sync | Self::WarnIfInsufficientAccess)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "Sync",
            Self::ExistsAndWarnIfChanges => "ExistsAndWarnIfChanges",
            Self::ExistsAndValidates => "ExistsAndValidates",
            Self::Ignore => "Ignore",
            Self::WarnIfInsufficientAccess => "WarnIfInsufficientAccess",
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Lifecycle {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            Self::Sync,
            Self::ExistsAndWarnIfChanges,
            Self::ExistsAndValidates,
            Self::Ignore,
            Self::WarnIfInsufficientAccess,
        ]
        .into_iter()
        .find(|lifecycle| lifecycle.as_str().eq_ignore_ascii_case(s))
        .ok_or_else(|| ConfigError::UnknownLifecycle(s.to_string()))
    }
}

/// Lifecycle overrides keyed by task kind, e.g. `internet_gateway` →
/// `ExistsAndWarnIfChanges`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleOverrides(HashMap<String, Lifecycle>);

impl LifecycleOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: impl Into<String>, lifecycle: Lifecycle) -> Self {
        self.insert(kind, lifecycle);
        self
    }

    pub fn insert(&mut self, kind: impl Into<String>, lifecycle: Lifecycle) {
        self.0.insert(kind.into(), lifecycle);
    }

    pub fn get(&self, kind: &str) -> Option<Lifecycle> {
        self.0.get(kind).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parses `kind=Lifecycle` pairs, as passed on a command line.
    pub fn parse<'a>(pairs: impl IntoIterator<Item = &'a str>) -> Result<Self, ConfigError> {
        let mut overrides = Self::new();
        for pair in pairs {
            let (kind, lifecycle) = pair
                .split_once('=')
                .ok_or_else(|| ConfigError::MalformedOverride(pair.to_string()))?;
            overrides.insert(kind.trim(), lifecycle.trim().parse()?);
        }
        Ok(overrides)
    }
}

/// Where the changes of one run go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetKind {
    /// Call the cloud API directly.
    Direct,
    /// Emit a Terraform configuration.
    Terraform,
    /// Emit a CloudFormation template.
    CloudFormation,
    /// Compute and print the changes without applying them.
    DryRun,
}

impl TargetKind {
    /// IaC generation starts from a blank slate: existing resources are
    /// neither looked up nor deleted.
    pub fn check_existing(self) -> bool {
        matches!(self, Self::Direct | Self::DryRun)
    }
}

impl FromStr for TargetKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Self::Direct),
            "terraform" => Ok(Self::Terraform),
            "cloudformation" => Ok(Self::CloudFormation),
            "dryrun" => Ok(Self::DryRun),
            other => Err(ConfigError::UnknownTarget(other.to_string())),
        }
    }
}

/// A slice of the cluster to reconcile in one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Phase {
    /// Everything.
    #[default]
    All,
    Network,
    Security,
    Cluster,
}

impl FromStr for Phase {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "all" => Ok(Self::All),
            "network" => Ok(Self::Network),
            "security" => Ok(Self::Security),
            "cluster" => Ok(Self::Cluster),
            other => Err(ConfigError::UnknownPhase(other.to_string())),
        }
    }
}

/// Lifecycles for the three task groups producers emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseLifecycles {
    pub network: Lifecycle,
    pub security: Lifecycle,
    pub cluster: Lifecycle,
}

impl PhaseLifecycles {
    /// Picks the lifecycles for a phase.
    ///
    /// `assets_only` runs exist only to enumerate the files and images a
    /// cluster needs, so every group is ignored.
    pub fn resolve(phase: Phase, target: TargetKind, assets_only: bool) -> Self {
        use Lifecycle::*;

        if assets_only {
            return Self {
                network: Ignore,
                security: Ignore,
                cluster: Ignore,
            };
        }

        match phase {
            Phase::All => Self {
                network: Sync,
                security: Sync,
                cluster: Sync,
            },
            Phase::Network => Self {
                network: Sync,
                security: Ignore,
                cluster: Ignore,
            },
            Phase::Security => Self {
                network: ExistsAndWarnIfChanges,
                security: Sync,
                cluster: Ignore,
            },
            Phase::Cluster if target == TargetKind::DryRun => Self {
                network: ExistsAndWarnIfChanges,
                security: ExistsAndWarnIfChanges,
                cluster: Sync,
            },
            Phase::Cluster => Self {
                network: ExistsAndValidates,
                security: ExistsAndValidates,
                cluster: Sync,
            },
        }
    }
}
