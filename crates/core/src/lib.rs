//! Charter core types: charts, plans, credential documents and operation states.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use kube::config::Kubeconfig;
use serde::{Deserialize, Serialize};

pub mod naming;
pub mod value;

pub use value::{Document, Value};

/// A configuration variant of a chart.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub name: String,
    pub description: String,
    /// Catalog bullets; `None` lets the catalog fall back to `[description]`.
    pub bullets: Option<Vec<String>>,
    pub bindable: bool,
    pub free: bool,
    /// Raw YAML merged into the install as plan defaults.
    pub values: Vec<u8>,
    /// Access configuration of a dedicated cluster, when the plan has one.
    pub cluster_config: Option<Kubeconfig>,
}

impl Plan {
    /// True when the plan targets its own cluster instead of the broker default.
    pub fn has_cluster(&self) -> bool {
        self.cluster_config.as_ref().map(|c| !c.clusters.is_empty()).unwrap_or(false)
    }

    pub fn catalog_bullets(&self) -> Vec<String> {
        match &self.bullets {
            Some(b) => b.clone(),
            None => vec![self.description.clone()],
        }
    }
}

/// A loaded chart descriptor. Identity is `name`.
#[derive(Debug, Clone, Default)]
pub struct Chart {
    pub name: String,
    pub version: String,
    pub description: String,
    pub icon: Option<String>,
    pub home: Option<String>,
    /// Directory holding the unpacked chart, handed to the release client.
    pub path: std::path::PathBuf,
    pub plans: BTreeMap<String, Plan>,
    /// Template rendered against live secrets/services on bind.
    pub bind_template: Option<String>,
}

impl Chart {
    pub fn service_id(&self) -> String { naming::service_id(&self.name) }

    pub fn plan(&self, name: &str) -> Option<&Plan> { self.plans.get(name) }
}

/// Kind of asynchronous operation carried through the polling protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Provision,
    Deprovision,
    Update,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Provision => "provision",
            OperationKind::Deprovision => "deprovision",
            OperationKind::Update => "update",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown operation data: {0:?}")]
pub struct UnknownOperation(pub String);

impl FromStr for OperationKind {
    type Err = UnknownOperation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provision" => Ok(OperationKind::Provision),
            "deprovision" => Ok(OperationKind::Deprovision),
            "update" => Ok(OperationKind::Update),
            other => Err(UnknownOperation(other.to_string())),
        }
    }
}

/// Broker-visible state of an asynchronous operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationState {
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "succeeded")]
    Succeeded,
    #[serde(rename = "failed")]
    Failed,
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationState::InProgress => "in progress",
            OperationState::Succeeded => "succeeded",
            OperationState::Failed => "failed",
        })
    }
}

/// Answer to a poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastOperation {
    pub state: OperationState,
    pub description: String,
}

impl LastOperation {
    pub fn new(state: OperationState, description: impl Into<String>) -> Self {
        Self { state, description: description.into() }
    }
}
