//! Tasks and their resources

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::component::{EnvEntry, ImageSpec, PortSpec, ResourceRequest};
use super::volume::{MountSpec, VolumeSpec};

/// A named unit of work grouping one or more resources
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    /// Task name, unique within the app
    pub name: String,

    /// Extra labels applied to every object of the task
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Logical sub-components (worker, parameter-server, ...)
    pub resources: Vec<TaskResourceSpec>,

    /// Dataset/model versions pinned for this task
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub revisions: Vec<RevisionPin>,
}

/// A dataset or model version pinned against a volume
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct RevisionPin {
    /// Logical volume name
    pub volume: String,
    /// Version to mount
    pub version: String,
}

/// Container restart policy
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Never restart in place
    #[default]
    Never,
    /// Restart failed containers
    OnFailure,
    /// Always restart
    Always,
}

impl RestartPolicy {
    /// Platform string for pod specs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Never => "Never",
            Self::OnFailure => "OnFailure",
            Self::Always => "Always",
        }
    }

    /// Jobs reject `Always`; it degrades to `OnFailure`
    pub fn for_job(&self) -> &'static str {
        match self {
            Self::Never => "Never",
            Self::OnFailure | Self::Always => "OnFailure",
        }
    }
}

/// How the completion of a replicated resource is decided
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DoneCondition {
    /// Every replica must succeed
    #[default]
    AllSucceeded,
    /// The first successful replica completes the set
    AnySucceeded,
}

/// Pins replicas to nodes: replica `i` runs on `nodes[i]`
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct NodeAllocator {
    /// Ordered node names
    #[serde(default)]
    pub nodes: Vec<String>,
}

impl NodeAllocator {
    /// Node assigned to a replica, if any
    pub fn node_for(&self, index: u32) -> Option<&str> {
        self.nodes.get(index as usize).map(String::as_str)
    }
}

/// A logical sub-component of a task
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskResourceSpec {
    /// Resource name, unique within the task
    pub name: String,

    /// Replica count; more than one fans out into a worker set
    #[serde(default = "default_replicas")]
    pub replicas: u32,

    /// Container restart policy
    #[serde(default)]
    pub restart_policy: RestartPolicy,

    /// How often a failed replica may be recreated (configured default when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_restarts: Option<u32>,

    /// Tolerate replicas that exhaust their restarts
    #[serde(default)]
    pub allow_fail: bool,

    /// Container image
    pub image: ImageSpec,

    /// Entrypoint override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,

    /// Arguments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,

    /// Working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,

    /// Environment
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvEntry>,

    /// Compute request
    #[serde(default)]
    pub resources: ResourceRequest,

    /// Volume mounts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<MountSpec>,

    /// Per-resource volume declarations (git revisions for mounted repositories)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeSpec>,

    /// Dataset/model versions pinned for this resource only
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub revisions: Vec<RevisionPin>,

    /// Node pinning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocator: Option<NodeAllocator>,

    /// Completion rule for replicated resources
    #[serde(default)]
    pub done_condition: DoneCondition,

    /// Ports other replicas connect to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortSpec>,
}

fn default_replicas() -> u32 {
    1
}
