//! Building blocks shared by task resources, UI components and serving endpoints

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::quantity::Quantity;

/// Container image with an optional accelerator build
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    /// Image used when no GPU is resolved
    pub cpu: String,

    /// Image used when at least one GPU is resolved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<String>,
}

impl ImageSpec {
    /// Pick the variant for the resolved accelerator count
    pub fn select(&self, gpu_count: i64) -> &str {
        match &self.gpu {
            Some(gpu) if gpu_count > 0 => gpu,
            _ => &self.cpu,
        }
    }
}

/// CPU and memory quantities
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ResourceQuantity {
    /// CPU quantity (e.g. "500m", "2")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    /// Memory quantity (e.g. "512Mi", "4Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Declared compute request of a component
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequest {
    /// Accelerator count; absent means "whatever the ceiling allows"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<i64>,

    /// Share the accelerator with other workloads instead of owning it
    #[serde(default)]
    pub gpu_shared: bool,

    /// Scheduling requests
    #[serde(default)]
    pub requests: ResourceQuantity,

    /// Hard limits
    #[serde(default)]
    pub limits: ResourceQuantity,
}

impl ResourceRequest {
    /// Check every declared quantity parses
    pub fn validate(&self) -> Result<(), crate::Error> {
        for q in [
            &self.requests.cpu,
            &self.requests.memory,
            &self.limits.cpu,
            &self.limits.memory,
        ]
        .into_iter()
        .flatten()
        {
            Quantity::parse(q)?;
        }
        Ok(())
    }
}

/// Reference to a key of an app-level secret
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct SecretKeyRef {
    /// Secret name
    pub name: String,
    /// Key within the secret
    pub key: String,
}

/// User-declared environment variable
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvEntry {
    /// Variable name
    pub name: String,

    /// Literal value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// Secret key to read the value from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<SecretKeyRef>,
}

/// Network port exposed by a component
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PortSpec {
    /// Port name; generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Service port
    pub port: u16,

    /// Container port (defaults to `port`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,

    /// Protocol (TCP when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

/// Interactive UI component
///
/// Always single-instance and always exposed through a stable Service.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UixSpec {
    /// Component name, unique within the app
    pub name: String,

    /// Human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Extra labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

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

    /// Exposed ports
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortSpec>,

    /// Volume mounts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<super::MountSpec>,
}

/// Autoscaling bounds for a serving endpoint
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutoscaleSpec {
    /// Lower replica bound (default 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,

    /// Upper replica bound (default 5)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<i32>,

    /// Target average CPU utilization in percent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_cpu_utilization: Option<i32>,
}

/// Model-serving endpoint
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServingSpec {
    /// Endpoint name, unique within the app
    pub name: String,

    /// Extra labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

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

    /// Exposed ports; a metrics port is always added
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortSpec>,

    /// Volume mounts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<super::MountSpec>,

    /// Initial replica count
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Horizontal autoscaling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoscale: Option<AutoscaleSpec>,

    /// Pinned model revisions for mounted model volumes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub revisions: Vec<super::RevisionPin>,
}

fn default_replicas() -> i32 {
    1
}
