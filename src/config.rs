//! Compiler configuration
//!
//! Loaded from a YAML file; the CLI overrides individual fields from flags or
//! `TRELLIS_*` environment variables. Everything not set falls back to the
//! defaults below.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::crd::SecretKeyRef;
use crate::limits::ResourceLimit;
use crate::telemetry::LogFormat;
use crate::{Error, Result};

/// Default extended resource name for dedicated accelerators
pub const DEFAULT_GPU_RESOURCE: &str = "nvidia.com/gpu";
/// Default port of the implicit serving metrics endpoint
pub const DEFAULT_METRICS_PORT: u16 = 9091;
/// Default field manager for API writes
pub const DEFAULT_FIELD_MANAGER: &str = "trellis";

/// Name and id of a project or workspace
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Identity {
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Identifier
    #[serde(default)]
    pub id: String,
}

/// Settings shared by every compilation pass
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompilerConfig {
    /// Target namespace
    #[serde(default)]
    pub namespace: String,

    /// Build / job id stamped on every object
    #[serde(default)]
    pub build_id: String,

    /// Owning project
    #[serde(default)]
    pub project: Identity,

    /// Owning workspace
    #[serde(default)]
    pub workspace: Identity,

    /// Secret key holding the workspace credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_secret: Option<SecretKeyRef>,

    /// Account service URL exported to workloads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dealer_url: Option<String>,

    /// Root of the URL prefix for UI and serving components
    #[serde(default = "default_url_prefix")]
    pub url_prefix: String,

    /// Extended resource name for dedicated accelerators
    #[serde(default = "default_gpu_resource")]
    pub gpu_resource: String,

    /// Extended resource name for shared accelerators
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_gpu_resource: Option<String>,

    /// Cluster-wide ceiling
    #[serde(default)]
    pub cluster_limit: ResourceLimit,

    /// Workspace quota served when no account service is consulted
    #[serde(default)]
    pub workspace_limit: ResourceLimit,

    /// Port of the implicit serving metrics endpoint
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Field manager for API writes
    #[serde(default = "default_field_manager")]
    pub field_manager: String,

    /// Restart budget for task resources that declare none
    #[serde(default)]
    pub default_max_restarts: u32,

    /// Current artifact versions, keyed `<type>/<name>`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub revisions: BTreeMap<String, String>,

    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_url_prefix() -> String {
    "/".to_string()
}

fn default_gpu_resource() -> String {
    DEFAULT_GPU_RESOURCE.to_string()
}

fn default_metrics_port() -> u16 {
    DEFAULT_METRICS_PORT
}

fn default_field_manager() -> String {
    DEFAULT_FIELD_MANAGER.to_string()
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            build_id: String::new(),
            project: Identity::default(),
            workspace: Identity::default(),
            workspace_secret: None,
            dealer_url: None,
            url_prefix: default_url_prefix(),
            gpu_resource: default_gpu_resource(),
            shared_gpu_resource: None,
            cluster_limit: ResourceLimit::default(),
            workspace_limit: ResourceLimit::default(),
            metrics_port: DEFAULT_METRICS_PORT,
            field_manager: default_field_manager(),
            default_max_restarts: 0,
            revisions: BTreeMap::new(),
            log_format: LogFormat::default(),
        }
    }
}

impl CompilerConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_yaml(&data)
            .map_err(|e| Error::config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Parse configuration from YAML
    pub fn from_yaml(data: &str) -> Result<Self> {
        serde_yaml::from_str(data).map_err(|e| Error::config(e.to_string()))
    }

    /// Reject configurations no compilation can succeed with
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(Error::config("namespace must be set"));
        }
        if self.build_id.is_empty() {
            return Err(Error::config("build id must be set"));
        }
        if self.gpu_resource.is_empty() {
            return Err(Error::config("gpu resource name cannot be empty"));
        }
        if self.metrics_port == 0 {
            return Err(Error::config("metrics port cannot be 0"));
        }
        Ok(())
    }

    /// Extended resource name for a dedicated or shared accelerator
    pub fn gpu_resource_for(&self, shared: bool) -> &str {
        match (&self.shared_gpu_resource, shared) {
            (Some(name), true) => name,
            _ => &self.gpu_resource,
        }
    }
}
