//! App Custom Resource Definition
//!
//! The App CRD is the declarative input document. Its metadata name scopes
//! every generated object and its labels are copied onto all of them.

use std::collections::{BTreeMap, HashSet};

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::component::{ServingSpec, UixSpec};
use super::task::TaskSpec;
use super::volume::VolumeSpec;
use crate::Error;

/// Specification for an App
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "trellis.dev",
    version = "v1",
    kind = "App",
    plural = "apps",
    namespaced,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AppSpec {
    /// Compute tasks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<TaskSpec>,

    /// Interactive UI components
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uix: Vec<UixSpec>,

    /// Model-serving endpoints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servings: Vec<ServingSpec>,

    /// Logical volumes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeSpec>,

    /// App-level credentials
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<SecretSpec>,
}

/// A named credential materialized as a cluster Secret when referenced
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct SecretSpec {
    /// Secret name
    pub name: String,
    /// String data
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl App {
    /// Parse an App from a YAML (or JSON) document
    pub fn from_yaml(doc: &str) -> Result<Self, Error> {
        serde_yaml::from_str(doc)
            .map_err(|e| Error::serialization_for_kind("App", format!("invalid App document: {e}")))
    }

    /// App name from metadata
    pub fn app_name(&self) -> Result<&str, Error> {
        self.metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::validation("App has no metadata.name"))
    }

    /// App labels from metadata
    pub fn app_labels(&self) -> BTreeMap<String, String> {
        self.metadata.labels.clone().unwrap_or_default()
    }
}

impl AppSpec {
    /// Validate the app document
    ///
    /// Checks name uniqueness across tasks, resources within a task, UI
    /// components, serving endpoints, volumes and secrets, and that every
    /// volume declares exactly one source.
    pub fn validate(&self) -> Result<(), Error> {
        unique("task", self.tasks.iter().map(|t| t.name.as_str()))?;
        for task in &self.tasks {
            if task.resources.is_empty() {
                return Err(Error::validation(format!(
                    "task '{}' declares no resources",
                    task.name
                )));
            }
            unique(
                &format!("resource of task '{}'", task.name),
                task.resources.iter().map(|r| r.name.as_str()),
            )?;
        }
        unique("uix component", self.uix.iter().map(|u| u.name.as_str()))?;
        unique("serving", self.servings.iter().map(|s| s.name.as_str()))?;
        unique("volume", self.volumes.iter().map(|v| v.name.as_str()))?;
        unique("secret", self.secrets.iter().map(|s| s.name.as_str()))?;

        for volume in &self.volumes {
            volume.validate()?;
        }
        Ok(())
    }
}

fn unique<'a>(what: &str, names: impl Iterator<Item = &'a str>) -> Result<(), Error> {
    let mut seen = HashSet::new();
    for name in names {
        if name.is_empty() {
            return Err(Error::validation(format!("{what} name cannot be empty")));
        }
        if !seen.insert(name) {
            return Err(Error::validation(format!("duplicate {what} name '{name}'")));
        }
    }
    Ok(())
}
