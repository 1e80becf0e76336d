//! Dataset and model revision pinning
//!
//! Runs once per task before it is compiled. Explicit task pins are written
//! into the app's flex volume options first; every dataset/model volume the
//! task mounts is then resolved to a concrete version (its pin, or whatever
//! the catalog reports as current) and the version is written back into both
//! the volume record and the task's revision list.

use std::collections::{BTreeMap, BTreeSet};

#[cfg(test)]
use mockall::automock;

use crate::crd::{AppSpec, RevisionPin, FLEX_OPTION_NAME, FLEX_OPTION_VERSION};
use crate::{Error, Result};

/// Source of the current version of datasets and models
#[cfg_attr(test, automock)]
pub trait RevisionCatalog: Send + Sync {
    /// Current version of an artifact; `None` when the catalog has none
    fn current_version(&self, artifact_type: &str, name: &str) -> Result<Option<String>>;
}

/// Catalog backed by a fixed `<type>/<name> -> version` map
#[derive(Clone, Debug, Default)]
pub struct StaticCatalog {
    versions: BTreeMap<String, String>,
}

impl StaticCatalog {
    /// Build a catalog from `<type>/<name>` keys
    pub fn new(versions: BTreeMap<String, String>) -> Self {
        Self { versions }
    }
}

impl RevisionCatalog for StaticCatalog {
    fn current_version(&self, artifact_type: &str, name: &str) -> Result<Option<String>> {
        Ok(self.versions.get(&format!("{artifact_type}/{name}")).cloned())
    }
}

/// Pin and resolve revisions for one task
pub fn inject_task_revisions(
    spec: &mut AppSpec,
    task_index: usize,
    catalog: &dyn RevisionCatalog,
) -> Result<()> {
    let AppSpec { tasks, volumes, .. } = spec;
    let task = tasks
        .get_mut(task_index)
        .ok_or_else(|| Error::validation(format!("no task at index {task_index}")))?;

    for pin in &task.revisions {
        if let Some(flex) = volumes
            .iter_mut()
            .find(|v| v.name == pin.volume)
            .and_then(|v| v.flex.as_mut())
        {
            flex.options
                .insert(FLEX_OPTION_VERSION.to_string(), pin.version.clone());
        }
    }

    let mounted: BTreeSet<&str> = task
        .resources
        .iter()
        .flat_map(|r| r.mounts.iter().map(|m| m.volume.as_str()))
        .collect();

    for volume in volumes.iter_mut() {
        if !mounted.contains(volume.name.as_str()) {
            continue;
        }
        let Some(flex) = volume.flex.as_mut() else {
            continue;
        };
        let Some(artifact_type) = flex.artifact_type().map(str::to_string) else {
            continue;
        };

        let version = match flex.options.get(FLEX_OPTION_VERSION) {
            Some(v) => Some(v.clone()),
            None => {
                let name = flex
                    .options
                    .get(FLEX_OPTION_NAME)
                    .cloned()
                    .unwrap_or_else(|| volume.name.clone());
                catalog
                    .current_version(&artifact_type, &name)
                    .map_err(|e| e.in_component(&task.name))?
            }
        };
        let Some(version) = version else {
            tracing::debug!(task = %task.name, volume = %volume.name, "no current version in catalog");
            continue;
        };

        flex.options
            .insert(FLEX_OPTION_VERSION.to_string(), version.clone());
        match task.revisions.iter_mut().find(|p| p.volume == volume.name) {
            Some(pin) => pin.version = version,
            None => task.revisions.push(RevisionPin {
                volume: volume.name.clone(),
                version,
            }),
        }
    }

    Ok(())
}
