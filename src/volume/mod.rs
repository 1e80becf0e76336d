//! Volume and mount resolution
//!
//! Logical volumes are reduced to a bound identity derived from their backing
//! source. Declarations sharing an identity collapse into one native volume and
//! every mount referencing any of them is remapped onto it, keeping its own
//! path, sub-path and read-only flag.

mod revision;

pub use revision::{inject_task_revisions, RevisionCatalog, StaticCatalog};

#[cfg(test)]
pub use revision::MockRevisionCatalog;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    EmptyDirVolumeSource, FlexVolumeSource, GitRepoVolumeSource, HostPathVolumeSource,
    NFSVolumeSource, PersistentVolumeClaimVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::compiler::sanitize_dns_label;
use crate::crd::{MountSpec, RevisionPin, VolumeSpec, FLEX_OPTION_VERSION};
use crate::{Error, Result};

/// Read-only view of the app's volumes, keyed by logical name
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VolumeCatalog {
    volumes: BTreeMap<String, VolumeSpec>,
}

impl VolumeCatalog {
    /// Build a catalog from volume declarations
    pub fn new(volumes: &[VolumeSpec]) -> Self {
        Self {
            volumes: volumes
                .iter()
                .map(|v| (v.name.clone(), v.clone()))
                .collect(),
        }
    }

    /// Look up a logical volume
    pub fn get(&self, name: &str) -> Option<&VolumeSpec> {
        self.volumes.get(name)
    }

    /// A copy of the catalog scoped to one component
    ///
    /// Applies the component's own version pins and adopts git revisions from
    /// its per-component volume declarations. A live revision is never
    /// overwritten and the first matching declaration wins.
    pub fn scoped(
        &self,
        mounts: &[MountSpec],
        declarations: &[VolumeSpec],
        pins: &[RevisionPin],
    ) -> Self {
        let mut scoped = self.clone();

        for pin in pins {
            if let Some(flex) = scoped
                .volumes
                .get_mut(&pin.volume)
                .and_then(|v| v.flex.as_mut())
            {
                flex.options
                    .insert(FLEX_OPTION_VERSION.to_string(), pin.version.clone());
            }
        }

        for mount in mounts {
            let Some(git) = scoped
                .volumes
                .get_mut(&mount.volume)
                .and_then(|v| v.git.as_mut())
            else {
                continue;
            };
            if git.revision.is_some() {
                continue;
            }
            git.revision = declarations
                .iter()
                .filter(|d| d.name == mount.volume)
                .find_map(|d| d.git.as_ref().and_then(|g| g.revision.clone()));
        }

        scoped
    }
}

/// Identity of the storage behind a logical volume
pub fn bound_identity(volume: &VolumeSpec) -> String {
    if let Some(nfs) = &volume.nfs {
        let mode = if nfs.read_only { "ro" } else { "rw" };
        return format!("nfs://{}{}:{mode}", nfs.server, nfs.path);
    }
    if let Some(git) = &volume.git {
        return format!(
            "git://{}/{}@{}",
            git.repository,
            git.directory.as_deref().unwrap_or(""),
            git.revision.as_deref().unwrap_or("")
        );
    }
    if let Some(pvc) = &volume.pvc {
        return format!("pvc://{}", pvc.claim_name);
    }
    volume.name.clone()
}

/// A resolved mount with the flags environment assembly needs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountEntry {
    /// Logical volume name
    pub volume: String,
    /// Mount path in the container
    pub mount_path: String,
    /// Contributes to PYTHONPATH
    pub is_lib_dir: bool,
    /// Train log directory
    pub is_train_log_dir: bool,
}

/// Native volumes and mounts for one component
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResolvedVolumes {
    /// Deduplicated pod volumes
    pub volumes: Vec<Volume>,
    /// Container mounts
    pub mounts: Vec<VolumeMount>,
    /// Named mount entries
    pub entries: Vec<MountEntry>,
}

/// Resolve a component's mounts against the catalog
///
/// A mount naming an unknown volume fails the component.
pub fn resolve(
    component: &str,
    mounts: &[MountSpec],
    catalog: &VolumeCatalog,
) -> Result<ResolvedVolumes> {
    let mut resolved = ResolvedVolumes::default();
    // bound identity -> native volume name
    let mut bound: BTreeMap<String, String> = BTreeMap::new();

    for mount in mounts {
        let spec = catalog.get(&mount.volume).ok_or_else(|| {
            Error::compilation(
                component,
                format!("mount references unknown volume '{}'", mount.volume),
            )
        })?;

        let identity = bound_identity(spec);
        let native_name = match bound.get(&identity) {
            Some(name) => name.clone(),
            None => {
                let name = sanitize_dns_label(&spec.name);
                resolved
                    .volumes
                    .push(native_volume(&name, spec).map_err(|e| e.in_component(component))?);
                bound.insert(identity, name.clone());
                name
            }
        };

        let mount_path = mount
            .mount_path
            .clone()
            .unwrap_or_else(|| spec.default_mount_path());
        resolved.mounts.push(VolumeMount {
            name: native_name,
            mount_path: mount_path.clone(),
            sub_path: mount.sub_path.clone().or_else(|| spec.sub_path.clone()),
            read_only: mount.read_only.then_some(true),
            ..Default::default()
        });
        resolved.entries.push(MountEntry {
            volume: spec.name.clone(),
            mount_path,
            is_lib_dir: spec.is_lib_dir,
            is_train_log_dir: spec.is_train_log_dir,
        });
    }

    Ok(resolved)
}

fn native_volume(name: &str, spec: &VolumeSpec) -> Result<Volume> {
    let mut volume = Volume {
        name: name.to_string(),
        ..Default::default()
    };
    if let Some(host) = &spec.host_path {
        volume.host_path = Some(HostPathVolumeSource {
            path: host.path.clone(),
            type_: None,
        });
    } else if let Some(git) = &spec.git {
        volume.git_repo = Some(GitRepoVolumeSource {
            repository: git.repository.clone(),
            directory: git.directory.clone(),
            revision: git.revision.clone(),
        });
    } else if let Some(nfs) = &spec.nfs {
        volume.nfs = Some(NFSVolumeSource {
            server: nfs.server.clone(),
            path: nfs.path.clone(),
            read_only: Some(nfs.read_only),
        });
    } else if let Some(pvc) = &spec.pvc {
        volume.persistent_volume_claim = Some(PersistentVolumeClaimVolumeSource {
            claim_name: pvc.claim_name.clone(),
            read_only: Some(pvc.read_only),
        });
    } else if let Some(empty) = &spec.empty_dir {
        volume.empty_dir = Some(EmptyDirVolumeSource {
            medium: empty.medium.clone(),
            size_limit: empty.size_limit.clone().map(Quantity),
        });
    } else if let Some(flex) = &spec.flex {
        volume.flex_volume = Some(FlexVolumeSource {
            driver: flex.driver.clone(),
            options: (!flex.options.is_empty()).then(|| flex.options.clone()),
            ..Default::default()
        });
    } else {
        return Err(Error::validation(format!(
            "volume '{}' declares no source",
            spec.name
        )));
    }
    Ok(volume)
}
