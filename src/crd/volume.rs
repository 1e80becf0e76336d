//! Volume declarations and mounts

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Flex option naming the artifact type (`dataset` or `model`)
pub const FLEX_OPTION_TYPE: &str = "type";
/// Flex option carrying the pinned artifact version
pub const FLEX_OPTION_VERSION: &str = "version";
/// Flex option naming the artifact (defaults to the volume name)
pub const FLEX_OPTION_NAME: &str = "name";

/// A logical volume with exactly one backing source
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    /// Volume name, unique within the app
    pub name: String,

    /// Directory on the node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<HostPathSource>,

    /// Git repository checkout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitSource>,

    /// Network file share
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nfs: Option<NfsSource>,

    /// Existing persistent volume claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc: Option<PvcSource>,

    /// Scratch directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_dir: Option<EmptyDirSource>,

    /// External flex driver (datasets, models)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flex: Option<FlexSource>,

    /// Contributes its mount path to PYTHONPATH
    #[serde(default)]
    pub is_lib_dir: bool,

    /// Mount path is exported as TRAIN_LOG_DIR
    #[serde(default)]
    pub is_train_log_dir: bool,

    /// Default mount path (`/mnt/<name>` when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_path: Option<String>,

    /// Default sub-path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,
}

/// Host path source
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct HostPathSource {
    /// Path on the node
    pub path: String,
}

/// Git repository source
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct GitSource {
    /// Repository URL
    pub repository: String,
    /// Target directory inside the volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    /// Commit, tag or branch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

/// Network file share source
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NfsSource {
    /// Server host
    pub server: String,
    /// Exported path
    pub path: String,
    /// Mount read-only
    #[serde(default)]
    pub read_only: bool,
}

/// Persistent volume claim source
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PvcSource {
    /// Claim name
    pub claim_name: String,
    /// Mount read-only
    #[serde(default)]
    pub read_only: bool,
}

/// Scratch directory source
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EmptyDirSource {
    /// Storage medium ("Memory" for tmpfs)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medium: Option<String>,
    /// Size limit quantity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_limit: Option<String>,
}

/// External flex volume source
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct FlexSource {
    /// Driver name
    pub driver: String,
    /// Driver options, e.g. `{type: dataset, version: v3}`
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl FlexSource {
    /// Artifact type when the volume carries a dataset or model
    pub fn artifact_type(&self) -> Option<&str> {
        self.options
            .get(FLEX_OPTION_TYPE)
            .map(String::as_str)
            .filter(|t| matches!(*t, "dataset" | "model"))
    }
}

impl VolumeSpec {
    /// Number of backing sources declared
    pub fn source_count(&self) -> usize {
        [
            self.host_path.is_some(),
            self.git.is_some(),
            self.nfs.is_some(),
            self.pvc.is_some(),
            self.empty_dir.is_some(),
            self.flex.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count()
    }

    /// Mount path used when a mount does not override it
    pub fn default_mount_path(&self) -> String {
        self.mount_path
            .clone()
            .unwrap_or_else(|| format!("/mnt/{}", self.name))
    }

    /// Check exactly one source is declared
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self.source_count() {
            1 => Ok(()),
            0 => Err(crate::Error::validation(format!(
                "volume '{}' declares no source",
                self.name
            ))),
            n => Err(crate::Error::validation(format!(
                "volume '{}' declares {n} sources, expected exactly one",
                self.name
            ))),
        }
    }
}

/// A component's mount of a logical volume
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MountSpec {
    /// Logical volume name
    pub volume: String,

    /// Mount path (defaults to the volume's)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_path: Option<String>,

    /// Sub-path (defaults to the volume's)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,

    /// Mount read-only
    #[serde(default)]
    pub read_only: bool,
}
