//! The App document
//!
//! An `App` is a namespaced custom resource whose spec lists tasks, interactive
//! UI components, model-serving endpoints, volumes and app-level secrets.

mod app;
mod component;
mod task;
mod volume;

pub use app::{App, AppSpec, SecretSpec};
pub use component::{
    AutoscaleSpec, EnvEntry, ImageSpec, PortSpec, ResourceQuantity, ResourceRequest,
    SecretKeyRef, ServingSpec, UixSpec,
};
pub use task::{
    DoneCondition, NodeAllocator, RestartPolicy, RevisionPin, TaskResourceSpec, TaskSpec,
};
pub use volume::{
    EmptyDirSource, FlexSource, GitSource, HostPathSource, MountSpec, NfsSource, PvcSource,
    VolumeSpec, FLEX_OPTION_NAME, FLEX_OPTION_TYPE, FLEX_OPTION_VERSION,
};
