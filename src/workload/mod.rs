//! Compiled object graph
//!
//! The compiler emits [`CompiledResource`] graphs: a primary [`ClusterObject`]
//! plus dependents that must exist before it. Every object kind carries the
//! apply strategy the reconciler uses for it:
//!
//! - create-if-absent: Namespace, PersistentVolume(Claim), PodDisruptionBudget, Pod
//! - create-or-update: Service, Secret, ConfigMap, workload controllers, RBAC, HPA
//! - create-or-replace: Job (immutable pod template)
//! - fan-out: [`WorkerSet`], expanded into one pod per replica
//!
//! For object generation, use [`crate::compiler`].

mod autoscaler;
mod worker_set;

pub use autoscaler::{
    generate_autoscaler, target_utilization, DEFAULT_MAX_REPLICAS, DEFAULT_MIN_REPLICAS,
    DEFAULT_TARGET_UTILIZATION,
};
pub use worker_set::{
    pod_phase, replica_index, restart_count, worker_set_phase, WorkerSet, WorkerSetPhase,
    WORKER_SET_API_VERSION, WORKER_SET_KIND,
};

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    ConfigMap, Namespace, PersistentVolume, PersistentVolumeClaim, Pod, Secret, Service,
};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::Resource;
use kube::discovery::ApiResource;

use crate::{Error, Result, ANNOTATION_SPEC_HASH};

/// How the reconciler brings an object to its desired state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyStrategy {
    /// Create when missing, never update
    CreateIfAbsent,
    /// Create when missing, otherwise update in place
    CreateOrUpdate,
    /// Create when missing, otherwise delete and recreate if the upgrade predicate says so
    CreateOrReplace,
    /// Expand into per-replica pods
    FanOut,
}

macro_rules! cluster_objects {
    (@namespaced namespaced) => { true };
    (@namespaced cluster) => { false };
    ($($variant:ident => $strategy:ident, $scope:ident;)*) => {
        /// Kind tag of a [`ClusterObject`]
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum ObjectKind {
            $(
                #[doc = concat!("`", stringify!($variant), "`")]
                $variant,
            )*
            /// Replicated task resource
            WorkerSet,
        }

        /// A platform-native object the reconciler can dispatch
        #[derive(Clone, Debug, PartialEq)]
        pub enum ClusterObject {
            $(
                #[doc = concat!("`", stringify!($variant), "`")]
                $variant(Box<$variant>),
            )*
            /// Replicated task resource
            WorkerSet(Box<WorkerSet>),
        }

        $(
            impl From<$variant> for ClusterObject {
                fn from(object: $variant) -> Self {
                    Self::$variant(Box::new(object))
                }
            }
        )*

        impl From<WorkerSet> for ClusterObject {
            fn from(object: WorkerSet) -> Self {
                Self::WorkerSet(Box::new(object))
            }
        }

        impl ObjectKind {
            /// Apply strategy for this kind
            pub fn strategy(&self) -> ApplyStrategy {
                match self {
                    $(Self::$variant => ApplyStrategy::$strategy,)*
                    Self::WorkerSet => ApplyStrategy::FanOut,
                }
            }

            /// apiVersion of this kind
            pub fn api_version(&self) -> &'static str {
                match self {
                    $(Self::$variant => <$variant as Resource>::API_VERSION,)*
                    Self::WorkerSet => WORKER_SET_API_VERSION,
                }
            }

            /// kind string of this kind
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => <$variant as Resource>::KIND,)*
                    Self::WorkerSet => WORKER_SET_KIND,
                }
            }

            /// True when objects of this kind live in a namespace
            pub fn is_namespaced(&self) -> bool {
                match self {
                    $(Self::$variant => cluster_objects!(@namespaced $scope),)*
                    Self::WorkerSet => true,
                }
            }

            /// Dispatch an `apiVersion`/`kind` pair
            pub fn from_type(api_version: &str, kind: &str) -> Result<Self> {
                $(
                    if api_version == <$variant as Resource>::API_VERSION
                        && kind == <$variant as Resource>::KIND
                    {
                        return Ok(Self::$variant);
                    }
                )*
                Err(Error::unsupported_kind(api_version, kind))
            }

            /// Discovery information for dynamic API calls
            pub fn api_resource(&self) -> Result<ApiResource> {
                match self {
                    $(Self::$variant => Ok(ApiResource::erase::<$variant>(&())),)*
                    Self::WorkerSet => Err(Error::unsupported_kind(
                        WORKER_SET_API_VERSION,
                        WORKER_SET_KIND,
                    )),
                }
            }
        }

        impl ClusterObject {
            /// Kind tag
            pub fn kind(&self) -> ObjectKind {
                match self {
                    $(Self::$variant(_) => ObjectKind::$variant,)*
                    Self::WorkerSet(_) => ObjectKind::WorkerSet,
                }
            }

            /// Object metadata
            pub fn metadata(&self) -> &ObjectMeta {
                match self {
                    $(Self::$variant(o) => &o.metadata,)*
                    Self::WorkerSet(o) => &o.metadata,
                }
            }

            /// Mutable object metadata
            pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
                match self {
                    $(Self::$variant(o) => &mut o.metadata,)*
                    Self::WorkerSet(o) => &mut o.metadata,
                }
            }

            /// Deserialize a native object of a known kind
            pub fn from_value(kind: ObjectKind, value: serde_json::Value) -> Result<Self> {
                match kind {
                    $(
                        ObjectKind::$variant => serde_json::from_value::<$variant>(value)
                            .map(Self::from)
                            .map_err(|e| Error::serialization_for_kind(kind.as_str(), e.to_string())),
                    )*
                    ObjectKind::WorkerSet => Err(Error::unsupported_kind(
                        WORKER_SET_API_VERSION,
                        WORKER_SET_KIND,
                    )),
                }
            }

            /// Serialize, including `apiVersion` and `kind`
            pub fn to_value(&self) -> Result<serde_json::Value> {
                let value = match self {
                    $(Self::$variant(o) => serde_json::to_value(o.as_ref()),)*
                    Self::WorkerSet(o) => serde_json::to_value(o.as_ref()),
                };
                value.map_err(|e| Error::serialization_for_kind(self.kind().as_str(), e.to_string()))
            }
        }
    };
}

cluster_objects! {
    Namespace => CreateIfAbsent, cluster;
    PersistentVolume => CreateIfAbsent, cluster;
    PersistentVolumeClaim => CreateIfAbsent, namespaced;
    PodDisruptionBudget => CreateIfAbsent, namespaced;
    Pod => CreateIfAbsent, namespaced;
    Service => CreateOrUpdate, namespaced;
    Secret => CreateOrUpdate, namespaced;
    ConfigMap => CreateOrUpdate, namespaced;
    StatefulSet => CreateOrUpdate, namespaced;
    DaemonSet => CreateOrUpdate, namespaced;
    Deployment => CreateOrUpdate, namespaced;
    Role => CreateOrUpdate, namespaced;
    ClusterRole => CreateOrUpdate, cluster;
    RoleBinding => CreateOrUpdate, namespaced;
    ClusterRoleBinding => CreateOrUpdate, cluster;
    HorizontalPodAutoscaler => CreateOrUpdate, namespaced;
    Job => CreateOrReplace, namespaced;
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of an object in the cluster
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Kind
    pub kind: ObjectKind,
    /// Namespace (None for cluster-scoped kinds)
    pub namespace: Option<String>,
    /// Name
    pub name: String,
}

impl ObjectKey {
    /// Key of a namespaced object
    pub fn namespaced(kind: ObjectKind, namespace: &str, name: &str) -> Self {
        Self {
            kind,
            namespace: Some(namespace.to_string()),
            name: name.to_string(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

impl ClusterObject {
    /// Object name
    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    /// Object namespace (None for cluster-scoped kinds)
    pub fn namespace(&self) -> Option<&str> {
        if self.kind().is_namespaced() {
            self.metadata().namespace.as_deref()
        } else {
            None
        }
    }

    /// Cluster identity
    pub fn key(&self) -> ObjectKey {
        ObjectKey {
            kind: self.kind(),
            namespace: self.namespace().map(str::to_string),
            name: self.name().to_string(),
        }
    }

    /// Dispatch a raw manifest by its `apiVersion` and `kind`
    pub fn from_manifest(value: serde_json::Value) -> Result<Self> {
        let api_version = value
            .get("apiVersion")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        let kind = value
            .get("kind")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        let kind = ObjectKind::from_type(api_version, kind)?;
        Self::from_value(kind, value)
    }

    /// Place a namespaced object without a namespace into `namespace`
    pub fn with_default_namespace(mut self, namespace: &str) -> Self {
        if self.kind().is_namespaced() && self.metadata().namespace.is_none() {
            self.metadata_mut().namespace = Some(namespace.to_string());
        }
        self
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata()
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }
}

/// Decides whether a live object must be deleted and recreated
///
/// Called with the live object first and the desired object second.
pub type UpgradePredicate = fn(&ClusterObject, &ClusterObject) -> bool;

/// Replace when the pod template hash differs or the live object carries none
pub fn template_changed(live: &ClusterObject, desired: &ClusterObject) -> bool {
    match (
        live.annotation(ANNOTATION_SPEC_HASH),
        desired.annotation(ANNOTATION_SPEC_HASH),
    ) {
        (Some(old), Some(new)) => old != new,
        _ => true,
    }
}

/// A compiled object plus the objects that must exist before it
#[derive(Clone, Debug)]
pub struct CompiledResource {
    /// The object itself
    pub object: ClusterObject,
    /// Objects applied before this one, depth-first
    pub dependents: Vec<CompiledResource>,
    /// Replacement rule for immutable kinds
    pub upgrade: Option<UpgradePredicate>,
}

impl CompiledResource {
    /// Wrap an object with no dependents
    pub fn new(object: impl Into<ClusterObject>) -> Self {
        Self {
            object: object.into(),
            dependents: Vec::new(),
            upgrade: None,
        }
    }

    /// Add a dependent
    pub fn with_dependent(mut self, dependent: CompiledResource) -> Self {
        self.dependents.push(dependent);
        self
    }

    /// Set the upgrade predicate
    pub fn with_upgrade(mut self, predicate: UpgradePredicate) -> Self {
        self.upgrade = Some(predicate);
        self
    }

    /// All nodes of the graph, dependents before the node that owns them
    pub fn apply_order(&self) -> Vec<&CompiledResource> {
        let mut order = Vec::new();
        self.collect_order(&mut order);
        order
    }

    fn collect_order<'a>(&'a self, order: &mut Vec<&'a CompiledResource>) {
        for dependent in &self.dependents {
            dependent.collect_order(order);
        }
        order.push(self);
    }
}
