//! Worker sets: replicated task resources built on plain pods
//!
//! A worker set is never stored in the cluster. At apply time one pod is
//! derived per replica index; the pod name, hostname, `REPLICA_INDEX` and
//! optional node pinning are all functions of the index so re-expansion is
//! stable. The restart counter lives in a pod annotation.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EnvVar, Pod, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

use crate::crd::DoneCondition;
use crate::{
    ANNOTATION_RESTART, LABEL_JOB_ID, LABEL_ML_NODE, LABEL_REPLICA_INDEX, NODE_HOSTNAME_KEY,
};

/// apiVersion used when a worker set is printed
pub const WORKER_SET_API_VERSION: &str = "trellis.dev/v1";
/// kind used when a worker set is printed
pub const WORKER_SET_KIND: &str = "WorkerSet";

const REPLICA_INDEX_ENV: &str = "REPLICA_INDEX";

/// Compile-time description of a replicated task resource
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSet {
    /// Base name (pods are `<name>-<index>`) and namespace
    pub metadata: ObjectMeta,
    /// Owning task
    pub task: String,
    /// Task resource
    pub resource: String,
    /// Build / job id
    pub job_id: String,
    /// Replica count
    pub replicas: u32,
    /// Recreations allowed per replica
    pub max_restarts: u32,
    /// Tolerate replicas that exhaust their restarts
    pub allow_fail: bool,
    /// Completion rule
    pub done_condition: DoneCondition,
    /// Labels that select every replica
    pub selector: BTreeMap<String, String>,
    /// Node pinning by index
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<String>,
    /// Minimum restart generation per index; lower live generations are replaced
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub restarts: BTreeMap<u32, u32>,
    /// Pod template
    pub template: PodTemplateSpec,
}

impl WorkerSet {
    /// Base name
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// Pod name (and hostname) of a replica
    pub fn pod_name(&self, index: u32) -> String {
        format!("{}-{index}", self.name())
    }

    /// Node a replica is pinned to
    pub fn assigned_node(&self, index: u32) -> Option<&str> {
        self.nodes.get(index as usize).map(String::as_str)
    }

    /// Desired restart generation of a replica
    pub fn desired_restart(&self, index: u32) -> u32 {
        self.restarts.get(&index).copied().unwrap_or(0)
    }

    /// True when a live replica was created from this build
    ///
    /// Compares the job-id label the template stamps with the pod's.
    pub fn owns_build_of(&self, pod: &Pod) -> bool {
        let desired = self
            .template
            .metadata
            .as_ref()
            .and_then(|m| m.labels.as_ref())
            .and_then(|l| l.get(LABEL_JOB_ID));
        let live = pod.metadata.labels.as_ref().and_then(|l| l.get(LABEL_JOB_ID));
        desired == live
    }

    /// Label selector string enumerating live replicas
    pub fn label_selector(&self) -> String {
        self.selector
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Derive the pod for one replica
    pub fn expand(&self, index: u32, node: Option<&str>, restart: u32) -> Pod {
        let name = self.pod_name(index);

        let mut metadata = self.template.metadata.clone().unwrap_or_default();
        metadata.name = Some(name.clone());
        metadata.namespace = self.metadata.namespace.clone();
        let labels = metadata.labels.get_or_insert_with(BTreeMap::new);
        labels.extend(self.selector.clone());
        labels.insert(LABEL_REPLICA_INDEX.to_string(), index.to_string());
        if let Some(node) = node {
            labels.insert(LABEL_ML_NODE.to_string(), node.to_string());
        }
        metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(ANNOTATION_RESTART.to_string(), restart.to_string());

        let mut spec = self.template.spec.clone().unwrap_or_default();
        spec.hostname = Some(name);
        spec.subdomain = self.metadata.name.clone();
        if let Some(node) = node {
            spec.node_selector
                .get_or_insert_with(BTreeMap::new)
                .insert(NODE_HOSTNAME_KEY.to_string(), node.to_string());
        }
        for container in &mut spec.containers {
            let env = container.env.get_or_insert_with(Vec::new);
            env.retain(|e| e.name != REPLICA_INDEX_ENV);
            env.push(EnvVar {
                name: REPLICA_INDEX_ENV.to_string(),
                value: Some(index.to_string()),
                ..Default::default()
            });
        }

        Pod {
            metadata,
            spec: Some(spec),
            ..Default::default()
        }
    }

    /// Pods for every replica at their desired restart generation
    pub fn expand_all(&self) -> Vec<Pod> {
        (0..self.replicas)
            .map(|i| self.expand(i, self.assigned_node(i), self.desired_restart(i)))
            .collect()
    }
}

/// Replica index label of a pod
pub fn replica_index(pod: &Pod) -> Option<u32> {
    pod.metadata
        .labels
        .as_ref()?
        .get(LABEL_REPLICA_INDEX)?
        .parse()
        .ok()
}

/// Restart counter annotation of a pod (0 when absent)
pub fn restart_count(pod: &Pod) -> u32 {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_RESTART))
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Pod phase reported by the cluster
pub fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.phase.as_deref()
}

/// Aggregate state of a worker set
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerSetPhase {
    /// No replica exists yet
    Pending,
    /// Replicas are still working
    Running,
    /// The done condition is met
    Succeeded,
    /// A replica failed for good and failures are not tolerated
    Failed,
}

/// Evaluate the worker set against its live pods
pub fn worker_set_phase(set: &WorkerSet, pods: &[Pod]) -> WorkerSetPhase {
    let by_index: BTreeMap<u32, &Pod> = pods
        .iter()
        .filter_map(|p| replica_index(p).map(|i| (i, p)))
        .collect();

    let mut succeeded = 0;
    let mut settled = 0;
    for index in 0..set.replicas {
        let Some(pod) = by_index.get(&index) else {
            continue;
        };
        match pod_phase(pod) {
            Some("Succeeded") => {
                succeeded += 1;
                settled += 1;
            }
            Some("Failed") if restart_count(pod) >= set.max_restarts => {
                if !set.allow_fail {
                    return WorkerSetPhase::Failed;
                }
                settled += 1;
            }
            _ => {}
        }
    }

    match set.done_condition {
        DoneCondition::AnySucceeded if succeeded > 0 => return WorkerSetPhase::Succeeded,
        DoneCondition::AllSucceeded if settled == set.replicas && succeeded > 0 => {
            return WorkerSetPhase::Succeeded
        }
        _ => {}
    }
    if set.replicas > 0 && settled == set.replicas {
        // Every replica failed and was tolerated
        return WorkerSetPhase::Failed;
    }
    if by_index.is_empty() {
        WorkerSetPhase::Pending
    } else {
        WorkerSetPhase::Running
    }
}
