//! Ambient limits and request minimization
//!
//! A component's declared request is clamped against an ambient ceiling (the
//! workspace quota combined with the cluster-wide ceiling). Minimization never
//! rejects input, it only clamps. Quantities that are absent, non-positive or
//! unparseable count as "unlimited".

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity as K8sQuantity;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::crd::ResourceRequest;
use crate::quantity::Quantity;
use crate::Result;

/// A (possibly partial) resource ceiling
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimit {
    /// CPU quantity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    /// Memory quantity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,

    /// Accelerator count; negative means no ceiling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<i64>,

    /// Replica ceiling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i64>,

    /// Concurrent run ceiling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_runs: Option<i64>,

    /// Execution time ceiling in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<i64>,
}

/// Clamp `to_minimize` against `ambient`
pub fn minimize(to_minimize: &ResourceLimit, ambient: &ResourceLimit) -> ResourceLimit {
    ResourceLimit {
        cpu: min_quantity(to_minimize.cpu.as_deref(), ambient.cpu.as_deref()),
        memory: min_quantity(to_minimize.memory.as_deref(), ambient.memory.as_deref()),
        gpu: min_gpu(to_minimize.gpu, ambient.gpu),
        replicas: min_bound(to_minimize.replicas, ambient.replicas),
        parallel_runs: min_bound(to_minimize.parallel_runs, ambient.parallel_runs),
        execution_time: min_bound(to_minimize.execution_time, ambient.execution_time),
    }
}

fn concrete(raw: Option<&str>) -> Option<(&str, Quantity)> {
    let raw = raw?;
    Quantity::parse(raw)
        .ok()
        .filter(Quantity::is_positive)
        .map(|q| (raw, q))
}

fn min_quantity(current: Option<&str>, ambient: Option<&str>) -> Option<String> {
    match (concrete(current), concrete(ambient)) {
        (Some((c, cq)), Some((a, aq))) => {
            let winner = if cq <= aq { c } else { a };
            Some(winner.to_string())
        }
        (Some((c, _)), None) => Some(c.to_string()),
        (None, Some((a, _))) => Some(a.to_string()),
        (None, None) => None,
    }
}

fn min_gpu(current: Option<i64>, ambient: Option<i64>) -> Option<i64> {
    match (current, ambient) {
        (_, None) => current,
        (_, Some(g)) if g < 0 => current,
        (None, Some(g)) => Some(g),
        (Some(r), Some(g)) if r > g || r < 0 => Some(g),
        (Some(r), Some(_)) => Some(r),
    }
}

fn min_bound(current: Option<i64>, ambient: Option<i64>) -> Option<i64> {
    match ambient {
        Some(a) if a > 0 => match current {
            Some(c) if c > 0 && c <= a => Some(c),
            _ => Some(a),
        },
        _ => current,
    }
}

/// Clamp a count (replicas) against an ambient bound
pub fn clamp_count(current: i64, ambient: Option<i64>) -> i64 {
    min_bound(Some(current), ambient).unwrap_or(current)
}

/// Source of workspace-level quotas
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkspaceLimits: Send + Sync {
    /// Quota of a workspace
    async fn workspace_limit(&self, workspace_id: &str) -> Result<ResourceLimit>;
}

/// Fixed quota for every workspace
#[derive(Clone, Debug, Default)]
pub struct StaticLimits {
    limit: ResourceLimit,
}

impl StaticLimits {
    /// Serve `limit` for every workspace
    pub fn new(limit: ResourceLimit) -> Self {
        Self { limit }
    }
}

#[async_trait]
impl WorkspaceLimits for StaticLimits {
    async fn workspace_limit(&self, _workspace_id: &str) -> Result<ResourceLimit> {
        Ok(self.limit.clone())
    }
}

/// Combine a workspace quota with the cluster ceiling
pub async fn effective_limit(
    source: &dyn WorkspaceLimits,
    workspace_id: &str,
    cluster: &ResourceLimit,
) -> Result<ResourceLimit> {
    let workspace = source.workspace_limit(workspace_id).await?;
    let effective = minimize(&workspace, cluster);
    tracing::debug!(workspace = %workspace_id, ?effective, "resolved ambient limit");
    Ok(effective)
}

/// A component's request after clamping
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvedResources {
    /// CPU request
    pub cpu_request: Option<String>,
    /// CPU limit
    pub cpu_limit: Option<String>,
    /// Memory request
    pub memory_request: Option<String>,
    /// Memory limit
    pub memory_limit: Option<String>,
    /// Accelerator count (0 when none)
    pub gpu: i64,
    /// Accelerator is shared
    pub gpu_shared: bool,
}

/// Resolve a declared request against the ambient ceiling
///
/// Limits are clamped to the ceiling first, then requests are clamped to the
/// resulting limits so that `request <= limit <= ceiling` holds.
pub fn resolve_request(
    request: &ResourceRequest,
    ambient: &ResourceLimit,
) -> Result<ResolvedResources> {
    request.validate()?;

    let limit = minimize(
        &ResourceLimit {
            cpu: request.limits.cpu.clone(),
            memory: request.limits.memory.clone(),
            gpu: request.gpu,
            ..Default::default()
        },
        ambient,
    );
    let req = minimize(
        &ResourceLimit {
            cpu: request.requests.cpu.clone(),
            memory: request.requests.memory.clone(),
            ..Default::default()
        },
        &limit,
    );

    Ok(ResolvedResources {
        cpu_request: req.cpu,
        cpu_limit: limit.cpu,
        memory_request: req.memory,
        memory_limit: limit.memory,
        gpu: limit.gpu.unwrap_or(0).max(0),
        gpu_shared: request.gpu_shared,
    })
}

impl ResolvedResources {
    /// Container resource requirements; accelerators go on limits as an extended resource
    pub fn to_requirements(&self, gpu_resource: &str) -> Option<ResourceRequirements> {
        let mut requests = BTreeMap::new();
        let mut limits = BTreeMap::new();
        if let Some(cpu) = &self.cpu_request {
            requests.insert("cpu".to_string(), K8sQuantity(cpu.clone()));
        }
        if let Some(memory) = &self.memory_request {
            requests.insert("memory".to_string(), K8sQuantity(memory.clone()));
        }
        if let Some(cpu) = &self.cpu_limit {
            limits.insert("cpu".to_string(), K8sQuantity(cpu.clone()));
        }
        if let Some(memory) = &self.memory_limit {
            limits.insert("memory".to_string(), K8sQuantity(memory.clone()));
        }
        if self.gpu > 0 {
            limits.insert(gpu_resource.to_string(), K8sQuantity(self.gpu.to_string()));
        }

        if requests.is_empty() && limits.is_empty() {
            return None;
        }
        Some(ResourceRequirements {
            requests: (!requests.is_empty()).then_some(requests),
            limits: (!limits.is_empty()).then_some(limits),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ResourceQuantity;
    use rstest::rstest;

    fn gpu(request: Option<i64>, ambient: Option<i64>) -> Option<i64> {
        minimize(
            &ResourceLimit {
                gpu: request,
                ..Default::default()
            },
            &ResourceLimit {
                gpu: ambient,
                ..Default::default()
            },
        )
        .gpu
    }

    #[rstest]
    #[case::quota_of_zero_clamps(Some(2), Some(0), Some(0))]
    #[case::unlimited_keeps_zero(Some(0), Some(-1), Some(0))]
    #[case::unlimited_keeps_request(Some(8), Some(-1), Some(8))]
    #[case::absent_ceiling_keeps_request(Some(3), None, Some(3))]
    #[case::below_ceiling(Some(1), Some(4), Some(1))]
    #[case::above_ceiling(Some(6), Some(4), Some(4))]
    #[case::negative_request(Some(-1), Some(4), Some(4))]
    #[case::unset_adopts_ceiling(None, Some(2), Some(2))]
    fn gpu_minimization(
        #[case] request: Option<i64>,
        #[case] ambient: Option<i64>,
        #[case] expected: Option<i64>,
    ) {
        assert_eq!(gpu(request, ambient), expected);
    }

    #[test]
    fn concrete_request_survives_unset_ceiling() {
        let result = minimize(
            &ResourceLimit {
                cpu: Some("1".to_string()),
                memory: Some("4Gi".to_string()),
                ..Default::default()
            },
            &ResourceLimit::default(),
        );
        let cpu = Quantity::parse(result.cpu.as_deref().unwrap()).unwrap();
        let memory = Quantity::parse(result.memory.as_deref().unwrap()).unwrap();
        assert_eq!(cpu.milli_value(), 1000);
        assert_eq!(memory.scaled_value(6), 4295);
    }

    #[rstest]
    #[case::both_concrete(Some("2"), Some("500m"), Some("500m"))]
    #[case::request_smaller(Some("250m"), Some("1"), Some("250m"))]
    #[case::ceiling_unlimited(Some("2"), None, Some("2"))]
    #[case::request_unlimited(None, Some("1"), Some("1"))]
    #[case::zero_is_unlimited(Some("0"), Some("1"), Some("1"))]
    #[case::both_unlimited(None, Some("-1"), None)]
    fn cpu_minimization(
        #[case] request: Option<&str>,
        #[case] ambient: Option<&str>,
        #[case] expected: Option<&str>,
    ) {
        let result = minimize(
            &ResourceLimit {
                cpu: request.map(str::to_string),
                ..Default::default()
            },
            &ResourceLimit {
                cpu: ambient.map(str::to_string),
                ..Default::default()
            },
        );
        assert_eq!(result.cpu.as_deref(), expected);
    }

    #[rstest]
    #[case::exceeds(Some(10), Some(4), Some(4))]
    #[case::non_positive(Some(0), Some(4), Some(4))]
    #[case::within(Some(2), Some(4), Some(2))]
    #[case::no_bound(Some(10), None, Some(10))]
    #[case::zero_bound(Some(10), Some(0), Some(10))]
    fn replica_bound(
        #[case] current: Option<i64>,
        #[case] ambient: Option<i64>,
        #[case] expected: Option<i64>,
    ) {
        assert_eq!(min_bound(current, ambient), expected);
    }

    #[test]
    fn request_is_clamped_to_limit() {
        let request = ResourceRequest {
            requests: ResourceQuantity {
                cpu: Some("4".to_string()),
                memory: Some("1Gi".to_string()),
            },
            limits: ResourceQuantity {
                cpu: Some("8".to_string()),
                memory: None,
            },
            gpu: Some(2),
            ..Default::default()
        };
        let ambient = ResourceLimit {
            cpu: Some("2".to_string()),
            memory: Some("8Gi".to_string()),
            gpu: Some(1),
            ..Default::default()
        };
        let resolved = resolve_request(&request, &ambient).unwrap();
        assert_eq!(resolved.cpu_limit.as_deref(), Some("2"));
        assert_eq!(resolved.cpu_request.as_deref(), Some("2"));
        assert_eq!(resolved.memory_limit.as_deref(), Some("8Gi"));
        assert_eq!(resolved.memory_request.as_deref(), Some("1Gi"));
        assert_eq!(resolved.gpu, 1);
    }

    #[test]
    fn unparseable_request_is_rejected() {
        let request = ResourceRequest {
            limits: ResourceQuantity {
                cpu: Some("two".to_string()),
                memory: None,
            },
            ..Default::default()
        };
        assert!(resolve_request(&request, &ResourceLimit::default()).is_err());
    }

    #[test]
    fn gpu_lands_on_limits_only() {
        let resolved = ResolvedResources {
            cpu_request: Some("1".to_string()),
            gpu: 2,
            ..Default::default()
        };
        let req = resolved.to_requirements("nvidia.com/gpu").unwrap();
        let limits = req.limits.unwrap();
        assert_eq!(limits.get("nvidia.com/gpu"), Some(&K8sQuantity("2".to_string())));
        assert!(!req.requests.unwrap().contains_key("nvidia.com/gpu"));
        assert!(ResolvedResources::default().to_requirements("nvidia.com/gpu").is_none());
    }

    #[tokio::test]
    async fn workspace_quota_is_combined_with_cluster_ceiling() {
        let mut source = MockWorkspaceLimits::new();
        source
            .expect_workspace_limit()
            .times(1)
            .returning(|_| {
                Ok(ResourceLimit {
                    cpu: Some("16".to_string()),
                    gpu: Some(-1),
                    replicas: Some(8),
                    ..Default::default()
                })
            });
        let cluster = ResourceLimit {
            cpu: Some("4".to_string()),
            gpu: Some(2),
            replicas: Some(4),
            ..Default::default()
        };
        let effective = effective_limit(&source, "ws-1", &cluster).await.unwrap();
        assert_eq!(effective.cpu.as_deref(), Some("4"));
        assert_eq!(effective.gpu, Some(2));
        assert_eq!(effective.replicas, Some(4));
    }

    #[tokio::test]
    async fn static_limits_serve_every_workspace() {
        let limits = StaticLimits::new(ResourceLimit {
            memory: Some("32Gi".to_string()),
            ..Default::default()
        });
        let got = limits.workspace_limit("anything").await.unwrap();
        assert_eq!(got.memory.as_deref(), Some("32Gi"));
    }
}
