//! Autoscaler generation for serving deployments

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
    MetricSpec, MetricTarget, ResourceMetricSource,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity as K8sQuantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::Resource;

use super::CompiledResource;
use crate::crd::AutoscaleSpec;
use crate::quantity::Quantity;

/// Default lower replica bound
pub const DEFAULT_MIN_REPLICAS: i32 = 1;
/// Default upper replica bound
pub const DEFAULT_MAX_REPLICAS: i32 = 5;
/// Target used when no CPU limit is resolved
pub const DEFAULT_TARGET_UTILIZATION: i32 = 50;

/// Target CPU utilization: half of the limit/request headroom, in percent
///
/// A zero limit means "no limit" and yields the flat default. The percentage
/// is rounded down to a whole number, as the HPA target only takes integers.
pub fn target_utilization(limit_milli: i64, request_milli: i64) -> i32 {
    if limit_milli <= 0 || request_milli <= 0 {
        return DEFAULT_TARGET_UTILIZATION;
    }
    let target = limit_milli.saturating_mul(50) / request_milli;
    i32::try_from(target).unwrap_or(i32::MAX)
}

fn cpu_milli(quantities: Option<&BTreeMap<String, K8sQuantity>>) -> i64 {
    quantities
        .and_then(|m| m.get("cpu"))
        .and_then(|q| Quantity::parse(&q.0).ok())
        .map(|q| q.milli_value())
        .unwrap_or(0)
}

/// Build an HPA for a compiled deployment
///
/// Returns `None` when the deployment has no CPU request.
pub fn generate_autoscaler(
    deployment: &Deployment,
    config: &AutoscaleSpec,
) -> Option<CompiledResource> {
    let resources = deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .first()?
        .resources
        .as_ref()?;

    let request = cpu_milli(resources.requests.as_ref());
    if request <= 0 {
        return None;
    }
    let limit = cpu_milli(resources.limits.as_ref());

    let target = config
        .target_cpu_utilization
        .unwrap_or_else(|| target_utilization(limit, request));
    let min = config.min_replicas.unwrap_or(DEFAULT_MIN_REPLICAS).max(1);
    let max = config.max_replicas.unwrap_or(DEFAULT_MAX_REPLICAS).max(min);
    let name = deployment.metadata.name.clone().unwrap_or_default();

    tracing::debug!(deployment = %name, min, max, target, "generated autoscaler");

    Some(CompiledResource::new(HorizontalPodAutoscaler {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: deployment.metadata.namespace.clone(),
            labels: deployment.metadata.labels.clone(),
            ..Default::default()
        },
        spec: Some(HorizontalPodAutoscalerSpec {
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some(Deployment::API_VERSION.to_string()),
                kind: Deployment::KIND.to_string(),
                name,
            },
            min_replicas: Some(min),
            max_replicas: max,
            metrics: Some(vec![MetricSpec {
                type_: "Resource".to_string(),
                resource: Some(ResourceMetricSource {
                    name: "cpu".to_string(),
                    target: MetricTarget {
                        type_: "Utilization".to_string(),
                        average_utilization: Some(target),
                        ..Default::default()
                    },
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }))
}
