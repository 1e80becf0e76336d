//! Model-serving endpoint compilation

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Service, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use super::labels::{component_labels, selector_labels};
use super::pod::{self, ContainerSource};
use super::{CompilationContext, ComponentIdentity};
use crate::crd::{PortSpec, ServingSpec};
use crate::limits::clamp_count;
use crate::workload::{generate_autoscaler, CompiledResource};
use crate::Result;

const METRICS_PORT_NAME: &str = "metrics";

/// Declared ports plus the implicit metrics port, every port named
fn serving_ports(declared: &[PortSpec], metrics_port: u16) -> Vec<PortSpec> {
    let mut ports: Vec<PortSpec> = declared
        .iter()
        .map(|p| PortSpec {
            name: Some(pod::port_name(p)),
            ..p.clone()
        })
        .collect();
    let has_metrics = ports
        .iter()
        .any(|p| p.name.as_deref() == Some(METRICS_PORT_NAME) || p.port == metrics_port);
    if !has_metrics {
        ports.push(PortSpec {
            name: Some(METRICS_PORT_NAME.to_string()),
            port: metrics_port,
            target_port: None,
            protocol: None,
        });
    }
    ports
}

/// Compile a serving endpoint into a Deployment, a Service and an optional autoscaler
pub(crate) fn compile_serving(
    ctx: &CompilationContext<'_>,
    serving: &ServingSpec,
) -> Result<CompiledResource> {
    let id = ComponentIdentity::serving(&serving.name);
    let name = id.object_name(ctx);
    let labels = component_labels(ctx, &id, &serving.labels);
    let selector = selector_labels(ctx, &id);
    let ports = serving_ports(&serving.ports, ctx.config.metrics_port);

    let catalog = ctx.volumes.scoped(&serving.mounts, &[], &serving.revisions);
    let source = ContainerSource {
        image: &serving.image,
        command: serving.command.as_ref(),
        args: serving.args.as_ref(),
        work_dir: serving.work_dir.as_ref(),
        env: &serving.env,
        resources: &serving.resources,
        mounts: &serving.mounts,
        ports: &ports,
    };
    let prepared = pod::prepare(ctx, &id, &source, &catalog, &[], labels.clone())?;

    let replicas = clamp_count(i64::from(serving.replicas.max(1)), ctx.ambient.replicas);
    let deployment = Deployment {
        metadata: ctx.metadata(&name, labels.clone()),
        spec: Some(DeploymentSpec {
            replicas: Some(i32::try_from(replicas).unwrap_or(i32::MAX)),
            selector: LabelSelector {
                match_labels: Some(selector.clone()),
                ..Default::default()
            },
            template: prepared.template,
            ..Default::default()
        }),
        ..Default::default()
    };

    let autoscaler = serving
        .autoscale
        .as_ref()
        .and_then(|config| generate_autoscaler(&deployment, config));

    let mut compiled = CompiledResource::new(deployment).with_dependent(CompiledResource::new(
        Service {
            metadata: ctx.metadata(&name, labels),
            spec: Some(ServiceSpec {
                selector: Some(selector),
                ports: Some(pod::service_ports(&ports)),
                type_: Some("ClusterIP".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
    ));
    for secret in prepared.secrets {
        compiled = compiled.with_dependent(secret);
    }
    if let Some(hpa) = autoscaler {
        compiled = compiled.with_dependent(hpa);
    } else if serving.autoscale.is_some() {
        tracing::debug!(serving = %serving.name, "no cpu request resolved, skipping autoscaler");
    }
    Ok(compiled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::fixtures;
    use crate::crd::{AutoscaleSpec, ImageSpec, ResourceQuantity};
    use crate::limits::ResourceLimit;
    use crate::workload::{ClusterObject, ObjectKind};
    use crate::LABEL_SERVING_ID;

    fn predict(cpu_request: Option<&str>, autoscale: Option<AutoscaleSpec>) -> ServingSpec {
        ServingSpec {
            name: "predict".to_string(),
            labels: Default::default(),
            image: ImageSpec {
                cpu: "serve:1".to_string(),
                gpu: None,
            },
            command: None,
            args: None,
            work_dir: None,
            env: Vec::new(),
            resources: crate::crd::ResourceRequest {
                requests: ResourceQuantity {
                    cpu: cpu_request.map(str::to_string),
                    memory: None,
                },
                limits: ResourceQuantity {
                    cpu: Some("2".to_string()),
                    memory: None,
                },
                ..Default::default()
            },
            ports: vec![PortSpec {
                name: None,
                port: 8501,
                target_port: None,
                protocol: None,
            }],
            mounts: Vec::new(),
            replicas: 2,
            autoscale,
            revisions: Vec::new(),
        }
    }

    fn compile(serving: &ServingSpec) -> CompiledResource {
        let config = fixtures::config();
        let ambient = ResourceLimit::default();
        fixtures::with_context(&config, &ambient, &[], &[], |ctx| {
            compile_serving(ctx, serving).unwrap()
        })
    }

    #[test]
    fn story_metrics_port_is_always_added() {
        let ports = serving_ports(
            &[PortSpec {
                name: None,
                port: 8501,
                target_port: None,
                protocol: None,
            }],
            9091,
        );
        let names: Vec<_> = ports.iter().map(|p| p.name.clone().unwrap()).collect();
        assert_eq!(names, vec!["port-8501", "metrics"]);
        assert_eq!(ports[1].port, 9091);
    }

    #[test]
    fn story_declared_metrics_port_is_not_duplicated() {
        let ports = serving_ports(
            &[PortSpec {
                name: Some("metrics".to_string()),
                port: 9000,
                target_port: None,
                protocol: None,
            }],
            9091,
        );
        assert_eq!(ports.len(), 1);
    }

    #[test]
    fn story_serving_with_autoscaler() {
        let compiled = compile(&predict(Some("500m"), Some(AutoscaleSpec::default())));
        let ClusterObject::Deployment(deployment) = &compiled.object else {
            panic!("expected a deployment");
        };
        assert_eq!(deployment.spec.as_ref().unwrap().replicas, Some(2));
        let labels = deployment.metadata.labels.as_ref().unwrap();
        assert_eq!(
            labels.get(LABEL_SERVING_ID).map(String::as_str),
            Some("mnist-predict")
        );

        let kinds: Vec<_> = compiled.dependents.iter().map(|d| d.object.kind()).collect();
        assert_eq!(
            kinds,
            vec![ObjectKind::Service, ObjectKind::HorizontalPodAutoscaler]
        );
        let ClusterObject::HorizontalPodAutoscaler(hpa) = &compiled.dependents[1].object else {
            panic!("expected an autoscaler");
        };
        let target = hpa.spec.as_ref().unwrap().metrics.as_ref().unwrap()[0]
            .resource
            .as_ref()
            .unwrap()
            .target
            .average_utilization;
        // 2000m limit over 500m request, halved
        assert_eq!(target, Some(200));
    }

    #[test]
    fn story_no_autoscaler_without_cpu_request() {
        let mut serving = predict(None, Some(AutoscaleSpec::default()));
        serving.resources.limits.cpu = None;
        let compiled = compile(&serving);
        assert_eq!(compiled.dependents.len(), 1);
        assert_eq!(compiled.dependents[0].object.kind(), ObjectKind::Service);
    }

    #[test]
    fn story_unset_request_defaults_to_the_limit() {
        let compiled = compile(&predict(None, Some(AutoscaleSpec::default())));
        let ClusterObject::Deployment(deployment) = &compiled.object else {
            panic!("expected a deployment");
        };
        let container =
            &deployment.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0];
        let requests = container.resources.as_ref().unwrap().requests.as_ref().unwrap();
        assert_eq!(requests.get("cpu").map(|q| q.0.as_str()), Some("2"));
        assert_eq!(compiled.dependents.len(), 2);
    }

    #[test]
    fn story_serving_omits_workspace_secret() {
        let compiled = compile(&predict(Some("1"), None));
        let ClusterObject::Deployment(deployment) = &compiled.object else {
            panic!("expected a deployment");
        };
        let env = deployment.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0]
            .env
            .as_ref()
            .unwrap();
        assert!(env.iter().all(|e| e.name != "WORKSPACE_SECRET"));
        assert!(env.iter().any(|e| e.name == "URL_PREFIX"));
    }
}
