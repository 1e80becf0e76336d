//! UI component compilation

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Service, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use super::labels::{component_labels, selector_labels};
use super::pod::{self, ContainerSource};
use super::{CompilationContext, ComponentIdentity};
use crate::crd::UixSpec;
use crate::workload::CompiledResource;
use crate::Result;

const DISPLAY_NAME_ANNOTATION: &str = "trellis.dev/display-name";

/// Compile a UI component into a single-replica Deployment behind a Service
pub(crate) fn compile_uix(ctx: &CompilationContext<'_>, uix: &UixSpec) -> Result<CompiledResource> {
    let id = ComponentIdentity::uix(&uix.name);
    let name = id.object_name(ctx);
    let labels = component_labels(ctx, &id, &uix.labels);
    let selector = selector_labels(ctx, &id);

    let source = ContainerSource {
        image: &uix.image,
        command: uix.command.as_ref(),
        args: uix.args.as_ref(),
        work_dir: uix.work_dir.as_ref(),
        env: &uix.env,
        resources: &uix.resources,
        mounts: &uix.mounts,
        ports: &uix.ports,
    };
    let prepared = pod::prepare(ctx, &id, &source, ctx.volumes, &[], labels.clone())?;

    let mut metadata = ctx.metadata(&name, labels.clone());
    if let Some(display) = &uix.display_name {
        metadata.annotations = Some(
            [(DISPLAY_NAME_ANNOTATION.to_string(), display.clone())]
                .into_iter()
                .collect(),
        );
    }

    let deployment = Deployment {
        metadata,
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector.clone()),
                ..Default::default()
            },
            template: prepared.template,
            ..Default::default()
        }),
        ..Default::default()
    };

    let mut compiled = CompiledResource::new(deployment).with_dependent(CompiledResource::new(
        Service {
            metadata: ctx.metadata(&name, labels),
            spec: Some(ServiceSpec {
                selector: Some(selector),
                ports: Some(pod::service_ports(&uix.ports)),
                type_: Some("ClusterIP".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
    ));
    for secret in prepared.secrets {
        compiled = compiled.with_dependent(secret);
    }
    Ok(compiled)
}
