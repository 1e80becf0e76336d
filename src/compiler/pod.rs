//! Shared container and pod template construction

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec, Secret, ServicePort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use super::{env, CompilationContext, ComponentIdentity};
use crate::crd::{EnvEntry, ImageSpec, MountSpec, PortSpec, ResourceRequest};
use crate::limits::{resolve_request, ResolvedResources};
use crate::volume::{self, VolumeCatalog};
use crate::workload::CompiledResource;
use crate::{Result, LABEL_MANAGED_BY, LABEL_MANAGED_BY_TRELLIS};

/// Container name used by every component
pub(crate) const CONTAINER_NAME: &str = "main";

/// What a component declares about its single container
pub(crate) struct ContainerSource<'a> {
    pub image: &'a ImageSpec,
    pub command: Option<&'a Vec<String>>,
    pub args: Option<&'a Vec<String>>,
    pub work_dir: Option<&'a String>,
    pub env: &'a [EnvEntry],
    pub resources: &'a ResourceRequest,
    pub mounts: &'a [MountSpec],
    pub ports: &'a [PortSpec],
}

/// A pod template plus what the component compilers still need
pub(crate) struct PreparedPod {
    pub template: PodTemplateSpec,
    pub resolved: ResolvedResources,
    /// Secrets the container references that the app declares
    pub secrets: Vec<CompiledResource>,
}

/// Resolve resources and volumes, assemble the environment and build the template
pub(crate) fn prepare(
    ctx: &CompilationContext<'_>,
    id: &ComponentIdentity<'_>,
    source: &ContainerSource<'_>,
    catalog: &VolumeCatalog,
    peers: &[EnvVar],
    labels: BTreeMap<String, String>,
) -> Result<PreparedPod> {
    let component = id.display();
    let resolved =
        resolve_request(source.resources, ctx.ambient).map_err(|e| e.in_component(&component))?;
    let volumes = volume::resolve(&component, source.mounts, catalog)?;
    let env = env::assemble(ctx, id, &resolved, &volumes.entries, peers, source.env);

    let ports: Vec<ContainerPort> = source.ports.iter().map(container_port).collect();
    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(source.image.select(resolved.gpu).to_string()),
        command: source.command.cloned(),
        args: source.args.cloned(),
        working_dir: source.work_dir.cloned(),
        env: Some(env),
        ports: (!ports.is_empty()).then_some(ports),
        resources: resolved.to_requirements(ctx.config.gpu_resource_for(resolved.gpu_shared)),
        volume_mounts: (!volumes.mounts.is_empty()).then_some(volumes.mounts),
        ..Default::default()
    };

    let template = PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![container],
            volumes: (!volumes.volumes.is_empty()).then_some(volumes.volumes),
            ..Default::default()
        }),
    };

    Ok(PreparedPod {
        template,
        resolved,
        secrets: referenced_secrets(ctx, source.env),
    })
}

fn container_port(port: &PortSpec) -> ContainerPort {
    ContainerPort {
        name: Some(port_name(port)),
        container_port: i32::from(port.target_port.unwrap_or(port.port)),
        protocol: port.protocol.clone(),
        ..Default::default()
    }
}

/// Declared name, or `port-<number>`
pub(crate) fn port_name(port: &PortSpec) -> String {
    port.name
        .clone()
        .unwrap_or_else(|| format!("port-{}", port.port))
}

/// Service ports for declared ports
pub(crate) fn service_ports(ports: &[PortSpec]) -> Vec<ServicePort> {
    ports
        .iter()
        .map(|p| ServicePort {
            name: Some(port_name(p)),
            port: i32::from(p.port),
            target_port: Some(IntOrString::Int(i32::from(p.target_port.unwrap_or(p.port)))),
            protocol: p.protocol.clone(),
            ..Default::default()
        })
        .collect()
}

/// One `Secret` per app-declared secret the environment references
///
/// References to secrets the app does not declare are left to exist in the
/// cluster already.
fn referenced_secrets(ctx: &CompilationContext<'_>, entries: &[EnvEntry]) -> Vec<CompiledResource> {
    let names: BTreeSet<&str> = entries
        .iter()
        .filter_map(|e| e.secret.as_ref())
        .map(|s| s.name.as_str())
        .collect();

    ctx.secrets
        .iter()
        .filter(|s| names.contains(s.name.as_str()))
        .map(|s| {
            let mut labels = ctx.app_labels.clone();
            labels.insert(
                LABEL_MANAGED_BY.to_string(),
                LABEL_MANAGED_BY_TRELLIS.to_string(),
            );
            CompiledResource::new(Secret {
                metadata: ctx.metadata(&s.name, labels),
                string_data: Some(s.data.clone()),
                type_: Some("Opaque".to_string()),
                ..Default::default()
            })
        })
        .collect()
}
