//! Task resource compilation
//!
//! A single-replica resource becomes a `Job`. A replicated resource becomes a
//! [`WorkerSet`] that the reconciler fans out into one pod per replica. Both get
//! a headless `Service` so replicas resolve each other as
//! `<object>-<index>.<object>`.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{EnvVar, PodTemplateSpec, Service, ServiceSpec};
use sha2::{Digest, Sha256};

use super::env::literal;
use super::labels::{component_labels, env_prefix, selector_labels};
use super::pod::{self, ContainerSource};
use super::{CompilationContext, ComponentIdentity};
use crate::crd::{TaskResourceSpec, TaskSpec};
use crate::limits::clamp_count;
use crate::workload::{template_changed, CompiledResource, WorkerSet};
use crate::{Error, Result, ANNOTATION_SPEC_HASH, NODE_HOSTNAME_KEY};

/// Replica count after clamping against the ambient replica ceiling
fn replica_count(ctx: &CompilationContext<'_>, resource: &TaskResourceSpec) -> u32 {
    let clamped = clamp_count(i64::from(resource.replicas), ctx.ambient.replicas);
    u32::try_from(clamped.max(1)).unwrap_or(u32::MAX)
}

/// `<RESOURCE>_NODES` and `<RESOURCE>_HOSTS` for every resource of a task
pub(crate) fn peer_env(ctx: &CompilationContext<'_>, task: &TaskSpec) -> Vec<EnvVar> {
    task.resources
        .iter()
        .flat_map(|resource| {
            let replicas = replica_count(ctx, resource);
            let object = ComponentIdentity::task_resource(&task.name, &resource.name, replicas)
                .object_name(ctx);
            let hosts = (0..replicas)
                .map(|i| format!("{object}-{i}.{object}"))
                .collect::<Vec<_>>()
                .join(",");
            let prefix = env_prefix(&resource.name);
            [
                literal(&format!("{prefix}_NODES"), replicas.to_string()),
                literal(&format!("{prefix}_HOSTS"), hosts),
            ]
        })
        .collect()
}

/// Compile one resource of a task
pub(crate) fn compile_task_resource(
    ctx: &CompilationContext<'_>,
    task: &TaskSpec,
    resource: &TaskResourceSpec,
    peers: &[EnvVar],
) -> Result<CompiledResource> {
    let replicas = replica_count(ctx, resource);
    let id = ComponentIdentity::task_resource(&task.name, &resource.name, replicas);
    let name = id.object_name(ctx);
    let labels = component_labels(ctx, &id, &task.labels);
    let selector = selector_labels(ctx, &id);

    let catalog = ctx
        .volumes
        .scoped(&resource.mounts, &resource.volumes, &resource.revisions);
    let source = ContainerSource {
        image: &resource.image,
        command: resource.command.as_ref(),
        args: resource.args.as_ref(),
        work_dir: resource.work_dir.as_ref(),
        env: &resource.env,
        resources: &resource.resources,
        mounts: &resource.mounts,
        ports: &resource.ports,
    };
    let prepared = pod::prepare(ctx, &id, &source, &catalog, peers, labels.clone())?;

    let max_restarts = resource
        .max_restarts
        .unwrap_or(ctx.config.default_max_restarts);
    let deadline = ctx.ambient.execution_time.filter(|t| *t > 0);

    let mut template = prepared.template;
    if let Some(spec) = template.spec.as_mut() {
        spec.active_deadline_seconds = deadline;
    }

    let primary = if replicas > 1 {
        if let Some(spec) = template.spec.as_mut() {
            spec.restart_policy = Some(resource.restart_policy.as_str().to_string());
        }
        CompiledResource::new(WorkerSet {
            metadata: ctx.metadata(&name, labels.clone()),
            task: task.name.clone(),
            resource: resource.name.clone(),
            job_id: ctx.config.build_id.clone(),
            replicas,
            max_restarts,
            allow_fail: resource.allow_fail,
            done_condition: resource.done_condition,
            selector: selector.clone(),
            nodes: resource
                .allocator
                .as_ref()
                .map(|a| a.nodes.clone())
                .unwrap_or_default(),
            restarts: BTreeMap::new(),
            template,
        })
    } else {
        let node = resource
            .allocator
            .as_ref()
            .and_then(|a| a.node_for(0))
            .map(str::to_string);
        if let Some(spec) = template.spec.as_mut() {
            spec.restart_policy = Some(resource.restart_policy.for_job().to_string());
            spec.hostname = Some(format!("{name}-0"));
            spec.subdomain = Some(name.clone());
            if let Some(node) = node {
                spec.node_selector = Some(BTreeMap::from([(NODE_HOSTNAME_KEY.to_string(), node)]));
            }
        }
        let hash = template_hash(&template).map_err(|e| e.in_component(&id.display()))?;
        let mut metadata = ctx.metadata(&name, labels.clone());
        metadata.annotations = Some(BTreeMap::from([(ANNOTATION_SPEC_HASH.to_string(), hash)]));

        CompiledResource::new(Job {
            metadata,
            spec: Some(JobSpec {
                backoff_limit: Some(i32::try_from(max_restarts).unwrap_or(i32::MAX)),
                active_deadline_seconds: deadline,
                template,
                ..Default::default()
            }),
            ..Default::default()
        })
        .with_upgrade(template_changed)
    };

    let mut compiled = primary.with_dependent(CompiledResource::new(Service {
        metadata: ctx.metadata(&name, labels),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(selector),
            ports: Some(pod::service_ports(&resource.ports)).filter(|p| !p.is_empty()),
            publish_not_ready_addresses: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }));
    for secret in prepared.secrets {
        compiled = compiled.with_dependent(secret);
    }

    tracing::debug!(
        task = %task.name,
        resource = %resource.name,
        replicas,
        max_restarts,
        "compiled task resource"
    );
    Ok(compiled)
}

/// Short content hash of a pod template
fn template_hash(template: &PodTemplateSpec) -> Result<String> {
    let bytes = serde_json::to_vec(template)
        .map_err(|e| Error::serialization_for_kind("Job", e.to_string()))?;
    let digest = Sha256::digest(&bytes);
    Ok(digest[..8].iter().map(|b| format!("{b:02x}")).collect())
}
