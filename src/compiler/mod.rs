//! App compiler
//!
//! Turns an [`App`] into [`CompiledResource`] graphs, one per component:
//!
//! - task resources: a `Job` (single replica) or a [`WorkerSet`](crate::workload::WorkerSet)
//!   plus a headless `Service` for stable peer hostnames
//! - UI components: a `Deployment` plus a `Service`
//! - serving endpoints: a `Deployment`, a `Service` and optionally an autoscaler
//!
//! Every compiler call receives an explicit [`CompilationContext`] carrying the
//! configuration, the ambient ceiling and a read-only view of the app's volumes
//! and secrets.
//!
//! # Usage
//!
//! ```text
//! let compiler = AppCompiler::new(&config, &ambient, &catalog);
//! let compiled = compiler.compile(&mut app)?;
//! // compiled.namespace, compiled.resources, compiled.errors
//! ```
//!
//! Compilation errors are reported per component: a failing component is
//! recorded in [`CompiledApp::errors`] and the rest of the batch still compiles.

mod env;
mod labels;
mod pod;
mod serving;
mod task;
mod uix;

pub use labels::sanitize_dns_label;

use labels::{bounded_dns_label, MAX_DNS_LABEL};

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::config::CompilerConfig;
use crate::crd::{App, SecretSpec};
use crate::limits::ResourceLimit;
use crate::volume::{inject_task_revisions, RevisionCatalog, VolumeCatalog};
use crate::workload::{ClusterObject, CompiledResource};
use crate::{Error, Result, LABEL_MANAGED_BY, LABEL_MANAGED_BY_TRELLIS};

/// Kind of component being compiled
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComponentKind {
    /// A resource of a task
    Task,
    /// An interactive UI component
    Uix,
    /// A model-serving endpoint
    Serving,
}

impl ComponentKind {
    /// Value of the component-type label
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Uix => "uix",
            Self::Serving => "serving",
        }
    }
}

/// Identity of one component within the app
#[derive(Clone, Copy, Debug)]
pub(crate) struct ComponentIdentity<'a> {
    pub kind: ComponentKind,
    pub task: Option<&'a str>,
    pub name: &'a str,
    /// Characters kept free for a `-<index>` hostname suffix
    suffix: usize,
}

impl<'a> ComponentIdentity<'a> {
    /// A task resource whose replicas are addressed as `<object>-<index>`
    pub fn task_resource(task: &'a str, resource: &'a str, replicas: u32) -> Self {
        Self {
            kind: ComponentKind::Task,
            task: Some(task),
            name: resource,
            suffix: 1 + replicas.saturating_sub(1).to_string().len(),
        }
    }

    pub fn uix(name: &'a str) -> Self {
        Self {
            kind: ComponentKind::Uix,
            task: None,
            name,
            suffix: 0,
        }
    }

    pub fn serving(name: &'a str) -> Self {
        Self {
            kind: ComponentKind::Serving,
            task: None,
            name,
            suffix: 0,
        }
    }

    /// Name of the primary object (and of the component label)
    ///
    /// Bounded so that `<object>-<index>` still fits a DNS label.
    pub fn object_name(&self, ctx: &CompilationContext<'_>) -> String {
        let raw = match self.task {
            Some(task) => format!("{}-{task}-{}", ctx.app_name, self.name),
            None => format!("{}-{}", ctx.app_name, self.name),
        };
        bounded_dns_label(&raw, MAX_DNS_LABEL - self.suffix)
    }

    /// Name used in error reports
    pub fn display(&self) -> String {
        match self.task {
            Some(task) => format!("{task}/{}", self.name),
            None => self.name.to_string(),
        }
    }
}

/// Read-only state threaded through every compiler call
#[derive(Clone, Copy, Debug)]
pub struct CompilationContext<'a> {
    /// Compiler configuration
    pub config: &'a CompilerConfig,
    /// Effective ambient ceiling (workspace quota combined with the cluster ceiling)
    pub ambient: &'a ResourceLimit,
    /// App name
    pub app_name: &'a str,
    /// Target namespace
    pub namespace: &'a str,
    /// Labels copied from the app onto every object
    pub app_labels: &'a BTreeMap<String, String>,
    /// The app's volumes
    pub volumes: &'a VolumeCatalog,
    /// The app's declared secrets
    pub secrets: &'a [SecretSpec],
}

impl CompilationContext<'_> {
    /// Metadata for an object of this app
    pub(crate) fn metadata(&self, name: &str, labels: BTreeMap<String, String>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        }
    }
}

/// Output of compiling an app
#[derive(Debug)]
pub struct CompiledApp {
    /// Target namespace (applied first)
    pub namespace: CompiledResource,
    /// One graph per component that compiled
    pub resources: Vec<CompiledResource>,
    /// One error per component that did not
    pub errors: Vec<Error>,
}

impl CompiledApp {
    /// Every graph in apply order, namespace first
    pub fn graphs(&self) -> impl Iterator<Item = &CompiledResource> {
        std::iter::once(&self.namespace).chain(self.resources.iter())
    }

    /// Every object, dependents before the object depending on them
    pub fn objects(&self) -> Vec<&ClusterObject> {
        self.graphs()
            .flat_map(|g| g.apply_order())
            .map(|r| &r.object)
            .collect()
    }

    /// True when every component compiled
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Compiles whole apps
pub struct AppCompiler<'a> {
    config: &'a CompilerConfig,
    ambient: &'a ResourceLimit,
    revisions: &'a dyn RevisionCatalog,
}

impl<'a> AppCompiler<'a> {
    /// Create a compiler
    ///
    /// # Arguments
    /// * `config` - Compiler configuration
    /// * `ambient` - Effective ceiling (see [`crate::limits::effective_limit`])
    /// * `revisions` - Source of current dataset/model versions
    pub fn new(
        config: &'a CompilerConfig,
        ambient: &'a ResourceLimit,
        revisions: &'a dyn RevisionCatalog,
    ) -> Self {
        Self {
            config,
            ambient,
            revisions,
        }
    }

    /// Compile an app
    ///
    /// Revision injection runs per task right before that task compiles and
    /// writes resolved versions back into `app`. Document-level problems
    /// (missing name, duplicate names, bad volumes) fail the whole call;
    /// component-level problems are collected in [`CompiledApp::errors`].
    pub fn compile(&self, app: &mut App) -> Result<CompiledApp> {
        let app_name = app.app_name()?.to_string();
        let namespace = app
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| self.config.namespace.clone());
        if namespace.is_empty() {
            return Err(Error::validation(format!(
                "app '{app_name}' has no namespace and none is configured"
            )));
        }
        let app_labels = app.app_labels();
        app.spec.validate()?;

        let mut resources = Vec::new();
        let mut errors = Vec::new();

        for index in 0..app.spec.tasks.len() {
            if let Err(e) = inject_task_revisions(&mut app.spec, index, self.revisions) {
                tracing::warn!(app = %app_name, error = %e, "revision injection failed");
                errors.push(e);
                continue;
            }

            let catalog = VolumeCatalog::new(&app.spec.volumes);
            let ctx = CompilationContext {
                config: self.config,
                ambient: self.ambient,
                app_name: &app_name,
                namespace: &namespace,
                app_labels: &app_labels,
                volumes: &catalog,
                secrets: &app.spec.secrets,
            };
            let spec = &app.spec.tasks[index];
            let peers = task::peer_env(&ctx, spec);
            for resource in &spec.resources {
                collect(
                    task::compile_task_resource(&ctx, spec, resource, &peers),
                    &mut resources,
                    &mut errors,
                );
            }
        }

        let catalog = VolumeCatalog::new(&app.spec.volumes);
        let ctx = CompilationContext {
            config: self.config,
            ambient: self.ambient,
            app_name: &app_name,
            namespace: &namespace,
            app_labels: &app_labels,
            volumes: &catalog,
            secrets: &app.spec.secrets,
        };
        for spec in &app.spec.uix {
            collect(uix::compile_uix(&ctx, spec), &mut resources, &mut errors);
        }
        for spec in &app.spec.servings {
            collect(
                serving::compile_serving(&ctx, spec),
                &mut resources,
                &mut errors,
            );
        }

        tracing::info!(
            app = %app_name,
            namespace = %namespace,
            compiled = resources.len(),
            failed = errors.len(),
            "compiled app"
        );

        Ok(CompiledApp {
            namespace: compile_namespace(&namespace, &app_labels),
            resources,
            errors,
        })
    }
}

fn collect(
    result: Result<CompiledResource>,
    resources: &mut Vec<CompiledResource>,
    errors: &mut Vec<Error>,
) {
    match result {
        Ok(resource) => {
            tracing::debug!(
                kind = %resource.object.kind(),
                name = %resource.object.name(),
                dependents = resource.dependents.len(),
                "compiled component"
            );
            resources.push(resource);
        }
        Err(e) => {
            tracing::warn!(error = %e, "component failed to compile");
            errors.push(e);
        }
    }
}

fn compile_namespace(name: &str, app_labels: &BTreeMap<String, String>) -> CompiledResource {
    let mut labels = app_labels.clone();
    labels.insert(
        LABEL_MANAGED_BY.to_string(),
        LABEL_MANAGED_BY_TRELLIS.to_string(),
    );
    CompiledResource::new(Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        ..Default::default()
    })
}

// =============================================================================
// Test fixtures shared by the component compilers
// =============================================================================


#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::{MockRevisionCatalog, StaticCatalog};
    use crate::workload::ObjectKind;

    const APP: &str = r#"
apiVersion: trellis.dev/v1
kind: App
metadata:
  name: mnist
  labels:
    team: vision
spec:
  tasks:
    - name: train
      resources:
        - name: worker
          replicas: 3
          image: {cpu: "trainer:cpu", gpu: "trainer:cuda"}
          mounts:
            - volume: data
        - name: ps
          image: {cpu: "trainer:cpu"}
  uix:
    - name: board
      image: {cpu: "board:1"}
      ports:
        - {name: http, port: 8080}
  servings:
    - name: predict
      image: {cpu: "serve:1"}
      resources:
        requests: {cpu: 500m}
      autoscale: {}
  volumes:
    - name: data
      nfs: {server: nfs.local, path: /exports/data}
"#;

    fn compile(app: &mut App) -> CompiledApp {
        let config = fixtures::config();
        let ambient = ResourceLimit::default();
        let catalog = StaticCatalog::default();
        AppCompiler::new(&config, &ambient, &catalog)
            .compile(app)
            .unwrap()
    }

    // =========================================================================
    // Story: Whole App Compilation
    // =========================================================================

    #[test]
    fn story_every_component_gets_a_graph() {
        let mut app = App::from_yaml(APP).unwrap();
        let compiled = compile(&mut app);

        assert!(compiled.is_complete());
        let kinds: Vec<_> = compiled.resources.iter().map(|r| r.object.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                ObjectKind::WorkerSet,
                ObjectKind::Job,
                ObjectKind::Deployment,
                ObjectKind::Deployment
            ]
        );
        let names: Vec<_> = compiled.resources.iter().map(|r| r.object.name()).collect();
        assert_eq!(
            names,
            vec!["mnist-train-worker", "mnist-train-ps", "mnist-board", "mnist-predict"]
        );
    }

    #[test]
    fn story_namespace_is_applied_first() {
        let mut app = App::from_yaml(APP).unwrap();
        let compiled = compile(&mut app);

        assert_eq!(compiled.namespace.object.kind(), ObjectKind::Namespace);
        assert_eq!(compiled.namespace.object.name(), "ml");
        let objects = compiled.objects();
        assert_eq!(objects[0].kind(), ObjectKind::Namespace);
        assert!(objects
            .iter()
            .skip(1)
            .all(|o| o.namespace() == Some("ml")));
    }

    #[test]
    fn story_app_namespace_wins_over_configured_one() {
        let mut app = App::from_yaml(APP).unwrap();
        app.metadata.namespace = Some("team-a".to_string());
        let compiled = compile(&mut app);
        assert_eq!(compiled.namespace.object.name(), "team-a");
        assert_eq!(compiled.resources[0].object.namespace(), Some("team-a"));
    }

    // =========================================================================
    // Story: Component Failures Do Not Abort The Batch
    // =========================================================================

    #[test]
    fn story_missing_volume_fails_only_its_component() {
        let mut app = App::from_yaml(APP).unwrap();
        app.spec.uix[0].mounts.push(crate::crd::MountSpec {
            volume: "nowhere".to_string(),
            mount_path: None,
            sub_path: None,
            read_only: false,
        });
        let compiled = compile(&mut app);

        assert_eq!(compiled.errors.len(), 1);
        assert!(matches!(
            &compiled.errors[0],
            Error::Compilation { component, .. } if component == "board"
        ));
        assert_eq!(compiled.resources.len(), 3);
        assert!(!compiled.is_complete());
    }

    #[test]
    fn story_bad_quantity_names_the_task_resource() {
        let mut app = App::from_yaml(APP).unwrap();
        app.spec.tasks[0].resources[1].resources.limits.cpu = Some("lots".to_string());
        let compiled = compile(&mut app);

        assert_eq!(compiled.errors.len(), 1);
        assert!(matches!(
            &compiled.errors[0],
            Error::Compilation { component, .. } if component == "train/ps"
        ));
        assert_eq!(compiled.resources.len(), 3);
    }

    #[test]
    fn story_catalog_failure_skips_the_task() {
        let mut app = App::from_yaml(
            r#"
metadata: {name: mnist}
spec:
  tasks:
    - name: train
      resources:
        - name: worker
          image: {cpu: "trainer:cpu"}
          mounts: [{volume: mnist}]
  volumes:
    - name: mnist
      flex: {driver: trellis/artifacts, options: {type: dataset}}
"#,
        )
        .unwrap();
        let config = fixtures::config();
        let ambient = ResourceLimit::default();
        let mut catalog = MockRevisionCatalog::new();
        catalog
            .expect_current_version()
            .returning(|_, _| Err(Error::collaborator("catalog", "unreachable")));

        let compiled = AppCompiler::new(&config, &ambient, &catalog)
            .compile(&mut app)
            .unwrap();
        assert!(compiled.resources.is_empty());
        assert!(matches!(
            &compiled.errors[0],
            Error::Compilation { component, .. } if component == "train"
        ));
    }

    // =========================================================================
    // Story: Document-Level Errors
    // =========================================================================

    #[test]
    fn story_nameless_app_is_rejected() {
        let mut app = App::from_yaml(APP).unwrap();
        app.metadata.name = None;
        let config = fixtures::config();
        let ambient = ResourceLimit::default();
        let catalog = StaticCatalog::default();
        let err = AppCompiler::new(&config, &ambient, &catalog)
            .compile(&mut app)
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn story_resolved_versions_are_written_back() {
        let mut app = App::from_yaml(
            r#"
metadata: {name: mnist}
spec:
  tasks:
    - name: train
      resources:
        - name: worker
          image: {cpu: "trainer:cpu"}
          mounts: [{volume: mnist}]
  volumes:
    - name: mnist
      flex: {driver: trellis/artifacts, options: {type: dataset}}
"#,
        )
        .unwrap();
        let config = fixtures::config();
        let ambient = ResourceLimit::default();
        let catalog = StaticCatalog::new(BTreeMap::from([(
            "dataset/mnist".to_string(),
            "v3".to_string(),
        )]));
        let compiled = AppCompiler::new(&config, &ambient, &catalog)
            .compile(&mut app)
            .unwrap();

        assert!(compiled.is_complete());
        assert_eq!(app.spec.tasks[0].revisions[0].version, "v3");
        let options = &app.spec.volumes[0].flex.as_ref().unwrap().options;
        assert_eq!(options.get("version").map(String::as_str), Some("v3"));
    }

    #[test]
    fn story_object_names_are_dns_safe() {
        let config = fixtures::config();
        let ambient = ResourceLimit::default();
        fixtures::with_context(&config, &ambient, &[], &[], |ctx| {
            let id = ComponentIdentity::task_resource("Train_Job", "Worker", 1);
            assert_eq!(id.object_name(ctx), "mnist-train-job-worker");
            assert_eq!(id.display(), "Train_Job/Worker");
        });
    }
}
