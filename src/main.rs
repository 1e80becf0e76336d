//! Trellis CLI - compile App documents and apply them to a cluster

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, CustomResourceExt};
use serde::Deserialize;
use tracing::{error, info};

use trellis::compiler::{AppCompiler, CompiledApp};
use trellis::config::CompilerConfig;
use trellis::controller::{KubeClusterClient, Reconciler};
use trellis::crd::App;
use trellis::limits::{effective_limit, StaticLimits};
use trellis::telemetry::{init_logging, LogFormat};
use trellis::volume::StaticCatalog;
use trellis::workload::{ClusterObject, CompiledResource};

/// Trellis - compiles App specs into Kubernetes objects and reconciles them
#[derive(Parser, Debug)]
#[command(name = "trellis", version, about, long_about = None)]
struct Cli {
    /// Compiler configuration file (YAML)
    #[arg(long, env = "TRELLIS_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Target namespace, overrides the configuration file
    #[arg(long, env = "TRELLIS_NAMESPACE", global = true)]
    namespace: Option<String>,

    /// Build id stamped on every object, overrides the configuration file
    #[arg(long, env = "TRELLIS_BUILD_ID", global = true)]
    build_id: Option<String>,

    /// Log output format
    #[arg(long, env = "TRELLIS_LOG_FORMAT", value_enum, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compile an App and print the generated objects as YAML
    ///
    /// Worker sets are printed as the pods they fan out to.
    Compile(CompileArgs),

    /// Compile an App and apply the result to the cluster
    Apply(ApplyArgs),

    /// Print the App CRD manifest
    Crd,
}

#[derive(Parser, Debug)]
struct CompileArgs {
    /// Path to the App YAML document
    #[arg(short = 'f', long = "file")]
    file: PathBuf,
}

#[derive(Parser, Debug)]
struct ApplyArgs {
    /// Path to the App YAML document
    #[arg(short = 'f', long = "file")]
    file: PathBuf,

    /// Extra manifests applied after the App, multi-document YAML
    #[arg(long = "manifests")]
    manifests: Vec<PathBuf>,

    /// Kubeconfig to use instead of the in-cluster / default one
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => CompilerConfig::load(path)?,
        None => CompilerConfig::default(),
    };
    if let Some(namespace) = cli.namespace {
        config.namespace = namespace;
    }
    if let Some(build_id) = cli.build_id {
        config.build_id = build_id;
    }
    if let Some(format) = cli.log_format {
        config.log_format = format;
    }
    init_logging(config.log_format)?;

    match cli.command {
        Commands::Crd => {
            let crd = serde_yaml::to_string(&App::crd())
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("{crd}");
            Ok(())
        }
        Commands::Compile(args) => {
            let compiled = compile(&config, &args.file).await?;
            print!("{}", render(&compiled)?);
            finish(&compiled)
        }
        Commands::Apply(args) => run_apply(&config, args).await,
    }
}

/// Read an App document and compile it
async fn compile(config: &CompilerConfig, path: &Path) -> anyhow::Result<CompiledApp> {
    config.validate()?;

    let doc = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
    let mut app = App::from_yaml(&doc)?;

    let quotas = StaticLimits::new(config.workspace_limit.clone());
    let ambient = effective_limit(&quotas, &config.workspace.id, &config.cluster_limit).await?;
    let catalog = StaticCatalog::new(config.revisions.clone());

    let compiled = AppCompiler::new(config, &ambient, &catalog).compile(&mut app)?;
    info!(
        app = %app.app_name()?,
        namespace = %compiled.namespace.object.name(),
        resources = compiled.resources.len(),
        errors = compiled.errors.len(),
        "compiled app"
    );
    Ok(compiled)
}

/// Multi-document YAML of every compiled object
fn render(compiled: &CompiledApp) -> anyhow::Result<String> {
    let mut docs = Vec::new();
    for object in compiled.objects() {
        match object {
            ClusterObject::WorkerSet(set) => {
                for pod in set.expand_all() {
                    docs.push(serde_yaml::to_string(&pod)?);
                }
            }
            other => docs.push(serde_yaml::to_string(&other.to_value()?)?),
        }
    }
    Ok(docs.iter().map(|d| format!("---\n{d}")).collect())
}

/// Turn per-component failures into a non-zero exit
fn finish(compiled: &CompiledApp) -> anyhow::Result<()> {
    if compiled.is_complete() {
        return Ok(());
    }
    for e in &compiled.errors {
        error!(error = %e, "component failed to compile");
    }
    anyhow::bail!("{} component(s) failed to compile", compiled.errors.len())
}

async fn kube_client(kubeconfig: Option<&Path>) -> anyhow::Result<Client> {
    match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)?;
            let config =
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await?;
            Ok(Client::try_from(config)?)
        }
        None => Ok(Client::try_default().await?),
    }
}

/// Parse a multi-document manifest file into standalone graphs
async fn read_manifests(path: &Path, namespace: &str) -> anyhow::Result<Vec<CompiledResource>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;

    let mut graphs = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(&text) {
        let value = serde_json::Value::deserialize(doc)
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))?;
        if value.is_null() {
            continue;
        }
        let object = ClusterObject::from_manifest(value)?.with_default_namespace(namespace);
        graphs.push(CompiledResource::new(object));
    }
    Ok(graphs)
}

async fn run_apply(config: &CompilerConfig, args: ApplyArgs) -> anyhow::Result<()> {
    let compiled = compile(config, &args.file).await?;
    let namespace = compiled.namespace.object.name().to_string();

    let mut extra = Vec::new();
    for path in &args.manifests {
        extra.extend(read_manifests(path, &namespace).await?);
    }

    let client = kube_client(args.kubeconfig.as_deref()).await?;
    let reconciler = Reconciler::new(Arc::new(KubeClusterClient::new(
        client,
        config.field_manager.clone(),
    )));

    reconciler.apply_all(compiled.graphs()).await?;
    reconciler.apply_all(&extra).await?;

    for resource in &compiled.resources {
        if let ClusterObject::WorkerSet(set) = &resource.object {
            let phase = reconciler.worker_set_status(set).await?;
            info!(worker_set = %set.name(), ?phase, "worker set applied");
        }
    }

    finish(&compiled)
}
