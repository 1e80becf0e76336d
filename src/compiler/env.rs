//! Environment assembly
//!
//! Platform variables first, then task peer variables, then the user's own
//! entries layered on top. A later entry replaces an earlier one of the same
//! name.

use k8s_openapi::api::core::v1::{EnvVar, EnvVarSource, ObjectFieldSelector, SecretKeySelector};

use super::labels::env_prefix;
use super::{CompilationContext, ComponentIdentity, ComponentKind};
use crate::crd::EnvEntry;
use crate::limits::ResolvedResources;
use crate::volume::MountEntry;

const PYTHONPATH: &str = "PYTHONPATH";

/// A literal variable
pub(crate) fn literal(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        value_from: None,
    }
}

fn secret_ref(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                optional: None,
            }),
            ..Default::default()
        }),
    }
}

fn field_ref(name: &str, path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                api_version: None,
                field_path: path.to_string(),
            }),
            ..Default::default()
        }),
    }
}

/// Insert `var`, replacing any entry of the same name in place
pub(crate) fn upsert(env: &mut Vec<EnvVar>, var: EnvVar) {
    match env.iter_mut().find(|e| e.name == var.name) {
        Some(existing) => *existing = var,
        None => env.push(var),
    }
}

/// Full environment of a component's container
pub(crate) fn assemble(
    ctx: &CompilationContext<'_>,
    id: &ComponentIdentity<'_>,
    resolved: &ResolvedResources,
    mounts: &[MountEntry],
    peers: &[EnvVar],
    user: &[EnvEntry],
) -> Vec<EnvVar> {
    let config = ctx.config;
    let mut env = vec![literal("BUILD_ID", &config.build_id)];
    if let Some(task) = id.task {
        env.push(literal("TASK_NAME", task));
    }
    env.push(literal("RESOURCE_NAME", id.name));
    env.push(field_ref("POD_NAME", "metadata.name"));
    env.push(literal("GPU_COUNT", resolved.gpu.to_string()));

    if let Some(path) = python_path(mounts, user) {
        env.push(literal(PYTHONPATH, path));
    }
    for mount in mounts {
        upsert(
            &mut env,
            literal(
                &format!("{}_DIR", env_prefix(&mount.volume)),
                &mount.mount_path,
            ),
        );
        if mount.is_train_log_dir {
            upsert(&mut env, literal("TRAIN_LOG_DIR", &mount.mount_path));
        }
    }

    if let Some(url) = &config.dealer_url {
        env.push(literal("CLOUD_DEALER_URL", url));
    }
    env.push(literal("PROJECT_NAME", &config.project.name));
    env.push(literal("PROJECT_ID", &config.project.id));
    env.push(literal("WORKSPACE_NAME", &config.workspace.name));
    env.push(literal("WORKSPACE_ID", &config.workspace.id));
    if id.kind != ComponentKind::Serving {
        if let Some(secret) = &config.workspace_secret {
            env.push(secret_ref("WORKSPACE_SECRET", &secret.name, &secret.key));
        }
    }
    if id.kind != ComponentKind::Task {
        env.push(literal("URL_PREFIX", url_prefix(ctx, id)));
    }

    for var in peers {
        upsert(&mut env, var.clone());
    }
    for entry in user.iter().filter(|e| e.name != PYTHONPATH) {
        let var = match &entry.secret {
            Some(secret) => secret_ref(&entry.name, &secret.name, &secret.key),
            None => EnvVar {
                name: entry.name.clone(),
                value: entry.value.clone(),
                value_from: None,
            },
        };
        upsert(&mut env, var);
    }
    env
}

/// Lib-flagged mount paths followed by the user's own `PYTHONPATH`
fn python_path(mounts: &[MountEntry], user: &[EnvEntry]) -> Option<String> {
    let mut parts: Vec<&str> = mounts
        .iter()
        .filter(|m| m.is_lib_dir)
        .map(|m| m.mount_path.as_str())
        .collect();
    if let Some(explicit) = user
        .iter()
        .find(|e| e.name == PYTHONPATH)
        .and_then(|e| e.value.as_deref())
        .filter(|v| !v.is_empty())
    {
        parts.push(explicit);
    }
    (!parts.is_empty()).then(|| parts.join(":"))
}

/// `<root>/<namespace>/<app>/<component>`
pub(crate) fn url_prefix(ctx: &CompilationContext<'_>, id: &ComponentIdentity<'_>) -> String {
    format!(
        "{}/{}/{}/{}",
        ctx.config.url_prefix.trim_end_matches('/'),
        ctx.namespace,
        ctx.app_name,
        id.name
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::fixtures;
    use crate::crd::SecretKeyRef;
    use crate::limits::ResourceLimit;

    fn value<'a>(env: &'a [EnvVar], name: &str) -> Option<&'a str> {
        env.iter()
            .find(|e| e.name == name)
            .and_then(|e| e.value.as_deref())
    }

    fn mount(volume: &str, path: &str, lib: bool) -> MountEntry {
        MountEntry {
            volume: volume.to_string(),
            mount_path: path.to_string(),
            is_lib_dir: lib,
            is_train_log_dir: false,
        }
    }

    fn user(name: &str, value: &str) -> EnvEntry {
        EnvEntry {
            name: name.to_string(),
            value: Some(value.to_string()),
            secret: None,
        }
    }

    fn assemble_for(
        id: ComponentIdentity<'_>,
        mounts: &[MountEntry],
        peers: &[EnvVar],
        entries: &[EnvEntry],
    ) -> Vec<EnvVar> {
        let config = fixtures::config();
        let ambient = ResourceLimit::default();
        let resolved = ResolvedResources {
            gpu: 2,
            ..Default::default()
        };
        fixtures::with_context(&config, &ambient, &[], &[], |ctx| {
            assemble(ctx, &id, &resolved, mounts, peers, entries)
        })
    }

    #[test]
    fn platform_variables_for_task_resources() {
        let env = assemble_for(
            ComponentIdentity::task_resource("train", "worker", 2),
            &[],
            &[],
            &[],
        );
        assert_eq!(value(&env, "BUILD_ID"), Some("b-42"));
        assert_eq!(value(&env, "TASK_NAME"), Some("train"));
        assert_eq!(value(&env, "RESOURCE_NAME"), Some("worker"));
        assert_eq!(value(&env, "GPU_COUNT"), Some("2"));
        assert_eq!(value(&env, "CLOUD_DEALER_URL"), Some("https://dealer.local"));
        assert_eq!(value(&env, "WORKSPACE_ID"), Some("ws-9"));
        assert_eq!(value(&env, "PROJECT_NAME"), Some("vision"));
        assert!(value(&env, "URL_PREFIX").is_none());

        let pod_name = env.iter().find(|e| e.name == "POD_NAME").unwrap();
        let field = pod_name.value_from.as_ref().unwrap().field_ref.as_ref().unwrap();
        assert_eq!(field.field_path, "metadata.name");
    }

    #[test]
    fn workspace_secret_is_a_reference_except_for_serving() {
        let env = assemble_for(ComponentIdentity::uix("board"), &[], &[], &[]);
        let secret = env.iter().find(|e| e.name == "WORKSPACE_SECRET").unwrap();
        let selector = secret
            .value_from
            .as_ref()
            .unwrap()
            .secret_key_ref
            .as_ref()
            .unwrap();
        assert_eq!(selector.name, "ws-token");
        assert_eq!(selector.key, "token");
        assert!(secret.value.is_none());

        let env = assemble_for(ComponentIdentity::serving("predict"), &[], &[], &[]);
        assert!(env.iter().all(|e| e.name != "WORKSPACE_SECRET"));
    }

    #[test]
    fn python_path_joins_lib_mounts_and_explicit_entry() {
        let env = assemble_for(
            ComponentIdentity::task_resource("train", "worker", 2),
            &[
                mount("libs", "/mnt/libs", true),
                mount("data", "/data", false),
                mount("extra", "/opt/extra", true),
            ],
            &[],
            &[user("PYTHONPATH", "/usr/local/site")],
        );
        assert_eq!(
            value(&env, "PYTHONPATH"),
            Some("/mnt/libs:/opt/extra:/usr/local/site")
        );
        assert_eq!(env.iter().filter(|e| e.name == "PYTHONPATH").count(), 1);
        assert_eq!(value(&env, "DATA_DIR"), Some("/data"));
        assert_eq!(value(&env, "LIBS_DIR"), Some("/mnt/libs"));
    }

    #[test]
    fn user_entries_replace_platform_ones() {
        let env = assemble_for(
            ComponentIdentity::task_resource("train", "worker", 2),
            &[],
            &[literal("WORKER_NODES", "3")],
            &[
                user("BUILD_ID", "override"),
                EnvEntry {
                    name: "API_TOKEN".to_string(),
                    value: None,
                    secret: Some(SecretKeyRef {
                        name: "api".to_string(),
                        key: "token".to_string(),
                    }),
                },
            ],
        );
        assert_eq!(value(&env, "BUILD_ID"), Some("override"));
        assert_eq!(env.iter().filter(|e| e.name == "BUILD_ID").count(), 1);
        assert_eq!(value(&env, "WORKER_NODES"), Some("3"));
        let token = env.iter().find(|e| e.name == "API_TOKEN").unwrap();
        assert!(token.value_from.as_ref().unwrap().secret_key_ref.is_some());
    }

    #[test]
    fn url_prefix_scopes_by_namespace_app_and_component() {
        let env = assemble_for(ComponentIdentity::serving("predict"), &[], &[], &[]);
        assert_eq!(value(&env, "URL_PREFIX"), Some("/apps/ml/mnist/predict"));
    }
}
