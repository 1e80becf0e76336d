//! Worker-set fan-out against live pods

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, info, warn};

use super::client::ClusterClient;
use super::wait::wait_deleted;
use crate::workload::{
    pod_phase, replica_index, restart_count, worker_set_phase, ClusterObject, ObjectKey,
    ObjectKind, WorkerSet, WorkerSetPhase,
};
use crate::{Error, Result};

fn namespace(set: &WorkerSet) -> Result<&str> {
    set.metadata
        .namespace
        .as_deref()
        .ok_or_else(|| Error::validation(format!("worker set {} has no namespace", set.name())))
}

async fn live_pods(client: &dyn ClusterClient, set: &WorkerSet) -> Result<BTreeMap<u32, Pod>> {
    let pods = client
        .list_pods(namespace(set)?, &set.label_selector())
        .await?;
    Ok(pods
        .into_iter()
        .filter_map(|p| replica_index(&p).map(|i| (i, p)))
        .collect())
}

async fn create_replica(
    client: &dyn ClusterClient,
    set: &WorkerSet,
    index: u32,
    restart: u32,
) -> Result<()> {
    let pod = set.expand(index, set.assigned_node(index), restart);
    match client.create(&ClusterObject::from(pod)).await {
        Ok(()) => {
            info!(worker_set = %set.name(), index, restart, "created replica");
            Ok(())
        }
        Err(e) if e.is_already_exists() => {
            debug!(worker_set = %set.name(), index, "replica already exists");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn replace_replica(
    client: &dyn ClusterClient,
    set: &WorkerSet,
    index: u32,
    restart: u32,
) -> Result<()> {
    let key = ObjectKey::namespaced(ObjectKind::Pod, namespace(set)?, &set.pod_name(index));
    client.delete(&key).await?;
    wait_deleted(client, &key).await?;
    create_replica(client, set, index, restart).await
}

/// Bring the replicas of a worker set to their desired state
///
/// Per index: a missing pod is created; a pod of an older build or with an
/// older restart counter is replaced; a failed pod is recreated with its
/// counter incremented while restarts remain. A replica that exhausted its restarts is tolerated when the
/// set allows failures and is an error otherwise. Pods with an index beyond the
/// replica count are deleted.
pub async fn apply_worker_set(client: &dyn ClusterClient, set: &WorkerSet) -> Result<()> {
    let live = live_pods(client, set).await?;

    for index in 0..set.replicas {
        let desired = set.desired_restart(index);
        let Some(pod) = live.get(&index) else {
            create_replica(client, set, index, desired).await?;
            continue;
        };

        let current = restart_count(pod);
        if !set.owns_build_of(pod) {
            info!(worker_set = %set.name(), index, "replacing replica of a previous build");
            replace_replica(client, set, index, desired).await?;
        } else if current < desired {
            info!(worker_set = %set.name(), index, current, desired, "replacing stale replica");
            replace_replica(client, set, index, desired).await?;
        } else if pod_phase(pod) == Some("Failed") {
            if current < set.max_restarts {
                info!(worker_set = %set.name(), index, restart = current + 1, "restarting failed replica");
                replace_replica(client, set, index, current + 1).await?;
            } else if set.allow_fail {
                warn!(worker_set = %set.name(), index, restarts = current, "replica failed, tolerated");
            } else {
                return Err(Error::ReplicaFailed {
                    worker_set: set.name().to_string(),
                    index,
                    restarts: current,
                });
            }
        } else {
            debug!(worker_set = %set.name(), index, "replica up to date");
        }
    }

    for (index, pod) in live.range(set.replicas..) {
        let name = pod.metadata.name.as_deref().unwrap_or_default();
        info!(worker_set = %set.name(), index, pod = %name, "deleting surplus replica");
        client
            .delete(&ObjectKey::namespaced(ObjectKind::Pod, namespace(set)?, name))
            .await?;
    }
    Ok(())
}

/// Current phase of a worker set from its live pods
pub async fn worker_set_status(
    client: &dyn ClusterClient,
    set: &WorkerSet,
) -> Result<WorkerSetPhase> {
    let pods: Vec<Pod> = live_pods(client, set).await?.into_values().collect();
    Ok(worker_set_phase(set, &pods))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::client::MockClusterClient;
    use k8s_openapi::api::core::v1::{PodSpec, PodStatus, PodTemplateSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::{Arc, Mutex};

    fn set(replicas: u32, max_restarts: u32, allow_fail: bool) -> WorkerSet {
        WorkerSet {
            metadata: ObjectMeta {
                name: Some("mnist-train-worker".to_string()),
                namespace: Some("ml".to_string()),
                ..Default::default()
            },
            replicas,
            max_restarts,
            allow_fail,
            selector: BTreeMap::from([(
                "trellis.dev/component-name".to_string(),
                "mnist-train-worker".to_string(),
            )]),
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec::default()),
            },
            ..Default::default()
        }
    }

    fn live(set: &WorkerSet, index: u32, restart: u32, phase: &str) -> Pod {
        let mut pod = set.expand(index, None, restart);
        pod.status = Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        });
        pod
    }

    fn created_restarts(created: &Mutex<Vec<ClusterObject>>) -> Vec<(String, u32)> {
        created
            .lock()
            .unwrap()
            .iter()
            .map(|o| match o {
                ClusterObject::Pod(p) => (o.name().to_string(), restart_count(p)),
                other => panic!("unexpected object: {other:?}"),
            })
            .collect()
    }

    fn recording(pods: Vec<Pod>) -> (MockClusterClient, Arc<Mutex<Vec<ClusterObject>>>) {
        let created = Arc::new(Mutex::new(Vec::new()));
        let sink = created.clone();
        let mut client = MockClusterClient::new();
        client
            .expect_list_pods()
            .returning(move |_, _| Ok(pods.clone()));
        client.expect_create().returning(move |o| {
            sink.lock().unwrap().push(o.clone());
            Ok(())
        });
        (client, created)
    }

    #[tokio::test]
    async fn missing_replicas_are_created() {
        let set = set(3, 0, false);
        let (mut client, created) = recording(vec![live(&set, 1, 0, "Running")]);
        client.expect_delete().never();

        apply_worker_set(&client, &set).await.unwrap();
        assert_eq!(
            created_restarts(&created),
            vec![
                ("mnist-train-worker-0".to_string(), 0),
                ("mnist-train-worker-2".to_string(), 0)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_replica_is_recreated_with_next_restart() {
        let set = set(1, 2, false);
        let (mut client, created) = recording(vec![live(&set, 0, 1, "Failed")]);
        client.expect_delete().times(1).returning(|_| Ok(()));
        client.expect_get().returning(|_| Ok(None));

        apply_worker_set(&client, &set).await.unwrap();
        assert_eq!(
            created_restarts(&created),
            vec![("mnist-train-worker-0".to_string(), 2)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stale_replica_is_replaced() {
        let mut set = set(1, 0, false);
        set.restarts.insert(0, 1);
        let (mut client, created) = recording(vec![live(&set, 0, 0, "Running")]);
        client.expect_delete().times(1).returning(|_| Ok(()));
        client.expect_get().returning(|_| Ok(None));

        apply_worker_set(&client, &set).await.unwrap();
        assert_eq!(
            created_restarts(&created),
            vec![("mnist-train-worker-0".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn exhausted_replica_fails_the_set() {
        let set = set(2, 1, false);
        let (mut client, _) = recording(vec![
            live(&set, 0, 1, "Failed"),
            live(&set, 1, 0, "Running"),
        ]);
        client.expect_delete().never();

        let err = apply_worker_set(&client, &set).await.unwrap_err();
        assert!(matches!(
            err,
            Error::ReplicaFailed { index: 0, restarts: 1, .. }
        ));
    }

    #[tokio::test]
    async fn exhausted_replica_is_tolerated_when_allowed() {
        let set = set(2, 0, true);
        let (mut client, created) = recording(vec![
            live(&set, 0, 0, "Failed"),
            live(&set, 1, 0, "Running"),
        ]);
        client.expect_delete().never();

        apply_worker_set(&client, &set).await.unwrap();
        assert!(created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn surplus_replicas_are_deleted() {
        let set = set(1, 0, false);
        let pods = vec![live(&set, 0, 0, "Running"), live(&set, 2, 0, "Running")];
        let (mut client, _) = recording(pods);
        client
            .expect_delete()
            .withf(|key| key.name == "mnist-train-worker-2")
            .times(1)
            .returning(|_| Ok(()));

        apply_worker_set(&client, &set).await.unwrap();
    }

    #[tokio::test]
    async fn status_reflects_live_pods() {
        let set = set(2, 0, false);
        let (client, _) = recording(vec![
            live(&set, 0, 0, "Succeeded"),
            live(&set, 1, 0, "Succeeded"),
        ]);
        assert_eq!(
            worker_set_status(&client, &set).await.unwrap(),
            WorkerSetPhase::Succeeded
        );
    }
}
