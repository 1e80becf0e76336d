//! Blocking wait primitives
//!
//! Poll an object every [`POLL_INTERVAL`] until it reaches the awaited state or
//! [`WAIT_TIMEOUT`] elapses. On timeout the object is deleted (best effort) so
//! nothing is left behind half-ready.

use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, warn};

use super::client::ClusterClient;
use crate::workload::{pod_phase, ClusterObject, ObjectKey, ObjectKind};
use crate::{Error, Result};

/// Poll period
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Give-up deadline
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(60);

async fn poll_until<F>(
    client: &dyn ClusterClient,
    key: &ObjectKey,
    timeout: Duration,
    delete_on_timeout: bool,
    done: F,
) -> Result<Option<ClusterObject>>
where
    F: Fn(Option<&ClusterObject>) -> bool,
{
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut ticker = tokio::time::interval(POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                if delete_on_timeout {
                    if let Err(e) = client.delete(key).await {
                        warn!(object = %key, error = %e, "cleanup after wait timeout failed");
                    }
                }
                return Err(Error::WaitTimeout {
                    kind: key.kind.to_string(),
                    name: key.name.clone(),
                    timeout,
                });
            }
            _ = ticker.tick() => {
                let live = client.get(key).await?;
                if done(live.as_ref()) {
                    return Ok(live);
                }
            }
        }
    }
}

fn phase_in(object: Option<&ClusterObject>, phases: &[&str]) -> bool {
    match object {
        Some(ClusterObject::Pod(pod)) => pod_phase(pod).is_some_and(|p| phases.contains(&p)),
        _ => false,
    }
}

fn into_pod(object: Option<ClusterObject>, key: &ObjectKey) -> Result<Pod> {
    match object {
        Some(ClusterObject::Pod(pod)) => Ok(*pod),
        _ => Err(Error::validation(format!("{key} is not a pod"))),
    }
}

/// Wait until a pod is running
pub async fn wait_pod(client: &dyn ClusterClient, namespace: &str, name: &str) -> Result<Pod> {
    wait_pod_for(client, namespace, name, WAIT_TIMEOUT).await
}

/// [`wait_pod`] with an explicit timeout
pub async fn wait_pod_for(
    client: &dyn ClusterClient,
    namespace: &str,
    name: &str,
    timeout: Duration,
) -> Result<Pod> {
    let key = ObjectKey::namespaced(ObjectKind::Pod, namespace, name);
    let live = poll_until(client, &key, timeout, true, |o| phase_in(o, &["Running"])).await?;
    debug!(pod = %key, "pod running");
    into_pod(live, &key)
}

/// Wait until a pod has succeeded or failed
pub async fn wait_pod_complete(
    client: &dyn ClusterClient,
    namespace: &str,
    name: &str,
) -> Result<Pod> {
    let key = ObjectKey::namespaced(ObjectKind::Pod, namespace, name);
    let live = poll_until(client, &key, WAIT_TIMEOUT, true, |o| {
        phase_in(o, &["Succeeded", "Failed"])
    })
    .await?;
    debug!(pod = %key, "pod completed");
    into_pod(live, &key)
}

/// Wait until an object no longer exists
pub async fn wait_deleted(client: &dyn ClusterClient, key: &ObjectKey) -> Result<()> {
    poll_until(client, key, WAIT_TIMEOUT, false, |o| o.is_none()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::client::MockClusterClient;
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn pod(phase: &str) -> ClusterObject {
        Pod {
            metadata: ObjectMeta {
                name: Some("worker-0".to_string()),
                namespace: Some("ml".to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
        .into()
    }

    #[tokio::test(start_paused = true)]
    async fn returns_once_the_pod_is_running() {
        let polls = Arc::new(AtomicU32::new(0));
        let counter = polls.clone();
        let mut client = MockClusterClient::new();
        client.expect_get().returning(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Ok(Some(pod(if n < 3 { "Pending" } else { "Running" })))
        });
        client.expect_delete().never();

        let running = wait_pod(&client, "ml", "worker-0").await.unwrap();
        assert_eq!(pod_phase(&running), Some("Running"));
        assert_eq!(polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_accepts_failure() {
        let mut client = MockClusterClient::new();
        client
            .expect_get()
            .returning(|_| Ok(Some(pod("Failed"))));
        let done = wait_pod_complete(&client, "ml", "worker-0").await.unwrap();
        assert_eq!(pod_phase(&done), Some("Failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_deletes_the_pod_and_names_it() {
        let mut client = MockClusterClient::new();
        client
            .expect_get()
            .returning(|_| Ok(Some(pod("Pending"))));
        client
            .expect_delete()
            .times(1)
            .returning(|_| Ok(()));

        let err = wait_pod(&client, "ml", "worker-0").await.unwrap_err();
        match err {
            Error::WaitTimeout {
                kind,
                name,
                timeout,
            } => {
                assert_eq!(kind, "Pod");
                assert_eq!(name, "worker-0");
                assert_eq!(timeout, WAIT_TIMEOUT);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_cleanup_still_reports_the_timeout() {
        let mut client = MockClusterClient::new();
        client.expect_get().returning(|_| Ok(None));
        client
            .expect_delete()
            .times(1)
            .returning(|_| Err(Error::collaborator("cluster", "gone away")));

        let err = wait_pod_for(&client, "ml", "worker-0", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WaitTimeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn deletion_wait_never_deletes() {
        let polls = Arc::new(AtomicU32::new(0));
        let counter = polls.clone();
        let mut client = MockClusterClient::new();
        client.expect_get().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Ok(Some(pod("Running")))
            } else {
                Ok(None)
            }
        });
        client.expect_delete().never();

        let key = ObjectKey::namespaced(ObjectKind::Pod, "ml", "worker-0");
        wait_deleted(&client, &key).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn api_errors_propagate() {
        let mut client = MockClusterClient::new();
        client
            .expect_get()
            .returning(|_| Err(Error::collaborator("cluster", "unavailable")));
        let err = wait_pod(&client, "ml", "worker-0").await.unwrap_err();
        assert!(matches!(err, Error::Collaborator { .. }));
    }
}
