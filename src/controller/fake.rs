//! In-memory cluster for reconciler tests

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;

use super::client::ClusterClient;
use crate::workload::{ClusterObject, ObjectKey};
use crate::{Error, Result};

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::from(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, ClusterObject>,
    created: Vec<ObjectKey>,
    updates: usize,
    deletes: usize,
    next_version: u64,
}

/// Object store with create/update/delete semantics close to the API server
#[derive(Default)]
pub(crate) struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    /// Keys in creation order
    pub fn created(&self) -> Vec<ObjectKey> {
        self.lock().created.clone()
    }

    pub fn update_count(&self) -> usize {
        self.lock().updates
    }

    pub fn delete_count(&self) -> usize {
        self.lock().deletes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn matches_selector(pod: &Pod, selector: &str) -> bool {
    let labels = pod.metadata.labels.clone().unwrap_or_default();
    selector
        .split(',')
        .filter(|s| !s.is_empty())
        .all(|pair| match pair.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => false,
        })
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get(&self, key: &ObjectKey) -> Result<Option<ClusterObject>> {
        Ok(self.lock().objects.get(key).cloned())
    }

    async fn create(&self, object: &ClusterObject) -> Result<()> {
        let mut state = self.lock();
        let key = object.key();
        if state.objects.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists", format!("{key} already exists")));
        }
        state.next_version += 1;
        let mut stored = object.clone();
        stored.metadata_mut().resource_version = Some(state.next_version.to_string());
        state.objects.insert(key.clone(), stored);
        state.created.push(key);
        Ok(())
    }

    async fn update(&self, object: &ClusterObject) -> Result<()> {
        let mut state = self.lock();
        let key = object.key();
        let live_version = match state.objects.get(&key) {
            Some(live) => live.metadata().resource_version.clone(),
            None => return Err(api_error(404, "NotFound", format!("{key} not found"))),
        };
        if object.metadata().resource_version != live_version {
            return Err(api_error(409, "Conflict", format!("{key} was modified")));
        }
        state.next_version += 1;
        let mut stored = object.clone();
        stored.metadata_mut().resource_version = Some(state.next_version.to_string());
        state.objects.insert(key, stored);
        state.updates += 1;
        Ok(())
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let mut state = self.lock();
        if state.objects.remove(key).is_some() {
            state.deletes += 1;
        }
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        Ok(self
            .lock()
            .objects
            .values()
            .filter_map(|o| match o {
                ClusterObject::Pod(pod) => Some(pod.as_ref()),
                _ => None,
            })
            .filter(|p| p.metadata.namespace.as_deref() == Some(namespace))
            .filter(|p| matches_selector(p, selector))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Service;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn service() -> ClusterObject {
        Service {
            metadata: ObjectMeta {
                name: Some("board".to_string()),
                namespace: Some("ml".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
        .into()
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let fake = FakeCluster::default();
        fake.create(&service()).await.unwrap();
        let err = fake.update(&service()).await.unwrap_err();
        assert!(!err.is_already_exists());
        assert!(err.to_string().contains("modified"));
    }

    #[tokio::test]
    async fn duplicate_create_reports_already_exists() {
        let fake = FakeCluster::default();
        fake.create(&service()).await.unwrap();
        assert!(fake.create(&service()).await.unwrap_err().is_already_exists());
    }
}
