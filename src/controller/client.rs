//! Cluster API seam
//!
//! The reconciler only talks to the cluster through [`ClusterClient`] so the
//! apply engine can be exercised against mocks and an in-memory fake.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;

use crate::workload::{ClusterObject, ObjectKey, ObjectKind};
use crate::{Error, Result};

/// Typed access to the cluster object store
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Read an object; `None` when it does not exist
    async fn get(&self, key: &ObjectKey) -> Result<Option<ClusterObject>>;

    /// Create an object
    async fn create(&self, object: &ClusterObject) -> Result<()>;

    /// Replace an object; the live `resourceVersion` must be set on `object`
    async fn update(&self, object: &ClusterObject) -> Result<()>;

    /// Delete an object; deleting a missing object succeeds
    async fn delete(&self, key: &ObjectKey) -> Result<()>;

    /// Pods in `namespace` matching a label selector
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>>;
}

/// [`ClusterClient`] backed by the Kubernetes API
pub struct KubeClusterClient {
    client: Client,
    field_manager: String,
}

impl KubeClusterClient {
    /// Wrap a kube client; writes are attributed to `field_manager`
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn api(&self, kind: ObjectKind, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        let ar = kind.api_resource()?;
        Ok(match namespace {
            Some(ns) if kind.is_namespaced() => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        })
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        }
    }
}

fn to_dynamic(object: &ClusterObject) -> Result<DynamicObject> {
    serde_json::from_value(object.to_value()?)
        .map_err(|e| Error::serialization_for_kind(object.kind().as_str(), e.to_string()))
}

fn from_dynamic(kind: ObjectKind, object: DynamicObject) -> Result<ClusterObject> {
    let value = serde_json::to_value(&object)
        .map_err(|e| Error::serialization_for_kind(kind.as_str(), e.to_string()))?;
    ClusterObject::from_value(kind, value)
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get(&self, key: &ObjectKey) -> Result<Option<ClusterObject>> {
        let api = self.api(key.kind, key.namespace.as_deref())?;
        match api.get_opt(&key.name).await? {
            Some(object) => Ok(Some(from_dynamic(key.kind, object)?)),
            None => Ok(None),
        }
    }

    async fn create(&self, object: &ClusterObject) -> Result<()> {
        let api = self.api(object.kind(), object.namespace())?;
        api.create(&self.post_params(), &to_dynamic(object)?)
            .await?;
        Ok(())
    }

    async fn update(&self, object: &ClusterObject) -> Result<()> {
        let api = self.api(object.kind(), object.namespace())?;
        api.replace(object.name(), &self.post_params(), &to_dynamic(object)?)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let api = self.api(key.kind, key.namespace.as_deref())?;
        match api.delete(&key.name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = Error::from(e);
                if err.is_not_found() {
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api.list(&ListParams::default().labels(selector)).await?;
        Ok(pods.items)
    }
}
