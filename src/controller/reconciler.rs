//! Apply engine
//!
//! Walks a [`CompiledResource`] graph depth-first, dependents before the object
//! depending on them, and brings each object to its desired state according to
//! its kind's [`ApplyStrategy`]. Everything is sequential; a failure stops the
//! walk and leaves already-applied objects in place.

use std::sync::Arc;

use tracing::{debug, info};

use super::client::ClusterClient;
use super::wait::wait_deleted;
use super::worker_set::{apply_worker_set, worker_set_status};
use crate::workload::{
    ApplyStrategy, ClusterObject, CompiledResource, WorkerSet, WorkerSetPhase,
};
use crate::{Error, Result};

/// What happened to one object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The object did not exist and was created
    Created,
    /// The object existed and was updated in place
    Updated,
    /// The object was deleted and recreated
    Replaced,
    /// The object existed and was left untouched
    Unchanged,
    /// Replicas were reconciled
    FannedOut,
}

/// Pushes compiled graphs to the cluster
pub struct Reconciler {
    client: Arc<dyn ClusterClient>,
}

impl Reconciler {
    /// Create a reconciler over a cluster client
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self { client }
    }

    /// Apply several graphs one after another
    pub async fn apply_all<'a>(
        &self,
        graphs: impl IntoIterator<Item = &'a CompiledResource>,
    ) -> Result<()> {
        for graph in graphs {
            self.apply(graph).await?;
        }
        Ok(())
    }

    /// Apply one graph, dependents first
    pub async fn apply(&self, graph: &CompiledResource) -> Result<Vec<ApplyOutcome>> {
        let mut outcomes = Vec::new();
        for node in graph.apply_order() {
            outcomes.push(self.apply_object(node).await?);
        }
        Ok(outcomes)
    }

    /// Phase of a worker set as seen in the cluster
    pub async fn worker_set_status(&self, set: &WorkerSet) -> Result<WorkerSetPhase> {
        worker_set_status(self.client.as_ref(), set).await
    }

    async fn apply_object(&self, node: &CompiledResource) -> Result<ApplyOutcome> {
        let object = &node.object;
        let key = object.key();
        let client = self.client.as_ref();

        let outcome = match object.kind().strategy() {
            ApplyStrategy::FanOut => {
                let ClusterObject::WorkerSet(set) = object else {
                    return Err(Error::unsupported_kind(
                        object.kind().api_version(),
                        object.kind().as_str(),
                    ));
                };
                apply_worker_set(client, set).await?;
                ApplyOutcome::FannedOut
            }
            ApplyStrategy::CreateIfAbsent => match client.get(&key).await? {
                None => self.create(object).await?,
                Some(_) => ApplyOutcome::Unchanged,
            },
            ApplyStrategy::CreateOrUpdate => match client.get(&key).await? {
                None => self.create(object).await?,
                Some(live) => {
                    let mut desired = object.clone();
                    desired.metadata_mut().resource_version =
                        live.metadata().resource_version.clone();
                    client.update(&desired).await?;
                    ApplyOutcome::Updated
                }
            },
            ApplyStrategy::CreateOrReplace => match client.get(&key).await? {
                None => self.create(object).await?,
                Some(live) => {
                    if node.upgrade.is_some_and(|changed| changed(&live, object)) {
                        client.delete(&key).await?;
                        wait_deleted(client, &key).await?;
                        self.create(object).await?;
                        ApplyOutcome::Replaced
                    } else {
                        ApplyOutcome::Unchanged
                    }
                }
            },
        };

        match outcome {
            ApplyOutcome::Unchanged => debug!(object = %key, "up to date"),
            _ => info!(object = %key, ?outcome, "applied"),
        }
        Ok(outcome)
    }

    /// Create, treating "already exists" as success
    async fn create(&self, object: &ClusterObject) -> Result<ApplyOutcome> {
        match self.client.create(object).await {
            Ok(()) => Ok(ApplyOutcome::Created),
            Err(e) if e.is_already_exists() => {
                debug!(object = %object.key(), "already exists");
                Ok(ApplyOutcome::Unchanged)
            }
            Err(e) => Err(e),
        }
    }
}
