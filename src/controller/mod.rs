//! Applying compiled graphs to a live cluster
//!
//! The [`Reconciler`] dispatches on each object's apply strategy; worker sets
//! are fanned out into per-replica pods. All cluster access goes through the
//! [`ClusterClient`] trait.

mod client;
#[cfg(test)]
mod fake;
mod reconciler;
mod wait;
mod worker_set;

pub use client::{ClusterClient, KubeClusterClient};
pub use reconciler::{ApplyOutcome, Reconciler};
pub use wait::{
    wait_deleted, wait_pod, wait_pod_complete, wait_pod_for, POLL_INTERVAL, WAIT_TIMEOUT,
};
pub use worker_set::{apply_worker_set, worker_set_status};

#[cfg(test)]
pub use client::MockClusterClient;
