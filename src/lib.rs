//! Trellis - compiles declarative App specs into Kubernetes objects and reconciles them
//!
//! An [`crd::App`] describes compute tasks, interactive UI components, model-serving
//! endpoints and storage volumes. Trellis turns it into a dependency-ordered graph of
//! native cluster objects and pushes that graph to a live cluster with idempotent
//! create-or-update semantics.
//!
//! # Pipeline
//!
//! ```text
//! App -> limits + volume resolution -> compiler -> CompiledResource graphs
//!     -> worker-set fan-out -> controller::Reconciler -> cluster
//! ```
//!
//! # Modules
//!
//! - [`crd`] - The App document (tasks, uix, servings, volumes, secrets)
//! - [`quantity`] - Kubernetes quantity parsing and rounding
//! - [`limits`] - Ambient ceilings and request minimization
//! - [`volume`] - Volume dedup, mount resolution, revision pinning
//! - [`compiler`] - Per-component manifest generation
//! - [`workload`] - Compiled object graph, worker sets, autoscalers
//! - [`controller`] - Apply engine and wait primitives
//! - [`config`] - Compiler configuration
//! - [`telemetry`] - Logging setup
//! - [`error`] - Error types

#![warn(missing_docs)]

pub mod compiler;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod limits;
pub mod quantity;
pub mod telemetry;
pub mod volume;
pub mod workload;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Label taxonomy
// =============================================================================
// Every generated object carries these labels so live objects can be selected
// by component, task, job or serving endpoint.

/// Name of the component that produced the object
pub const LABEL_COMPONENT_NAME: &str = "trellis.dev/component-name";

/// Component type: `task`, `uix` or `serving`
pub const LABEL_COMPONENT_TYPE: &str = "trellis.dev/component-type";

/// Build / job identifier of the compilation pass
pub const LABEL_JOB_ID: &str = "trellis.dev/job-id";

/// Task name (task resources only)
pub const LABEL_TASK_NAME: &str = "trellis.dev/task-name";

/// Serving endpoint identifier (model-serving components only)
pub const LABEL_SERVING_ID: &str = "trellis.dev/serving-id";

/// Node a replica has been pinned to
pub const LABEL_ML_NODE: &str = "trellis.dev/ml-node";

/// Zero-based replica index of a worker-set pod
pub const LABEL_REPLICA_INDEX: &str = "trellis.dev/replica-index";

/// Standard managed-by label key
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Managed-by label value for objects created by trellis
pub const LABEL_MANAGED_BY_TRELLIS: &str = "trellis";

/// Restart counter annotation on worker-set pods (decimal string)
pub const ANNOTATION_RESTART: &str = "trellis.dev/restart";

/// Hash of the pod template of a Job, used to decide replacement
pub const ANNOTATION_SPEC_HASH: &str = "trellis.dev/spec-hash";

/// Node selector key used to pin replicas to a node
pub const NODE_HOSTNAME_KEY: &str = "kubernetes.io/hostname";
