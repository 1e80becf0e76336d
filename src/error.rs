//! Error types for trellis
//!
//! Errors are structured with fields so the offending component, object or
//! collaborator is always visible in logs.

use std::time::Duration;

use thiserror::Error;

/// Main error type for trellis operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A single component failed to compile
    #[error("compilation failed for {component}: {message}")]
    Compilation {
        /// Name of the component (task resource, uix or serving endpoint)
        component: String,
        /// Description of what failed
        message: String,
    },

    /// Unparseable resource quantity
    #[error("invalid quantity '{value}': {message}")]
    Quantity {
        /// The raw quantity string
        value: String,
        /// Why it could not be parsed
        message: String,
    },

    /// An object kind the reconciler cannot dispatch
    #[error("unsupported object kind {kind} (apiVersion {api_version})")]
    UnsupportedKind {
        /// apiVersion of the object
        api_version: String,
        /// kind of the object
        kind: String,
    },

    /// A wait primitive gave up
    #[error("timed out after {timeout:?} waiting for {kind} {name}")]
    WaitTimeout {
        /// Kind of the awaited object
        kind: String,
        /// Name of the awaited object
        name: String,
        /// How long we waited
        timeout: Duration,
    },

    /// A worker-set replica exhausted its restart budget
    #[error("replica {index} of worker set {worker_set} failed after {restarts} restarts")]
    ReplicaFailed {
        /// Worker set name
        worker_set: String,
        /// Replica index
        index: u32,
        /// Restarts consumed
        restarts: u32,
    },

    /// Validation error for App documents
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Configuration error
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's wrong
        message: String,
    },

    /// External collaborator (quota service, revision catalog) failed
    #[error("{collaborator} lookup failed: {message}")]
    Collaborator {
        /// Which collaborator
        collaborator: String,
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a compilation error for a component
    pub fn compilation(component: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Compilation {
            component: component.into(),
            message: msg.into(),
        }
    }

    /// Create a quantity error
    pub fn quantity(value: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Quantity {
            value: value.into(),
            message: msg.into(),
        }
    }

    /// Create an unsupported-kind dispatch error
    pub fn unsupported_kind(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self::UnsupportedKind {
            api_version: api_version.into(),
            kind: kind.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a collaborator error
    pub fn collaborator(collaborator: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Collaborator {
            collaborator: collaborator.into(),
            message: msg.into(),
        }
    }

    /// Attach a component name, turning any error into a compilation error.
    ///
    /// Compilation errors keep their original component.
    pub fn in_component(self, component: &str) -> Self {
        match self {
            Self::Compilation { .. } => self,
            other => Self::compilation(component, other.to_string()),
        }
    }

    /// True when the API rejected a create because the object already exists
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            Self::Kube { source: kube::Error::Api(ae) } if ae.code == 409 && ae.reason == "AlreadyExists"
        )
    }

    /// True when the API reported the object as missing
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Kube { source: kube::Error::Api(ae) } if ae.code == 404
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16, reason: &str) -> Error {
        Error::from(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: reason.to_string(),
            code,
        }))
    }

    #[test]
    fn already_exists_uses_typed_status() {
        assert!(api_error(409, "AlreadyExists").is_already_exists());
        // A conflict on update is not "already exists"
        assert!(!api_error(409, "Conflict").is_already_exists());
        assert!(!api_error(404, "NotFound").is_already_exists());
    }

    #[test]
    fn not_found_detection() {
        assert!(api_error(404, "NotFound").is_not_found());
        assert!(!Error::validation("x").is_not_found());
    }

    #[test]
    fn in_component_wraps_foreign_errors() {
        let err = Error::quantity("abc", "not a number").in_component("train-worker");
        match err {
            Error::Compilation { component, message } => {
                assert_eq!(component, "train-worker");
                assert!(message.contains("abc"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn in_component_keeps_original_component() {
        let err = Error::compilation("first", "bad").in_component("second");
        assert!(matches!(err, Error::Compilation { component, .. } if component == "first"));
    }
}
