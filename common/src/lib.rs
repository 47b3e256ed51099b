use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YamlError: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("K8s error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("{action} {key} failed: {source}")]
    ObjectError {
        action: &'static str,
        key: ObjectKey,
        #[source]
        source: kube::Error,
    },

    #[error("Cannot set owner reference on {key}: {reason}")]
    OwnerReference { key: ObjectKey, reason: String },

    #[error("Ambiguous resource condition for {key}: {active} active classifications")]
    AmbiguousCondition { key: ObjectKey, active: usize },

    #[error("Deleting {key} did not complete within {timeout:?}")]
    DeleteTimeout { key: ObjectKey, timeout: Duration },

    #[error("Prune job {namespace}/{name} failed ({failed} failed pods)")]
    PruneJobFailed {
        namespace: String,
        name: String,
        failed: i32,
    },

    #[error("Missing object key {0}")]
    MissingObjectKey(&'static str),

    #[error("Unsupported manifest kind {0}")]
    UnknownKind(String),

    #[error("No manifest for {0}")]
    MissingManifest(String),

    #[error("Expected a {expected} but got a {found}")]
    UnexpectedKind { expected: ManagedKind, found: ManagedKind },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn object(action: &'static str, key: &ObjectKey, source: kube::Error) -> Self {
        Error::ObjectError {
            action,
            key: key.clone(),
            source,
        }
    }

    fn api_code(&self) -> Option<u16> {
        match self {
            Error::KubeError(kube::Error::Api(ae)) => Some(ae.code),
            Error::ObjectError {
                source: kube::Error::Api(ae),
                ..
            } => Some(ae.code),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(404)
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        self.api_code() == Some(409)
    }

    /// Short reason used both as metric label and as the Degraded condition reason
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Error::SerializationError(_) | Error::YamlError(_) => "SerializationFailed",
            Error::KubeError(_) | Error::ObjectError { .. } => {
                if self.is_conflict() {
                    "Conflict"
                } else {
                    "ApiError"
                }
            }
            Error::OwnerReference { .. } => "OwnerReferenceFailed",
            Error::AmbiguousCondition { .. } => "AmbiguousResourceCondition",
            Error::DeleteTimeout { .. } => "DeleteTimeout",
            Error::PruneJobFailed { .. } => "PruneJobFailed",
            Error::MissingObjectKey(_) => "MissingObjectKey",
            Error::UnknownKind(_) | Error::MissingManifest(_) | Error::UnexpectedKind { .. } => {
                "InvalidManifest"
            }
            Error::Config(_) => "InvalidConfiguration",
        }
    }

    #[must_use]
    pub fn metric_label(&self) -> String {
        self.reason().to_lowercase()
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub mod conditions;
pub mod context;
pub mod instance;
pub mod manifests;
pub mod memstore;
pub mod objects;
pub mod store;

pub use context::{OperatorConfig, RetryPolicy, get_client_name};
pub use instance::{FINALIZER, NodeFeatureDiscovery, NodeFeatureDiscoverySpec, NodeFeatureDiscoveryStatus};
pub use objects::{ManagedKind, ManagedObject, ObjectKey};
pub use store::{InstanceEvent, KubeStore, ObjectStore};

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: reason.to_string(),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn test_not_found_is_detected_through_object_context() {
        let key = ObjectKey::namespaced(ManagedKind::DaemonSet, "openshift-nfd", "nfd-worker");
        let err = Error::object("get", &key, api_error(404, "NotFound"));
        assert!(err.is_not_found());
        assert!(!err.is_conflict());
        assert_eq!(err.reason(), "ApiError");
        assert!(err.to_string().contains("DaemonSet openshift-nfd/nfd-worker"));
    }

    #[test]
    fn test_conflict_reason() {
        let err = Error::KubeError(api_error(409, "Conflict"));
        assert!(err.is_conflict());
        assert_eq!(err.reason(), "Conflict");
        assert_eq!(err.metric_label(), "conflict");
    }

    #[test]
    fn test_non_api_errors_are_not_not_found() {
        let key = ObjectKey::cluster(ManagedKind::ClusterRole, "nfd-master");
        let err = Error::AmbiguousCondition { key, active: 2 };
        assert!(!err.is_not_found());
        assert_eq!(err.reason(), "AmbiguousResourceCondition");
    }
}
