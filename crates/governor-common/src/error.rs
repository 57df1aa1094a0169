//! Error types for the governor controllers
//!
//! Errors are structured with fields to aid debugging in production. Each
//! variant carries the resource it concerns so that logs and status
//! conditions can point at the object that needs attention.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for governor operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Malformed input: missing registration, empty role name, duplicate role
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the resource with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.roles[1].name")
        field: Option<String>,
    },

    /// Project purge did not complete
    #[error("purge error for project {project}: {message}")]
    Purge {
        /// Project being torn down
        project: String,
        /// Description of what failed
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

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "purge")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a purge error for a project
    pub fn purge(project: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Purge {
            project: project.into(),
            message: msg.into(),
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

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// HTTP status code of the underlying API error, if any
    pub fn api_code(&self) -> Option<u16> {
        match self {
            Error::Kube {
                source: kube::Error::Api(ae),
            } => Some(ae.code),
            _ => None,
        }
    }

    /// The object vanished upstream
    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(404)
    }

    /// An optimistic-concurrency write lost a race
    pub fn is_conflict(&self) -> bool {
        self.api_code() == Some(409)
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors are not retryable (require a spec fix).
    /// Kubernetes 4xx errors are permanent, except conflicts and throttling.
    /// Purge and internal errors are transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => {
                    ae.code == 409 || ae.code == 429 || !(400..500).contains(&ae.code)
                }
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::Purge { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the resource name if this error is associated with one
    pub fn resource(&self) -> Option<&str> {
        match self {
            Error::Validation { resource, .. } => Some(resource),
            Error::Purge { project, .. } => Some(project),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16, reason: &str) -> Error {
        Error::from(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} from api server"),
            reason: reason.to_string(),
            code,
        }))
    }

    // ==========================================================================
    // Story Tests: Error classification drives controller retry behavior
    // ==========================================================================

    /// Story: Objects deleted upstream are recognised as not-found
    #[test]
    fn story_not_found_is_recognised() {
        let err = api_error(404, "NotFound");
        assert!(err.is_not_found());
        assert!(!err.is_conflict());
        assert!(!err.is_retryable());
    }

    /// Story: A lost optimistic-concurrency race is retried
    ///
    /// When two writers race on the same resourceVersion, the loser gets a
    /// 409. The reconcile re-reads fresh state and tries again.
    #[test]
    fn story_conflict_is_retryable() {
        let err = api_error(409, "Conflict");
        assert!(err.is_conflict());
        assert!(err.is_retryable());
    }

    /// Story: Throttling and server errors are transient
    #[test]
    fn story_transient_api_errors_are_retryable() {
        assert!(api_error(429, "TooManyRequests").is_retryable());
        assert!(api_error(500, "InternalError").is_retryable());
        assert!(api_error(503, "ServiceUnavailable").is_retryable());
    }

    /// Story: Forbidden and invalid requests need a human
    #[test]
    fn story_permanent_api_errors_are_not_retryable() {
        assert!(!api_error(403, "Forbidden").is_retryable());
        assert!(!api_error(422, "Invalid").is_retryable());
    }

    /// Story: Validation errors carry the resource and field at fault
    #[test]
    fn story_validation_errors_include_context() {
        let err = Error::validation_for_field("alice", "spec.roles[1].name", "role name cannot be empty");
        assert!(err.to_string().contains("alice"));
        assert!(err.to_string().contains("role name cannot be empty"));
        assert_eq!(err.resource(), Some("alice"));
        match &err {
            Error::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("spec.roles[1].name"))
            }
            _ => panic!("Expected Validation variant"),
        }
        assert!(!err.is_retryable());
    }

    /// Story: Purge failures keep the finalizer and retry
    #[test]
    fn story_purge_errors_are_retryable() {
        let err = Error::purge("web", "rbac forbids DeleteCollection for apps/v1/deployments");
        assert!(err.is_retryable());
        assert_eq!(err.resource(), Some("web"));
        assert!(err.to_string().contains("purge error for project web"));
    }

    #[test]
    fn serde_json_errors_become_serialization_errors() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn internal_errors_are_retryable() {
        let err = Error::internal_with_context("purge", "timed out");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("[purge]"));
    }
}
