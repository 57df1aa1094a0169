//! Common types for the governor: CRDs, errors, naming, indexes and utilities

#![deny(missing_docs)]

pub mod admission;
pub mod crd;
pub mod error;
pub mod events;
pub mod index;
pub mod kind_registry;
pub mod kube_utils;
pub mod naming;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group of the tenant hierarchy kinds
pub const RESOURCEMANAGER_GROUP: &str = "resourcemanager.miloapis.com";

/// API group of the authorization kinds
pub const IAM_GROUP: &str = "iam.miloapis.com";

/// API group of the quota kinds
pub const QUOTA_GROUP: &str = "quota.miloapis.com";

/// API group of the documentation kinds
pub const DOCUMENTATION_GROUP: &str = "documentation.miloapis.com";

/// Label naming the membership a PolicyBinding was created for
pub const MEMBERSHIP_LABEL: &str = "resourcemanager.miloapis.com/membership";

/// Label naming the controller that manages a PolicyBinding
pub const MANAGED_BY_LABEL: &str = "resourcemanager.miloapis.com/managed-by";

/// Value of [`MANAGED_BY_LABEL`] on bindings created for membership roles
pub const MEMBERSHIP_CONTROLLER_NAME: &str = "organization-membership-controller";

/// Finalizer blocking Project removal until its control plane is purged
pub const PROJECT_FINALIZER: &str = "resourcemanager.miloapis.com/project-controller";

/// Annotation carrying an object's human-readable name
pub const DISPLAY_NAME_ANNOTATION: &str = "kubernetes.io/display-name";

/// Field manager used for every governor write
pub const FIELD_MANAGER: &str = "governor";

/// Timeout applied to controller watches, in seconds
pub const WATCH_TIMEOUT_SECS: u32 = 25;
