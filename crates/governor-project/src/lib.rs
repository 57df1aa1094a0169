//! Project controller for the governor
//!
//! Projects are created with a finalizer and, when deleted, keep it until
//! everything served at the project's control-plane endpoint has been
//! purged.

#![deny(missing_docs)]

pub mod controller;
pub mod endpoint;
pub mod purge;

pub use controller::{
    error_policy, project_for_control_plane, reconcile, ProjectContext, ProjectKubeClient,
    ProjectKubeClientImpl,
};
pub use endpoint::{project_endpoint, ProjectEndpointClient, ProjectEndpointClientImpl};
pub use purge::{KubePurgeTarget, PurgeOptions, PurgeResource, PurgeTarget, Purger};
