//! Organization controller for the governor
//!
//! Owns each organization's namespace and removes organizations whose last
//! member's user account has been deleted.

#![deny(missing_docs)]

pub mod controller;

pub use controller::{
    error_policy, namespace_owner_patch, organization_for_membership, organizations_for_user,
    reconcile, OrganizationContext, OrganizationKubeClient, OrganizationKubeClientImpl,
};
