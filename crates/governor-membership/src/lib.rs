//! OrganizationMembership reconciliation for the governor
//!
//! - [`controller`]: resolves organization and user details and converges
//!   membership roles onto managed PolicyBindings
//! - [`roles`]: the pure role planning and status summary logic
//! - [`owner`]: the "organization keeps an owner" invariant
//! - [`admission`]: create/update/delete validation served by the webhook

#![deny(missing_docs)]

pub mod admission;
pub mod controller;
pub mod owner;
pub mod roles;

pub use admission::{
    MembershipAdmission, MembershipAdmissionClient, MembershipAdmissionClientImpl, Verdict,
};
pub use controller::{
    error_policy, memberships_for_organization, memberships_for_user, reconcile,
    MembershipContext, MembershipKubeClient, MembershipKubeClientImpl,
};
pub use owner::{OwnerChange, OwnerPolicy};
