//! Custom Resource Definitions for the governor
//!
//! This module contains every CRD the governor reads or writes, grouped by
//! API group.

mod documentation;
mod iam;
mod quota;
mod resourcemanager;
mod types;

pub use documentation::{
    Document, DocumentReference, DocumentRevision, DocumentRevisionContent,
    DocumentRevisionSpec, DocumentRevisionStatus, DocumentSpec, DocumentStatus,
    LatestRevisionRef,
};
pub use iam::{
    BindingRoleRef, PolicyBinding, PolicyBindingSpec, PolicyBindingStatus, ResourceKind,
    ResourceReference, ResourceSelector, Role, RoleSpec, Subject, User, UserSpec,
};
pub use quota::{
    AllocationOutcome, Allowance, AllowanceBucket, AllowanceBucketSpec, AllowanceBucketStatus,
    ClaimingResource, ConsumerRef, ConsumerTypeRef, GrantBucket, RegistrationType,
    ResourceClaim, ResourceClaimAllocationStatus, ResourceClaimSpec, ResourceClaimStatus,
    ResourceGrant, ResourceGrantSpec, ResourceGrantStatus, ResourceRegistration,
    ResourceRegistrationSpec, ResourceRegistrationStatus, ResourceRequest,
    UnversionedObjectReference,
};
pub use resourcemanager::{
    AppliedRole, AppliedRoleStatus, MemberReference, MembershipOrganizationStatus,
    MembershipUserStatus, Organization, OrganizationMembership, OrganizationMembershipSpec,
    OrganizationMembershipStatus, OrganizationReference, OrganizationSpec, OrganizationStatus,
    OrganizationType, PolicyBindingReference, Project, ProjectControlPlane,
    ProjectControlPlaneSpec, ProjectControlPlaneStatus, ProjectOwnerReference, ProjectSpec,
    ProjectStatus, RoleReference,
};
pub use types::{
    find_condition, is_condition_true, set_condition, Condition, ConditionStatus,
    DimensionSelector,
};

/// Well-known condition types
pub mod conditions {
    /// Generic readiness
    pub const READY: &str = "Ready";
    /// Membership roles converged
    pub const ROLES_APPLIED: &str = "RolesApplied";
    /// Claim evaluation outcome
    pub const GRANTED: &str = "Granted";
    /// Grant and registration activation
    pub const ACTIVE: &str = "Active";
}
