//! The "organization keeps an owner" invariant
//!
//! Every organization with memberships must have at least one membership
//! holding the configured owner role. This module holds the pure parts of the
//! check; the admission handler and the organization controller supply the
//! cluster state.

use governor_common::crd::{OrganizationMembership, RoleReference};
use kube::ResourceExt;

/// Which role makes a membership an owner
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OwnerPolicy {
    owner_role: Option<RoleReference>,
}

impl OwnerPolicy {
    /// Policy recognising `name` in `namespace` as the owner role.
    ///
    /// An empty name or namespace disables the guard.
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        let name = name.into();
        let namespace = namespace.into();
        if name.is_empty() || namespace.is_empty() {
            return Self::disabled();
        }
        Self {
            owner_role: Some(RoleReference {
                name,
                namespace: Some(namespace),
            }),
        }
    }

    /// Policy that treats nobody as an owner and allows every change
    pub fn disabled() -> Self {
        Self { owner_role: None }
    }

    /// Whether an owner role is configured
    pub fn is_enabled(&self) -> bool {
        self.owner_role.is_some()
    }

    /// Whether `membership` grants the owner role
    pub fn is_owner(&self, membership: &OrganizationMembership) -> bool {
        let Some(owner) = &self.owner_role else {
            return false;
        };
        let membership_ns = membership.namespace().unwrap_or_default();
        membership.spec.roles.iter().any(|role| {
            role.name == owner.name
                && Some(role.resolved_namespace(&membership_ns)) == owner.namespace.as_deref()
        })
    }

    /// Whether some membership other than `membership`, for the same
    /// organization, holds the owner role
    pub fn has_other_owner(
        &self,
        membership: &OrganizationMembership,
        siblings: &[OrganizationMembership],
    ) -> bool {
        let name = membership.name_any();
        let org = &membership.spec.organization_ref.name;
        siblings
            .iter()
            .filter(|other| other.name_any() != name)
            .filter(|other| &other.spec.organization_ref.name == org)
            .any(|other| self.is_owner(other))
    }
}

/// Change to a membership being checked against the invariant
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OwnerChange {
    /// Membership is being deleted
    Delete,
    /// Membership update drops the owner role
    Update,
}

impl OwnerChange {
    fn verb(&self) -> &'static str {
        match self {
            Self::Delete => "delete",
            Self::Update => "update",
        }
    }
}

/// Rejection message for removing the last owner of an organization
pub fn last_owner_message(change: OwnerChange, membership: &OrganizationMembership) -> String {
    format!(
        "cannot {} membership for user '{}': organization '{}' must have at least one owner. \
         Assign the owner role to another member before removing this membership, \
         or delete the organization instead if you intend to remove all owners.",
        change.verb(),
        membership.spec.user_ref.name,
        membership.spec.organization_ref.name,
    )
}
