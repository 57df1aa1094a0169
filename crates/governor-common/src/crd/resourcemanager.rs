//! Tenant hierarchy CRDs: Organization, Project and OrganizationMembership
//!
//! Organizations are the tenant root. Each organization owns a namespace
//! `organization-{name}` that holds its memberships, and zero or more
//! cluster-scoped projects.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

/// Kind of organization
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum OrganizationType {
    /// Single-user organization created alongside a user account
    Personal,
    /// Shared organization with any number of members
    #[default]
    Standard,
}

impl std::fmt::Display for OrganizationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Personal => write!(f, "Personal"),
            Self::Standard => write!(f, "Standard"),
        }
    }
}

/// Organization is the root of the tenant hierarchy.
///
/// Example:
/// ```yaml
/// apiVersion: resourcemanager.miloapis.com/v1alpha1
/// kind: Organization
/// metadata:
///   name: acme
///   annotations:
///     kubernetes.io/display-name: ACME Corp
/// spec:
///   type: Standard
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "resourcemanager.miloapis.com",
    version = "v1alpha1",
    kind = "Organization",
    status = "OrganizationStatus",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationSpec {
    /// Organization type, immutable after creation
    #[serde(rename = "type")]
    pub type_: OrganizationType,
}

/// Organization status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationStatus {
    /// Last observed generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Reference to the organization that owns a project
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectOwnerReference {
    /// Owner kind (always Organization today)
    pub kind: String,
    /// Owner name
    pub name: String,
}

/// Project is a cluster-scoped workspace owned by exactly one Organization.
///
/// Deletion is gated by a finalizer until every resource reachable at the
/// project's control-plane endpoint has been purged.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "resourcemanager.miloapis.com",
    version = "v1alpha1",
    kind = "Project",
    status = "ProjectStatus",
    printcolumn = r#"{"name":"Owner","type":"string","jsonPath":".spec.ownerRef.name"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSpec {
    /// Owning organization
    pub owner_ref: ProjectOwnerReference,
}

/// Project status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStatus {
    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Dedicated control plane provisioned for a project on the infrastructure
/// cluster. Only consulted when the control-plane wait state is enabled.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "resourcemanager.miloapis.com",
    version = "v1alpha1",
    kind = "ProjectControlPlane",
    status = "ProjectControlPlaneStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ProjectControlPlaneSpec {}

/// ProjectControlPlane status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectControlPlaneStatus {
    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Reference to an organization by name
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct OrganizationReference {
    /// Organization name
    pub name: String,
}

/// Reference to a user by name
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct MemberReference {
    /// User name
    pub name: String,
}

/// Reference to a role granted through a membership
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub struct RoleReference {
    /// Role name
    pub name: String,
    /// Role namespace; defaults to the membership namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl RoleReference {
    /// Build a reference with an explicit namespace
    pub fn new(name: impl Into<String>, namespace: Option<&str>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.map(str::to_string),
        }
    }

    /// Namespace the role lives in, falling back to `default_namespace`
    pub fn resolved_namespace<'a>(&'a self, default_namespace: &'a str) -> &'a str {
        match self.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => ns,
            _ => default_namespace,
        }
    }
}

/// OrganizationMembership links one User to one Organization with roles.
///
/// Example:
/// ```yaml
/// apiVersion: resourcemanager.miloapis.com/v1alpha1
/// kind: OrganizationMembership
/// metadata:
///   name: alice
///   namespace: organization-acme
/// spec:
///   organizationRef:
///     name: acme
///   userRef:
///     name: alice
///   roles:
///     - name: organization-owner
///       namespace: milo-system
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "resourcemanager.miloapis.com",
    version = "v1alpha1",
    kind = "OrganizationMembership",
    namespaced,
    status = "OrganizationMembershipStatus",
    printcolumn = r#"{"name":"Organization","type":"string","jsonPath":".spec.organizationRef.name"}"#,
    printcolumn = r#"{"name":"User","type":"string","jsonPath":".spec.userRef.name"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationMembershipSpec {
    /// Organization this membership belongs to
    pub organization_ref: OrganizationReference,

    /// User this membership grants access to
    pub user_ref: MemberReference,

    /// Roles granted to the user within the organization
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<RoleReference>,
}

/// Outcome of applying one desired role
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum AppliedRoleStatus {
    /// Binding exists and reports Ready
    Applied,
    /// Binding exists or was just created but is not Ready yet
    Pending,
    /// Binding could not be created
    Failed,
}

/// Reference to a PolicyBinding created for a role
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct PolicyBindingReference {
    /// Binding name
    pub name: String,
    /// Binding namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Per-role status entry on a membership
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppliedRole {
    /// Role name
    pub name: String,
    /// Role namespace as written in the spec
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Application outcome
    pub status: AppliedRoleStatus,
    /// Human-readable detail, set for Pending and Failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Binding that grants this role
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_binding_ref: Option<PolicyBindingReference>,
    /// When the binding was created, set once Applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
}

/// Cached user fields shown on a membership
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MembershipUserStatus {
    /// User email
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,
    /// User given name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub given_name: String,
    /// User family name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub family_name: String,
}

/// Cached organization fields shown on a membership
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MembershipOrganizationStatus {
    /// Organization type
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub type_: String,
    /// Organization display name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
}

/// OrganizationMembership status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationMembershipStatus {
    /// Last observed generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Ready and RolesApplied conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Cached user details
    #[serde(default)]
    pub user: MembershipUserStatus,

    /// Cached organization details
    #[serde(default)]
    pub organization: MembershipOrganizationStatus,

    /// One entry per desired role, in spec order
    #[serde(default)]
    pub applied_roles: Vec<AppliedRole>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn role_reference_namespace_defaults_to_membership_namespace() {
        let explicit = RoleReference::new("viewer", Some("milo-system"));
        let implicit = RoleReference::new("viewer", None);
        let blank = RoleReference::new("viewer", Some(""));

        assert_eq!(explicit.resolved_namespace("organization-acme"), "milo-system");
        assert_eq!(implicit.resolved_namespace("organization-acme"), "organization-acme");
        assert_eq!(blank.resolved_namespace("organization-acme"), "organization-acme");
    }

    #[test]
    fn membership_spec_round_trips_from_yaml() {
        let yaml = r#"
organizationRef:
  name: acme
userRef:
  name: alice
roles:
  - name: organization-owner
    namespace: milo-system
  - name: viewer
"#;
        let spec: OrganizationMembershipSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.organization_ref.name, "acme");
        assert_eq!(spec.user_ref.name, "alice");
        assert_eq!(spec.roles.len(), 2);
        assert_eq!(spec.roles[1].namespace, None);
    }

    #[test]
    fn organization_type_serializes_as_pascal_case() {
        let spec = OrganizationSpec {
            type_: OrganizationType::Personal,
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["type"], "Personal");
    }

    #[test]
    fn crds_have_expected_scope() {
        assert_eq!(Organization::crd().spec.scope, "Cluster");
        assert_eq!(Project::crd().spec.scope, "Cluster");
        assert_eq!(OrganizationMembership::crd().spec.scope, "Namespaced");
    }
}
