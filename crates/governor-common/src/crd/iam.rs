//! IAM CRDs consumed by the governor: PolicyBinding, Role and User
//!
//! These kinds are owned by the IAM subsystem. The governor only reads
//! Roles and Users, and creates/deletes PolicyBindings it manages.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

/// Role referenced by a binding
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct BindingRoleRef {
    /// Role name
    pub name: String,
    /// Role namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Principal receiving a role
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Subject {
    /// Subject kind (User, Group, MachineAccount)
    pub kind: String,
    /// Subject name
    pub name: String,
    /// Subject namespace for namespaced subject kinds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Subject UID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

/// Concrete resource a binding applies to
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceReference {
    /// API group of the target
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_group: String,
    /// Kind of the target
    pub kind: String,
    /// Name of the target
    pub name: String,
    /// UID of the target
    pub uid: String,
    /// Namespace of the target, for namespaced kinds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Every resource of a kind
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceKind {
    /// API group
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_group: String,
    /// Kind
    pub kind: String,
}

/// Exactly one of the fields is set
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSelector {
    /// A single resource instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_ref: Option<ResourceReference>,
    /// All resources of a kind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_kind: Option<ResourceKind>,
}

/// PolicyBinding grants a Role to Subjects over a target resource.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "iam.miloapis.com",
    version = "v1alpha1",
    kind = "PolicyBinding",
    namespaced,
    status = "PolicyBindingStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct PolicyBindingSpec {
    /// Role being granted
    pub role_ref: BindingRoleRef,
    /// Principals receiving the role
    pub subjects: Vec<Subject>,
    /// Resources the grant applies to
    pub resource_selector: ResourceSelector,
}

/// PolicyBinding status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyBindingStatus {
    /// Last observed generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Ready condition published by the authorization engine
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Role is a named set of permissions. Only its existence matters here.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "iam.miloapis.com",
    version = "v1alpha1",
    kind = "Role",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct RoleSpec {
    /// Permissions granted by the role
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_permissions: Vec<String>,
    /// Other roles whose permissions are inherited
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inherited_roles: Vec<BindingRoleRef>,
}

/// User is a platform account.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(group = "iam.miloapis.com", version = "v1alpha1", kind = "User")]
#[serde(rename_all = "camelCase")]
pub struct UserSpec {
    /// Primary email address
    #[serde(default)]
    pub email: String,
    /// Given name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub given_name: String,
    /// Family name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub family_name: String,
}
