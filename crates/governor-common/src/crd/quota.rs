//! Quota CRDs: ResourceClaim, ResourceGrant, AllowanceBucket, ResourceRegistration
//!
//! Grants define limits, buckets track consumption per dimension tuple, and
//! claims ask for a slice of the remaining headroom. Buckets are produced by
//! an external usage tracker; the governor only reads them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, DimensionSelector};

/// Entity consuming quota (usually an Organization or Project)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerRef {
    /// API group of the consumer
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_group: String,
    /// Consumer kind
    pub kind: String,
    /// Consumer name
    pub name: String,
    /// Consumer namespace, for namespaced kinds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Version-independent reference to the object that triggered a claim
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UnversionedObjectReference {
    /// API group
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_group: String,
    /// Kind
    pub kind: String,
    /// Name
    pub name: String,
    /// Namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// One resource request inside a claim
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequest {
    /// Registered resource type (e.g. `resourcemanager.miloapis.com/projects`)
    pub resource_type: String,
    /// Amount in the registration's base unit
    pub amount: i64,
    /// Usage dimensions this request is accounted under. `None` and an
    /// empty map are distinct: they hash to different buckets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<BTreeMap<String, String>>,
}

/// ResourceClaim requests quota for one or more resource types, all-or-nothing.
///
/// Example:
/// ```yaml
/// apiVersion: quota.miloapis.com/v1alpha1
/// kind: ResourceClaim
/// metadata:
///   name: project-web
///   namespace: organization-acme
/// spec:
///   consumerRef:
///     kind: Organization
///     name: acme
///   requests:
///     - resourceType: resourcemanager.miloapis.com/projects
///       amount: 1
///       dimensions:
///         env: prod
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "quota.miloapis.com",
    version = "v1alpha1",
    kind = "ResourceClaim",
    namespaced,
    status = "ResourceClaimStatus",
    printcolumn = r#"{"name":"Granted","type":"string","jsonPath":".status.conditions[?(@.type==\"Granted\")].status"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.conditions[?(@.type==\"Granted\")].reason"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ResourceClaimSpec {
    /// Consumer the quota is charged to
    #[serde(default)]
    pub consumer_ref: ConsumerRef,
    /// Requested resources, evaluated in order
    pub requests: Vec<ResourceRequest>,
    /// Object that triggered this claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_ref: Option<UnversionedObjectReference>,
}

/// Per-request allocation outcome
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum AllocationOutcome {
    /// Quota was available
    Granted,
    /// Quota would be exceeded
    Denied,
}

/// Per-request evaluation record kept in claim status
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceClaimAllocationStatus {
    /// Resource type this entry describes
    pub resource_type: String,
    /// Outcome for this request
    pub status: AllocationOutcome,
    /// Machine-readable reason
    pub reason: String,
    /// Diagnostic message with usage, limit and headroom
    pub message: String,
    /// Amount allocated; zero when denied
    #[serde(default)]
    pub allocated_amount: i64,
    /// Bucket the amount is accounted in
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub allocating_bucket: String,
    /// When this entry last changed
    pub last_transition_time: DateTime<Utc>,
}

/// ResourceClaim status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceClaimStatus {
    /// Last processed generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Granted condition
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// One entry per request, in request order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allocations: Vec<ResourceClaimAllocationStatus>,
}

/// A limit for a subset of dimension tuples
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GrantBucket {
    /// Which usage dimensions this bucket applies to
    #[serde(default)]
    pub dimension_selector: DimensionSelector,
    /// Amount contributed to the limit
    pub amount: i64,
}

/// Limits for one resource type
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Allowance {
    /// Registered resource type
    pub resource_type: String,
    /// Buckets contributing to the limit
    pub buckets: Vec<GrantBucket>,
}

/// ResourceGrant adds allowances for a consumer. Only Active grants count.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "quota.miloapis.com",
    version = "v1alpha1",
    kind = "ResourceGrant",
    namespaced,
    status = "ResourceGrantStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGrantSpec {
    /// Consumer receiving the allowances
    #[serde(default)]
    pub consumer_ref: ConsumerRef,
    /// Allowances per resource type
    pub allowances: Vec<Allowance>,
}

/// ResourceGrant status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGrantStatus {
    /// Last observed generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Active condition
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// AllowanceBucket tracks consumption for one (namespace, type, dimensions)
/// tuple. Its name is derived with [`crate::naming::bucket_name`].
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "quota.miloapis.com",
    version = "v1alpha1",
    kind = "AllowanceBucket",
    namespaced,
    status = "AllowanceBucketStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct AllowanceBucketSpec {
    /// Resource type tracked by this bucket
    pub resource_type: String,
    /// Dimension tuple tracked by this bucket
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dimensions: BTreeMap<String, String>,
}

/// AllowanceBucket status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AllowanceBucketStatus {
    /// Current consumption
    #[serde(default)]
    pub allocated: i64,
}

/// Kind of quota being registered
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RegistrationType {
    /// Counted objects (projects, users)
    #[default]
    Entity,
    /// Capacity amounts (bytes, millicores)
    Allocation,
}

/// Kind allowed to consume a registered resource type
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerTypeRef {
    /// API group
    #[serde(default)]
    pub api_group: String,
    /// Kind
    pub kind: String,
}

/// Kind allowed to create claims against a registered resource type
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClaimingResource {
    /// API group
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_group: String,
    /// Kind
    pub kind: String,
}

/// ResourceRegistration declares a resource type that quota can be claimed for.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "quota.miloapis.com",
    version = "v1alpha1",
    kind = "ResourceRegistration",
    status = "ResourceRegistrationStatus",
    printcolumn = r#"{"name":"ResourceType","type":"string","jsonPath":".spec.resourceType"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRegistrationSpec {
    /// Consumer kind
    pub consumer_type_ref: ConsumerTypeRef,
    /// Entity or Allocation
    #[serde(rename = "type", default)]
    pub type_: RegistrationType,
    /// Resource type identifier referenced by claims and grants
    pub resource_type: String,
    /// Description shown to users
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Unit amounts are stored in
    #[serde(default)]
    pub base_unit: String,
    /// Unit amounts are displayed in
    #[serde(default)]
    pub display_unit: String,
    /// Base units per display unit
    #[serde(default = "default_conversion_factor")]
    pub unit_conversion_factor: i64,
    /// Kinds permitted to claim this resource type
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub claiming_resources: Vec<ClaimingResource>,
}

fn default_conversion_factor() -> i64 {
    1
}

impl ResourceRegistrationSpec {
    /// Whether `kind` in `api_group` may create claims for this type.
    /// Kind comparison is case-insensitive; an empty list allows nothing.
    pub fn allows_claiming_resource(&self, api_group: &str, kind: &str) -> bool {
        self.claiming_resources
            .iter()
            .any(|r| r.api_group == api_group && r.kind.eq_ignore_ascii_case(kind))
    }
}

/// ResourceRegistration status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRegistrationStatus {
    /// Last observed generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Active condition
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
