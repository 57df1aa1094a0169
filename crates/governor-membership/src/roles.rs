//! Convergence of membership roles onto managed PolicyBindings
//!
//! Desired roles come from `spec.roles`; existing state is the set of
//! PolicyBindings labelled as managed for the membership. Both sides are keyed
//! by `namespace/name` of the role so a binding is matched to its role
//! regardless of what the binding itself is called.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use governor_common::crd::{
    conditions, is_condition_true, AppliedRole, AppliedRoleStatus, BindingRoleRef, Condition,
    ConditionStatus, Organization, OrganizationMembership, PolicyBinding,
    PolicyBindingReference, PolicyBindingSpec, ResourceReference, ResourceSelector,
    RoleReference, Subject, User,
};
use governor_common::naming::{binding_name, role_key};
use governor_common::{
    Error, Result, MANAGED_BY_LABEL, MEMBERSHIP_CONTROLLER_NAME, MEMBERSHIP_LABEL,
    RESOURCEMANAGER_GROUP,
};
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};

/// Reason when every role is applied
pub const REASON_ALL_APPLIED: &str = "AllRolesApplied";
/// Reason when some roles are pending or failed
pub const REASON_PARTIAL: &str = "PartialRolesApplied";
/// Reason when the membership lists no roles
pub const REASON_NO_ROLES: &str = "NoRolesSpecified";

/// Message on a role whose binding exists but is not Ready
pub const MSG_WAITING_READY: &str = "Waiting for PolicyBinding to become Ready";
/// Message on a role whose binding was just created
pub const MSG_CREATED: &str = "PolicyBinding created, waiting for Ready status";

/// Labels identifying the bindings managed for `membership`
pub fn managed_labels(membership: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MEMBERSHIP_LABEL.to_string(), membership.to_string()),
        (
            MANAGED_BY_LABEL.to_string(),
            MEMBERSHIP_CONTROLLER_NAME.to_string(),
        ),
    ])
}

/// Label selector matching the bindings managed for `membership`
pub fn managed_selector(membership: &str) -> String {
    format!("{MEMBERSHIP_LABEL}={membership},{MANAGED_BY_LABEL}={MEMBERSHIP_CONTROLLER_NAME}")
}

/// Result of diffing desired roles against managed bindings
#[derive(Debug)]
pub struct RolePlan {
    /// Desired roles in spec order, each with its existing binding if any
    pub desired: Vec<(RoleReference, Option<PolicyBinding>)>,
    /// Managed bindings no desired role maps to
    pub stale: Vec<PolicyBinding>,
}

/// Pair each desired role with its managed binding.
///
/// When two bindings claim the same role key the later one in `existing`
/// wins and the other is reported as stale.
pub fn plan_roles(
    roles: &[RoleReference],
    existing: Vec<PolicyBinding>,
    membership_namespace: &str,
) -> RolePlan {
    let mut by_key: HashMap<String, PolicyBinding> = HashMap::new();
    let mut stale = Vec::new();
    for binding in existing {
        let key = binding_role_key(&binding, membership_namespace);
        if let Some(previous) = by_key.insert(key, binding) {
            stale.push(previous);
        }
    }

    let desired = roles
        .iter()
        .map(|role| {
            let key = role_key(role, membership_namespace);
            (role.clone(), by_key.remove(&key))
        })
        .collect();

    stale.extend(by_key.into_values());
    RolePlan { desired, stale }
}

fn binding_role_key(binding: &PolicyBinding, membership_namespace: &str) -> String {
    let role = RoleReference {
        name: binding.spec.role_ref.name.clone(),
        namespace: binding.spec.role_ref.namespace.clone(),
    };
    role_key(&role, membership_namespace)
}

fn binding_ref(binding: &PolicyBinding) -> PolicyBindingReference {
    PolicyBindingReference {
        name: binding.name_any(),
        namespace: binding.namespace(),
    }
}

/// Status entry for a role whose managed binding already exists
pub fn existing_binding_status(role: &RoleReference, binding: &PolicyBinding) -> AppliedRole {
    let ready = binding
        .status
        .as_ref()
        .is_some_and(|s| is_condition_true(&s.conditions, conditions::READY));

    if ready {
        AppliedRole {
            name: role.name.clone(),
            namespace: role.namespace.clone(),
            status: AppliedRoleStatus::Applied,
            message: None,
            policy_binding_ref: Some(binding_ref(binding)),
            applied_at: Some(
                binding
                    .creation_timestamp()
                    .map(|t| t.0)
                    .unwrap_or_else(Utc::now),
            ),
        }
    } else {
        AppliedRole {
            name: role.name.clone(),
            namespace: role.namespace.clone(),
            status: AppliedRoleStatus::Pending,
            message: Some(MSG_WAITING_READY.to_string()),
            policy_binding_ref: Some(binding_ref(binding)),
            applied_at: None,
        }
    }
}

/// Status entry for a role whose binding was just created
pub fn created_binding_status(role: &RoleReference, binding: &PolicyBinding) -> AppliedRole {
    AppliedRole {
        name: role.name.clone(),
        namespace: role.namespace.clone(),
        status: AppliedRoleStatus::Pending,
        message: Some(MSG_CREATED.to_string()),
        policy_binding_ref: Some(binding_ref(binding)),
        applied_at: None,
    }
}

/// Status entry for a role whose binding could not be created
pub fn failed_binding_status(role: &RoleReference, error: &str) -> AppliedRole {
    AppliedRole {
        name: role.name.clone(),
        namespace: role.namespace.clone(),
        status: AppliedRoleStatus::Failed,
        message: Some(format!("Failed to create PolicyBinding: {error}")),
        policy_binding_ref: None,
        applied_at: None,
    }
}

/// `RolesApplied` condition summarising `applied`
pub fn roles_applied_condition(applied: &[AppliedRole], generation: Option<i64>) -> Condition {
    let count = |status| applied.iter().filter(|r| r.status == status).count();
    let ok = count(AppliedRoleStatus::Applied);
    let pending = count(AppliedRoleStatus::Pending);
    let failed = count(AppliedRoleStatus::Failed);

    let (status, reason, message) = if applied.is_empty() {
        (
            ConditionStatus::True,
            REASON_NO_ROLES,
            "No roles specified for this membership".to_string(),
        )
    } else if pending == 0 && failed == 0 {
        (
            ConditionStatus::True,
            REASON_ALL_APPLIED,
            format!("All {ok} role(s) successfully applied"),
        )
    } else if pending > 0 {
        (
            ConditionStatus::False,
            REASON_PARTIAL,
            format!(
                "{ok} of {} role(s) ready, {pending} pending",
                ok + pending + failed
            ),
        )
    } else {
        (
            ConditionStatus::False,
            REASON_PARTIAL,
            format!("{ok} of {} role(s) successfully applied", ok + failed),
        )
    };

    Condition::new(conditions::ROLES_APPLIED, status, reason, message).with_generation(generation)
}

/// Managed binding granting `role` to the membership's user over the organization
pub fn build_role_binding(
    membership: &OrganizationMembership,
    organization: &Organization,
    user: &User,
    role: &RoleReference,
) -> Result<PolicyBinding> {
    let membership_name = membership.name_any();
    let namespace = membership.namespace().unwrap_or_default();
    let key = role_key(role, &namespace);

    let owner = membership.controller_owner_ref(&()).ok_or_else(|| {
        Error::internal_with_context(
            "build_role_binding",
            format!("membership {membership_name} has no uid"),
        )
    })?;

    Ok(PolicyBinding {
        metadata: ObjectMeta {
            name: Some(binding_name(&membership_name, &key)),
            namespace: Some(namespace.clone()),
            labels: Some(managed_labels(&membership_name)),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: PolicyBindingSpec {
            role_ref: BindingRoleRef {
                name: role.name.clone(),
                namespace: Some(role.resolved_namespace(&namespace).to_string()),
            },
            subjects: vec![user_subject(user)],
            resource_selector: ResourceSelector {
                resource_ref: Some(ResourceReference {
                    api_group: RESOURCEMANAGER_GROUP.to_string(),
                    kind: Organization::kind(&()).to_string(),
                    name: organization.name_any(),
                    uid: organization.uid().unwrap_or_default(),
                    namespace: None,
                }),
                resource_kind: None,
            },
        },
        status: None,
    })
}

/// Binding that lets the membership's user delete the membership itself
pub fn build_self_delete_binding(
    membership: &OrganizationMembership,
    user: &User,
    role: &RoleReference,
    name: String,
) -> Result<PolicyBinding> {
    let namespace = membership.namespace().unwrap_or_default();
    let owner = membership.controller_owner_ref(&()).ok_or_else(|| {
        Error::internal_with_context(
            "build_self_delete_binding",
            format!("membership {} has no uid", membership.name_any()),
        )
    })?;

    Ok(PolicyBinding {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace.clone()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: PolicyBindingSpec {
            role_ref: BindingRoleRef {
                name: role.name.clone(),
                namespace: role.namespace.clone(),
            },
            subjects: vec![user_subject(user)],
            resource_selector: ResourceSelector {
                resource_ref: Some(ResourceReference {
                    api_group: RESOURCEMANAGER_GROUP.to_string(),
                    kind: OrganizationMembership::kind(&()).to_string(),
                    name: membership.name_any(),
                    uid: membership.uid().unwrap_or_default(),
                    namespace: Some(namespace),
                }),
                resource_kind: None,
            },
        },
        status: None,
    })
}

fn user_subject(user: &User) -> Subject {
    Subject {
        kind: User::kind(&()).to_string(),
        name: user.name_any(),
        namespace: None,
        uid: user.uid(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::owner::tests::membership;
    use governor_common::crd::{
        OrganizationSpec, OrganizationType, PolicyBindingStatus, UserSpec,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    // =========================================================================
    // Test Fixtures
    // =========================================================================

    fn organization(name: &str) -> Organization {
        let mut org = Organization::new(
            name,
            OrganizationSpec {
                type_: OrganizationType::Standard,
            },
        );
        org.metadata.uid = Some(format!("org-uid-{name}"));
        org
    }

    fn user(name: &str) -> User {
        let mut u = User::new(
            name,
            UserSpec {
                email: format!("{name}@example.com"),
                ..Default::default()
            },
        );
        u.metadata.uid = Some(format!("user-uid-{name}"));
        u
    }

    fn binding_for(m: &OrganizationMembership, role: &RoleReference, ready: bool) -> PolicyBinding {
        let mut b = build_role_binding(m, &organization("acme"), &user("alice"), role).unwrap();
        b.metadata.creation_timestamp = Some(Time(
            chrono::DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        ));
        let status = if ready {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        };
        b.status = Some(PolicyBindingStatus {
            observed_generation: None,
            conditions: vec![Condition::new(conditions::READY, status, "Reconciled", "")],
        });
        b
    }

    fn viewer() -> RoleReference {
        RoleReference::new("viewer", None)
    }

    fn owner() -> RoleReference {
        RoleReference::new("organization-owner", Some("milo-system"))
    }

    // =========================================================================
    // Binding construction
    // =========================================================================

    #[test]
    fn role_binding_targets_organization_and_user() {
        let m = membership("alice", "acme", vec![viewer()]);
        let b = build_role_binding(&m, &organization("acme"), &user("alice"), &viewer()).unwrap();

        assert_eq!(
            b.metadata.name.as_deref(),
            Some(binding_name("alice", "organization-acme/viewer").as_str())
        );
        assert_eq!(b.metadata.namespace.as_deref(), Some("organization-acme"));
        assert_eq!(b.metadata.labels, Some(managed_labels("alice")));

        let owner_ref = &b.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner_ref.kind, "OrganizationMembership");
        assert_eq!(owner_ref.uid, "uid-alice");
        assert_eq!(owner_ref.controller, Some(true));

        assert_eq!(b.spec.role_ref.name, "viewer");
        assert_eq!(b.spec.role_ref.namespace.as_deref(), Some("organization-acme"));
        assert_eq!(b.spec.subjects[0].kind, "User");
        assert_eq!(b.spec.subjects[0].uid.as_deref(), Some("user-uid-alice"));

        let target = b.spec.resource_selector.resource_ref.as_ref().unwrap();
        assert_eq!(target.api_group, "resourcemanager.miloapis.com");
        assert_eq!(target.kind, "Organization");
        assert_eq!(target.uid, "org-uid-acme");
        assert!(target.namespace.is_none());
    }

    #[test]
    fn binding_requires_membership_uid() {
        let mut m = membership("alice", "acme", vec![viewer()]);
        m.metadata.uid = None;
        assert!(build_role_binding(&m, &organization("acme"), &user("alice"), &viewer()).is_err());
    }

    #[test]
    fn self_delete_binding_targets_the_membership() {
        let m = membership("alice", "acme", vec![]);
        let role = RoleReference::new("membership-self-delete", Some("milo-system"));
        let b = build_self_delete_binding(
            &m,
            &user("alice"),
            &role,
            "usermembership-self-delete-alice".into(),
        )
        .unwrap();

        assert!(b.metadata.labels.is_none());
        let target = b.spec.resource_selector.resource_ref.as_ref().unwrap();
        assert_eq!(target.kind, "OrganizationMembership");
        assert_eq!(target.name, "alice");
        assert_eq!(target.namespace.as_deref(), Some("organization-acme"));
        assert_eq!(target.uid, "uid-alice");
        assert_eq!(b.spec.role_ref.namespace.as_deref(), Some("milo-system"));
    }

    #[test]
    fn managed_selector_matches_both_labels() {
        assert_eq!(
            managed_selector("alice"),
            "resourcemanager.miloapis.com/membership=alice,\
             resourcemanager.miloapis.com/managed-by=organization-membership-controller"
        );
    }

    // =========================================================================
    // Planning
    // =========================================================================

    #[test]
    fn plan_pairs_roles_by_resolved_key() {
        let m = membership("alice", "acme", vec![viewer(), owner()]);
        // A binding whose roleRef spells out the default namespace still matches
        let existing = vec![binding_for(&m, &viewer(), true)];

        let plan = plan_roles(&m.spec.roles, existing, "organization-acme");
        assert_eq!(plan.desired.len(), 2);
        assert!(plan.desired[0].1.is_some());
        assert!(plan.desired[1].1.is_none());
        assert!(plan.stale.is_empty());
    }

    #[test]
    fn plan_reports_unmatched_bindings_as_stale() {
        let m = membership("alice", "acme", vec![owner()]);
        let existing = vec![
            binding_for(&m, &viewer(), true),
            binding_for(&m, &owner(), false),
        ];
        let plan = plan_roles(&m.spec.roles, existing, "organization-acme");

        assert_eq!(plan.stale.len(), 1);
        assert_eq!(plan.stale[0].spec.role_ref.name, "viewer");
    }

    #[test]
    fn plan_preserves_spec_order() {
        let roles = vec![owner(), viewer(), RoleReference::new("billing", None)];
        let plan = plan_roles(&roles, vec![], "organization-acme");
        let names: Vec<_> = plan.desired.iter().map(|(r, _)| r.name.as_str()).collect();
        assert_eq!(names, vec!["organization-owner", "viewer", "billing"]);
    }

    // =========================================================================
    // Status entries and summary
    // =========================================================================

    #[test]
    fn ready_binding_is_applied_with_creation_time() {
        let m = membership("alice", "acme", vec![viewer()]);
        let b = binding_for(&m, &viewer(), true);
        let entry = existing_binding_status(&viewer(), &b);

        assert_eq!(entry.status, AppliedRoleStatus::Applied);
        assert!(entry.message.is_none());
        assert_eq!(
            entry.applied_at.map(|t| t.to_rfc3339()),
            Some("2025-01-01T00:00:00+00:00".to_string())
        );
    }

    #[test]
    fn unready_binding_is_pending() {
        let m = membership("alice", "acme", vec![viewer()]);
        let entry = existing_binding_status(&viewer(), &binding_for(&m, &viewer(), false));
        assert_eq!(entry.status, AppliedRoleStatus::Pending);
        assert_eq!(entry.message.as_deref(), Some(MSG_WAITING_READY));
        assert!(entry.policy_binding_ref.is_some());
    }

    #[test]
    fn summary_all_applied() {
        let m = membership("alice", "acme", vec![viewer()]);
        let applied = vec![existing_binding_status(&viewer(), &binding_for(&m, &viewer(), true))];
        let c = roles_applied_condition(&applied, Some(2));
        assert!(c.is_true());
        assert_eq!(c.reason, REASON_ALL_APPLIED);
        assert_eq!(c.message, "All 1 role(s) successfully applied");
        assert_eq!(c.observed_generation, Some(2));
    }

    #[test]
    fn summary_with_pending_counts_everything() {
        let m = membership("alice", "acme", vec![]);
        let applied = vec![
            existing_binding_status(&viewer(), &binding_for(&m, &viewer(), true)),
            created_binding_status(&owner(), &binding_for(&m, &owner(), false)),
            failed_binding_status(&RoleReference::new("ghost", None), "role ghost not found"),
        ];
        let c = roles_applied_condition(&applied, None);
        assert!(!c.is_true());
        assert_eq!(c.reason, REASON_PARTIAL);
        assert_eq!(c.message, "1 of 3 role(s) ready, 1 pending");
    }

    #[test]
    fn summary_with_only_failures() {
        let m = membership("alice", "acme", vec![]);
        let applied = vec![
            existing_binding_status(&viewer(), &binding_for(&m, &viewer(), true)),
            failed_binding_status(&owner(), "boom"),
        ];
        let c = roles_applied_condition(&applied, None);
        assert_eq!(c.reason, REASON_PARTIAL);
        assert_eq!(c.message, "1 of 2 role(s) successfully applied");
        assert_eq!(
            applied[1].message.as_deref(),
            Some("Failed to create PolicyBinding: boom")
        );
    }

    #[test]
    fn summary_without_roles() {
        let c = roles_applied_condition(&[], Some(1));
        assert!(c.is_true());
        assert_eq!(c.reason, REASON_NO_ROLES);
        assert_eq!(c.message, "No roles specified for this membership");
    }
}
