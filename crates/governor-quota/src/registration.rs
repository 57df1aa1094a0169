//! ResourceRegistration checks shared by the claim and grant controllers
//!
//! Every resource type a claim requests, or a grant allows, must be backed by
//! an active registration before the quota system takes it into account.

use std::collections::{BTreeSet, HashMap};

use governor_common::crd::{
    conditions, is_condition_true, Condition, ConditionStatus, ResourceRegistration,
    UnversionedObjectReference,
};
use kube::ResourceExt;

/// Active condition reason once validation passed
pub const REASON_ACTIVE: &str = "Active";
/// Active condition reason when validation failed
pub const REASON_VALIDATION_FAILED: &str = "ValidationFailed";

/// Check that every type in `resource_types` has an active registration.
///
/// Returns the first problem found as a user-facing message. Types are checked
/// in sorted order so the reported problem is stable across reconciles.
pub fn validate_registrations<'a>(
    resource_types: impl IntoIterator<Item = &'a str>,
    registrations: &[ResourceRegistration],
) -> Result<(), String> {
    let by_type: HashMap<&str, &ResourceRegistration> = registrations
        .iter()
        .map(|r| (r.spec.resource_type.as_str(), r))
        .collect();

    let wanted: BTreeSet<&str> = resource_types.into_iter().collect();
    for resource_type in wanted {
        let Some(registration) = by_type.get(resource_type) else {
            return Err(format!(
                "ResourceRegistration not found for resource type {resource_type:?}"
            ));
        };
        let active = registration
            .status
            .as_ref()
            .is_some_and(|s| is_condition_true(&s.conditions, conditions::ACTIVE));
        if !active {
            return Err(format!(
                "ResourceRegistration {:?} is not active",
                registration.name_any()
            ));
        }
    }
    Ok(())
}

/// Check that `claimant` may claim `resource_type` under its registration
pub fn validate_claiming_resource(
    resource_type: &str,
    claimant: &UnversionedObjectReference,
    registrations: &[ResourceRegistration],
) -> Result<(), String> {
    let Some(registration) = registrations
        .iter()
        .find(|r| r.spec.resource_type == resource_type)
    else {
        return Ok(());
    };
    if registration
        .spec
        .allows_claiming_resource(&claimant.api_group, &claimant.kind)
    {
        return Ok(());
    }

    let claimant_str = if claimant.api_group.is_empty() {
        claimant.kind.clone()
    } else {
        format!("{}/{}", claimant.api_group, claimant.kind)
    };
    let allowed: Vec<String> = registration
        .spec
        .claiming_resources
        .iter()
        .map(|c| {
            if c.api_group.is_empty() {
                c.kind.clone()
            } else {
                format!("{}/{}", c.api_group, c.kind)
            }
        })
        .collect();

    if allowed.is_empty() {
        Err(format!(
            "resource type {claimant_str} does not satisfy claiming rules for {resource_type}. \
             No claimingResources configured in ResourceRegistration"
        ))
    } else {
        Err(format!(
            "resource type {claimant_str} does not satisfy claiming rules for {resource_type}. \
             Allowed claiming resources: [{}]",
            allowed.join(", ")
        ))
    }
}

/// `Active` condition for a ResourceGrant after validating its allowances
pub fn grant_active_condition(validation: &Result<(), String>, generation: Option<i64>) -> Condition {
    let condition = match validation {
        Ok(()) => Condition::new(
            conditions::ACTIVE,
            ConditionStatus::True,
            REASON_ACTIVE,
            "The grant has been successfully activated and will now be taken into account \
             when evaluating future claims.",
        ),
        Err(e) => Condition::new(
            conditions::ACTIVE,
            ConditionStatus::False,
            REASON_VALIDATION_FAILED,
            format!("Validation failed: {e}"),
        ),
    };
    condition.with_generation(generation)
}

/// `Active` condition for a ResourceRegistration that passed validation
pub fn registration_active_condition(generation: Option<i64>) -> Condition {
    Condition::new(
        conditions::ACTIVE,
        ConditionStatus::True,
        REASON_ACTIVE,
        "The registration is active and resource grants and claims can now be created for \
         this resource type.",
    )
    .with_generation(generation)
}

/// `Active` condition for a ResourceRegistration that failed validation
pub fn registration_invalid_condition(error: &str, generation: Option<i64>) -> Condition {
    Condition::new(
        conditions::ACTIVE,
        ConditionStatus::False,
        REASON_VALIDATION_FAILED,
        format!(
            "Validation failed: {error}. Please check the resourceType, ownerRef, and \
             dimensions fields to ensure they are valid."
        ),
    )
    .with_generation(generation)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use governor_common::crd::{
        ClaimingResource, ConsumerTypeRef, RegistrationType, ResourceRegistrationSpec,
        ResourceRegistrationStatus,
    };

    pub(crate) fn registration(name: &str, resource_type: &str, active: bool) -> ResourceRegistration {
        let mut r = ResourceRegistration::new(
            name,
            ResourceRegistrationSpec {
                consumer_type_ref: ConsumerTypeRef {
                    api_group: "resourcemanager.miloapis.com".into(),
                    kind: "Organization".into(),
                },
                type_: RegistrationType::Allocation,
                resource_type: resource_type.into(),
                description: None,
                base_unit: "millicores".into(),
                display_unit: "cores".into(),
                unit_conversion_factor: 1000,
                claiming_resources: vec![],
            },
        );
        if active {
            r.status = Some(ResourceRegistrationStatus {
                observed_generation: Some(1),
                conditions: vec![registration_active_condition(Some(1))],
            });
        }
        r
    }

    #[test]
    fn active_registrations_validate() {
        let regs = vec![
            registration("cpu", "compute_cpu", true),
            registration("mem", "compute_memory", true),
        ];
        let wanted = ["compute_cpu", "compute_memory", "compute_cpu"];
        assert!(validate_registrations(wanted, &regs).is_ok());
        assert!(validate_registrations(Vec::<&str>::new(), &regs).is_ok());
    }

    #[test]
    fn missing_registration_is_reported() {
        let regs = vec![registration("cpu", "compute_cpu", true)];
        assert_eq!(
            validate_registrations(["compute_gpu"], &regs),
            Err("ResourceRegistration not found for resource type \"compute_gpu\"".into())
        );
    }

    #[test]
    fn inactive_registration_is_reported() {
        let regs = vec![registration("cpu", "compute_cpu", false)];
        assert_eq!(
            validate_registrations(["compute_cpu"], &regs),
            Err("ResourceRegistration \"cpu\" is not active".into())
        );
    }

    #[test]
    fn claiming_rules_list_allowed_resources() {
        let mut reg = registration("projects", "resourcemanager.miloapis.com/projects", true);
        let claimant = UnversionedObjectReference {
            api_group: "resourcemanager.miloapis.com".into(),
            kind: "Project".into(),
            name: "web".into(),
            namespace: None,
        };

        let err = validate_claiming_resource(&reg.spec.resource_type.clone(), &claimant, &[reg.clone()])
            .unwrap_err();
        assert!(err.ends_with("No claimingResources configured in ResourceRegistration"));

        reg.spec.claiming_resources = vec![ClaimingResource {
            api_group: "resourcemanager.miloapis.com".into(),
            kind: "Organization".into(),
        }];
        let err = validate_claiming_resource(&reg.spec.resource_type.clone(), &claimant, &[reg.clone()])
            .unwrap_err();
        assert!(err.ends_with("Allowed claiming resources: [resourcemanager.miloapis.com/Organization]"));

        reg.spec.claiming_resources[0].kind = "Project".into();
        assert!(validate_claiming_resource(&reg.spec.resource_type.clone(), &claimant, &[reg]).is_ok());
    }

    #[test]
    fn grant_condition_reflects_validation() {
        let ok = grant_active_condition(&Ok(()), Some(2));
        assert!(ok.is_true());
        assert_eq!(ok.reason, REASON_ACTIVE);

        let failed = grant_active_condition(&Err("nope".into()), Some(2));
        assert!(!failed.is_true());
        assert_eq!(failed.message, "Validation failed: nope");
    }
}
