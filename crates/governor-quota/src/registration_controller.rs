//! ResourceRegistration reconciliation
//!
//! Checks the registration is well-formed and marks it `Active`. Claims and
//! grants for a resource type are only honoured once its registration is.

use std::sync::Arc;
use std::time::Duration;

use governor_common::crd::{set_condition, ResourceRegistration, ResourceRegistrationSpec};
use governor_common::{Error, Result};
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, instrument};

use crate::client::QuotaContext;
use crate::registration::{registration_active_condition, registration_invalid_condition};

/// Controller name reported on Events
pub const CONTROLLER_NAME: &str = "resource-registration-controller";

/// Structural checks on a registration spec
pub fn validate_spec(spec: &ResourceRegistrationSpec) -> std::result::Result<(), String> {
    if spec.resource_type.trim().is_empty() {
        return Err("resourceType must not be empty".to_string());
    }
    if spec.consumer_type_ref.kind.is_empty() {
        return Err("consumerTypeRef.kind must not be empty".to_string());
    }
    if spec.unit_conversion_factor <= 0 {
        return Err(format!(
            "unitConversionFactor must be positive, got {}",
            spec.unit_conversion_factor
        ));
    }
    Ok(())
}

/// Reconcile a ResourceRegistration
#[instrument(skip(registration, ctx), fields(registration = %registration.name_any()))]
pub async fn reconcile(
    registration: Arc<ResourceRegistration>,
    ctx: Arc<QuotaContext>,
) -> Result<Action> {
    if registration.meta().deletion_timestamp.is_some() {
        debug!("registration is being deleted");
        return Ok(Action::await_change());
    }

    let name = registration.name_any();
    let generation = registration.meta().generation;
    let original = registration.status.clone().unwrap_or_default();
    let mut status = original.clone();
    status.observed_generation = generation;

    let condition = match validate_spec(&registration.spec) {
        Ok(()) => registration_active_condition(generation),
        Err(e) => {
            info!(error = %e, "resource registration validation failed");
            registration_invalid_condition(&e, generation)
        }
    };
    set_condition(&mut status.conditions, condition);

    if status != original {
        ctx.kube.patch_registration_status(&name, &status).await?;
        info!(
            resource_type = %registration.spec.resource_type,
            "resource registration status updated"
        );
    }
    Ok(Action::await_change())
}

/// Error policy for the registration controller
pub fn error_policy(
    registration: Arc<ResourceRegistration>,
    error: &Error,
    _ctx: Arc<QuotaContext>,
) -> Action {
    error!(
        ?error,
        registration = %registration.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );
    if error.is_retryable() {
        Action::requeue(Duration::from_secs(30))
    } else {
        Action::await_change()
    }
}
