//! ResourceClaim reconciliation
//!
//! Validates that every requested type is registered, evaluates each request
//! in order against its bucket's usage and the active grants, and records the
//! outcome. Nothing is written to grants or buckets; this controller only
//! decides.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use governor_common::crd::{
    conditions, find_condition, is_condition_true, set_condition, ResourceClaim, ResourceGrant,
    ResourceRegistration,
};
use governor_common::events::{actions, reasons};
use governor_common::naming::bucket_name;
use governor_common::{Error, Result};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::runtime::reflector::ObjectRef;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, instrument};

use crate::client::QuotaContext;
use crate::evaluator::{
    claim_condition, merge_allocations, validation_failed_condition, RequestEvaluation,
};
use crate::registration::{validate_claiming_resource, validate_registrations};

/// Controller name reported on Events
pub const CONTROLLER_NAME: &str = "resource-claim-controller";

/// Reconcile a ResourceClaim
#[instrument(
    skip(claim, ctx),
    fields(
        claim = %claim.name_any(),
        namespace = claim.namespace().as_deref().unwrap_or_default(),
    )
)]
pub async fn reconcile(claim: Arc<ResourceClaim>, ctx: Arc<QuotaContext>) -> Result<Action> {
    if claim.meta().deletion_timestamp.is_some() {
        debug!("claim is being deleted, skipping evaluation");
        return Ok(Action::await_change());
    }

    let name = claim.name_any();
    let namespace = claim
        .namespace()
        .ok_or_else(|| Error::validation_for(&name, "ResourceClaim is missing a namespace"))?;
    let generation = claim.meta().generation;

    let original = claim.status.clone().unwrap_or_default();
    let mut status = original.clone();
    status.observed_generation = generation;

    let registrations = ctx.kube.list_registrations().await?;
    if let Err(reason) = validate_claim(&claim, &registrations) {
        info!(error = %reason, "resource claim validation failed");
        set_condition(
            &mut status.conditions,
            validation_failed_condition(&reason, generation),
        );
        if status != original {
            ctx.kube
                .patch_claim_status(&name, &namespace, &status)
                .await?;
        }
        return Ok(Action::await_change());
    }

    let grants = ctx.kube.list_grants(&namespace).await?;
    let mut evaluations = Vec::with_capacity(claim.spec.requests.len());
    for (index, request) in claim.spec.requests.iter().enumerate() {
        let bucket = bucket_name(&namespace, &request.resource_type, request.dimensions.as_ref())?;
        let usage = match ctx.kube.get_bucket(&bucket, &namespace).await? {
            Some(b) => b.status.map(|s| s.allocated).unwrap_or_default(),
            None => {
                debug!(bucket = %bucket, "allowance bucket not found, no usage recorded yet");
                0
            }
        };

        let evaluation = RequestEvaluation::new(request, usage, &grants, bucket);
        info!(
            request_index = index,
            resource_type = %evaluation.resource_type,
            amount = evaluation.amount,
            usage = evaluation.usage,
            limit = evaluation.limit,
            granted = evaluation.granted(),
            "evaluated resource request"
        );
        evaluations.push(evaluation);
    }

    let granted = evaluations.iter().all(RequestEvaluation::granted);
    let now = Utc::now();
    status.allocations = merge_allocations(
        &original.allocations,
        evaluations.iter().map(|e| e.allocation(now)).collect(),
    );
    set_condition(&mut status.conditions, claim_condition(granted, generation));

    if status == original {
        debug!("status unchanged, skipping update");
        return Ok(Action::await_change());
    }

    ctx.kube
        .patch_claim_status(&name, &namespace, &status)
        .await?;
    info!(granted, requests = evaluations.len(), "updated resource claim status");

    let was = find_condition(&original.conditions, conditions::GRANTED).map(|c| c.reason.clone());
    let now_reason = find_condition(&status.conditions, conditions::GRANTED).map(|c| c.reason.clone());
    if was != now_reason {
        let (type_, reason) = if granted {
            (EventType::Normal, reasons::CLAIM_GRANTED)
        } else {
            (EventType::Warning, reasons::CLAIM_DENIED)
        };
        let note = evaluations
            .iter()
            .map(RequestEvaluation::message)
            .collect::<Vec<_>>()
            .join("; ");
        ctx.events
            .publish(&claim.object_ref(&()), type_, reason, actions::EVALUATE, Some(note))
            .await;
    }

    Ok(Action::await_change())
}

/// Registration and claiming-rule checks run before any evaluation
fn validate_claim(
    claim: &ResourceClaim,
    registrations: &[ResourceRegistration],
) -> std::result::Result<(), String> {
    let types = claim.spec.requests.iter().map(|r| r.resource_type.as_str());
    validate_registrations(types, registrations)?;

    if let Some(claimant) = &claim.spec.resource_ref {
        for request in &claim.spec.requests {
            validate_claiming_resource(&request.resource_type, claimant, registrations)?;
        }
    }
    Ok(())
}

/// Error policy for the claim controller
pub fn error_policy(claim: Arc<ResourceClaim>, error: &Error, _ctx: Arc<QuotaContext>) -> Action {
    error!(
        ?error,
        claim = %claim.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );
    if error.is_conflict() {
        Action::requeue(Duration::from_millis(500))
    } else if error.is_retryable() {
        Action::requeue(Duration::from_secs(30))
    } else {
        Action::await_change()
    }
}

/// Claims a grant change can affect: ungranted claims in the grant's namespace
pub fn claims_for_grant(
    claims: &[Arc<ResourceClaim>],
    grant: &ResourceGrant,
) -> Vec<ObjectRef<ResourceClaim>> {
    let Some(namespace) = grant.namespace() else {
        return Vec::new();
    };
    claims
        .iter()
        .filter(|c| c.namespace().as_deref() == Some(namespace.as_str()))
        .filter(|c| {
            !c.status
                .as_ref()
                .is_some_and(|s| is_condition_true(&s.conditions, conditions::GRANTED))
        })
        .map(|c| ObjectRef::from_obj(c.as_ref()))
        .collect()
}
