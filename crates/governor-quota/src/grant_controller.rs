//! ResourceGrant reconciliation
//!
//! A grant becomes `Active`, and therefore counts towards claim limits, once
//! every resource type it allows has an active registration.

use std::sync::Arc;
use std::time::Duration;

use governor_common::crd::{set_condition, ResourceGrant};
use governor_common::{Error, Result};
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, instrument};

use crate::client::QuotaContext;
use crate::registration::{grant_active_condition, validate_registrations};

/// Controller name reported on Events
pub const CONTROLLER_NAME: &str = "resource-grant-controller";

/// Reconcile a ResourceGrant
#[instrument(
    skip(grant, ctx),
    fields(
        grant = %grant.name_any(),
        namespace = grant.namespace().as_deref().unwrap_or_default(),
    )
)]
pub async fn reconcile(grant: Arc<ResourceGrant>, ctx: Arc<QuotaContext>) -> Result<Action> {
    if grant.meta().deletion_timestamp.is_some() {
        debug!("grant is being deleted");
        return Ok(Action::await_change());
    }

    let name = grant.name_any();
    let namespace = grant
        .namespace()
        .ok_or_else(|| Error::validation_for(&name, "ResourceGrant is missing a namespace"))?;
    let generation = grant.meta().generation;

    let original = grant.status.clone().unwrap_or_default();
    let mut status = original.clone();
    status.observed_generation = generation;

    let registrations = ctx.kube.list_registrations().await?;
    let types = grant.spec.allowances.iter().map(|a| a.resource_type.as_str());
    let validation = validate_registrations(types, &registrations);
    if let Err(e) = &validation {
        info!(error = %e, "resource grant validation failed");
    }
    set_condition(
        &mut status.conditions,
        grant_active_condition(&validation, generation),
    );

    if status != original {
        ctx.kube
            .patch_grant_status(&name, &namespace, &status)
            .await?;
        info!(active = validation.is_ok(), "resource grant status updated");
    }
    Ok(Action::await_change())
}

/// Error policy for the grant controller
pub fn error_policy(grant: Arc<ResourceGrant>, error: &Error, _ctx: Arc<QuotaContext>) -> Action {
    error!(
        ?error,
        grant = %grant.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );
    if error.is_retryable() {
        Action::requeue(Duration::from_secs(30))
    } else {
        Action::await_change()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockQuotaKubeClient;
    use crate::registration::tests::registration;
    use crate::registration::{REASON_ACTIVE, REASON_VALIDATION_FAILED};
    use governor_common::crd::{
        conditions, find_condition, Allowance, GrantBucket, ResourceGrantSpec,
        ResourceGrantStatus,
    };
    use std::sync::Mutex;

    fn grant(types: &[&str]) -> ResourceGrant {
        let mut g = ResourceGrant::new(
            "base",
            ResourceGrantSpec {
                consumer_ref: Default::default(),
                allowances: types
                    .iter()
                    .map(|t| Allowance {
                        resource_type: t.to_string(),
                        buckets: vec![GrantBucket {
                            dimension_selector: Default::default(),
                            amount: 10,
                        }],
                    })
                    .collect(),
            },
        );
        g.metadata.namespace = Some("organization-acme".into());
        g.metadata.generation = Some(1);
        g
    }

    /// Reconcile `g` once, returning the status written if any
    async fn run(g: ResourceGrant) -> Option<ResourceGrantStatus> {
        let mut mock = MockQuotaKubeClient::new();
        mock.expect_list_registrations()
            .returning(|| Ok(vec![registration("cpu", "compute_cpu", true)]));
        let captured = Arc::new(Mutex::new(None));
        let sink = captured.clone();
        mock.expect_patch_grant_status()
            .returning(move |_, _, status| {
                *sink.lock().unwrap() = Some(status.clone());
                Ok(())
            });
        let ctx = Arc::new(QuotaContext::for_testing(Arc::new(mock)));

        reconcile(Arc::new(g), ctx).await.unwrap();
        let status = captured.lock().unwrap().clone();
        status
    }

    /// Story: A grant over registered types becomes Active
    #[tokio::test]
    async fn story_registered_grant_activates() {
        let status = run(grant(&["compute_cpu"])).await.expect("status written");
        let active = find_condition(&status.conditions, conditions::ACTIVE).unwrap();
        assert!(active.is_true());
        assert_eq!(active.reason, REASON_ACTIVE);
        assert_eq!(status.observed_generation, Some(1));
    }

    /// Story: A grant naming an unknown type stays inactive
    #[tokio::test]
    async fn story_unregistered_grant_stays_inactive() {
        let status = run(grant(&["compute_cpu", "compute_gpu"])).await.expect("status written");
        let active = find_condition(&status.conditions, conditions::ACTIVE).unwrap();
        assert!(!active.is_true());
        assert_eq!(active.reason, REASON_VALIDATION_FAILED);
        assert!(active.message.contains("compute_gpu"));
    }

    /// Story: An already-active grant is not rewritten
    #[tokio::test]
    async fn story_active_grant_is_not_rewritten() {
        let mut g = grant(&["compute_cpu"]);
        g.status = run(g.clone()).await;
        assert!(run(g).await.is_none());
    }
}
