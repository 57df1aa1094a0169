//! DocumentRevision reconciliation
//!
//! Revisions are immutable, so they are reconciled once: the content hash is
//! stamped and the revision marked Ready.

use std::sync::Arc;
use std::time::Duration;

use governor_common::crd::{
    conditions, is_condition_true, set_condition, Condition, ConditionStatus, DocumentRevision,
};
use governor_common::naming::sha256_hex;
use governor_common::{Error, Result};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument};

use crate::client::DocumentationContext;

/// Controller name used in logs
pub const CONTROLLER_NAME: &str = "document-revision-controller";

/// Ready reason once the revision has been stamped
pub const REASON_RECONCILED: &str = "Reconciled";

/// Reconcile a DocumentRevision
#[instrument(skip(revision, ctx), fields(revision = %revision.name_any()))]
pub async fn reconcile(
    revision: Arc<DocumentRevision>,
    ctx: Arc<DocumentationContext>,
) -> Result<Action> {
    let original = revision.status.clone().unwrap_or_default();
    if is_condition_true(&original.conditions, conditions::READY) {
        debug!("document revision already reconciled");
        return Ok(Action::await_change());
    }

    let mut status = original;
    status.content_hash = sha256_hex(revision.spec.content.data.as_bytes());
    set_condition(
        &mut status.conditions,
        Condition::new(
            conditions::READY,
            ConditionStatus::True,
            REASON_RECONCILED,
            "Document revision reconciled",
        )
        .with_generation(revision.metadata.generation),
    );

    let namespace = revision.namespace().unwrap_or_default();
    ctx.kube
        .patch_revision_status(&revision.name_any(), &namespace, &status)
        .await?;
    info!(content_hash = %status.content_hash, "document revision reconciled");
    Ok(Action::await_change())
}

/// Error policy for the revision controller
pub fn error_policy(
    revision: Arc<DocumentRevision>,
    error: &Error,
    _ctx: Arc<DocumentationContext>,
) -> Action {
    error!(
        ?error,
        revision = %revision.name_any(),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{index_of, revision};
    use crate::client::MockDocumentationKubeClient;
    use governor_common::crd::{find_condition, DocumentRevisionStatus};
    use std::sync::Mutex;

    /// Story: A new revision gets its content hash and becomes Ready
    #[tokio::test]
    async fn story_revision_is_stamped_once() {
        let captured: Arc<Mutex<Option<DocumentRevisionStatus>>> = Arc::new(Mutex::new(None));
        let sink = captured.clone();
        let mut mock = MockDocumentationKubeClient::new();
        mock.expect_patch_revision_status()
            .withf(|name, ns, _| name == "tos-v1" && ns == "docs")
            .times(1)
            .returning(move |_, _, status| {
                *sink.lock().unwrap() = Some(status.clone());
                Ok(())
            });
        let ctx = DocumentationContext::for_testing(Arc::new(mock), index_of(vec![]));
        let r = revision("tos-v1", "tos", "v1.0.0", chrono::Utc::now());

        reconcile(Arc::new(r.clone()), Arc::new(ctx)).await.unwrap();

        let status = captured.lock().unwrap().clone().expect("status written");
        assert_eq!(status.content_hash, sha256_hex(r.spec.content.data.as_bytes()));
        assert_eq!(status.content_hash.len(), 64);
        let ready = find_condition(&status.conditions, conditions::READY).unwrap();
        assert!(ready.is_true());
        assert_eq!(ready.message, "Document revision reconciled");
        assert_eq!(ready.observed_generation, Some(1));
    }

    /// Story: A Ready revision is never touched again
    #[tokio::test]
    async fn story_ready_revision_is_skipped() {
        let mut mock = MockDocumentationKubeClient::new();
        mock.expect_patch_revision_status().never();
        let ctx = DocumentationContext::for_testing(Arc::new(mock), index_of(vec![]));
        let mut r = revision("tos-v1", "tos", "v1.0.0", chrono::Utc::now());
        r.status = Some(DocumentRevisionStatus {
            conditions: vec![Condition::new(
                conditions::READY,
                ConditionStatus::True,
                REASON_RECONCILED,
                "Document revision reconciled",
            )],
            content_hash: "stale".into(),
        });

        let action = reconcile(Arc::new(r), Arc::new(ctx)).await.unwrap();
        assert_eq!(action, Action::await_change());
    }
}
