//! Document reconciliation
//!
//! Tracks the highest-versioned revision of each Document in
//! `status.latestRevisionRef`. Revision admission compares new versions
//! against that reference.

use std::sync::Arc;
use std::time::Duration;

use governor_common::crd::{
    conditions, set_condition, Condition, ConditionStatus, Document, DocumentRevision,
    LatestRevisionRef,
};
use governor_common::index::IndexKey;
use governor_common::kube_utils::is_terminating;
use governor_common::{Error, Result};
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use crate::client::DocumentationContext;
use crate::version::DocumentVersion;

/// Controller name used in logs
pub const CONTROLLER_NAME: &str = "document-controller";

/// Ready reason once the document status is current
pub const REASON_RECONCILED: &str = "Reconciled";

/// Document a revision belongs to
pub fn document_for_revision(revision: &DocumentRevision) -> Option<ObjectRef<Document>> {
    let doc = &revision.spec.document_ref;
    if doc.name.is_empty() {
        return None;
    }
    let namespace = if doc.namespace.is_empty() {
        revision.namespace()?
    } else {
        doc.namespace.clone()
    };
    Some(ObjectRef::new(&doc.name).within(&namespace))
}

/// Highest-versioned revision; on equal versions the first one seen wins.
///
/// Revisions whose version does not parse are skipped.
pub fn latest_revision<'a>(
    revisions: impl IntoIterator<Item = &'a DocumentRevision>,
) -> Option<&'a DocumentRevision> {
    revisions
        .into_iter()
        .filter_map(|r| match r.spec.version.parse::<DocumentVersion>() {
            Ok(version) => Some((version, r)),
            Err(e) => {
                warn!(
                    revision = %r.name_any(),
                    version = %r.spec.version,
                    error = %e,
                    "skipping revision with unparsable version"
                );
                None
            }
        })
        .reduce(|best, next| if next.0 > best.0 { next } else { best })
        .map(|(_, r)| r)
}

/// Reconcile a Document
#[instrument(skip(document, ctx), fields(document = %document.name_any()))]
pub async fn reconcile(document: Arc<Document>, ctx: Arc<DocumentationContext>) -> Result<Action> {
    if is_terminating(document.as_ref()) {
        debug!("document is being deleted");
        return Ok(Action::await_change());
    }

    let name = document.name_any();
    let namespace = document.namespace().unwrap_or_default();
    let original = document.status.clone().unwrap_or_default();
    let mut status = original.clone();

    set_condition(
        &mut status.conditions,
        Condition::new(
            conditions::READY,
            ConditionStatus::True,
            REASON_RECONCILED,
            "Document reconciled",
        )
        .with_generation(document.metadata.generation),
    );

    let revisions = ctx.revisions.lookup(&IndexKey::RevisionByDocument {
        name: name.clone(),
        namespace: namespace.clone(),
    });
    status.latest_revision_ref =
        latest_revision(revisions.iter().map(|r| r.as_ref())).map(|latest| LatestRevisionRef {
            name: latest.name_any(),
            namespace: latest.namespace().unwrap_or_default(),
            version: latest.spec.version.clone(),
            published_at: Some(latest.spec.effective_date),
        });

    if status != original {
        ctx.kube
            .patch_document_status(&name, &namespace, &status)
            .await?;
        info!(
            revisions = revisions.len(),
            latest = status
                .latest_revision_ref
                .as_ref()
                .map(|r| r.version.as_str())
                .unwrap_or("none"),
            "document status updated"
        );
    }
    Ok(Action::await_change())
}

/// Error policy for the document controller
pub fn error_policy(
    document: Arc<Document>,
    error: &Error,
    _ctx: Arc<DocumentationContext>,
) -> Action {
    error!(
        ?error,
        document = %document.name_any(),
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
