//! Admission checks for DocumentRevision
//!
//! A new revision must point at an existing Document, carry a version
//! strictly higher than the Document's latest revision, and take effect in
//! the future. Revisions are immutable history and cannot be deleted.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use governor_common::admission::Verdict;
use governor_common::crd::DocumentRevision;
use governor_common::{Error, Result};
use kube::ResourceExt;
use tracing::{debug, info};

use crate::client::DocumentationKubeClient;
use crate::version::{is_version_higher, DocumentVersion};

const KIND: &str = "DocumentRevision.documentation.miloapis.com";

/// Validates DocumentRevision create, update and delete requests
pub struct RevisionAdmission {
    client: Arc<dyn DocumentationKubeClient>,
}

impl RevisionAdmission {
    /// Create a validator reading documents through `client`
    pub fn new(client: Arc<dyn DocumentationKubeClient>) -> Self {
        Self { client }
    }

    /// Validate a new revision as of `now`
    pub async fn validate_create(
        &self,
        revision: &DocumentRevision,
        now: DateTime<Utc>,
    ) -> Result<Verdict> {
        let name = revision.name_any();
        let doc = &revision.spec.document_ref;
        let doc_namespace = if doc.namespace.is_empty() {
            revision.namespace().unwrap_or_default()
        } else {
            doc.namespace.clone()
        };
        let version = &revision.spec.version;
        let mut errors = Vec::new();

        if let Err(e) = version.parse::<DocumentVersion>() {
            errors.push(format!("spec.version: Invalid value: {version:?}: {e}"));
        }

        match self.client.get_document(&doc.name, &doc_namespace).await? {
            None => {
                debug!(document = %doc.name, namespace = %doc_namespace, "document not found");
                errors.push(format!("spec.documentRef: Not found: {:?}", doc.name));
            }
            Some(document) => {
                let latest = document
                    .status
                    .as_ref()
                    .and_then(|s| s.latest_revision_ref.as_ref());
                if let (Some(latest), true) = (latest, errors.is_empty()) {
                    let higher = is_version_higher(version, &latest.version).map_err(|e| {
                        Error::internal_with_context(
                            "revision_admission",
                            format!(
                                "cannot compare {version} with latest revision version {}: {e}",
                                latest.version
                            ),
                        )
                    })?;
                    if !higher {
                        info!(
                            version = %version,
                            latest = %latest.version,
                            "revision version is not higher than the latest revision"
                        );
                        errors.push(format!(
                            "spec.version: Invalid value: {version:?}: Document revision version \
                             is not higher than the latest referenced revision version"
                        ));
                    }
                }
            }
        }

        let effective = revision.spec.effective_date;
        if effective <= now {
            errors.push(format!(
                "spec.effectiveDate: Invalid value: {:?}: EffectiveDate must be in the future",
                effective.to_rfc3339_opts(SecondsFormat::Secs, true)
            ));
        }

        Ok(match errors.as_slice() {
            [] => Verdict::Allow,
            [only] => Verdict::deny(format!("{KIND} {name:?} is invalid: {only}")),
            many => Verdict::deny(format!("{KIND} {name:?} is invalid: [{}]", many.join(", "))),
        })
    }

    /// Updates are allowed
    pub async fn validate_update(
        &self,
        _old: &DocumentRevision,
        _new: &DocumentRevision,
    ) -> Result<Verdict> {
        Ok(Verdict::Allow)
    }

    /// Deletes are always refused
    pub async fn validate_delete(&self, _revision: &DocumentRevision) -> Result<Verdict> {
        Ok(Verdict::deny(format!(
            "delete is not supported on resources of kind {KIND:?}"
        )))
    }
}
