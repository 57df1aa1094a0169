//! Kubernetes access for the documentation controllers and admission

use std::sync::Arc;

use async_trait::async_trait;
use governor_common::crd::{Document, DocumentRevision, DocumentRevisionStatus, DocumentStatus};
use governor_common::index::RevisionIndex;
use governor_common::kube_utils::patch_resource_status;
use governor_common::{Result, FIELD_MANAGER};
use kube::api::Api;
use kube::Client;

#[cfg(test)]
use mockall::automock;

/// Trait abstracting Kubernetes operations on documentation kinds
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DocumentationKubeClient: Send + Sync {
    /// Get a Document by name and namespace
    async fn get_document(&self, name: &str, namespace: &str) -> Result<Option<Document>>;

    /// Patch the status of a Document
    async fn patch_document_status(
        &self,
        name: &str,
        namespace: &str,
        status: &DocumentStatus,
    ) -> Result<()>;

    /// Patch the status of a DocumentRevision
    async fn patch_revision_status(
        &self,
        name: &str,
        namespace: &str,
        status: &DocumentRevisionStatus,
    ) -> Result<()>;
}

/// Real Kubernetes client implementation
pub struct DocumentationKubeClientImpl {
    client: Client,
}

impl DocumentationKubeClientImpl {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DocumentationKubeClient for DocumentationKubeClientImpl {
    async fn get_document(&self, name: &str, namespace: &str) -> Result<Option<Document>> {
        let api: Api<Document> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn patch_document_status(
        &self,
        name: &str,
        namespace: &str,
        status: &DocumentStatus,
    ) -> Result<()> {
        patch_resource_status::<Document>(&self.client, name, namespace, status, FIELD_MANAGER)
            .await?;
        Ok(())
    }

    async fn patch_revision_status(
        &self,
        name: &str,
        namespace: &str,
        status: &DocumentRevisionStatus,
    ) -> Result<()> {
        patch_resource_status::<DocumentRevision>(
            &self.client,
            name,
            namespace,
            status,
            FIELD_MANAGER,
        )
        .await?;
        Ok(())
    }
}

// =============================================================================
// Controller context
// =============================================================================

/// Shared state for the documentation controllers
pub struct DocumentationContext {
    /// Kubernetes operations
    pub kube: Arc<dyn DocumentationKubeClient>,
    /// Revisions indexed by the document they belong to
    pub revisions: RevisionIndex,
}

impl DocumentationContext {
    /// Create a context backed by the cluster
    pub fn from_client(client: Client, revisions: RevisionIndex) -> Self {
        Self {
            kube: Arc::new(DocumentationKubeClientImpl::new(client)),
            revisions,
        }
    }

    /// Create a context for testing with a mock client
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn DocumentationKubeClient>, revisions: RevisionIndex) -> Self {
        Self { kube, revisions }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use governor_common::crd::{
        DocumentReference, DocumentRevisionContent, DocumentRevisionSpec, DocumentSpec,
    };
    use governor_common::index::{revision_keys, StoreIndex};
    use kube::runtime::reflector::store::Writer;
    use kube::runtime::watcher::Event;

    pub(crate) fn document(name: &str) -> Document {
        let mut d = Document::new(
            name,
            DocumentSpec {
                title: "Terms of Service".into(),
                description: String::new(),
                document_type: "terms-of-service".into(),
            },
        );
        d.metadata.namespace = Some("docs".into());
        d.metadata.generation = Some(1);
        d
    }

    pub(crate) fn revision(name: &str, doc: &str, version: &str, effective: DateTime<Utc>) -> DocumentRevision {
        let mut r = DocumentRevision::new(
            name,
            DocumentRevisionSpec {
                document_ref: DocumentReference {
                    name: doc.into(),
                    namespace: "docs".into(),
                },
                version: version.into(),
                content: DocumentRevisionContent {
                    format: "markdown".into(),
                    data: format!("# Terms {version}"),
                },
                effective_date: effective,
                changes_summary: String::new(),
            },
        );
        r.metadata.namespace = Some("docs".into());
        r.metadata.generation = Some(1);
        r
    }

    pub(crate) fn index_of(revisions: Vec<DocumentRevision>) -> RevisionIndex {
        let mut writer = Writer::<DocumentRevision>::default();
        let store = writer.as_reader();
        writer.apply_watcher_event(&Event::Init);
        for r in revisions {
            writer.apply_watcher_event(&Event::InitApply(r));
        }
        writer.apply_watcher_event(&Event::InitDone);
        StoreIndex::new(store, revision_keys)
    }
}
