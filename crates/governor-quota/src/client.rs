//! Kubernetes access for the quota controllers

use std::sync::Arc;

use async_trait::async_trait;
use governor_common::crd::{
    AllowanceBucket, ResourceClaim, ResourceClaimStatus, ResourceGrant, ResourceGrantStatus,
    ResourceRegistration, ResourceRegistrationStatus,
};
use governor_common::events::{EventPublisher, KubeEventPublisher};
use governor_common::kube_utils::{patch_cluster_resource_status, patch_resource_status};
use governor_common::{Result, FIELD_MANAGER};
use kube::api::{Api, ListParams};
use kube::Client;

#[cfg(test)]
use mockall::automock;

/// Trait abstracting Kubernetes operations for the quota controllers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait QuotaKubeClient: Send + Sync {
    /// Get an AllowanceBucket by name and namespace
    async fn get_bucket(&self, name: &str, namespace: &str) -> Result<Option<AllowanceBucket>>;

    /// List the ResourceGrants in a namespace
    async fn list_grants(&self, namespace: &str) -> Result<Vec<ResourceGrant>>;

    /// List every ResourceRegistration
    async fn list_registrations(&self) -> Result<Vec<ResourceRegistration>>;

    /// Patch the status of a ResourceClaim
    async fn patch_claim_status(
        &self,
        name: &str,
        namespace: &str,
        status: &ResourceClaimStatus,
    ) -> Result<()>;

    /// Patch the status of a ResourceGrant
    async fn patch_grant_status(
        &self,
        name: &str,
        namespace: &str,
        status: &ResourceGrantStatus,
    ) -> Result<()>;

    /// Patch the status of a ResourceRegistration
    async fn patch_registration_status(
        &self,
        name: &str,
        status: &ResourceRegistrationStatus,
    ) -> Result<()>;
}

/// Real Kubernetes client implementation
pub struct QuotaKubeClientImpl {
    client: Client,
}

impl QuotaKubeClientImpl {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl QuotaKubeClient for QuotaKubeClientImpl {
    async fn get_bucket(&self, name: &str, namespace: &str) -> Result<Option<AllowanceBucket>> {
        let api: Api<AllowanceBucket> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(bucket) => Ok(Some(bucket)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_grants(&self, namespace: &str) -> Result<Vec<ResourceGrant>> {
        let api: Api<ResourceGrant> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_registrations(&self) -> Result<Vec<ResourceRegistration>> {
        let api: Api<ResourceRegistration> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn patch_claim_status(
        &self,
        name: &str,
        namespace: &str,
        status: &ResourceClaimStatus,
    ) -> Result<()> {
        patch_resource_status::<ResourceClaim>(&self.client, name, namespace, status, FIELD_MANAGER)
            .await?;
        Ok(())
    }

    async fn patch_grant_status(
        &self,
        name: &str,
        namespace: &str,
        status: &ResourceGrantStatus,
    ) -> Result<()> {
        patch_resource_status::<ResourceGrant>(&self.client, name, namespace, status, FIELD_MANAGER)
            .await?;
        Ok(())
    }

    async fn patch_registration_status(
        &self,
        name: &str,
        status: &ResourceRegistrationStatus,
    ) -> Result<()> {
        patch_cluster_resource_status::<ResourceRegistration>(
            &self.client,
            name,
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

/// Shared state for the quota controllers
pub struct QuotaContext {
    /// Kubernetes operations
    pub kube: Arc<dyn QuotaKubeClient>,
    /// Event publisher
    pub events: Arc<dyn EventPublisher>,
}

impl QuotaContext {
    /// Create a context backed by the cluster
    pub fn from_client(client: Client, controller_name: &str) -> Self {
        Self {
            kube: Arc::new(QuotaKubeClientImpl::new(client.clone())),
            events: Arc::new(KubeEventPublisher::new(client, controller_name)),
        }
    }

    /// Create a context for testing with a mock client
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn QuotaKubeClient>) -> Self {
        Self {
            kube,
            events: Arc::new(governor_common::events::NoopEventPublisher),
        }
    }
}
