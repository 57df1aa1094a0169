//! Organization reconciliation controller
//!
//! Keeps the organization namespace owned by its Organization, and deletes an
//! Organization whose only remaining member's user account is gone. That is
//! the reconcile-time half of the owner invariant: the admission webhook
//! cannot see a User deletion, so the last membership would otherwise be left
//! pointing at nobody.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor_common::crd::{Organization, OrganizationMembership, User};
use governor_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use governor_common::index::{IndexKey, MembershipIndex};
use governor_common::kube_utils::is_terminating;
use governor_common::naming::organization_namespace;
use governor_common::{Error, Result, FIELD_MANAGER};
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::runtime::reflector::ObjectRef;
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

/// Controller name reported on Events
pub const CONTROLLER_NAME: &str = "organization-controller";

// =============================================================================
// Kube client abstraction
// =============================================================================

/// Trait abstracting Kubernetes operations for the organization controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OrganizationKubeClient: Send + Sync {
    /// Read a User straight from the API server, bypassing caches
    async fn get_user(&self, name: &str) -> Result<Option<User>>;

    /// Delete an Organization; not-found is success
    async fn delete_organization(&self, name: &str) -> Result<()>;

    /// Get a Namespace by name
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>>;

    /// Apply a merge patch to a Namespace
    async fn patch_namespace(&self, name: &str, patch: &serde_json::Value) -> Result<()>;
}

/// Real Kubernetes client implementation
pub struct OrganizationKubeClientImpl {
    client: Client,
}

impl OrganizationKubeClientImpl {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl OrganizationKubeClient for OrganizationKubeClientImpl {
    async fn get_user(&self, name: &str) -> Result<Option<User>> {
        let api: Api<User> = Api::all(self.client.clone());
        match api.get(name).await {
            Ok(user) => Ok(Some(user)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_organization(&self, name: &str) -> Result<()> {
        let api: Api<Organization> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.get(name).await {
            Ok(ns) => Ok(Some(ns)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_namespace(&self, name: &str, patch: &serde_json::Value) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await?;
        Ok(())
    }
}

// =============================================================================
// Controller context
// =============================================================================

/// Shared state for organization reconciliation
pub struct OrganizationContext {
    /// Kubernetes operations
    pub kube: Arc<dyn OrganizationKubeClient>,
    /// Event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Memberships indexed by user and organization
    pub memberships: MembershipIndex,
}

impl OrganizationContext {
    /// Create a context backed by the cluster
    pub fn from_client(client: Client, memberships: MembershipIndex) -> Self {
        Self {
            kube: Arc::new(OrganizationKubeClientImpl::new(client.clone())),
            events: Arc::new(KubeEventPublisher::new(client, CONTROLLER_NAME)),
            memberships,
        }
    }

    /// Create a context for testing with a mock client
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn OrganizationKubeClient>, memberships: MembershipIndex) -> Self {
        Self {
            kube,
            events: Arc::new(governor_common::events::NoopEventPublisher),
            memberships,
        }
    }
}

// =============================================================================
// Watch mappers
// =============================================================================

/// Organizations affected by a change to `user`
pub fn organizations_for_user(index: &MembershipIndex, user: &User) -> Vec<ObjectRef<Organization>> {
    let mut orgs: Vec<ObjectRef<Organization>> = index
        .lookup(&IndexKey::MembershipByUser(user.name_any()))
        .iter()
        .map(|m| ObjectRef::new(&m.spec.organization_ref.name))
        .collect();
    orgs.sort_by(|a, b| a.name.cmp(&b.name));
    orgs.dedup();
    orgs
}

/// Organization a membership belongs to
pub fn organization_for_membership(
    membership: &OrganizationMembership,
) -> Option<ObjectRef<Organization>> {
    let org = &membership.spec.organization_ref.name;
    (!org.is_empty()).then(|| ObjectRef::new(org))
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Reconcile an Organization
#[instrument(skip(org, ctx), fields(organization = %org.name_any()))]
pub async fn reconcile(org: Arc<Organization>, ctx: Arc<OrganizationContext>) -> Result<Action> {
    if is_terminating(org.as_ref()) {
        debug!("organization is being deleted");
        return Ok(Action::await_change());
    }
    let name = org.name_any();

    ensure_namespace_owner(&org, &ctx).await?;

    let memberships = ctx
        .memberships
        .lookup(&IndexKey::MembershipByOrganization(name.clone()));
    let [last] = memberships.as_slice() else {
        debug!(memberships = memberships.len(), "organization membership count does not need action");
        return Ok(Action::await_change());
    };

    let user_name = &last.spec.user_ref.name;
    let user_gone = match ctx.kube.get_user(user_name).await? {
        None => true,
        Some(user) => is_terminating(&user),
    };
    if !user_gone {
        return Ok(Action::await_change());
    }

    info!(
        user = %user_name,
        membership = %last.name_any(),
        "last member's user is gone, deleting organization"
    );
    ctx.kube.delete_organization(&name).await?;
    ctx.events
        .publish(
            &org.object_ref(&()),
            EventType::Normal,
            reasons::ORGANIZATION_DELETED,
            actions::DELETE,
            Some(format!("Deleted organization after user {user_name} was removed")),
        )
        .await;

    Ok(Action::await_change())
}

/// Make the Organization the controller owner of its namespace
async fn ensure_namespace_owner(org: &Organization, ctx: &OrganizationContext) -> Result<()> {
    let ns_name = organization_namespace(&org.name_any());
    let Some(namespace) = ctx.kube.get_namespace(&ns_name).await? else {
        debug!(namespace = %ns_name, "organization namespace does not exist yet");
        return Ok(());
    };

    if let Some(patch) = namespace_owner_patch(&namespace, org)? {
        info!(namespace = %ns_name, "setting organization as namespace owner");
        ctx.kube.patch_namespace(&ns_name, &patch).await?;
    }
    Ok(())
}

/// Patch adding `org` as controller owner of `namespace`, or `None` if it
/// already is one.
///
/// A namespace controlled by something else is left alone.
pub fn namespace_owner_patch(
    namespace: &Namespace,
    org: &Organization,
) -> Result<Option<serde_json::Value>> {
    let owner: OwnerReference = org.controller_owner_ref(&()).ok_or_else(|| {
        Error::internal_with_context(
            "namespace_owner_patch",
            format!("organization {} has no uid", org.name_any()),
        )
    })?;

    let current = namespace.owner_references();
    if let Some(controller) = current.iter().find(|r| r.controller == Some(true)) {
        if controller.uid != owner.uid {
            warn!(
                namespace = %namespace.name_any(),
                controller = %controller.name,
                "namespace already has a different controller owner"
            );
        }
        return Ok(None);
    }

    let mut refs = current.to_vec();
    refs.retain(|r| r.uid != owner.uid);
    refs.push(owner);

    let mut metadata = json!({ "ownerReferences": refs });
    if let Some(rv) = namespace.resource_version() {
        metadata["resourceVersion"] = json!(rv);
    }
    Ok(Some(json!({ "metadata": metadata })))
}

/// Error policy for the organization controller
pub fn error_policy(org: Arc<Organization>, error: &Error, _ctx: Arc<OrganizationContext>) -> Action {
    error!(
        ?error,
        organization = %org.name_any(),
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
