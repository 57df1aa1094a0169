//! Admission checks for OrganizationMembership
//!
//! Create and update requests must reference existing, distinct, non-empty
//! roles. Delete requests, and updates that drop the owner role, are refused
//! when they would leave the organization without an owner.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
pub use governor_common::admission::Verdict;
use governor_common::crd::{Organization, OrganizationMembership, Role};
use governor_common::{Error, Result};
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::owner::{last_owner_message, OwnerChange, OwnerPolicy};

/// Cluster reads needed by membership admission
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MembershipAdmissionClient: Send + Sync {
    /// List every membership in a namespace
    async fn list_memberships(&self, namespace: &str) -> Result<Vec<OrganizationMembership>>;

    /// Get a membership by name and namespace
    async fn get_membership(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<OrganizationMembership>>;

    /// Get a Role by name and namespace
    async fn get_role(&self, name: &str, namespace: &str) -> Result<Option<Role>>;

    /// Get a Namespace by name
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>>;

    /// Get an Organization by name
    async fn get_organization(&self, name: &str) -> Result<Option<Organization>>;
}

/// Real Kubernetes client implementation
pub struct MembershipAdmissionClientImpl {
    client: Client,
}

impl MembershipAdmissionClientImpl {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

async fn get_opt<K>(api: Api<K>, name: &str) -> Result<Option<K>>
where
    K: Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.get(name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl MembershipAdmissionClient for MembershipAdmissionClientImpl {
    async fn list_memberships(&self, namespace: &str) -> Result<Vec<OrganizationMembership>> {
        let api: Api<OrganizationMembership> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_membership(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<OrganizationMembership>> {
        get_opt(Api::namespaced(self.client.clone(), namespace), name).await
    }

    async fn get_role(&self, name: &str, namespace: &str) -> Result<Option<Role>> {
        get_opt(Api::namespaced(self.client.clone(), namespace), name).await
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        get_opt(Api::all(self.client.clone()), name).await
    }

    async fn get_organization(&self, name: &str) -> Result<Option<Organization>> {
        get_opt(Api::all(self.client.clone()), name).await
    }
}

/// Validates membership create, update and delete requests
pub struct MembershipAdmission {
    client: Arc<dyn MembershipAdmissionClient>,
    owner: OwnerPolicy,
}

impl MembershipAdmission {
    /// Create a validator with the given owner policy
    pub fn new(client: Arc<dyn MembershipAdmissionClient>, owner: OwnerPolicy) -> Self {
        Self { client, owner }
    }

    /// Validate a new membership
    pub async fn validate_create(&self, membership: &OrganizationMembership) -> Result<Verdict> {
        self.validate_roles(membership).await
    }

    /// Validate an update; the owner check compares against the stored object
    pub async fn validate_update(
        &self,
        _old: &OrganizationMembership,
        new: &OrganizationMembership,
    ) -> Result<Verdict> {
        let verdict = self.validate_roles(new).await?;
        if !verdict.is_allowed() || !self.owner.is_enabled() {
            return Ok(verdict);
        }

        let namespace = namespace_of(new)?;
        let Some(current) = self
            .client
            .get_membership(&new.name_any(), &namespace)
            .await?
        else {
            return Ok(Verdict::Allow);
        };

        if self.owner.is_owner(&current) && !self.owner.is_owner(new) {
            return self.guard_last_owner(&current, OwnerChange::Update).await;
        }
        Ok(Verdict::Allow)
    }

    /// Validate a delete
    pub async fn validate_delete(&self, membership: &OrganizationMembership) -> Result<Verdict> {
        if !self.owner.is_owner(membership) {
            return Ok(Verdict::Allow);
        }
        self.guard_last_owner(membership, OwnerChange::Delete).await
    }

    /// Deny removing the owner role from `membership` when nobody else holds it
    async fn guard_last_owner(
        &self,
        membership: &OrganizationMembership,
        change: OwnerChange,
    ) -> Result<Verdict> {
        let namespace = namespace_of(membership)?;
        if self.is_teardown(&namespace, membership).await {
            debug!(namespace = %namespace, "organization is being torn down, allowing");
            return Ok(Verdict::Allow);
        }

        let siblings = self.client.list_memberships(&namespace).await?;
        if self.owner.has_other_owner(membership, &siblings) {
            return Ok(Verdict::Allow);
        }

        info!(
            membership = %membership.name_any(),
            organization = %membership.spec.organization_ref.name,
            "refusing to remove the last organization owner"
        );
        Ok(Verdict::Deny(last_owner_message(change, membership)))
    }

    /// Whether the namespace or the organization is going away.
    ///
    /// Lookup failures, including a namespace that cannot be found, count as
    /// "not going away" so the guard stays in force.
    async fn is_teardown(&self, namespace: &str, membership: &OrganizationMembership) -> bool {
        match self.client.get_namespace(namespace).await {
            Ok(Some(ns)) if namespace_terminating(&ns) => return true,
            Ok(_) => {}
            Err(e) => {
                warn!(
                    namespace = %namespace,
                    error = %e,
                    "failed to fetch namespace while validating owner removal"
                );
            }
        }

        let org = &membership.spec.organization_ref.name;
        if org.is_empty() {
            return false;
        }
        match self.client.get_organization(org).await {
            Ok(None) => true,
            Ok(Some(org)) => org.metadata.deletion_timestamp.is_some(),
            Err(e) => {
                warn!(
                    organization = %org,
                    error = %e,
                    "failed to fetch organization while validating owner removal"
                );
                false
            }
        }
    }

    async fn validate_roles(&self, membership: &OrganizationMembership) -> Result<Verdict> {
        let namespace = namespace_of(membership)?;
        let mut seen = HashSet::new();

        for role in &membership.spec.roles {
            if role.name.is_empty() {
                return Ok(Verdict::Deny("role name cannot be empty".to_string()));
            }
            let role_namespace = role.resolved_namespace(&namespace);
            if !seen.insert((role_namespace.to_string(), role.name.clone())) {
                return Ok(Verdict::Deny(format!(
                    "duplicate role reference detected: {} in namespace {}",
                    role.name, role_namespace
                )));
            }
            if self.client.get_role(&role.name, role_namespace).await?.is_none() {
                return Ok(Verdict::Deny(format!(
                    "role '{}' not found in namespace '{}'",
                    role.name, role_namespace
                )));
            }
        }
        Ok(Verdict::Allow)
    }
}

fn namespace_of(membership: &OrganizationMembership) -> Result<String> {
    membership.namespace().ok_or_else(|| {
        Error::validation_for(
            membership.name_any(),
            "OrganizationMembership is missing a namespace",
        )
    })
}

fn namespace_terminating(ns: &Namespace) -> bool {
    ns.metadata.deletion_timestamp.is_some()
        || ns
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .is_some_and(|phase| phase == "Terminating")
}
