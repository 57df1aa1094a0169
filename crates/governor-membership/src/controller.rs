//! OrganizationMembership reconciliation controller
//!
//! For each membership the controller:
//! - resolves the referenced Organization and User and caches their display
//!   fields in status,
//! - ensures the user's self-delete PolicyBinding exists (when configured),
//! - converges `spec.roles` onto managed PolicyBindings, one per role,
//! - reports per-role outcomes and a `RolesApplied` summary condition.
//!
//! A role that fails to apply never blocks the others. The reconcile only
//! errors when no useful progress is possible (listing bindings failed, the
//! status write failed).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor_common::crd::{
    conditions, set_condition, AppliedRole, AppliedRoleStatus, Condition, ConditionStatus,
    MembershipOrganizationStatus, MembershipUserStatus, Organization, OrganizationMembership,
    OrganizationMembershipStatus, PolicyBinding, Role, RoleReference, User,
};
use governor_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use governor_common::index::{IndexKey, MembershipIndex};
use governor_common::naming::self_delete_binding_name;
use governor_common::{Error, Result, DISPLAY_NAME_ANNOTATION, FIELD_MANAGER};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::runtime::reflector::ObjectRef;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::roles::{
    build_role_binding, build_self_delete_binding, created_binding_status,
    existing_binding_status, failed_binding_status, managed_selector, plan_roles,
    roles_applied_condition,
};

/// Controller name reported on Events
pub use governor_common::MEMBERSHIP_CONTROLLER_NAME as CONTROLLER_NAME;

/// Ready reason once organization and user details are cached
pub const REASON_READY: &str = "Ready";
/// Ready reason when the organization does not exist
pub const REASON_ORGANIZATION_NOT_FOUND: &str = "OrganizationNotFound";
/// Ready reason when the user does not exist
pub const REASON_USER_NOT_FOUND: &str = "UserNotFound";
/// Ready reason when a lookup failed
pub const REASON_RECONCILE_ERROR: &str = "ReconcileError";

/// Requeue interval while bindings are still becoming Ready
const PENDING_REQUEUE: Duration = Duration::from_secs(30);

// =============================================================================
// Kube client abstraction
// =============================================================================

/// Trait abstracting Kubernetes operations for the membership controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MembershipKubeClient: Send + Sync {
    /// Get an Organization by name
    async fn get_organization(&self, name: &str) -> Result<Option<Organization>>;

    /// Get a User by name
    async fn get_user(&self, name: &str) -> Result<Option<User>>;

    /// Get a Role by name and namespace
    async fn get_role(&self, name: &str, namespace: &str) -> Result<Option<Role>>;

    /// Get a PolicyBinding by name and namespace
    async fn get_binding(&self, name: &str, namespace: &str) -> Result<Option<PolicyBinding>>;

    /// List the PolicyBindings managed for a membership
    async fn list_managed_bindings(
        &self,
        namespace: &str,
        membership: &str,
    ) -> Result<Vec<PolicyBinding>>;

    /// Create a PolicyBinding
    async fn create_binding(&self, binding: &PolicyBinding) -> Result<()>;

    /// Delete a PolicyBinding; not-found is success
    async fn delete_binding(&self, name: &str, namespace: &str) -> Result<()>;

    /// Patch the status of a membership
    async fn patch_membership_status(
        &self,
        name: &str,
        namespace: &str,
        status: &OrganizationMembershipStatus,
    ) -> Result<()>;
}

/// Real Kubernetes client implementation
pub struct MembershipKubeClientImpl {
    client: Client,
}

impl MembershipKubeClientImpl {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn not_found_to_none<T>(result: std::result::Result<T, kube::Error>) -> Result<Option<T>> {
    match result {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl MembershipKubeClient for MembershipKubeClientImpl {
    async fn get_organization(&self, name: &str) -> Result<Option<Organization>> {
        let api: Api<Organization> = Api::all(self.client.clone());
        not_found_to_none(api.get(name).await)
    }

    async fn get_user(&self, name: &str) -> Result<Option<User>> {
        let api: Api<User> = Api::all(self.client.clone());
        not_found_to_none(api.get(name).await)
    }

    async fn get_role(&self, name: &str, namespace: &str) -> Result<Option<Role>> {
        let api: Api<Role> = Api::namespaced(self.client.clone(), namespace);
        not_found_to_none(api.get(name).await)
    }

    async fn get_binding(&self, name: &str, namespace: &str) -> Result<Option<PolicyBinding>> {
        let api: Api<PolicyBinding> = Api::namespaced(self.client.clone(), namespace);
        not_found_to_none(api.get(name).await)
    }

    async fn list_managed_bindings(
        &self,
        namespace: &str,
        membership: &str,
    ) -> Result<Vec<PolicyBinding>> {
        let api: Api<PolicyBinding> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&managed_selector(membership));
        Ok(api.list(&lp).await?.items)
    }

    async fn create_binding(&self, binding: &PolicyBinding) -> Result<()> {
        let namespace = binding.namespace().unwrap_or_default();
        let api: Api<PolicyBinding> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), binding).await?;
        Ok(())
    }

    async fn delete_binding(&self, name: &str, namespace: &str) -> Result<()> {
        let api: Api<PolicyBinding> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_membership_status(
        &self,
        name: &str,
        namespace: &str,
        status: &OrganizationMembershipStatus,
    ) -> Result<()> {
        let api: Api<OrganizationMembership> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

// =============================================================================
// Controller context
// =============================================================================

/// Shared state for membership reconciliation
pub struct MembershipContext {
    /// Kubernetes operations
    pub kube: Arc<dyn MembershipKubeClient>,
    /// Event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Role granted to each user over their own membership, if configured
    pub self_delete_role: Option<RoleReference>,
}

impl MembershipContext {
    /// Create a context from explicit dependencies
    pub fn new(
        kube: Arc<dyn MembershipKubeClient>,
        events: Arc<dyn EventPublisher>,
        self_delete_role: Option<RoleReference>,
    ) -> Self {
        Self {
            kube,
            events,
            self_delete_role,
        }
    }

    /// Create a context backed by the cluster
    pub fn from_client(client: Client, self_delete_role: Option<RoleReference>) -> Self {
        let events = Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME));
        Self::new(
            Arc::new(MembershipKubeClientImpl::new(client)),
            events,
            self_delete_role,
        )
    }

    /// Create a context for testing with a mock client
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn MembershipKubeClient>) -> Self {
        Self::new(
            kube,
            Arc::new(governor_common::events::NoopEventPublisher),
            None,
        )
    }
}

// =============================================================================
// Watch mappers
// =============================================================================

/// Memberships referencing `organization`.
///
/// A membership created before its Organization parks on OrganizationNotFound;
/// this brings it back once the Organization appears or changes.
pub fn memberships_for_organization(
    index: &MembershipIndex,
    organization: &Organization,
) -> Vec<ObjectRef<OrganizationMembership>> {
    membership_refs(index.lookup(&IndexKey::MembershipByOrganization(
        organization.name_any(),
    )))
}

/// Memberships held by `user`
pub fn memberships_for_user(
    index: &MembershipIndex,
    user: &User,
) -> Vec<ObjectRef<OrganizationMembership>> {
    membership_refs(index.lookup(&IndexKey::MembershipByUser(user.name_any())))
}

fn membership_refs(
    memberships: Vec<Arc<OrganizationMembership>>,
) -> Vec<ObjectRef<OrganizationMembership>> {
    memberships
        .iter()
        .map(|m| ObjectRef::from_obj(m.as_ref()))
        .collect()
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Reconcile an OrganizationMembership
#[instrument(
    skip(membership, ctx),
    fields(
        membership = %membership.name_any(),
        namespace = membership.namespace().as_deref().unwrap_or_default(),
    )
)]
pub async fn reconcile(
    membership: Arc<OrganizationMembership>,
    ctx: Arc<MembershipContext>,
) -> Result<Action> {
    let name = membership.name_any();
    let namespace = membership.namespace().ok_or_else(|| {
        Error::validation_for(&name, "OrganizationMembership is missing a namespace")
    })?;

    if membership.meta().deletion_timestamp.is_some() {
        debug!("membership is being deleted, bindings are garbage collected");
        return Ok(Action::await_change());
    }

    let org_name = &membership.spec.organization_ref.name;
    let user_name = &membership.spec.user_ref.name;
    info!(organization = %org_name, user = %user_name, "reconciling organization membership");

    let original = membership.status.clone().unwrap_or_default();
    let mut status = original.clone();
    let generation = membership.meta().generation;

    let organization = match ctx.kube.get_organization(org_name).await {
        Ok(Some(org)) => org,
        Ok(None) => {
            info!(organization = %org_name, "referenced organization not found");
            let ready = not_ready(
                REASON_ORGANIZATION_NOT_FOUND,
                format!(
                    "Organization '{org_name}' does not exist. Please ensure the organization \
                     name is correct and the organization has been created."
                ),
                generation,
            );
            write_condition_only(&ctx, &name, &namespace, original, ready).await?;
            return Ok(Action::await_change());
        }
        Err(e) => {
            error!(error = %e, "failed to get organization");
            let ready = not_ready(
                REASON_RECONCILE_ERROR,
                "Unable to retrieve organization information. Please try again later or \
                 contact support if the problem persists.",
                generation,
            );
            write_condition_only(&ctx, &name, &namespace, original, ready).await?;
            return Err(e);
        }
    };

    let user = match ctx.kube.get_user(user_name).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            info!(user = %user_name, "referenced user not found");
            let ready = not_ready(
                REASON_USER_NOT_FOUND,
                format!(
                    "User '{user_name}' does not exist. Please ensure the user name is correct \
                     and the user account has been created."
                ),
                generation,
            );
            write_condition_only(&ctx, &name, &namespace, original, ready).await?;
            return Ok(Action::await_change());
        }
        Err(e) => {
            error!(error = %e, "failed to get user");
            let ready = not_ready(
                REASON_RECONCILE_ERROR,
                "Unable to retrieve user information. Please try again later or contact the \
                 support team if the problem persists.",
                generation,
            );
            write_condition_only(&ctx, &name, &namespace, original, ready).await?;
            return Err(e);
        }
    };

    if let Some(role) = &ctx.self_delete_role {
        ensure_self_delete_binding(&membership, &user, role, &ctx).await?;
    }

    status.observed_generation = generation;
    status.organization = MembershipOrganizationStatus {
        type_: organization.spec.type_.to_string(),
        display_name: organization
            .annotations()
            .get(DISPLAY_NAME_ANNOTATION)
            .cloned()
            .unwrap_or_default(),
    };
    status.user = MembershipUserStatus {
        email: user.spec.email.clone(),
        given_name: user.spec.given_name.clone(),
        family_name: user.spec.family_name.clone(),
    };
    set_condition(
        &mut status.conditions,
        Condition::new(
            conditions::READY,
            ConditionStatus::True,
            REASON_READY,
            "Organization membership status has been populated",
        )
        .with_generation(generation),
    );

    status.applied_roles =
        reconcile_roles(&membership, &namespace, &organization, &user, &ctx).await?;
    let pending = status
        .applied_roles
        .iter()
        .any(|r| r.status == AppliedRoleStatus::Pending);
    set_condition(
        &mut status.conditions,
        roles_applied_condition(&status.applied_roles, generation),
    );

    if status != original {
        ctx.kube
            .patch_membership_status(&name, &namespace, &status)
            .await?;
        info!("organization membership status updated");
    } else {
        debug!("status unchanged, skipping update");
    }

    if pending {
        Ok(Action::requeue(PENDING_REQUEUE))
    } else {
        Ok(Action::await_change())
    }
}

fn not_ready(reason: &str, message: impl Into<String>, generation: Option<i64>) -> Condition {
    Condition::new(conditions::READY, ConditionStatus::False, reason, message)
        .with_generation(generation)
}

/// Record a Ready condition without touching the rest of the status
async fn write_condition_only(
    ctx: &MembershipContext,
    name: &str,
    namespace: &str,
    mut status: OrganizationMembershipStatus,
    condition: Condition,
) -> Result<()> {
    if set_condition(&mut status.conditions, condition) {
        ctx.kube
            .patch_membership_status(name, namespace, &status)
            .await?;
    }
    Ok(())
}

/// Converge managed bindings onto `spec.roles`, returning per-role status
async fn reconcile_roles(
    membership: &OrganizationMembership,
    namespace: &str,
    organization: &Organization,
    user: &User,
    ctx: &MembershipContext,
) -> Result<Vec<AppliedRole>> {
    let name = membership.name_any();
    let existing = ctx.kube.list_managed_bindings(namespace, &name).await?;
    let plan = plan_roles(&membership.spec.roles, existing, namespace);
    let obj_ref = membership.object_ref(&());

    let mut applied = Vec::with_capacity(plan.desired.len());
    for (role, binding) in &plan.desired {
        let entry = match binding {
            Some(binding) => existing_binding_status(role, binding),
            None => match create_role_binding(membership, organization, user, role, ctx).await {
                Ok(binding) => {
                    ctx.events
                        .publish(
                            &obj_ref,
                            EventType::Normal,
                            reasons::BINDING_CREATED,
                            actions::CREATE,
                            Some(format!("Created PolicyBinding for role {}", role.name)),
                        )
                        .await;
                    created_binding_status(role, &binding)
                }
                Err(e) => {
                    warn!(role = %role.name, error = %e, "failed to create policy binding");
                    ctx.events
                        .publish(
                            &obj_ref,
                            EventType::Warning,
                            reasons::BINDING_FAILED,
                            actions::CREATE,
                            Some(e.to_string()),
                        )
                        .await;
                    failed_binding_status(role, &e.to_string())
                }
            },
        };
        applied.push(entry);
    }

    for binding in &plan.stale {
        let binding_name = binding.name_any();
        info!(policy_binding = %binding_name, "deleting policy binding for removed role");
        match ctx.kube.delete_binding(&binding_name, namespace).await {
            Ok(()) => {
                ctx.events
                    .publish(
                        &obj_ref,
                        EventType::Normal,
                        reasons::BINDING_DELETED,
                        actions::DELETE,
                        Some(format!("Deleted PolicyBinding {binding_name}")),
                    )
                    .await
            }
            Err(e) => {
                warn!(policy_binding = %binding_name, error = %e, "failed to delete policy binding")
            }
        }
    }

    Ok(applied)
}

/// Verify the role exists, then create its managed binding
async fn create_role_binding(
    membership: &OrganizationMembership,
    organization: &Organization,
    user: &User,
    role: &RoleReference,
    ctx: &MembershipContext,
) -> Result<PolicyBinding> {
    let namespace = membership.namespace().unwrap_or_default();
    let role_namespace = role.resolved_namespace(&namespace);
    if ctx.kube.get_role(&role.name, role_namespace).await?.is_none() {
        return Err(Error::validation_for(
            membership.name_any(),
            format!("role {} not found in namespace {}", role.name, role_namespace),
        ));
    }

    let binding = build_role_binding(membership, organization, user, role)?;
    info!(
        policy_binding = %binding.name_any(),
        role = %role.name,
        "creating policy binding"
    );
    ctx.kube.create_binding(&binding).await?;
    Ok(binding)
}

/// Ensure the binding that lets the user delete their own membership exists
async fn ensure_self_delete_binding(
    membership: &OrganizationMembership,
    user: &User,
    role: &RoleReference,
    ctx: &MembershipContext,
) -> Result<()> {
    let namespace = membership.namespace().unwrap_or_default();
    let name = self_delete_binding_name(&user.name_any());
    if ctx.kube.get_binding(&name, &namespace).await?.is_some() {
        return Ok(());
    }

    let binding = build_self_delete_binding(membership, user, role, name)?;
    info!(policy_binding = %binding.name_any(), "creating self-delete policy binding");
    ctx.kube.create_binding(&binding).await
}

/// Error policy for the membership controller
pub fn error_policy(
    membership: Arc<OrganizationMembership>,
    error: &Error,
    _ctx: Arc<MembershipContext>,
) -> Action {
    error!(
        ?error,
        membership = %membership.name_any(),
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
