//! Project reconciliation controller
//!
//! A Project moves through `Active -> Terminating -> gone`. The finalizer is
//! added before anything else so that the project's control plane can always
//! be purged before the Project disappears. While active, the controller
//! optionally waits for the ProjectControlPlane to report Ready, then makes
//! sure the `default` namespace exists at the project endpoint.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor_common::crd::{
    conditions, find_condition, is_condition_true, set_condition, Condition, ConditionStatus,
    Project, ProjectControlPlane, ProjectControlPlaneSpec, ProjectStatus,
};
use governor_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use governor_common::kube_utils::{
    add_finalizer_patch, has_finalizer, is_terminating, patch_cluster_resource_status,
    remove_finalizer_patch,
};
use governor_common::{Error, Result, FIELD_MANAGER, PROJECT_FINALIZER};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::runtime::reflector::ObjectRef;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::endpoint::ProjectEndpointClient;

#[cfg(test)]
use mockall::automock;

/// Controller name reported on Events
pub const CONTROLLER_NAME: &str = "project-controller";

/// Label on a ProjectControlPlane naming its Project
pub const PROJECT_NAME_LABEL: &str = "resourcemanager.miloapis.com/project-name";

/// Annotation on a ProjectControlPlane naming the owning organization
pub const OWNER_NAME_ANNOTATION: &str = "resourcemanager.miloapis.com/owner-name";

/// Namespace every project starts with
pub const DEFAULT_NAMESPACE: &str = "default";

/// Ready reason while the control plane is being set up
pub const REASON_PROVISIONING: &str = "Provisioning";
/// Ready reason once the project can be used
pub const REASON_READY: &str = "Ready";

const MSG_PROVISIONING: &str = "Project is provisioning";
const MSG_READY: &str = "Project is ready";

/// Requeue interval while waiting for the control plane
const PROVISIONING_REQUEUE: Duration = Duration::from_secs(15);

/// Requeue interval after a failed purge
const PURGE_RETRY: Duration = Duration::from_secs(10);

// =============================================================================
// Kube client abstraction
// =============================================================================

/// Trait abstracting Kubernetes operations for the project controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProjectKubeClient: Send + Sync {
    /// Apply a metadata merge patch to a Project
    async fn patch_project(&self, name: &str, patch: &serde_json::Value) -> Result<()>;

    /// Patch a Project's status
    async fn patch_project_status(&self, name: &str, status: &ProjectStatus) -> Result<()>;

    /// Get the ProjectControlPlane of a project
    async fn get_control_plane(&self, name: &str) -> Result<Option<ProjectControlPlane>>;

    /// Create a ProjectControlPlane
    async fn create_control_plane(&self, control_plane: &ProjectControlPlane) -> Result<()>;

    /// Delete a ProjectControlPlane; not-found is success
    async fn delete_control_plane(&self, name: &str) -> Result<()>;
}

/// Real Kubernetes client implementation
pub struct ProjectKubeClientImpl {
    client: Client,
}

impl ProjectKubeClientImpl {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ProjectKubeClient for ProjectKubeClientImpl {
    async fn patch_project(&self, name: &str, patch: &serde_json::Value) -> Result<()> {
        let api: Api<Project> = Api::all(self.client.clone());
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn patch_project_status(&self, name: &str, status: &ProjectStatus) -> Result<()> {
        patch_cluster_resource_status::<Project>(&self.client, name, status, FIELD_MANAGER)
            .await?;
        Ok(())
    }

    async fn get_control_plane(&self, name: &str) -> Result<Option<ProjectControlPlane>> {
        let api: Api<ProjectControlPlane> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn create_control_plane(&self, control_plane: &ProjectControlPlane) -> Result<()> {
        let api: Api<ProjectControlPlane> = Api::all(self.client.clone());
        match api.create(&PostParams::default(), control_plane).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_control_plane(&self, name: &str) -> Result<()> {
        let api: Api<ProjectControlPlane> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// =============================================================================
// Controller context
// =============================================================================

/// Shared state for project reconciliation
pub struct ProjectContext {
    /// Kubernetes operations against the platform API
    pub kube: Arc<dyn ProjectKubeClient>,
    /// Operations against per-project endpoints
    pub endpoints: Arc<dyn ProjectEndpointClient>,
    /// Event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Hold projects in Provisioning until their ProjectControlPlane is Ready
    pub wait_for_control_plane: bool,
}

impl ProjectContext {
    /// Create a context backed by the cluster
    pub fn from_client(
        client: Client,
        endpoints: Arc<dyn ProjectEndpointClient>,
        wait_for_control_plane: bool,
    ) -> Self {
        Self {
            kube: Arc::new(ProjectKubeClientImpl::new(client.clone())),
            endpoints,
            events: Arc::new(KubeEventPublisher::new(client, CONTROLLER_NAME)),
            wait_for_control_plane,
        }
    }

    /// Create a context for testing with mock clients
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn ProjectKubeClient>,
        endpoints: Arc<dyn ProjectEndpointClient>,
        wait_for_control_plane: bool,
    ) -> Self {
        Self {
            kube,
            endpoints,
            events: Arc::new(governor_common::events::NoopEventPublisher),
            wait_for_control_plane,
        }
    }
}

/// Project a ProjectControlPlane belongs to
pub fn project_for_control_plane(control_plane: &ProjectControlPlane) -> Option<ObjectRef<Project>> {
    control_plane
        .labels()
        .get(PROJECT_NAME_LABEL)
        .filter(|name| !name.is_empty())
        .map(|name| ObjectRef::new(name))
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Reconcile a Project
#[instrument(skip(project, ctx), fields(project = %project.name_any()))]
pub async fn reconcile(project: Arc<Project>, ctx: Arc<ProjectContext>) -> Result<Action> {
    let name = project.name_any();

    if is_terminating(project.as_ref()) {
        if !has_finalizer(project.as_ref(), PROJECT_FINALIZER) {
            debug!("project is being deleted and holds no finalizer");
            return Ok(Action::await_change());
        }
        return teardown(&project, &ctx).await;
    }

    if let Some(patch) = add_finalizer_patch(&project.metadata, PROJECT_FINALIZER) {
        info!("adding project finalizer");
        ctx.kube.patch_project(&name, &patch).await?;
        // The metadata change triggers the next reconcile
        return Ok(Action::await_change());
    }

    let generation = project.metadata.generation;
    let original = project.status.clone().unwrap_or_default();
    let mut status = original.clone();

    if ctx.wait_for_control_plane {
        if let Some(waiting) = control_plane_pending(&project, &ctx).await? {
            debug!(reason = %waiting.reason, "waiting for project control plane");
            set_condition(&mut status.conditions, waiting.with_generation(generation));
            write_status(&name, &original, &status, &ctx).await?;
            return Ok(Action::requeue(PROVISIONING_REQUEUE));
        }
    }

    if let Err(e) = ctx.endpoints.ensure_namespace(&name, DEFAULT_NAMESPACE).await {
        warn!(error = %e, "failed to bootstrap default namespace");
        if find_condition(&status.conditions, conditions::READY).is_none() {
            set_condition(&mut status.conditions, provisioning_condition(generation));
            write_status(&name, &original, &status, &ctx).await?;
        }
        return Err(e);
    }

    let became_ready = !is_condition_true(&original.conditions, conditions::READY);
    set_condition(&mut status.conditions, ready_condition(generation));
    write_status(&name, &original, &status, &ctx).await?;

    if became_ready {
        info!("project is ready");
        ctx.events
            .publish(
                &project.object_ref(&()),
                EventType::Normal,
                reasons::PROJECT_READY,
                actions::RECONCILE,
                Some(MSG_READY.to_string()),
            )
            .await;
    }
    Ok(Action::await_change())
}

/// Purge the project control plane, then release the finalizer
async fn teardown(project: &Project, ctx: &ProjectContext) -> Result<Action> {
    let name = project.name_any();
    let object_ref = project.object_ref(&());

    info!("purging project control plane");
    ctx.events
        .publish(
            &object_ref,
            EventType::Normal,
            reasons::PURGE_STARTED,
            actions::DELETE,
            None,
        )
        .await;

    if let Err(e) = ctx.endpoints.purge(&name).await {
        warn!(error = %e, "project purge failed, keeping finalizer");
        ctx.events
            .publish(
                &object_ref,
                EventType::Warning,
                reasons::PURGE_FAILED,
                actions::DELETE,
                Some(e.to_string()),
            )
            .await;
        return Err(e);
    }

    if ctx.wait_for_control_plane {
        ctx.kube.delete_control_plane(&name).await?;
    }

    // Guarded by resourceVersion: a concurrent metadata change gets a 409
    // and the next reconcile retries against fresh state.
    if let Some(patch) = remove_finalizer_patch(&project.metadata, PROJECT_FINALIZER) {
        ctx.kube.patch_project(&name, &patch).await?;
    }
    info!("project purged, finalizer released");
    ctx.events
        .publish(
            &object_ref,
            EventType::Normal,
            reasons::PURGE_COMPLETE,
            actions::DELETE,
            None,
        )
        .await;
    Ok(Action::await_change())
}

/// Ready condition to report while the control plane is not ready, or
/// `None` once it is. Creates the control plane if it does not exist.
async fn control_plane_pending(project: &Project, ctx: &ProjectContext) -> Result<Option<Condition>> {
    let name = project.name_any();
    let Some(control_plane) = ctx.kube.get_control_plane(&name).await? else {
        info!("creating project control plane");
        ctx.kube
            .create_control_plane(&build_control_plane(project))
            .await?;
        return Ok(Some(provisioning_condition(None)));
    };

    let ready = control_plane
        .status
        .as_ref()
        .and_then(|s| find_condition(&s.conditions, conditions::READY));
    Ok(match ready {
        Some(c) if c.is_true() => None,
        Some(c) => Some(Condition::new(
            conditions::READY,
            ConditionStatus::False,
            c.reason.clone(),
            c.message.clone(),
        )),
        None => Some(provisioning_condition(None)),
    })
}

/// ProjectControlPlane for `project`
pub fn build_control_plane(project: &Project) -> ProjectControlPlane {
    let name = project.name_any();
    let mut control_plane = ProjectControlPlane::new(&name, ProjectControlPlaneSpec::default());
    control_plane.metadata.labels = Some(BTreeMap::from([(
        PROJECT_NAME_LABEL.to_string(),
        name,
    )]));
    control_plane.metadata.annotations = Some(BTreeMap::from([(
        OWNER_NAME_ANNOTATION.to_string(),
        project.spec.owner_ref.name.clone(),
    )]));
    control_plane
}

fn provisioning_condition(generation: Option<i64>) -> Condition {
    Condition::new(
        conditions::READY,
        ConditionStatus::False,
        REASON_PROVISIONING,
        MSG_PROVISIONING,
    )
    .with_generation(generation)
}

fn ready_condition(generation: Option<i64>) -> Condition {
    Condition::new(conditions::READY, ConditionStatus::True, REASON_READY, MSG_READY)
        .with_generation(generation)
}

async fn write_status(
    name: &str,
    original: &ProjectStatus,
    status: &ProjectStatus,
    ctx: &ProjectContext,
) -> Result<()> {
    if status == original {
        return Ok(());
    }
    ctx.kube.patch_project_status(name, status).await
}

/// Error policy for the project controller
pub fn error_policy(project: Arc<Project>, error: &Error, _ctx: Arc<ProjectContext>) -> Action {
    error!(
        ?error,
        project = %project.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );
    if error.is_conflict() {
        Action::requeue(Duration::from_millis(500))
    } else if matches!(error, Error::Purge { .. }) {
        Action::requeue(PURGE_RETRY)
    } else if error.is_retryable() {
        Action::requeue(Duration::from_secs(30))
    } else {
        Action::await_change()
    }
}
