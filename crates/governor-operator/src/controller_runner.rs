//! Controller runner - builds controller futures for each vertical slice
//!
//! Each `build_*` function returns a Vec of boxed futures that can be composed
//! by the caller. A slice whose kinds are not installed returns no futures.

use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::reflector::{self, Store};
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::{Controller, WatchStreamExt};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use governor_common::crd::{
    Document, DocumentRevision, Organization, OrganizationMembership, PolicyBinding, Project,
    ProjectControlPlane, ResourceClaim, ResourceGrant, ResourceRegistration, User,
};
use governor_common::index::{
    membership_keys, revision_keys, MembershipIndex, RevisionIndex, StoreIndex,
};
use governor_common::kind_registry::{GovernedKind, KindRegistry};
use governor_common::WATCH_TIMEOUT_SECS;
use governor_documentation::{document_controller, revision_controller, DocumentationContext};
use governor_membership::{memberships_for_organization, memberships_for_user, MembershipContext};
use governor_organization::{organization_for_membership, organizations_for_user, OrganizationContext};
use governor_project::{project_for_control_plane, ProjectContext, ProjectEndpointClientImpl, Purger};
use governor_quota::{claim_controller, grant_controller, registration_controller, QuotaContext};

use crate::config::GovernorConfig;

/// A controller (or reflector) driven to completion by the caller
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Whether every kind a slice needs is installed; logs the gap otherwise
fn installed(registry: &KindRegistry, slice: &str, kinds: &[GovernedKind]) -> bool {
    let missing = registry.missing(kinds);
    if missing.is_empty() {
        return true;
    }
    warn!(
        slice,
        missing = ?missing.iter().map(GovernedKind::kind_str).collect::<Vec<_>>(),
        "CRDs not installed, skipping controllers"
    );
    false
}

/// Reflector feeding a secondary index, plus the future that keeps it current
fn index_reflector<K>(api: Api<K>, name: &'static str) -> (Store<K>, ControllerFuture)
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let (store, writer) = reflector::store();
    let drive = reflector::reflector(writer, watcher::watcher(api, watcher_config()))
        .default_backoff()
        .touched_objects()
        .for_each(move |event| {
            if let Err(e) = event {
                warn!(index = name, error = %e, "index watch error");
            }
            std::future::ready(())
        });
    (store, Box::pin(drive))
}

/// Hold `controller` back until `index` has completed its initial list.
///
/// Reconcilers that read an index would otherwise act on a partial cache
/// right after startup. If the reflector stops before syncing, the
/// controller is not started.
fn after_sync<K, F>(index: StoreIndex<K>, name: &'static str, controller: F) -> ControllerFuture
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    Box::pin(async move {
        if !index.wait_until_ready().await {
            warn!(
                index = name,
                "index reflector stopped before its initial sync, controller not started"
            );
            return;
        }
        info!(index = name, "index synced");
        controller.await;
    })
}

/// Build the membership controller (owns the PolicyBindings it creates)
pub fn build_membership_controllers(
    client: Client,
    registry: &KindRegistry,
    config: &GovernorConfig,
) -> Vec<ControllerFuture> {
    if !installed(
        registry,
        "membership",
        &[
            GovernedKind::OrganizationMembership,
            GovernedKind::PolicyBinding,
            GovernedKind::Organization,
            GovernedKind::User,
        ],
    ) {
        return vec![];
    }

    let ctx = Arc::new(MembershipContext::from_client(
        client.clone(),
        config.self_delete_role.clone(),
    ));
    let memberships: Api<OrganizationMembership> = Api::all(client.clone());
    let bindings: Api<PolicyBinding> = Api::all(client.clone());
    let organizations: Api<Organization> = Api::all(client.clone());
    let users: Api<User> = Api::all(client);

    info!("- OrganizationMembership controller");

    let ctrl = Controller::new(memberships, watcher_config());
    let by_organization = MembershipIndex::new(ctrl.store(), membership_keys);
    let by_user = by_organization.clone();

    vec![Box::pin(
        ctrl.owns(bindings, watcher_config())
            .watches(organizations, watcher_config(), move |org| {
                memberships_for_organization(&by_organization, &org)
            })
            .watches(users, watcher_config(), move |user| {
                memberships_for_user(&by_user, &user)
            })
            .shutdown_on_signal()
            .run(
                governor_membership::reconcile,
                governor_membership::error_policy,
                ctx,
            )
            .for_each(log_reconcile_result("OrganizationMembership")),
    )]
}

/// Build the organization controller and the membership index it reads
pub fn build_organization_controllers(
    client: Client,
    registry: &KindRegistry,
) -> Vec<ControllerFuture> {
    if !installed(
        registry,
        "organization",
        &[
            GovernedKind::Organization,
            GovernedKind::OrganizationMembership,
            GovernedKind::User,
        ],
    ) {
        return vec![];
    }

    let (store, drive_index) = index_reflector(
        Api::<OrganizationMembership>::all(client.clone()),
        "memberships",
    );
    let index = MembershipIndex::new(store, membership_keys);
    let ctx = Arc::new(OrganizationContext::from_client(client.clone(), index.clone()));

    let organizations: Api<Organization> = Api::all(client.clone());
    let memberships: Api<OrganizationMembership> = Api::all(client.clone());
    let users: Api<User> = Api::all(client);

    info!("- Organization controller");

    let mapper_index = index.clone();
    let ctrl = Controller::new(organizations, watcher_config())
        .watches(memberships, watcher_config(), |membership| {
            organization_for_membership(&membership)
        })
        .watches(users, watcher_config(), move |user| {
            organizations_for_user(&mapper_index, &user)
        })
        .shutdown_on_signal()
        .run(
            governor_organization::reconcile,
            governor_organization::error_policy,
            ctx,
        )
        .for_each(log_reconcile_result("Organization"));

    vec![drive_index, after_sync(index, "memberships", ctrl)]
}

/// Build the quota controllers (claims, grants, registrations)
pub fn build_quota_controllers(client: Client, registry: &KindRegistry) -> Vec<ControllerFuture> {
    if !installed(
        registry,
        "quota",
        &[
            GovernedKind::ResourceClaim,
            GovernedKind::ResourceGrant,
            GovernedKind::AllowanceBucket,
            GovernedKind::ResourceRegistration,
        ],
    ) {
        return vec![];
    }

    let claims: Api<ResourceClaim> = Api::all(client.clone());
    let grants: Api<ResourceGrant> = Api::all(client.clone());
    let registrations: Api<ResourceRegistration> = Api::all(client.clone());

    let claim_ctx = Arc::new(QuotaContext::from_client(
        client.clone(),
        claim_controller::CONTROLLER_NAME,
    ));
    let claim_ctrl = Controller::new(claims, watcher_config());
    let claim_store = claim_ctrl.store();
    let claim_ctrl = claim_ctrl
        .watches(grants.clone(), watcher_config(), move |grant| {
            claim_controller::claims_for_grant(&claim_store.state(), &grant)
        })
        .shutdown_on_signal()
        .run(
            claim_controller::reconcile,
            claim_controller::error_policy,
            claim_ctx,
        )
        .for_each(log_reconcile_result("ResourceClaim"));

    let grant_ctx = Arc::new(QuotaContext::from_client(
        client.clone(),
        grant_controller::CONTROLLER_NAME,
    ));
    let grant_ctrl = Controller::new(grants, watcher_config())
        .shutdown_on_signal()
        .run(
            grant_controller::reconcile,
            grant_controller::error_policy,
            grant_ctx,
        )
        .for_each(log_reconcile_result("ResourceGrant"));

    let registration_ctx = Arc::new(QuotaContext::from_client(
        client,
        registration_controller::CONTROLLER_NAME,
    ));
    let registration_ctrl = Controller::new(registrations, watcher_config())
        .shutdown_on_signal()
        .run(
            registration_controller::reconcile,
            registration_controller::error_policy,
            registration_ctx,
        )
        .for_each(log_reconcile_result("ResourceRegistration"));

    info!("- ResourceClaim controller");
    info!("- ResourceGrant controller");
    info!("- ResourceRegistration controller");

    vec![
        Box::pin(claim_ctrl),
        Box::pin(grant_ctrl),
        Box::pin(registration_ctrl),
    ]
}

/// Build the project controller; disabled without a project endpoint base
pub fn build_project_controllers(
    client: Client,
    kube_config: kube::Config,
    registry: &KindRegistry,
    config: &GovernorConfig,
) -> Vec<ControllerFuture> {
    let Some(base) = config.project_endpoint_base.clone() else {
        info!("project endpoint base not configured, project controller disabled");
        return vec![];
    };
    let mut kinds = vec![GovernedKind::Project];
    if config.wait_for_control_plane {
        kinds.push(GovernedKind::ProjectControlPlane);
    }
    if !installed(registry, "project", &kinds) {
        return vec![];
    }

    let endpoints = Arc::new(ProjectEndpointClientImpl::new(
        kube_config,
        base,
        Purger::new(config.purge.clone()),
    ));
    let ctx = Arc::new(ProjectContext::from_client(
        client.clone(),
        endpoints,
        config.wait_for_control_plane,
    ));
    let projects: Api<Project> = Api::all(client.clone());

    info!(
        wait_for_control_plane = config.wait_for_control_plane,
        "- Project controller"
    );

    let ctrl = Controller::new(projects, watcher_config());
    let ctrl = if config.wait_for_control_plane {
        let control_planes: Api<ProjectControlPlane> = Api::all(client);
        ctrl.watches(control_planes, watcher_config(), |cp| {
            project_for_control_plane(&cp)
        })
    } else {
        ctrl
    };

    vec![Box::pin(
        ctrl.shutdown_on_signal()
            .run(
                governor_project::reconcile,
                governor_project::error_policy,
                ctx,
            )
            .for_each(log_reconcile_result("Project")),
    )]
}

/// Build the Document and DocumentRevision controllers
pub fn build_documentation_controllers(
    client: Client,
    registry: &KindRegistry,
) -> Vec<ControllerFuture> {
    if !installed(
        registry,
        "documentation",
        &[GovernedKind::Document, GovernedKind::DocumentRevision],
    ) {
        return vec![];
    }

    let (store, drive_index) =
        index_reflector(Api::<DocumentRevision>::all(client.clone()), "revisions");
    let index = RevisionIndex::new(store, revision_keys);
    let ctx = Arc::new(DocumentationContext::from_client(client.clone(), index.clone()));

    let documents: Api<Document> = Api::all(client.clone());
    let revisions: Api<DocumentRevision> = Api::all(client);

    let document_ctrl = Controller::new(documents, watcher_config())
        .watches(revisions.clone(), watcher_config(), |revision| {
            document_controller::document_for_revision(&revision)
        })
        .shutdown_on_signal()
        .run(
            document_controller::reconcile,
            document_controller::error_policy,
            ctx.clone(),
        )
        .for_each(log_reconcile_result("Document"));

    let revision_ctrl = Controller::new(revisions, watcher_config())
        .shutdown_on_signal()
        .run(
            revision_controller::reconcile,
            revision_controller::error_policy,
            ctx,
        )
        .for_each(log_reconcile_result("DocumentRevision"));

    info!("- Document controller");
    info!("- DocumentRevision controller");

    vec![
        drive_index,
        after_sync(index, "revisions", document_ctrl),
        Box::pin(revision_ctrl),
    ]
}

fn log_reconcile_result<T: Debug, E: Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn installed_reports_missing_kinds() {
        let registry = KindRegistry::assume_installed();
        assert!(installed(
            &registry,
            "documentation",
            &[GovernedKind::Document, GovernedKind::DocumentRevision]
        ));
    }

    #[test]
    fn watcher_config_uses_short_timeout() {
        assert_eq!(watcher_config().timeout, Some(WATCH_TIMEOUT_SECS));
    }

    // =========================================================================
    // Index sync gating
    // =========================================================================

    fn started_flag() -> (Arc<AtomicBool>, impl Future<Output = ()> + Send + 'static) {
        let started = Arc::new(AtomicBool::new(false));
        let flag = started.clone();
        (started, async move {
            flag.store(true, Ordering::SeqCst);
        })
    }

    /// Story: An organization controller does not run on an empty cache
    ///
    /// Until the membership reflector finishes its initial list the index
    /// reports no memberships, which the reconciler would read as "nothing
    /// to clean up". The controller starts only after the sync completes.
    #[tokio::test]
    async fn story_controller_waits_for_index_sync() {
        let (store, mut writer) = reflector::store::<OrganizationMembership>();
        let index = MembershipIndex::new(store, membership_keys);
        let (started, controller) = started_flag();

        let handle = tokio::spawn(after_sync(index, "memberships", controller));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!started.load(Ordering::SeqCst));
        assert!(!handle.is_finished());

        writer.apply_watcher_event(&watcher::Event::Init);
        writer.apply_watcher_event(&watcher::Event::InitDone);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("controller started after sync")
            .unwrap();
        assert!(started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn controller_skipped_when_reflector_stops_before_sync() {
        let (store, writer) = reflector::store::<DocumentRevision>();
        let index = RevisionIndex::new(store, revision_keys);
        let (started, controller) = started_flag();
        drop(writer);

        after_sync(index, "revisions", controller).await;
        assert!(!started.load(Ordering::SeqCst));
    }
}
