//! Project control-plane purge
//!
//! Deletes everything reachable at a project's control-plane endpoint so the
//! Project finalizer can be released. The sweep runs in phases, each one with
//! bounded parallelism and all of them sharing a single deadline:
//!
//! 1. DeleteCollection of every namespaced resource type in every namespace
//! 2. DeleteCollection of every cluster-scoped resource type
//! 3. Delete every namespace
//! 4. Force-finalize every namespace so no namespace controller is needed
//! 5. Poll until no namespace remains
//!
//! Namespaces and CustomResourceDefinitions never go through the collection
//! sweeps. Not-found and method-not-supported responses are ignored;
//! Forbidden and Unauthorized responses are reported as RBAC problems.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, TryStreamExt};
use governor_common::kube_utils::poll_until;
use governor_common::{Error, Result};
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::discovery::{verbs, Discovery, Scope};
use kube::{Client, ResourceExt};
use tokio::time::Instant;
use tracing::{debug, info};

/// Overall purge deadline when none is configured
pub const DEFAULT_PURGE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Concurrent deletions per phase when none is configured
pub const DEFAULT_PURGE_WORKERS: usize = 8;

const NAMESPACE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Tunables for a purge sweep
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PurgeOptions {
    /// Only delete objects matching this label selector
    pub label_selector: Option<String>,
    /// Only delete objects matching this field selector
    pub field_selector: Option<String>,
    /// Deadline for the whole sweep
    pub timeout: Duration,
    /// Concurrent deletions per phase
    pub workers: usize,
}

impl Default for PurgeOptions {
    fn default() -> Self {
        Self {
            label_selector: None,
            field_selector: None,
            timeout: DEFAULT_PURGE_TIMEOUT,
            workers: DEFAULT_PURGE_WORKERS,
        }
    }
}

impl PurgeOptions {
    /// List parameters scoping each DeleteCollection call
    pub fn list_params(&self) -> ListParams {
        let mut lp = ListParams::default();
        if let Some(labels) = self.label_selector.as_deref().filter(|s| !s.is_empty()) {
            lp = lp.labels(labels);
        }
        if let Some(fields) = self.field_selector.as_deref().filter(|s| !s.is_empty()) {
            lp = lp.fields(fields);
        }
        lp
    }
}

/// A resource type served by the project endpoint
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PurgeResource {
    /// Group, version and plural of the type
    pub api_resource: ApiResource,
    /// Whether objects of this type live in namespaces
    pub namespaced: bool,
    /// Verbs the API server advertises for the type
    pub verbs: Vec<String>,
}

impl PurgeResource {
    fn supports(&self, verb: &str) -> bool {
        self.verbs.iter().any(|v| v == verb)
    }

    fn is_excluded(&self) -> bool {
        let ar = &self.api_resource;
        (ar.group.is_empty() && ar.plural == "namespaces")
            || (ar.group == "apiextensions.k8s.io" && ar.plural == "customresourcedefinitions")
    }
}

impl fmt::Display for PurgeResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ar = &self.api_resource;
        if ar.group.is_empty() {
            write!(f, "{}/{}", ar.version, ar.plural)
        } else {
            write!(f, "{}/{}/{}", ar.group, ar.version, ar.plural)
        }
    }
}

/// Split discovered types into the namespaced and cluster-scoped sweeps.
///
/// Keeps types that support both `list` and `deletecollection`, skips
/// subresources, namespaces and CRDs.
pub fn purgeable(resources: Vec<PurgeResource>) -> (Vec<PurgeResource>, Vec<PurgeResource>) {
    resources
        .into_iter()
        .filter(|r| r.supports(verbs::LIST) && r.supports(verbs::DELETE_COLLECTION))
        .filter(|r| !r.api_resource.plural.contains('/'))
        .filter(|r| !r.is_excluded())
        .partition(|r| r.namespaced)
}

// =============================================================================
// Purge target abstraction
// =============================================================================

/// Operations the purge needs from a project control plane
#[async_trait]
pub trait PurgeTarget: Send + Sync {
    /// Every resource type the endpoint serves, at its preferred version
    async fn discover(&self) -> Result<Vec<PurgeResource>>;

    /// Names of every namespace
    async fn list_namespaces(&self) -> Result<Vec<String>>;

    /// DeleteCollection of one type, in `namespace` or cluster-wide
    async fn delete_collection(
        &self,
        resource: &PurgeResource,
        namespace: Option<&str>,
        lp: &ListParams,
    ) -> Result<()>;

    /// Delete a namespace with background propagation
    async fn delete_namespace(&self, name: &str) -> Result<()>;

    /// Get a namespace by name
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>>;

    /// Write `namespace` through the finalize subresource with its
    /// `spec.finalizers` cleared
    async fn finalize_namespace(&self, namespace: &Namespace) -> Result<()>;
}

/// Purge target backed by a kube client pointed at a project endpoint
pub struct KubePurgeTarget {
    client: Client,
}

impl KubePurgeTarget {
    /// Wrap a client connected to the project endpoint
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PurgeTarget for KubePurgeTarget {
    async fn discover(&self) -> Result<Vec<PurgeResource>> {
        let discovery = Discovery::new(self.client.clone()).run().await?;
        let mut resources = Vec::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                resources.push(PurgeResource {
                    api_resource: ar,
                    namespaced: matches!(caps.scope, Scope::Namespaced),
                    verbs: caps.operations.clone(),
                });
            }
        }
        Ok(resources)
    }

    async fn list_namespaces(&self) -> Result<Vec<String>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items.iter().map(|ns| ns.name_any()).collect())
    }

    async fn delete_collection(
        &self,
        resource: &PurgeResource,
        namespace: Option<&str>,
        lp: &ListParams,
    ) -> Result<()> {
        let api: Api<DynamicObject> = match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource.api_resource),
            None => Api::all_with(self.client.clone(), &resource.api_resource),
        };
        api.delete_collection(&DeleteParams::background(), lp).await?;
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.delete(name, &DeleteParams::background()).await?;
        Ok(())
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn finalize_namespace(&self, namespace: &Namespace) -> Result<()> {
        let mut ns = namespace.clone();
        if let Some(spec) = ns.spec.as_mut() {
            spec.finalizers = None;
        }
        let data = serde_json::to_vec(&ns)?;
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.replace_subresource("finalize", &ns.name_any(), &PostParams::default(), data)
            .await?;
        Ok(())
    }
}

// =============================================================================
// Purger
// =============================================================================

fn ignorable(error: &Error) -> bool {
    matches!(error.api_code(), Some(404 | 405))
}

fn forbidden(error: &Error) -> bool {
    matches!(error.api_code(), Some(401 | 403))
}

/// Runs the phased purge sweep
#[derive(Clone, Debug, Default)]
pub struct Purger {
    options: PurgeOptions,
}

impl Purger {
    /// Create a purger with the given options
    pub fn new(options: PurgeOptions) -> Self {
        Self { options }
    }

    /// Purge options in effect
    pub fn options(&self) -> &PurgeOptions {
        &self.options
    }

    /// Delete everything `target` serves on behalf of `project`
    pub async fn purge(&self, target: &dyn PurgeTarget, project: &str) -> Result<()> {
        let fail = |msg: String| Error::purge(project, msg);

        let (namespaced, cluster) = purgeable(
            target
                .discover()
                .await
                .map_err(|e| fail(format!("discover: {e}")))?,
        );
        let namespaces = target
            .list_namespaces()
            .await
            .map_err(|e| fail(format!("list namespaces: {e}")))?;
        info!(
            project,
            namespaced = namespaced.len(),
            cluster = cluster.len(),
            namespaces = namespaces.len(),
            "purging project control plane"
        );

        let deadline = Instant::now() + self.options.timeout;
        let workers = self.options.workers.max(1);
        let list_params = self.options.list_params();
        let lp = &list_params;
        let namespaces = namespaces.as_slice();
        let timed_out = || fail(format!("timed out after {:?}", self.options.timeout));
        let checked = |result: Result<()>, what: String| -> Result<()> {
            match result {
                Ok(()) => Ok(()),
                Err(e) if ignorable(&e) => Ok(()),
                Err(e) if forbidden(&e) => Err(fail(format!("rbac forbids {what}: {e}"))),
                Err(e) => Err(fail(format!("{what}: {e}"))),
            }
        };

        debug!(project, "deleting namespaced resources");
        let phase = run_parallel(workers, &namespaced, |resource| async move {
            for ns in namespaces {
                let result = target.delete_collection(resource, Some(ns), lp).await;
                checked(result, format!("DeleteCollection for {resource} in ns={ns}"))?;
            }
            Ok(())
        });
        tokio::time::timeout_at(deadline, phase)
            .await
            .map_err(|_| timed_out())??;

        debug!(project, "deleting cluster-scoped resources");
        let phase = run_parallel(workers, &cluster, |resource| async move {
            let result = target.delete_collection(resource, None, lp).await;
            checked(result, format!("DeleteCollection for {resource}"))
        });
        tokio::time::timeout_at(deadline, phase)
            .await
            .map_err(|_| timed_out())??;

        debug!(project, "deleting namespaces");
        let phase = run_parallel(workers, namespaces, |ns| async move {
            let result = target.delete_namespace(ns).await;
            checked(result, format!("deleting namespace {ns:?}"))
        });
        tokio::time::timeout_at(deadline, phase)
            .await
            .map_err(|_| timed_out())??;

        debug!(project, "finalizing namespaces");
        let phase = run_parallel(workers, namespaces, |ns| async move {
            let namespace = match target.get_namespace(ns).await {
                Ok(Some(namespace)) => namespace,
                Ok(None) => return Ok(()),
                Err(e) if ignorable(&e) => return Ok(()),
                Err(e) => return Err(fail(format!("get namespace {ns:?}: {e}"))),
            };
            if namespace.metadata.deletion_timestamp.is_none() {
                // The delete has not landed yet; re-issuing it is idempotent
                let _ = target.delete_namespace(ns).await;
            }
            let result = target.finalize_namespace(&namespace).await;
            checked(result, format!("namespaces/finalize on {ns:?}"))
        });
        tokio::time::timeout_at(deadline, phase)
            .await
            .map_err(|_| timed_out())??;

        debug!(project, "waiting for namespaces to disappear");
        let remaining = deadline.saturating_duration_since(Instant::now());
        poll_until(
            remaining,
            NAMESPACE_POLL_INTERVAL,
            "timeout waiting for namespaces to disappear",
            move || async move { Ok::<bool, Error>(target.list_namespaces().await?.is_empty()) },
        )
        .await
        .map_err(|_| fail("timeout waiting for namespaces to disappear".to_string()))?;

        info!(project, "project control plane purged");
        Ok(())
    }
}

/// Run `f` over `items` with at most `workers` in flight, stopping at the
/// first error
async fn run_parallel<'a, T, F, Fut>(workers: usize, items: &'a [T], f: F) -> Result<()>
where
    T: Sync,
    F: Fn(&'a T) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    stream::iter(items.iter().map(Ok::<&'a T, Error>))
        .try_for_each_concurrent(workers, f)
        .await
}
