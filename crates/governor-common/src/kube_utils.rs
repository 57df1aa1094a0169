//! Shared Kubernetes helpers for governor controllers

use std::future::Future;
use std::time::Duration;

use kube::api::{Api, ObjectMeta, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use tracing::trace;

use crate::Error;

/// Patch the status sub-resource of a namespaced resource.
///
/// Serializes `status` into `{ "status": <status> }` and applies it via
/// merge-patch. Returns `kube::Error` so callers can map to their own error type.
pub async fn patch_resource_status<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    status: &impl serde::Serialize,
    field_manager: &str,
) -> std::result::Result<(), kube::Error>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let patch = json!({ "status": status });
    api.patch_status(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Patch the status sub-resource of a cluster-scoped resource.
pub async fn patch_cluster_resource_status<T>(
    client: &Client,
    name: &str,
    status: &impl serde::Serialize,
    field_manager: &str,
) -> std::result::Result<(), kube::Error>
where
    T: Resource<Scope = k8s_openapi::ClusterResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::all(client.clone());
    let patch = json!({ "status": status });
    api.patch_status(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Whether `obj` carries `finalizer`
pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

/// Whether `obj` has a deletion timestamp
pub fn is_terminating<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

/// Merge patch setting the finalizer list to `finalizers`, guarded by
/// `resource_version`.
///
/// The API server rejects the patch with 409 if the object changed since it
/// was read, so a concurrent writer's finalizer is never dropped.
pub fn finalizers_patch(finalizers: &[String], resource_version: Option<&str>) -> serde_json::Value {
    let mut metadata = json!({ "finalizers": finalizers });
    if let Some(rv) = resource_version {
        metadata["resourceVersion"] = json!(rv);
    }
    json!({ "metadata": metadata })
}

/// Finalizer-list patch adding `finalizer` to `meta`, or `None` if present
pub fn add_finalizer_patch(meta: &ObjectMeta, finalizer: &str) -> Option<serde_json::Value> {
    let current = meta.finalizers.clone().unwrap_or_default();
    if current.iter().any(|f| f == finalizer) {
        return None;
    }
    let mut next = current;
    next.push(finalizer.to_string());
    Some(finalizers_patch(&next, meta.resource_version.as_deref()))
}

/// Finalizer-list patch removing `finalizer` from `meta`, or `None` if absent
pub fn remove_finalizer_patch(meta: &ObjectMeta, finalizer: &str) -> Option<serde_json::Value> {
    let current = meta.finalizers.clone().unwrap_or_default();
    if !current.iter().any(|f| f == finalizer) {
        return None;
    }
    let next: Vec<String> = current.into_iter().filter(|f| f != finalizer).collect();
    Some(finalizers_patch(&next, meta.resource_version.as_deref()))
}

/// Poll until `check_fn` returns `Ok(true)` or `timeout` elapses.
///
/// Check errors are treated as "not yet" and polling continues.
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    timeout_msg: impl Into<String>,
    mut check_fn: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let start = tokio::time::Instant::now();
    let timeout_msg = timeout_msg.into();

    loop {
        match check_fn().await {
            Ok(true) => return Ok(()),
            Ok(false) => trace!("polling condition not yet met"),
            Err(e) => trace!(error = %e, "polling check failed, retrying"),
        }

        if start.elapsed() >= timeout {
            return Err(Error::internal_with_context("poll_until", timeout_msg));
        }
        tokio::time::sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn meta(finalizers: &[&str], rv: Option<&str>) -> ObjectMeta {
        ObjectMeta {
            name: Some("web".into()),
            finalizers: Some(finalizers.iter().map(|f| f.to_string()).collect()),
            resource_version: rv.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn remove_finalizer_patch_carries_resource_version() {
        let m = meta(&["a/keep", "b/mine"], Some("42"));
        let patch = remove_finalizer_patch(&m, "b/mine").unwrap();
        assert_eq!(patch["metadata"]["finalizers"], json!(["a/keep"]));
        assert_eq!(patch["metadata"]["resourceVersion"], "42");
    }

    #[test]
    fn remove_absent_finalizer_is_noop() {
        let m = meta(&["a/keep"], Some("1"));
        assert!(remove_finalizer_patch(&m, "b/mine").is_none());
    }

    #[test]
    fn add_finalizer_patch_appends_once() {
        let m = meta(&["a/keep"], Some("7"));
        let patch = add_finalizer_patch(&m, "b/mine").unwrap();
        assert_eq!(patch["metadata"]["finalizers"], json!(["a/keep", "b/mine"]));
        assert_eq!(patch["metadata"]["resourceVersion"], "7");

        let m = meta(&["b/mine"], None);
        assert!(add_finalizer_patch(&m, "b/mine").is_none());
    }

    #[test]
    fn removing_last_finalizer_sends_empty_list() {
        let m = meta(&["b/mine"], None);
        let patch = remove_finalizer_patch(&m, "b/mine").unwrap();
        assert_eq!(patch["metadata"]["finalizers"], json!([]));
        assert!(patch["metadata"].get("resourceVersion").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn poll_until_returns_once_condition_holds() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = poll_until(
            Duration::from_secs(10),
            Duration::from_millis(500),
            "never ready",
            move || {
                let c = c.clone();
                async move { Ok(c.fetch_add(1, Ordering::SeqCst) >= 2) }
            },
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_until_times_out() {
        let result = poll_until(
            Duration::from_secs(2),
            Duration::from_millis(500),
            "namespaces still present",
            || async { Ok(false) },
        )
        .await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("namespaces still present"));
    }
}
