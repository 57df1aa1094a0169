//! Per-project control-plane endpoints
//!
//! Every project is served under its own path on the platform API server.
//! The controller talks to that endpoint to bootstrap the project and to
//! purge it on deletion.

use async_trait::async_trait;
use governor_common::{Error, Result};
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, PostParams};
use kube::{Client, Config};
use tracing::{debug, info};

use crate::purge::{KubePurgeTarget, Purger};

#[cfg(test)]
use mockall::automock;

/// URL of the control plane serving `project` under `base`
pub fn project_endpoint(base: &str, project: &str) -> String {
    format!("{}/projects/{project}/control-plane", base.trim_end_matches('/'))
}

/// Operations the project controller performs against project endpoints
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProjectEndpointClient: Send + Sync {
    /// Delete everything served at the project's endpoint
    async fn purge(&self, project: &str) -> Result<()>;

    /// Create `namespace` at the project's endpoint if it does not exist
    async fn ensure_namespace(&self, project: &str, namespace: &str) -> Result<()>;
}

/// Endpoint client deriving per-project kube clients from a base config
pub struct ProjectEndpointClientImpl {
    config: Config,
    base_url: String,
    purger: Purger,
}

impl ProjectEndpointClientImpl {
    /// Reach projects under `base_url` with the credentials of `config`
    pub fn new(config: Config, base_url: impl Into<String>, purger: Purger) -> Self {
        Self {
            config,
            base_url: base_url.into(),
            purger,
        }
    }

    fn client_for(&self, project: &str) -> Result<Client> {
        let endpoint = project_endpoint(&self.base_url, project);
        let mut config = self.config.clone();
        config.cluster_url = endpoint.parse().map_err(|e| {
            Error::internal_with_context(
                "project_client",
                format!("invalid project endpoint {endpoint}: {e}"),
            )
        })?;
        debug!(project, endpoint = %endpoint, "connecting to project control plane");
        Client::try_from(config).map_err(|e| {
            Error::internal_with_context(
                "project_client",
                format!("failed to create client for {endpoint}: {e}"),
            )
        })
    }
}

#[async_trait]
impl ProjectEndpointClient for ProjectEndpointClientImpl {
    async fn purge(&self, project: &str) -> Result<()> {
        let client = self
            .client_for(project)
            .map_err(|e| Error::purge(project, e.to_string()))?;
        self.purger
            .purge(&KubePurgeTarget::new(client), project)
            .await
    }

    async fn ensure_namespace(&self, project: &str, namespace: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client_for(project)?);
        if api.get_opt(namespace).await?.is_some() {
            return Ok(());
        }

        let mut ns = Namespace::default();
        ns.metadata.name = Some(namespace.to_string());
        match api.create(&PostParams::default(), &ns).await {
            Ok(_) => {
                info!(project, namespace, "created namespace in project control plane");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
