//! Governor - organization, project, quota and documentation controllers

use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};

use governor_common::kind_registry::{KindRegistry, ALL_GOVERNED_KINDS};
use governor_common::telemetry::{init_telemetry, TelemetryConfig};
use governor_common::FIELD_MANAGER;
use governor_documentation::{DocumentationKubeClientImpl, RevisionAdmission};
use governor_membership::{MembershipAdmission, MembershipAdmissionClientImpl};
use governor_operator::config::{Cli, Commands, ControllerArgs, GovernorConfig, WebhookArgs};
use governor_operator::controller_runner::{
    build_documentation_controllers, build_membership_controllers,
    build_organization_controllers, build_project_controllers, build_quota_controllers,
};
use governor_webhook::{WebhookServerConfig, WebhookState};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The webhook and the kube client both need a process-wide rustls provider
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}. \
             TLS connections cannot be established without it.",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();

    let service_name = match &cli.command {
        Commands::Crd => return print_crds(),
        Commands::Controller(_) => "governor-controller",
        Commands::Webhook(_) => "governor-webhook",
    };
    init_telemetry(TelemetryConfig {
        service_name: service_name.to_string(),
        log_format: cli.log_format.into(),
        ..Default::default()
    })?;

    match cli.command {
        Commands::Controller(args) => run_controller(args).await,
        Commands::Webhook(args) => run_webhook(args).await,
        Commands::Crd => Ok(()),
    }
}

/// Print every governed CRD as a multi-document YAML stream
fn print_crds() -> anyhow::Result<()> {
    for kind in ALL_GOVERNED_KINDS {
        let crd = serde_yaml::to_string(&kind.crd())
            .with_context(|| format!("Failed to serialize {} CRD", kind.kind_str()))?;
        println!("---\n{crd}");
    }
    Ok(())
}

/// Server-side apply every governed CRD
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for kind in ALL_GOVERNED_KINDS {
        let crd = kind.crd();
        let name = crd.metadata.name.clone().unwrap_or_default();
        tracing::info!(crd = %name, "Installing CRD...");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .with_context(|| format!("Failed to install {name} CRD"))?;
    }

    tracing::info!("All governor CRDs installed/updated");
    Ok(())
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    tracing::info!("Governor controller starting...");
    let config = GovernorConfig::from(&args);

    let kube_config = kube::Config::infer()
        .await
        .context("Failed to load Kubernetes configuration")?;
    let client =
        Client::try_from(kube_config.clone()).context("Failed to create Kubernetes client")?;

    if args.install_crds {
        ensure_crds_installed(&client).await?;
    }

    let registry = KindRegistry::discover(client.clone()).await;

    tracing::info!("Starting controllers:");
    let mut controllers = Vec::new();
    controllers.extend(build_membership_controllers(client.clone(), &registry, &config));
    controllers.extend(build_organization_controllers(client.clone(), &registry));
    controllers.extend(build_quota_controllers(client.clone(), &registry));
    controllers.extend(build_project_controllers(
        client.clone(),
        kube_config,
        &registry,
        &config,
    ));
    controllers.extend(build_documentation_controllers(client, &registry));

    if controllers.is_empty() {
        anyhow::bail!("No controllers to run: none of the governor CRDs are installed");
    }

    futures::future::join_all(controllers).await;
    tracing::info!("Governor controller shutting down");
    Ok(())
}

async fn run_webhook(args: WebhookArgs) -> anyhow::Result<()> {
    tracing::info!("Governor webhook starting...");
    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let owner = args.owner_policy();
    if !owner.is_enabled() {
        tracing::warn!("No owner role configured, the last-owner guard is disabled");
    }

    let state = Arc::new(WebhookState {
        memberships: MembershipAdmission::new(
            Arc::new(MembershipAdmissionClientImpl::new(client.clone())),
            owner,
        ),
        revisions: RevisionAdmission::new(Arc::new(DocumentationKubeClientImpl::new(client))),
    });

    governor_webhook::serve(
        WebhookServerConfig {
            addr: args.bind_addr,
            cert_path: args.tls_cert,
            key_path: args.tls_key,
        },
        state,
    )
    .await?;
    Ok(())
}
