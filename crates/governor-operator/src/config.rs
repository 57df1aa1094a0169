//! Command line and environment configuration
//!
//! Every flag can also be set through the environment variable named in its
//! help text, which is how the Deployment manifests configure the binary.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use governor_common::crd::RoleReference;
use governor_common::telemetry::LogFormat;
use governor_membership::OwnerPolicy;
use governor_project::PurgeOptions;

/// Governor - organization, project, quota and documentation controllers
#[derive(Parser, Debug)]
#[command(name = "governor", version, about, long_about = None)]
pub struct Cli {
    /// Log line encoding
    #[arg(long, global = true, env = "GOVERNOR_LOG_FORMAT", value_enum, default_value_t = LogFormatArg::Json)]
    pub log_format: LogFormatArg,

    #[allow(missing_docs)]
    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the reconcilers
    Controller(ControllerArgs),
    /// Serve the validating admission webhook
    Webhook(WebhookArgs),
    /// Print every CustomResourceDefinition as YAML and exit
    Crd,
}

/// Log format flag values
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    /// One JSON object per line
    Json,
    /// Human-readable lines
    Text,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Json => LogFormat::Json,
            LogFormatArg::Text => LogFormat::Text,
        }
    }
}

/// Flags for `governor controller`
#[derive(Args, Debug, Clone)]
pub struct ControllerArgs {
    /// Role granted to every member over their own membership, so they can leave
    #[arg(long, env = "GOVERNOR_SELF_DELETE_ROLE_NAME", default_value = "")]
    pub self_delete_role_name: String,

    /// Namespace of the self-delete role
    #[arg(long, env = "GOVERNOR_SELF_DELETE_ROLE_NAMESPACE", default_value = "")]
    pub self_delete_role_namespace: String,

    /// Base URL under which project control planes are served.
    /// The project controller is disabled when unset.
    #[arg(long, env = "GOVERNOR_PROJECT_ENDPOINT_BASE")]
    pub project_endpoint_base: Option<String>,

    /// Concurrent deletions per purge phase
    #[arg(long, env = "GOVERNOR_PURGE_WORKERS", default_value_t = 8)]
    pub purge_workers: usize,

    /// Deadline for a project purge, in seconds
    #[arg(long, env = "GOVERNOR_PURGE_TIMEOUT_SECS", default_value_t = 300)]
    pub purge_timeout_secs: u64,

    /// Only purge objects matching this label selector
    #[arg(long, env = "GOVERNOR_PURGE_LABEL_SELECTOR")]
    pub purge_label_selector: Option<String>,

    /// Only purge objects matching this field selector
    #[arg(long, env = "GOVERNOR_PURGE_FIELD_SELECTOR")]
    pub purge_field_selector: Option<String>,

    /// Create a ProjectControlPlane per project and wait for it before
    /// bootstrapping the project
    #[arg(long, env = "GOVERNOR_WAIT_FOR_CONTROL_PLANE", default_value_t = false)]
    pub wait_for_control_plane: bool,

    /// Server-side apply the CRDs before starting
    #[arg(long, env = "GOVERNOR_INSTALL_CRDS", default_value_t = false)]
    pub install_crds: bool,
}

/// Flags for `governor webhook`
#[derive(Args, Debug, Clone)]
pub struct WebhookArgs {
    /// Role that makes a membership an organization owner
    #[arg(long, env = "GOVERNOR_OWNER_ROLE_NAME", default_value = "")]
    pub owner_role_name: String,

    /// Namespace of the owner role
    #[arg(long, env = "GOVERNOR_OWNER_ROLE_NAMESPACE", default_value = "")]
    pub owner_role_namespace: String,

    /// Address the webhook listens on
    #[arg(long, env = "GOVERNOR_WEBHOOK_ADDR", default_value = "0.0.0.0:9443")]
    pub bind_addr: SocketAddr,

    /// TLS certificate PEM file
    #[arg(long, env = "GOVERNOR_WEBHOOK_CERT", default_value = "/tmp/k8s-webhook-server/serving-certs/tls.crt")]
    pub tls_cert: PathBuf,

    /// TLS private key PEM file
    #[arg(long, env = "GOVERNOR_WEBHOOK_KEY", default_value = "/tmp/k8s-webhook-server/serving-certs/tls.key")]
    pub tls_key: PathBuf,
}

impl WebhookArgs {
    /// Owner policy enforced at admission
    pub fn owner_policy(&self) -> OwnerPolicy {
        OwnerPolicy::new(&self.owner_role_name, &self.owner_role_namespace)
    }
}

/// Settings shared by the controllers
#[derive(Clone, Debug, PartialEq)]
pub struct GovernorConfig {
    /// Role bound to each member over their own membership
    pub self_delete_role: Option<RoleReference>,
    /// Base URL of the per-project control planes
    pub project_endpoint_base: Option<String>,
    /// Purge tunables
    pub purge: PurgeOptions,
    /// Whether projects wait for their ProjectControlPlane
    pub wait_for_control_plane: bool,
}

impl From<&ControllerArgs> for GovernorConfig {
    fn from(args: &ControllerArgs) -> Self {
        let self_delete_role = (!args.self_delete_role_name.is_empty()
            && !args.self_delete_role_namespace.is_empty())
        .then(|| {
            RoleReference::new(
                &args.self_delete_role_name,
                Some(args.self_delete_role_namespace.as_str()),
            )
        });

        Self {
            self_delete_role,
            project_endpoint_base: args
                .project_endpoint_base
                .clone()
                .filter(|base| !base.is_empty()),
            purge: PurgeOptions {
                label_selector: args.purge_label_selector.clone(),
                field_selector: args.purge_field_selector.clone(),
                timeout: Duration::from_secs(args.purge_timeout_secs),
                workers: args.purge_workers.max(1),
            },
            wait_for_control_plane: args.wait_for_control_plane,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller_args(argv: &[&str]) -> ControllerArgs {
        let mut full = vec!["governor", "controller"];
        full.extend_from_slice(argv);
        match Cli::try_parse_from(full).unwrap().command {
            Commands::Controller(args) => args,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn defaults_disable_optional_features() {
        let config = GovernorConfig::from(&controller_args(&[]));
        assert_eq!(config.self_delete_role, None);
        assert_eq!(config.project_endpoint_base, None);
        assert!(!config.wait_for_control_plane);
        assert_eq!(config.purge, PurgeOptions::default());
    }

    #[test]
    fn flags_populate_config() {
        let config = GovernorConfig::from(&controller_args(&[
            "--self-delete-role-name",
            "membership-self-delete",
            "--self-delete-role-namespace",
            "milo-system",
            "--project-endpoint-base",
            "https://api.example.com/",
            "--purge-workers",
            "0",
            "--purge-timeout-secs",
            "60",
            "--purge-label-selector",
            "app=web",
            "--wait-for-control-plane",
        ]));

        assert_eq!(
            config.self_delete_role,
            Some(RoleReference::new("membership-self-delete", Some("milo-system")))
        );
        assert_eq!(
            config.project_endpoint_base.as_deref(),
            Some("https://api.example.com/")
        );
        assert_eq!(config.purge.workers, 1);
        assert_eq!(config.purge.timeout, Duration::from_secs(60));
        assert_eq!(config.purge.label_selector.as_deref(), Some("app=web"));
        assert!(config.wait_for_control_plane);
    }

    #[test]
    fn self_delete_role_needs_both_parts() {
        let config = GovernorConfig::from(&controller_args(&[
            "--self-delete-role-name",
            "membership-self-delete",
        ]));
        assert_eq!(config.self_delete_role, None);
    }

    #[test]
    fn webhook_flags() {
        let cli = Cli::try_parse_from([
            "governor",
            "--log-format",
            "text",
            "webhook",
            "--owner-role-name",
            "organization-owner",
            "--owner-role-namespace",
            "milo-system",
            "--bind-addr",
            "127.0.0.1:8443",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormatArg::Text);
        let Commands::Webhook(args) = cli.command else {
            panic!("expected webhook command");
        };
        assert!(args.owner_policy().is_enabled());
        assert_eq!(args.bind_addr, "127.0.0.1:8443".parse().unwrap());
    }

    #[test]
    fn crd_subcommand_parses() {
        let cli = Cli::try_parse_from(["governor", "crd"]).unwrap();
        assert!(matches!(cli.command, Commands::Crd));
    }
}
