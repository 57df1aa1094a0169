//! HTTPS server for the webhook

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum_server::tls_rustls::RustlsConfig;
use tracing::info;

use crate::error::WebhookError;
use crate::handlers::{router, WebhookState};

/// Webhook server configuration
#[derive(Clone, Debug)]
pub struct WebhookServerConfig {
    /// Address to bind the server
    pub addr: SocketAddr,
    /// TLS certificate PEM file
    pub cert_path: PathBuf,
    /// TLS private key PEM file
    pub key_path: PathBuf,
}

/// Serve the webhook until the process is stopped.
///
/// A rustls crypto provider must be installed before calling this.
pub async fn serve(config: WebhookServerConfig, state: Arc<WebhookState>) -> Result<(), WebhookError> {
    let tls_config = RustlsConfig::from_pem_file(&config.cert_path, &config.key_path)
        .await
        .map_err(|e| {
            WebhookError::Tls(format!(
                "loading {} and {}: {e}",
                config.cert_path.display(),
                config.key_path.display()
            ))
        })?;

    info!(addr = %config.addr, "Starting admission webhook server");

    axum_server::bind_rustls(config.addr, tls_config)
        .serve(router(state).into_make_service())
        .await?;

    Ok(())
}
