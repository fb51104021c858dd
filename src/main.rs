use anyhow::Context;
use clap::Parser;
use quic_sni_proxy::{ProxyConfig, ProxyListener};
use std::{path::PathBuf, sync::Arc};
use tracing_subscriber::EnvFilter;

/// Startup values for this server, provided by arguments when the binary is invoked.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Configuration {
    /// path to the JSON settings file [default: appsettings.json next to the executable]
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // configure logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let configuration = Configuration::parse();
    let path = match configuration.config {
        Some(path) => path,
        None => std::env::current_exe()
            .context("failed to locate the executable")?
            .with_file_name("appsettings.json"),
    };

    // every setting is validated and every certificate loaded before anything binds
    let settings = ProxyConfig::load(&path)?;
    let routes = settings.routing_table()?;
    let base_dir = path.parent().map(PathBuf::from).unwrap_or_default();
    let certificates = settings
        .certificate_store(&base_dir, &rustls::crypto::ring::default_provider())?;
    if routes.is_empty() {
        tracing::warn!(
            path = %path.display(),
            "no servers configured, every handshake will be refused"
        );
    }
    tracing::info!(
        hostnames = routes.len(),
        certificates = certificates.len(),
        "loaded configuration"
    );
    let listener_settings = settings.listener_settings()?;
    let address = settings.listen_address()?;

    let mut listener = ProxyListener::new(routes, Arc::new(certificates), listener_settings);
    listener
        .start(address)
        .with_context(|| format!("failed to start listening on {address}"))?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown requested");
    listener.stop().await;

    Ok(())
}
