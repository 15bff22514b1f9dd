use anyhow::Context;
use clap::Parser;
use relay_rs::api::ApiServer;
use relay_rs::config::Config;
use relay_rs::management::RelayManager;
use relay_rs::relay::Relay;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "relay-rs")]
#[command(about = "Self-hosted SMTP relay", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "config.toml", env = "RELAY_CONFIG")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    relay_rs::logging::init(&config.logging)?;

    info!("Starting relay-rs");
    if !cli.config.exists() {
        info!("No config file found, using defaults");
    }
    info!("  SMTP listening on: {}", config.smtp.listen_addr);
    info!("  Hostname: {}", config.server.hostname);
    info!("  Data directory: {}", config.storage.data_dir);
    info!("  Upstream: {}:{}", config.upstream.host, config.upstream.port);

    let relay = Arc::new(Relay::new(config.clone()).await.context("Failed to initialize relay")?);
    relay.start().await.context("Failed to start SMTP listener")?;
    relay.spawn_background().await;

    let api_cancel = CancellationToken::new();
    let api_handle = if config.api.enabled {
        let server = ApiServer::new(RelayManager::new(Arc::clone(&relay)), config.api.listen_addr.clone());
        let cancel = api_cancel.clone();
        Some(tokio::spawn(async move { server.run(cancel).await }))
    } else {
        info!("Management API disabled");
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    api_cancel.cancel();
    if let Some(handle) = api_handle {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("API server error: {}", e),
            Err(e) => error!("API task panic: {}", e),
        }
    }

    relay.shutdown().await?;
    Ok(())
}
