//! b0-connector daemon
//!
//! Discovers sockets, reconciles them against the Border0 control plane,
//! and maintains one authenticated reverse tunnel per active socket.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use b0_api::ApiClient;
use b0_connector::{ConnectorSessionFactory, Supervisor};
use b0_core::config::{self, ConnectorConfig};
use b0_discover::StaticSocketFinder;
use b0_tunnel::{Dialer, SessionConfig, TunnelRegistry};

#[derive(Parser)]
#[command(name = "b0-connector")]
#[command(about = "Border0 connector agent")]
#[command(version)]
struct Args {
    /// Path to the connector configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Access token (overrides $BORDER0_ADMIN_TOKEN)
    #[arg(short, long)]
    token: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("b0-connector {} starting", env!("CARGO_PKG_VERSION"));

    let config_path = args.config.unwrap_or_else(config::default_config_path);
    let cfg: ConnectorConfig = config::load_config(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    cfg.validate().context("invalid connector configuration")?;

    let token = args
        .token
        .or_else(|| std::env::var("BORDER0_ADMIN_TOKEN").ok())
        .context("no access token; pass --token or set BORDER0_ADMIN_TOKEN")?;

    let api = Arc::new(ApiClient::new(token).context("failed to build API client")?);
    let registry = Arc::new(TunnelRegistry::new());

    if !cfg.cloud_groups.is_empty() {
        tracing::warn!(
            "cloud groups configured but no instance source is wired into this build; \
             only static sockets will be discovered"
        );
    }

    let dialer = Dialer::from_proxy(cfg.proxy.as_deref()).context("invalid proxy setting")?;
    let template = SessionConfig {
        dialer,
        version: env!("CARGO_PKG_VERSION").to_string(),
        ..Default::default()
    };

    let factory = Arc::new(ConnectorSessionFactory::new(
        api.clone(),
        registry.clone(),
        template,
    ));

    let supervisor = Supervisor::new(
        cfg,
        api,
        Box::new(StaticSocketFinder),
        registry,
        factory,
    );

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            shutdown.cancel();
        }
    });

    supervisor.run(cancel).await?;
    tracing::info!("connector stopped");

    Ok(())
}
