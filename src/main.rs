//! # huddle
//!
//! Chatroom presence server binary: loads settings, installs telemetry and
//! serves until ctrl+c.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use huddle_server::HuddleSettings;

/// Chatroom presence server.
#[derive(Parser, Debug)]
#[command(name = "huddle", about = "Chatroom presence server")]
struct Cli {
    /// Settings file (default: ~/.huddle/settings.json, optional).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Default log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn load_settings(&self) -> Result<HuddleSettings> {
        let mut settings = match &self.config {
            Some(path) => huddle_server::load_settings_from_file(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => huddle_server::load_settings().context("Failed to load settings")?,
        };

        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.telemetry.log_level.clone_from(level);
        }

        settings.validate().context("Invalid settings")?;
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.load_settings()?;

    let telemetry_config = settings.telemetry.to_telemetry_config()?;
    let telemetry = huddle_telemetry::init_telemetry(&telemetry_config)?;
    let metrics = telemetry.metrics();

    tracing::info!(
        host = %settings.server.host,
        port = settings.server.port,
        metrics = metrics.is_some(),
        "starting huddle"
    );

    let server = huddle_server::start(settings.server, metrics.clone())
        .await
        .context("Failed to start server")?;

    let snapshots = metrics.map(|recorder| {
        huddle_telemetry::start_snapshot_task(
            recorder,
            Duration::from_secs(telemetry_config.metrics_snapshot_interval_secs),
            telemetry_config.metrics_retention_days,
            server.shutdown_token(),
        )
    });

    tracing::info!(addr = %server.local_addr(), "huddle ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;

    server.shutdown().await;
    if let Some(snapshots) = snapshots {
        if let Err(e) = snapshots.await {
            tracing::warn!(error = %e, "metrics snapshot task failed");
        }
    }
    tracing::info!("huddle stopped");
    Ok(())
}
