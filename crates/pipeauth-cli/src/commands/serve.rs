//! Serve command - run an endpoint until interrupted.

use std::path::PathBuf;

use anyhow::{Context, Result};
use pipeauth_core::SecurityLevel;
use pipeauth_ipc::TransportService;

use crate::ui;

/// Serve command arguments.
#[derive(Debug, Clone)]
pub struct ServeArgs {
    /// Config file.
    pub config_path: PathBuf,
    /// Endpoint name override.
    pub endpoint: Option<String>,
    /// Security level names override.
    pub security: Vec<String>,
}

/// Run the serve command.
pub async fn run_serve(args: ServeArgs) -> Result<()> {
    let mut config = super::load_config(&args.config_path)?;
    if let Some(name) = args.endpoint {
        config.endpoint.name = name;
    }
    if !args.security.is_empty() {
        config.endpoint.security = args.security;
    }
    let security: SecurityLevel = config.endpoint.security_level()?;

    let service = TransportService::builder(config).build()?;
    let controller = service
        .open_default_endpoint()
        .await
        .context("failed to open endpoint")?;

    ui::header("pipeauth endpoint");
    ui::kv("Endpoint", controller.name());
    ui::kv("Security", &security.to_string());
    ui::kv("Runtime dir", &service.runtime_dir().display().to_string());
    ui::kv("Handlers", &service.handlers().names().join(", "));
    ui::kv("Routes", &service.routes().len().to_string());
    ui::info("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    ui::info("Shutting down...");
    service.shutdown().await;

    ui::success(&format!(
        "Endpoint closed after {} connections",
        controller.connections_served()
    ));
    Ok(())
}
