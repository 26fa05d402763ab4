//! Send and receive commands.

use std::path::{Path, PathBuf};

use anyhow::Result;
use pipeauth_core::{Destination, Query};
use pipeauth_ipc::TransportService;

use crate::ui;

/// Send command arguments.
#[derive(Debug, Clone)]
pub struct SendArgs {
    /// Config file.
    pub config_path: PathBuf,
    /// Destination as `pipe` or `host/pipe`.
    pub destination: String,
    /// Query tokens.
    pub parts: Vec<String>,
    /// Do not wait for an answer.
    pub one_way: bool,
}

/// Run the send command.
pub async fn run_send(args: SendArgs) -> Result<()> {
    let config = super::load_config(&args.config_path)?;
    let service = TransportService::builder(config).build()?;
    let destination = Destination::parse(&args.destination);
    let query = Query::from_tokens(&args.parts);

    tracing::debug!(destination = %destination, query = %query, "sending");
    let outcome = if args.one_way {
        service
            .send_one_way(&destination, query)
            .await
            .map(|()| None)
    } else {
        service.request(&destination, query).await.map(Some)
    };
    service.shutdown().await;

    match outcome? {
        Some(answer) => {
            ui::success(&format!("Answer from {destination}"));
            ui::query(&answer);
        }
        None => ui::success(&format!("Delivered to {destination}")),
    }
    Ok(())
}

/// Run the receive command.
pub async fn run_receive(config_path: &Path, destination: &str) -> Result<()> {
    let config = super::load_config(config_path)?;
    let service = TransportService::builder(config).build()?;
    let destination = Destination::parse(destination);

    let message = service.receive(&destination).await;
    service.shutdown().await;

    let message = message?;
    ui::success(&format!("Received from {destination}"));
    ui::query(&message);
    Ok(())
}
