//! Route command - inspect the configured routing table.

use std::path::Path;

use anyhow::Result;
use pipeauth_core::routing::LogonPolicy;
use pipeauth_core::{Instruction, Query};

use crate::ui;

/// Route actions.
#[derive(Debug, Clone)]
pub enum RouteAction {
    /// List instructions.
    List,
    /// Match a query against the table.
    Test {
        /// Query tokens.
        parts: Vec<String>,
    },
}

/// Run the route command.
pub fn run_route(config_path: &Path, action: RouteAction) -> Result<()> {
    let config = super::load_config(config_path)?;
    let table = config.routing_table()?;

    match action {
        RouteAction::List => {
            ui::header("Routing table");
            if table.is_empty() {
                ui::info("No routes configured; every query is handled locally");
                return Ok(());
            }
            ui::table_row(&[("NAME", 16), ("DESTINATION", 24), ("LOGON", 10), ("ENCRYPT", 9)]);
            for instruction in table.iter() {
                let destination = instruction.destination.to_string();
                ui::table_row(&[
                    (instruction.name.as_str(), 16),
                    (destination.as_str(), 24),
                    (logon_label(instruction), 10),
                    (if instruction.encrypt { "yes" } else { "no" }, 9),
                ]);
                for pattern in instruction.patterns() {
                    println!("    {pattern}");
                }
            }
        }
        RouteAction::Test { parts } => {
            let query = Query::from_tokens(&parts);
            match table.match_query(&query) {
                Some(instruction) => {
                    ui::success(&format!("{query} matches '{}'", instruction.name));
                    ui::kv("Destination", &instruction.destination.to_string());
                    ui::kv("Logon", logon_label(instruction));
                    ui::kv("Encrypt", &instruction.encrypt.to_string());
                }
                None => ui::info(&format!("{query} matches no route; handled locally")),
            }
        }
    }
    Ok(())
}

const fn logon_label(instruction: &Instruction) -> &'static str {
    match instruction.logon_policy() {
        LogonPolicy::Anonymous => "anonymous",
        LogonPolicy::Guest => "guest",
        LogonPolicy::Full => "full",
    }
}
