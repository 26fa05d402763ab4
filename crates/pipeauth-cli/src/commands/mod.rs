//! CLI command implementations.

pub mod config;
pub mod route;
pub mod send;
pub mod serve;

use std::path::Path;

use anyhow::Result;
use pipeauth_core::Config;

use crate::ui;

pub use config::run_config;
pub use route::run_route;
pub use send::{run_receive, run_send};
pub use serve::run_serve;

/// Load the config file, falling back to defaults when it does not exist.
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        return Ok(Config::load(path)?);
    }
    ui::warning(&format!("No configuration at {}, using defaults", path.display()));
    Ok(Config::default())
}
