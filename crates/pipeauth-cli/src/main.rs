//! pipeauth CLI - serve and exercise named-pipe endpoints.

mod commands;
mod ui;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "pipeauth")]
#[command(about = "pipeauth - authenticated RPC over named pipes")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to ~/.pipeauth/pipeauth.json)
    #[arg(short, long, global = true, env = "PIPEAUTH_CONFIG_PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve an endpoint until interrupted
    Serve {
        /// Endpoint name (defaults to the configured one)
        #[arg(short, long)]
        endpoint: Option<String>,

        /// Security level names, e.g. internal, local, anonymous
        #[arg(short, long, value_delimiter = ',')]
        security: Vec<String>,
    },

    /// Send a query to a destination
    Send {
        /// Destination as `pipe` or `host/pipe`
        destination: String,

        /// Query parts as `name=value` or bare `name`
        #[arg(required = true)]
        parts: Vec<String>,

        /// Do not wait for an answer
        #[arg(long)]
        one_way: bool,
    },

    /// Collect the message served by a broadcast or answer endpoint
    Receive {
        /// Destination as `pipe` or `host/pipe`
        destination: String,
    },

    /// Inspect the routing table
    Route {
        #[command(subcommand)]
        action: RouteCommands,
    },

    /// Configuration get/set
    Config {
        #[command(subcommand)]
        action: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
enum RouteCommands {
    /// List instructions in match order
    List,

    /// Show which instruction a query matches
    Test {
        /// Query parts as `name=value` or bare `name`
        #[arg(required = true)]
        parts: Vec<String>,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Get a configuration value
    Get {
        /// Configuration key (e.g., client.retryIntervalMs)
        key: String,
    },

    /// Set a configuration value
    Set {
        /// Configuration key (e.g., endpoint.name)
        key: String,

        /// Value to set
        value: String,
    },

    /// Show full configuration
    Show,

    /// Validate configuration
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG wins over --verbose
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    let config_path = cli.config.unwrap_or_else(pipeauth_core::Config::default_path);

    match cli.command {
        Commands::Serve { endpoint, security } => {
            let args = commands::serve::ServeArgs {
                config_path,
                endpoint,
                security,
            };
            commands::run_serve(args).await?;
        }

        Commands::Send {
            destination,
            parts,
            one_way,
        } => {
            let args = commands::send::SendArgs {
                config_path,
                destination,
                parts,
                one_way,
            };
            commands::run_send(args).await?;
        }

        Commands::Receive { destination } => {
            commands::run_receive(&config_path, &destination).await?;
        }

        Commands::Route { action } => {
            let action = match action {
                RouteCommands::List => commands::route::RouteAction::List,
                RouteCommands::Test { parts } => commands::route::RouteAction::Test { parts },
            };
            commands::run_route(&config_path, action)?;
        }

        Commands::Config { action } => {
            let args = match action {
                Some(ConfigCommands::Get { key }) => commands::config::ConfigArgs {
                    get: Some(key),
                    ..Default::default()
                },
                Some(ConfigCommands::Set { key, value }) => commands::config::ConfigArgs {
                    set: Some(format!("{key}={value}")),
                    ..Default::default()
                },
                Some(ConfigCommands::Validate) => commands::config::ConfigArgs {
                    validate: true,
                    ..Default::default()
                },
                Some(ConfigCommands::Show) | None => commands::config::ConfigArgs {
                    show: true,
                    ..Default::default()
                },
            };
            commands::run_config(&config_path, args)?;
        }
    }

    Ok(())
}
