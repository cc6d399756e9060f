//! Tandem CLI
//!
//! Command-line interface for inspecting and updating a tandem state slot
//! kept in the file-backed storage medium.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tandem_core::Config;

mod commands;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "tandem")]
#[command(about = "Tandem - shared reducer state across processes")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to the config file (defaults to ~/.config/tandem/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the persisted state slot
    Show,
    /// Merge a JSON object into the shared state
    Set {
        /// JSON object to merge, e.g. '{"theme": "dark"}'
        patch: String,
    },
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (storage_area, storage_key, data_dir, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.unwrap_or_else(Config::config_file_path);

    match cli.command {
        Commands::Show => commands::show::show(&config_path, &output).await,
        Commands::Set { patch } => commands::set::set(&config_path, &patch, &output).await,
        Commands::Config { command } => match command {
            Some(ConfigCommands::Show) | None => commands::config::show(&config_path, &output),
            Some(ConfigCommands::Set { key, value }) => {
                commands::config::set(&config_path, key, value, &output)
            }
        },
    }
}

/// Log to stderr; `RUST_LOG` overrides the default `warn` level
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    // Ignore error if already initialized
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
