//! tidemark CLI — the main entry point.
//!
//! Commands:
//! - `simulate` — Replay a JSONL transcript through the compaction engine
//! - `memory`   — Inspect or clear stored observations
//! - `config`   — Show, validate or initialize configuration

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(
    name = "tidemark",
    about = "tidemark — background context compaction for long-running conversations",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to ~/.tidemark/config.toml)
    #[arg(long, global = true, env = "TIDEMARK_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a transcript and report what compaction did
    Simulate {
        /// JSON Lines transcript ({"role": ..., "content": ..., "tokens": ...})
        transcript: PathBuf,

        /// Override the observation threshold
        #[arg(long)]
        observation_threshold: Option<u64>,

        /// Override the reflection threshold
        #[arg(long)]
        reflection_threshold: Option<u64>,

        /// Override the scope
        #[arg(long)]
        scope: Option<String>,

        /// Keep observations in memory instead of the configured store
        #[arg(long)]
        ephemeral: bool,

        /// Print the final observations and remaining messages
        #[arg(long)]
        show_context: bool,

        /// Print the final state as JSON
        #[arg(long)]
        json: bool,
    },

    /// Inspect stored observations
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum MemoryAction {
    /// Summarize (or print with --full) the observations of a scope
    Show {
        #[arg(long)]
        scope: Option<String>,

        #[arg(long)]
        full: bool,
    },

    /// Delete the observations of a scope
    Clear {
        #[arg(long)]
        scope: Option<String>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,

    /// Check the configuration for problems
    Validate,

    /// Print the default config file path
    Path,

    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = cli.config.as_deref();
    match cli.command {
        Commands::Simulate {
            transcript,
            observation_threshold,
            reflection_threshold,
            scope,
            ephemeral,
            show_context,
            json,
        } => {
            let opts = commands::simulate::SimulateOptions {
                transcript,
                observation_threshold,
                reflection_threshold,
                scope,
                ephemeral,
                show_context,
                json,
            };
            commands::simulate::run(config, opts).await?
        }
        Commands::Memory { action } => match action {
            MemoryAction::Show { scope, full } => commands::memory::show(config, scope, full).await?,
            MemoryAction::Clear { scope } => commands::memory::clear(config, scope).await?,
        },
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_cmd::show(config).await?,
            ConfigAction::Validate => commands::config_cmd::validate(config).await?,
            ConfigAction::Path => commands::config_cmd::path().await?,
            ConfigAction::Init { force } => commands::config_cmd::init(config, force).await?,
        },
    }

    Ok(())
}
