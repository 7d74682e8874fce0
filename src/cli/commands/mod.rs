//! CLI commands implementation.
//!
//! This module contains the CLI parser and dispatches to command-specific
//! modules.

mod cache;
mod import;
mod init;
mod status;
mod verify_cmd;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Settings;

#[derive(Parser)]
#[command(name = "cadastre")]
#[command(about = "Municipal parcel record reconciliation and matching system")]
#[command(version)]
pub struct Cli {
    /// Config file path (overrides auto-discovery)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter config file
    Init {
        /// Where to write the config (default: ./cadastre.toml)
        #[arg(default_value = "cadastre.toml")]
        path: PathBuf,
    },

    /// Import and reconcile one or more regions
    Import {
        /// Regions to import (or use --all for every configured region)
        regions: Vec<String>,
        /// Import all configured regions
        #[arg(short, long)]
        all: bool,
        /// Regions per batch (overrides config)
        #[arg(short, long)]
        batch_size: Option<usize>,
        /// Prompt for continue/stop between batches
        #[arg(short, long)]
        interactive: bool,
        /// Re-run regions even when their source files are unchanged
        #[arg(short, long)]
        force: bool,
    },

    /// Verify stored records against authoritative sources
    Verify {
        /// Region to verify (omit with --all for every stored region)
        region: Option<String>,
        /// Verify every region in the store
        #[arg(short, long)]
        all: bool,
    },

    /// Show run history and the cross-region discrepancy summary
    Status {
        /// Limit to one region
        region: Option<String>,
    },

    /// Manage the geocode cache
    Cache {
        #[command(subcommand)]
        command: cache::CacheCommands,
    },
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Init { path } => init::cmd_init(&path),
        Commands::Import {
            regions,
            all,
            batch_size,
            interactive,
            force,
        } => import::cmd_import(&settings, regions, all, batch_size, interactive, force).await,
        Commands::Verify { region, all } => verify_cmd::cmd_verify(&settings, region, all),
        Commands::Status { region } => status::cmd_status(&settings, region.as_deref()),
        Commands::Cache { command } => cache::cmd_cache(&settings, command),
    }
}
