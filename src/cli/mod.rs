//! Command-line interface for dbvec.

pub mod commands;
pub mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::cli::output::{Formatter, get_formatter};
use crate::client::DaemonClient;
use crate::models::{Config, OutputFormat};

/// Vectorize warehouse column metadata and search it in natural language.
#[derive(Debug, Parser)]
#[command(name = "dbvec")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[arg(long, short = 'f', global = true, help = "Output format: text or json")]
    pub format: Option<OutputFormat>,

    #[arg(long, short = 'v', global = true, help = "Enable debug logging")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Path to a config file")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start, stop or restart the background daemon
    Serve(commands::ServeArgs),

    /// Extract catalog metadata and build a new index generation
    Extract(commands::ExtractArgs),

    /// Show daemon, index and latest run status
    Status(commands::StatusArgs),

    /// Cancel the running extraction of a project
    Cancel(commands::CancelArgs),

    /// Show vector index statistics
    Stats,

    /// Search column metadata
    Search(commands::SearchArgs),

    /// Check daemon and component health
    Health,

    /// Manage configuration
    #[command(subcommand)]
    Config(commands::ConfigCommand),
}

/// Resolved settings shared by every command handler.
pub struct Context {
    pub config: Config,
    pub config_path: Option<PathBuf>,
    pub format: OutputFormat,
    pub verbose: bool,
}

impl Context {
    pub fn client(&self) -> DaemonClient {
        DaemonClient::new(&self.config).with_config_path(self.config_path.clone())
    }

    pub fn formatter(&self) -> Box<dyn Formatter> {
        get_formatter(self.format)
    }
}
