//! CLI module for devfleet
//!
//! Argument parsing and subcommand dispatch for the `devfleet` binary.

pub mod commands;
pub mod local;
pub mod output;
pub mod progress;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Devfleet - drive a fleet of development servers over SSH
#[derive(Parser, Debug, Clone)]
#[command(name = "devfleet")]
#[command(author = "Devfleet Contributors")]
#[command(version)]
#[command(about = "Deploy, transfer and connect to development servers over SSH", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the configuration file
    #[arg(short = 'C', long, global = true, env = "DEVFLEET_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv)
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[arg(long, global = true, default_value = "human")]
    pub output: OutputFormat,

    /// Route the command through a running daemon at ADDR
    #[arg(long, global = true, value_name = "ADDR", env = "DEVFLEET_DAEMON")]
    pub daemon: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,
}

/// Output format for CLI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable output with colors
    #[default]
    Human,
    /// JSON output for scripting
    Json,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Bring servers to the local revision and apply local changes
    Deploy(commands::deploy::DeployArgs),

    /// Copy files or directories to or from a server
    Transfer(commands::transfer::TransferArgs),

    /// Open an interactive shell on a server
    Ssh(commands::ssh::SshArgs),

    /// Open a server's HTTP port in the browser
    Open(commands::open::OpenArgs),

    /// Run the session daemon
    Serve(commands::serve::ServeArgs),
}

impl Cli {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Get the effective verbosity level (0-2)
    pub fn verbosity(&self) -> u8 {
        self.verbose.min(2)
    }

    /// Check if JSON output is requested
    pub fn is_json(&self) -> bool {
        matches!(self.output, OutputFormat::Json)
    }
}
