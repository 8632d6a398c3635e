//! Subcommands module for the devfleet CLI
//!
//! Each subcommand runs either in-process, opening its own SSH sessions, or
//! through a running daemon when `--daemon` is given.

pub mod deploy;
pub mod open;
pub mod serve;
pub mod ssh;
pub mod transfer;

use anyhow::{bail, Result};
use futures::StreamExt;
use std::sync::Arc;

use crate::cli::local;
use crate::cli::output::OutputFormatter;
use devfleet::config::Config;
use devfleet::connection::{DirectProvider, RusshConnector, SessionProvider};
use devfleet::daemon::{self, FrameKind, LogRouter, Request};
use devfleet::inventory::Inventory;

/// Common context shared between commands
pub struct CommandContext {
    /// Configuration
    pub config: Config,
    /// Output formatter
    pub output: OutputFormatter,
    /// Verbosity level
    pub verbosity: u8,
    /// Daemon address, when commands are routed through one
    pub daemon: Option<String>,
    /// Log forwarding installed by `init_logging`
    pub logs: LogRouter,
}

impl CommandContext {
    /// Create a new command context from CLI arguments
    pub fn new(cli: &crate::cli::Cli, config: Config, logs: LogRouter) -> Self {
        let output = OutputFormatter::new(!cli.no_color, cli.is_json(), cli.verbosity());

        Self {
            config,
            output,
            verbosity: cli.verbosity(),
            daemon: cli.daemon.clone(),
            logs,
        }
    }

    /// Inventory over the loaded configuration
    pub async fn inventory(&self) -> Arc<Inventory> {
        Arc::new(Inventory::from_config(self.config.clone()).await)
    }

    /// Provider opening one SSH session per use
    pub fn direct_provider(&self) -> Arc<dyn SessionProvider> {
        let connector = Arc::new(RusshConnector::new(self.config.ssh.clone()));
        Arc::new(DirectProvider::new(connector))
    }

    /// Send `request` to the daemon and act on its response frames.
    ///
    /// Returns the exit status carried by the final frame.
    pub async fn via_daemon(&self, address: &str, request: &Request) -> Result<i32> {
        self.output.debug(&format!("Sending request to daemon at {}", address));
        let mut frames = daemon::request(address, request).await?;

        while let Some(frame) = frames.next().await {
            let frame = frame?;
            match frame.kind {
                FrameKind::Stderr => eprintln!("{}", frame.text),
                FrameKind::Stdout => println!("{}", frame.text),
                FrameKind::Exec => {
                    let code = local::run_command_line(&frame.text).await?;
                    if code != 0 {
                        return Ok(code);
                    }
                }
                FrameKind::BrowseUrl => local::open_url(&frame.text).await?,
                FrameKind::Exit => {
                    return match frame.exit_code() {
                        Some(code) => Ok(code),
                        None => bail!("daemon sent a malformed exit status '{}'", frame.text),
                    };
                }
            }
        }

        bail!("daemon closed the connection without an exit status")
    }
}
