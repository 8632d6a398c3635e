//! Ssh command - interactive shell on a server

use super::CommandContext;
use crate::cli::local;
use anyhow::Result;
use clap::Parser;

use devfleet::daemon::Request;

/// Arguments for the ssh command
#[derive(Parser, Debug, Clone)]
pub struct SshArgs {
    /// Server name or alias (defaults to the configured default)
    pub server: Option<String>,

    /// Print the ssh command line instead of running it
    #[arg(long)]
    pub print: bool,
}

impl SshArgs {
    /// Execute the ssh command
    pub async fn execute(&self, ctx: &mut CommandContext) -> Result<i32> {
        if let Some(address) = ctx.daemon.clone() {
            let request = Request::Ssh {
                server: self.server.clone(),
            };
            return ctx.via_daemon(&address, &request).await;
        }

        let host = ctx.inventory().await.resolve(self.server.as_deref()).await?;
        if self.print {
            println!("{}", host.ssh_command_line());
            return Ok(0);
        }

        ctx.output.debug(&host.ssh_command_line());
        local::run_interactive(&host.ssh_command()).await
    }
}
