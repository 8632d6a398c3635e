//! Open command - browse to a port served by a server

use super::CommandContext;
use crate::cli::local;
use anyhow::Result;
use clap::Parser;

use devfleet::daemon::Request;

/// Arguments for the open command
#[derive(Parser, Debug, Clone)]
pub struct OpenArgs {
    /// Server name or alias
    pub server: String,

    /// HTTP port on the server
    pub port: u16,
}

impl OpenArgs {
    /// Execute the open command
    pub async fn execute(&self, ctx: &mut CommandContext) -> Result<i32> {
        if let Some(address) = ctx.daemon.clone() {
            let request = Request::Open {
                server: Some(self.server.clone()),
                port: self.port,
            };
            return ctx.via_daemon(&address, &request).await;
        }

        let host = ctx.inventory().await.resolve(Some(&self.server)).await?;
        let url = host.http_url(self.port);
        ctx.output.info(&format!("Opening {}", url));
        local::open_url(&url).await?;
        Ok(0)
    }
}
