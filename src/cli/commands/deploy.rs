//! Deploy command
//!
//! Brings each server's checkout to the local revision and applies the local
//! uncommitted changes on top.

use super::CommandContext;
use anyhow::Result;
use clap::Parser;
use std::sync::Arc;

use devfleet::daemon::Request;
use devfleet::deploy::{DeployOrchestrator, GitWorkspace};

/// Arguments for the deploy command
#[derive(Parser, Debug, Clone)]
pub struct DeployArgs {
    /// Servers to deploy to (names or aliases)
    #[arg(required = true)]
    pub servers: Vec<String>,
}

impl DeployArgs {
    /// Execute the deploy command
    pub async fn execute(&self, ctx: &mut CommandContext) -> Result<i32> {
        if let Some(address) = ctx.daemon.clone() {
            let request = Request::Deploy {
                servers: self.servers.clone(),
            };
            return ctx.via_daemon(&address, &request).await;
        }

        ctx.output
            .info(&format!("Deploying to {}", self.servers.join(", ")));

        let orchestrator = DeployOrchestrator::new(
            ctx.inventory().await,
            ctx.direct_provider(),
            Arc::new(GitWorkspace::current()),
        );
        let report = orchestrator.run(&self.servers).await;

        ctx.output.deploy_report(&report)?;
        Ok(report.exit_code())
    }
}
