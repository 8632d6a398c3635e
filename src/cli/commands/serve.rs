//! Serve command - run the session daemon in the foreground

use super::CommandContext;
use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use devfleet::daemon::Daemon;
use devfleet::deploy::GitWorkspace;

/// Arguments for the serve command
#[derive(Parser, Debug, Clone)]
pub struct ServeArgs {
    /// Listen address (defaults to `[daemon] bind` from the config)
    #[arg(long, value_name = "ADDR")]
    pub bind: Option<String>,
}

impl ServeArgs {
    /// Execute the serve command
    pub async fn execute(&self, ctx: &mut CommandContext) -> Result<i32> {
        let bind = self
            .bind
            .clone()
            .unwrap_or_else(|| ctx.config.daemon.bind.clone());
        let listener = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("failed to listen on {}", bind))?;

        let daemon = Arc::new(
            Daemon::pooled(
                &ctx.config,
                ctx.inventory().await,
                Arc::new(GitWorkspace::current()),
            )
            .with_log_router(ctx.logs.clone()),
        );
        ctx.output.info(&format!("Serving on {}", bind));

        let result = tokio::select! {
            result = Arc::clone(&daemon).serve(listener) => result.map_err(anyhow::Error::from),
            signal = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                signal.map_err(anyhow::Error::from)
            }
        };

        daemon.shutdown().await;
        result.map(|()| 0)
    }
}
