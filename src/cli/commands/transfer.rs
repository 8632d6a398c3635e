//! Transfer command
//!
//! `devfleet transfer [server] get|put <src> [dst]`. Remote paths are
//! relative to the server's home directory and the destination defaults to
//! the source path.

use super::CommandContext;
use anyhow::{bail, Result};
use clap::Parser;
use std::path::{Path, PathBuf};

use crate::cli::progress::FileProgress;
use devfleet::daemon::Request;
use devfleet::transfer::{self, Direction, TransferRequest};

/// Arguments for the transfer command
#[derive(Parser, Debug, Clone)]
pub struct TransferArgs {
    /// [server] get|put <src> [dst]
    #[arg(required = true, num_args = 2..=4, value_name = "ARGS")]
    pub args: Vec<String>,

    /// Keep local files that already exist (get only)
    #[arg(long)]
    pub skip_existing: bool,

    /// Only transfer files whose name matches this glob (get only)
    #[arg(long, value_name = "GLOB")]
    pub pattern: Option<String>,
}

impl TransferArgs {
    /// Build the transfer request from the positional arguments.
    pub fn to_request(&self) -> Result<TransferRequest> {
        let (server, rest) = match self.args.first().map(String::as_str) {
            Some("get") | Some("put") => (None, &self.args[..]),
            Some(server) => (Some(server.to_string()), &self.args[1..]),
            None => bail!("missing transfer direction"),
        };

        let (direction, source, destination) = match rest {
            [direction, source] => (direction, source, None),
            [direction, source, destination] => (direction, source, Some(destination)),
            _ => bail!("usage: transfer [server] get|put <src> [dst]"),
        };

        let mut request = TransferRequest::new(server, direction.parse::<Direction>()?, source);
        request.destination = destination.map(PathBuf::from);
        request.skip_existing = self.skip_existing;
        request.pattern = self.pattern.clone();
        request.download_options()?;
        Ok(request)
    }

    /// Execute the transfer command
    pub async fn execute(&self, ctx: &mut CommandContext) -> Result<i32> {
        let request = self.to_request()?;

        if let Some(address) = ctx.daemon.clone() {
            let request = Request::Transfer(with_absolute_local_path(request)?);
            return ctx.via_daemon(&address, &request).await;
        }

        let inventory = ctx.inventory().await;
        let provider = ctx.direct_provider();
        let progress = FileProgress::new(!ctx.output.show_progress());

        let result = transfer::execute(
            &inventory,
            provider.as_ref(),
            &request,
            Some(progress.callback()),
        )
        .await;
        progress.finish();

        ctx.output.transfer_summary(request.direction, &result?)?;
        Ok(0)
    }
}

/// The daemon runs in another working directory, so local paths are sent
/// absolute.
fn with_absolute_local_path(mut request: TransferRequest) -> Result<TransferRequest> {
    let cwd = std::env::current_dir()?;
    let absolute = |p: &Path| cwd.join(p);
    match request.direction {
        Direction::Get => request.destination = Some(absolute(request.destination())),
        Direction::Put => {
            request.destination = Some(request.destination().to_path_buf());
            request.source = absolute(&request.source);
        }
    }
    Ok(request)
}
