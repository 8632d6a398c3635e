//! Processes run on the local machine: the interactive ssh client and the
//! URL opener.

use anyhow::{bail, Context, Result};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Run `argv` with the terminal attached and return its exit status.
pub async fn run_interactive(argv: &[String]) -> Result<i32> {
    let (program, args) = argv.split_first().context("empty command line")?;
    debug!(program = %program, args = ?args, "Running interactive command");

    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await
        .with_context(|| format!("failed to run {}", program))?;

    Ok(status.code().unwrap_or(1))
}

/// Run a shell-quoted command line with the terminal attached.
pub async fn run_command_line(line: &str) -> Result<i32> {
    let argv = shell_words::split(line).context("malformed command line")?;
    run_interactive(&argv).await
}

fn opener() -> &'static str {
    if cfg!(target_os = "macos") {
        "open"
    } else {
        "xdg-open"
    }
}

/// Open `url` with the desktop's default handler.
pub async fn open_url(url: &str) -> Result<()> {
    debug!(url = %url, "Opening URL");
    let status = Command::new(opener())
        .arg(url)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .status()
        .await
        .with_context(|| format!("failed to run {}", opener()))?;

    if !status.success() {
        bail!("{} exited with {}", opener(), status);
    }
    Ok(())
}
