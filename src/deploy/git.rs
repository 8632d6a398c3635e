//! Local git queries used by deploys.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::task::TaskError;

/// Command printing the checked-out commit.
pub const REVISION_COMMAND: &str = "git rev-parse HEAD";

/// Command printing uncommitted changes as a unified diff.
pub const PATCH_COMMAND: &str = "git diff HEAD";

/// Failures of local git commands.
#[derive(Error, Debug)]
pub enum GitError {
    /// The process could not be started.
    #[error("Failed to run '{command}': {source}")]
    Spawn {
        /// Command line
        command: String,
        /// Spawn error
        #[source]
        source: std::io::Error,
    },

    /// The command exited unsuccessfully.
    #[error("'{command}' failed with exit code {}: {stderr}", exit_code.map_or_else(|| "none".to_string(), |c| c.to_string()))]
    Failed {
        /// Command line
        command: String,
        /// Exit code, `None` when killed by a signal
        exit_code: Option<i32>,
        /// Captured standard error
        stderr: String,
    },

    /// The task running the command did not finish.
    #[error(transparent)]
    Task(#[from] TaskError),
}

/// The local checkout a deploy mirrors.
#[async_trait]
pub trait LocalRepository: Send + Sync {
    /// Commit id of `HEAD`.
    async fn revision(&self) -> Result<String, GitError>;

    /// Uncommitted changes against `HEAD`; empty when the tree is clean.
    async fn patch(&self) -> Result<Bytes, GitError>;
}

/// A git working tree on the local filesystem.
#[derive(Debug, Clone)]
pub struct GitWorkspace {
    dir: PathBuf,
}

impl GitWorkspace {
    /// Workspace rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Workspace in the current directory
    pub fn current() -> Self {
        Self::new(".")
    }

    /// Root directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn git(&self, command: &str) -> Result<Vec<u8>, GitError> {
        debug!(command = %command, dir = %self.dir.display(), "Running local command");

        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| GitError::Spawn {
                command: command.to_string(),
                source: e,
            })?;

        trace!(
            exit_code = ?output.status.code(),
            stdout_len = output.stdout.len(),
            "Local command completed"
        );

        if !output.status.success() {
            return Err(GitError::Failed {
                command: command.to_string(),
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl LocalRepository for GitWorkspace {
    async fn revision(&self) -> Result<String, GitError> {
        let stdout = self.git(REVISION_COMMAND).await?;
        Ok(String::from_utf8_lossy(&stdout).trim().to_string())
    }

    async fn patch(&self) -> Result<Bytes, GitError> {
        self.git(PATCH_COMMAND).await.map(Bytes::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failed_command_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = GitWorkspace::new(dir.path());
        let err = workspace.git("echo oops >&2; exit 3").await.unwrap_err();
        match err {
            GitError::Failed {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, Some(3));
                assert_eq!(stderr, "oops");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_runs_in_workspace_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker"), "x").unwrap();
        let out = GitWorkspace::new(dir.path()).git("ls").await.unwrap();
        assert_eq!(String::from_utf8_lossy(&out).trim(), "marker");
    }

    #[test]
    fn test_failed_display_without_exit_code() {
        let err = GitError::Failed {
            command: "git diff HEAD".into(),
            exit_code: None,
            stderr: "killed".into(),
        };
        assert_eq!(
            err.to_string(),
            "'git diff HEAD' failed with exit code none: killed"
        );
    }
}
