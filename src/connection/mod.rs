//! Remote session layer.
//!
//! Every interaction with a server goes through a [`RemoteSession`]: one
//! authenticated SSH connection that runs shell commands and moves whole files
//! over a lazily opened SFTP sub-channel.
//!
//! # Overview
//!
//! - [`russh`]: the production implementation, [`RusshSession`]
//! - [`registry`]: pooled sessions keyed by server name, plus the background
//!   liveness monitor that evicts dead ones
//! - [`provider`]: how callers obtain and give back sessions (fresh
//!   connection per use, or checkout from the registry)
//!
//! # Example
//!
//! ```rust,ignore
//! use devfleet::connection::{RusshSession, SessionOptions, SessionTarget};
//!
//! let target = SessionTarget::new("box", "10.0.0.5", "dev").home_dir("/home/dev/src");
//! let session = RusshSession::connect(&target, &SessionOptions::default()).await?;
//!
//! let output = session.run("uname -a").await?;
//! println!("{}", output.stdout_text());
//! session.close().await?;
//! ```

/// Connection configuration types.
pub mod config;

/// Session acquisition strategies.
pub mod provider;

/// Session registry and liveness monitor.
pub mod registry;

/// SSH sessions backed by russh.
pub mod russh;

use async_trait::async_trait;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::oneshot;

pub use config::{
    expand_path, HostKeyPolicy, SessionOptions, SessionTarget, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_SSH_PORT,
};
pub use provider::{DirectProvider, PooledProvider, RusshConnector, SessionConnector, SessionProvider};
pub use registry::{
    LivenessMonitor, MonitorConfig, MonitorHandle, ProbeReport, RegistryError, SessionRegistry,
};
pub use self::russh::RusshSession;

/// Wraps `russh::Error` so it can serve as the client handler's error type.
#[derive(Debug)]
pub struct RusshError(pub ::russh::Error);

impl From<::russh::Error> for RusshError {
    fn from(err: ::russh::Error) -> Self {
        RusshError(err)
    }
}

impl std::fmt::Display for RusshError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Russh error: {}", self.0)
    }
}

impl std::error::Error for RusshError {}

impl From<::russh::Error> for ConnectionError {
    fn from(err: ::russh::Error) -> Self {
        ConnectionError::SshError(format!("Russh error: {}", err))
    }
}

impl From<russh_sftp::client::error::Error> for ConnectionError {
    fn from(e: russh_sftp::client::error::Error) -> Self {
        ConnectionError::TransferFailed(format!("SFTP error: {}", e))
    }
}

/// Errors raised by session operations.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Failed to establish the TCP connection or the SSH handshake.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication was rejected by the remote host.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The remote command exited with a non-zero status.
    #[error("Command '{command}' exited with status {exit_code}: {stderr}")]
    CommandFailed {
        /// Command line as sent to the remote shell
        command: String,
        /// Remote exit status
        exit_code: u32,
        /// Captured standard error, lossily decoded
        stderr: String,
    },

    /// File upload or download operation failed.
    #[error("File transfer failed: {0}")]
    TransferFailed(String),

    /// The remote path does not exist.
    #[error("No such remote path: {0}")]
    NotFound(String),

    /// Connection or operation timed out.
    #[error("Connection timeout after {0} seconds")]
    Timeout(u64),

    /// Configuration is invalid or incomplete.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// SSH-specific error from the underlying implementation.
    #[error("SSH error: {0}")]
    SshError(String),

    /// I/O error during connection operations.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// The session was closed before or during the operation.
    #[error("Connection closed")]
    ConnectionClosed,
}

impl ConnectionError {
    /// Whether the error means the session itself is unusable.
    ///
    /// A command that ran and exited non-zero, or a missing path, leaves the
    /// session healthy; everything else is treated as a transport failure.
    pub fn is_transport_failure(&self) -> bool {
        !matches!(
            self,
            ConnectionError::CommandFailed { .. }
                | ConnectionError::NotFound(_)
                | ConnectionError::InvalidConfig(_)
        )
    }
}

/// Result type for session operations.
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Byte-level progress callback: `(bytes_done, bytes_total)`.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Output of a command that exited successfully.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Raw standard output
    pub stdout: Vec<u8>,
    /// Raw standard error
    pub stderr: Vec<u8>,
    /// Exit status (always 0 when returned by [`RemoteSession::run`])
    pub exit_code: u32,
}

impl CommandOutput {
    /// Standard output decoded lossily with surrounding whitespace removed.
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }
}

/// A command whose output is consumed while it runs.
///
/// The streams must be read (or dropped) for the remote side to make
/// progress; [`CommandStream::wait`] drops them before awaiting the exit
/// status.
pub struct CommandStream {
    /// Live standard output
    pub stdout: Pin<Box<dyn AsyncRead + Send>>,
    /// Live standard error
    pub stderr: Pin<Box<dyn AsyncRead + Send>>,
    exit: oneshot::Receiver<ConnectionResult<u32>>,
}

impl CommandStream {
    /// Assemble a stream from its parts.
    pub fn new(
        stdout: Pin<Box<dyn AsyncRead + Send>>,
        stderr: Pin<Box<dyn AsyncRead + Send>>,
        exit: oneshot::Receiver<ConnectionResult<u32>>,
    ) -> Self {
        Self {
            stdout,
            stderr,
            exit,
        }
    }

    /// A stream over output that is already complete.
    pub fn completed(stdout: Vec<u8>, stderr: Vec<u8>, exit_code: u32) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Ok(exit_code));
        Self::new(
            Box::pin(std::io::Cursor::new(stdout)),
            Box::pin(std::io::Cursor::new(stderr)),
            rx,
        )
    }

    /// Wait for the remote command to exit and return its status.
    pub async fn wait(self) -> ConnectionResult<u32> {
        let CommandStream {
            stdout,
            stderr,
            exit,
        } = self;
        drop(stdout);
        drop(stderr);
        exit.await.map_err(|_| ConnectionError::ConnectionClosed)?
    }
}

impl std::fmt::Debug for CommandStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandStream").finish_non_exhaustive()
    }
}

/// Attributes of a remote path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStat {
    /// Size in bytes
    pub size: u64,
    /// Unix permission bits, when reported
    pub mode: Option<u32>,
    /// Modification time (seconds since epoch), when reported
    pub mtime: Option<u32>,
    /// Whether the path is a directory
    pub is_dir: bool,
}

impl FileStat {
    /// Attributes of a regular file of `size` bytes.
    pub fn file(size: u64) -> Self {
        Self {
            size,
            ..Self::default()
        }
    }

    /// Attributes of a directory.
    pub fn dir() -> Self {
        Self {
            is_dir: true,
            ..Self::default()
        }
    }
}

/// One entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Base name of the entry
    pub name: String,
    /// Entry attributes
    pub stat: FileStat,
}

/// One authenticated connection to a remote host.
///
/// Implementations are shared as `Arc<dyn RemoteSession>`; all methods take
/// `&self`. Operations on a closed session fail with
/// [`ConnectionError::ConnectionClosed`].
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Registry key / display name of the session.
    fn identifier(&self) -> &str;

    /// Remote working directory this session was opened for.
    fn home_dir(&self) -> &str;

    /// Whether the session is still usable.
    fn is_connected(&self) -> bool;

    /// Run `command` to completion and capture its output.
    ///
    /// A non-zero exit is reported as [`ConnectionError::CommandFailed`].
    async fn run(&self, command: &str) -> ConnectionResult<CommandOutput>;

    /// Start `command` and hand back its live output streams.
    async fn run_stream(&self, command: &str) -> ConnectionResult<CommandStream>;

    /// Write `content` to `remote_path`, replacing any existing file.
    async fn send_file(
        &self,
        remote_path: &Path,
        content: &[u8],
        progress: Option<ProgressCallback>,
    ) -> ConnectionResult<()>;

    /// Read the whole of `remote_path`.
    async fn download_content(
        &self,
        remote_path: &Path,
        progress: Option<ProgressCallback>,
    ) -> ConnectionResult<Vec<u8>>;

    /// `None` when the path does not exist.
    async fn stat(&self, path: &Path) -> ConnectionResult<Option<FileStat>>;

    /// Entries of a remote directory, sorted by name, without `.` and `..`.
    async fn list_dir(&self, path: &Path) -> ConnectionResult<Vec<DirEntry>>;

    /// Release the connection. Calling it again is a no-op.
    async fn close(&self) -> ConnectionResult<()>;

    /// Upload a local file.
    async fn upload_file(
        &self,
        local_path: &Path,
        remote_path: &Path,
        progress: Option<ProgressCallback>,
    ) -> ConnectionResult<()> {
        let content = tokio::fs::read(local_path).await.map_err(|e| {
            ConnectionError::TransferFailed(format!(
                "Failed to read local file {}: {}",
                local_path.display(),
                e
            ))
        })?;
        self.send_file(remote_path, &content, progress).await
    }

    /// Download a remote file, creating the local parent directory.
    ///
    /// Returns the number of bytes written.
    async fn download_file(
        &self,
        remote_path: &Path,
        local_path: &Path,
        progress: Option<ProgressCallback>,
    ) -> ConnectionResult<u64> {
        let content = self.download_content(remote_path, progress).await?;

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ConnectionError::TransferFailed(format!(
                    "Failed to create local directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        tokio::fs::write(local_path, &content).await.map_err(|e| {
            ConnectionError::TransferFailed(format!(
                "Failed to write local file {}: {}",
                local_path.display(),
                e
            ))
        })?;

        Ok(content.len() as u64)
    }
}

impl std::fmt::Debug for dyn RemoteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSession")
            .field("identifier", &self.identifier())
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    shell_words::quote(s).into_owned()
}
