//! Recursive file and directory transfer over a [`RemoteSession`].
//!
//! Downloads mirror a remote tree into a local directory, optionally keeping
//! files that already exist locally and filtering files by a glob on their
//! base name. Uploads walk a local tree top-down, creating each remote
//! directory before its files.
//!
//! Progress is reported per file as [`TransferProgress`] events carrying the
//! path relative to the transfer root; an event with a new path means the
//! previous file is done.

use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};
use walkdir::WalkDir;

use crate::connection::{
    shell_quote, ConnectionError, ConnectionResult, FileStat, ProgressCallback, RemoteSession,
    SessionProvider,
};
use crate::inventory::Inventory;

/// Progress of the file currently being transferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    /// Path relative to the transfer root
    pub path: PathBuf,
    /// Bytes transferred so far
    pub transferred_bytes: u64,
    /// Size of the file
    pub total_bytes: u64,
}

impl TransferProgress {
    /// Whether the file has been fully transferred
    pub fn is_complete(&self) -> bool {
        self.transferred_bytes >= self.total_bytes
    }
}

/// Callback for per-file progress events.
pub type TransferProgressCallback = Arc<dyn Fn(&TransferProgress) + Send + Sync>;

/// Options for [`download`].
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    /// Leave files that already exist locally untouched
    pub skip_existing: bool,
    /// Only transfer files whose base name matches
    pub pattern: Option<glob::Pattern>,
}

impl DownloadOptions {
    /// Default options: overwrite everything, no filter
    pub fn new() -> Self {
        Self::default()
    }

    /// Set skip-existing
    pub fn with_skip_existing(mut self, skip: bool) -> Self {
        self.skip_existing = skip;
        self
    }

    /// Filter files by a glob on their base name.
    pub fn with_pattern(mut self, pattern: &str) -> ConnectionResult<Self> {
        let pattern = glob::Pattern::new(pattern).map_err(|e| {
            ConnectionError::InvalidConfig(format!("invalid file pattern '{}': {}", pattern, e))
        })?;
        self.pattern = Some(pattern);
        Ok(self)
    }

    fn accepts(&self, name: &str) -> bool {
        self.pattern.as_ref().map_or(true, |p| p.matches(name))
    }
}

/// Counts from a finished transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransferSummary {
    /// Files copied
    pub files_transferred: usize,
    /// Files left alone because they already existed locally
    pub files_skipped: usize,
    /// Files excluded by the pattern
    pub files_filtered: usize,
    /// Directories created or traversed
    pub directories: usize,
    /// Bytes copied
    pub bytes_transferred: u64,
}

impl TransferSummary {
    fn merge(&mut self, other: TransferSummary) {
        self.files_transferred += other.files_transferred;
        self.files_skipped += other.files_skipped;
        self.files_filtered += other.files_filtered;
        self.directories += other.directories;
        self.bytes_transferred += other.bytes_transferred;
    }
}

/// Per-file byte callback that tags events with `relative`.
fn file_progress(
    progress: Option<&TransferProgressCallback>,
    relative: &Path,
) -> Option<ProgressCallback> {
    let progress = Arc::clone(progress?);
    let path = relative.to_path_buf();
    Some(Arc::new(move |done, total| {
        progress(&TransferProgress {
            path: path.clone(),
            transferred_bytes: done,
            total_bytes: total,
        })
    }))
}

fn base_name(path: &Path) -> PathBuf {
    path.file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| path.to_path_buf())
}

/// Download `remote` (file or directory) to `local`.
///
/// Fails with [`ConnectionError::NotFound`] when `remote` does not exist.
pub async fn download(
    session: &dyn RemoteSession,
    remote: &Path,
    local: &Path,
    options: &DownloadOptions,
    progress: Option<TransferProgressCallback>,
) -> ConnectionResult<TransferSummary> {
    let stat = session
        .stat(remote)
        .await?
        .ok_or_else(|| ConnectionError::NotFound(remote.display().to_string()))?;

    debug!(
        remote = %remote.display(),
        local = %local.display(),
        directory = stat.is_dir,
        "Starting download"
    );

    let relative = if stat.is_dir {
        PathBuf::new()
    } else {
        base_name(remote)
    };
    let ctx = Download {
        session,
        options,
        progress: progress.as_ref(),
    };
    download_entry(ctx, remote.to_path_buf(), local.to_path_buf(), relative, stat).await
}

#[derive(Clone, Copy)]
struct Download<'a> {
    session: &'a dyn RemoteSession,
    options: &'a DownloadOptions,
    progress: Option<&'a TransferProgressCallback>,
}

fn download_entry<'a>(
    ctx: Download<'a>,
    remote: PathBuf,
    local: PathBuf,
    relative: PathBuf,
    stat: FileStat,
) -> BoxFuture<'a, ConnectionResult<TransferSummary>> {
    async move {
        let mut summary = TransferSummary::default();

        if stat.is_dir {
            tokio::fs::create_dir_all(&local).await.map_err(|e| {
                ConnectionError::TransferFailed(format!(
                    "Failed to create local directory {}: {}",
                    local.display(),
                    e
                ))
            })?;
            summary.directories += 1;

            for entry in ctx.session.list_dir(&remote).await? {
                if entry.name == "." || entry.name == ".." {
                    continue;
                }
                let child = download_entry(
                    ctx,
                    remote.join(&entry.name),
                    local.join(&entry.name),
                    relative.join(&entry.name),
                    entry.stat,
                )
                .await?;
                summary.merge(child);
            }
            return Ok(summary);
        }

        let name = base_name(&remote);
        if !ctx.options.accepts(&name.to_string_lossy()) {
            trace!(path = %relative.display(), "Filtered out by pattern");
            summary.files_filtered += 1;
            return Ok(summary);
        }

        if ctx.options.skip_existing && tokio::fs::try_exists(&local).await.unwrap_or(false) {
            info!(path = %local.display(), "Skipping existing file");
            summary.files_skipped += 1;
            return Ok(summary);
        }

        let bytes = ctx
            .session
            .download_file(&remote, &local, file_progress(ctx.progress, &relative))
            .await?;
        summary.files_transferred += 1;
        summary.bytes_transferred += bytes;
        Ok(summary)
    }
    .boxed()
}

/// Upload `local` (file or directory) to `remote`.
///
/// Remote directories are created with `mkdir -p`; a failing `mkdir` is
/// logged and the walk continues, so the following file upload reports the
/// real problem.
pub async fn upload(
    session: &dyn RemoteSession,
    local: &Path,
    remote: &Path,
    progress: Option<TransferProgressCallback>,
) -> ConnectionResult<TransferSummary> {
    let metadata = tokio::fs::metadata(local).await.map_err(|e| {
        ConnectionError::TransferFailed(format!(
            "Cannot read local path {}: {}",
            local.display(),
            e
        ))
    })?;

    let mut summary = TransferSummary::default();

    if !metadata.is_dir() {
        let relative = base_name(local);
        session
            .upload_file(local, remote, file_progress(progress.as_ref(), &relative))
            .await?;
        summary.files_transferred = 1;
        summary.bytes_transferred = metadata.len();
        return Ok(summary);
    }

    debug!(local = %local.display(), remote = %remote.display(), "Starting directory upload");

    let entries = WalkDir::new(local)
        .sort_by_file_name()
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConnectionError::IoError(e.into()))?;

    for entry in entries {
        let relative = entry
            .path()
            .strip_prefix(local)
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let target = if relative.as_os_str().is_empty() {
            remote.to_path_buf()
        } else {
            remote.join(&relative)
        };

        if entry.file_type().is_dir() {
            make_remote_dir(session, &target).await?;
            summary.directories += 1;
        } else if entry.path().is_file() {
            session
                .upload_file(
                    entry.path(),
                    &target,
                    file_progress(progress.as_ref(), &relative),
                )
                .await?;
            summary.files_transferred += 1;
            summary.bytes_transferred += entry.metadata().map(|m| m.len()).unwrap_or(0);
        } else {
            trace!(path = %entry.path().display(), "Skipping special file");
        }
    }

    Ok(summary)
}

async fn make_remote_dir(session: &dyn RemoteSession, path: &Path) -> ConnectionResult<()> {
    let command = format!("mkdir -p {}", shell_quote(&path.to_string_lossy()));
    match session.run(&command).await {
        Ok(_) => Ok(()),
        Err(e @ ConnectionError::CommandFailed { .. }) => {
            warn!(path = %path.display(), error = %e, "Could not create remote directory");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Direction of a server transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Remote to local
    Get,
    /// Local to remote
    Put,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Get => f.write_str("get"),
            Direction::Put => f.write_str("put"),
        }
    }
}

impl FromStr for Direction {
    type Err = ConnectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "get" => Ok(Direction::Get),
            "put" => Ok(Direction::Put),
            other => Err(ConnectionError::InvalidConfig(format!(
                "unknown transfer direction '{}', expected get or put",
                other
            ))),
        }
    }
}

/// A transfer between the local machine and a named server.
///
/// Remote paths are taken relative to the server's home directory; the
/// destination defaults to the source path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Server name, `None` for the default server
    pub server: Option<String>,
    /// Get or put
    pub direction: Direction,
    /// Source path (remote for get, local for put)
    pub source: PathBuf,
    /// Destination path, defaults to `source`
    pub destination: Option<PathBuf>,
    /// Keep existing local files (get only)
    pub skip_existing: bool,
    /// Base-name glob filter (get only)
    pub pattern: Option<String>,
}

impl TransferRequest {
    /// Request with no destination and default options
    pub fn new(server: Option<String>, direction: Direction, source: impl Into<PathBuf>) -> Self {
        Self {
            server,
            direction,
            source: source.into(),
            destination: None,
            skip_existing: false,
            pattern: None,
        }
    }

    /// Effective destination path
    pub fn destination(&self) -> &Path {
        self.destination.as_deref().unwrap_or(&self.source)
    }

    /// Download options, rejecting get-only flags on a put.
    pub fn download_options(&self) -> ConnectionResult<DownloadOptions> {
        if self.direction == Direction::Put {
            if self.skip_existing {
                return Err(ConnectionError::InvalidConfig(
                    "--skip-existing only applies to get".to_string(),
                ));
            }
            if self.pattern.is_some() {
                return Err(ConnectionError::InvalidConfig(
                    "--pattern only applies to get".to_string(),
                ));
            }
        }

        let options = DownloadOptions::new().with_skip_existing(self.skip_existing);
        match &self.pattern {
            Some(pattern) => options.with_pattern(pattern),
            None => Ok(options),
        }
    }
}

/// Resolve the request's server, then download or upload through `provider`.
pub async fn execute(
    inventory: &Inventory,
    provider: &dyn SessionProvider,
    request: &TransferRequest,
    progress: Option<TransferProgressCallback>,
) -> crate::Result<TransferSummary> {
    let options = request.download_options()?;
    let host = inventory.resolve(request.server.as_deref()).await?;
    let session = provider.acquire(&host.target).await?;
    let home = Path::new(&host.target.home_dir);

    info!(
        server = %host.name(),
        direction = %request.direction,
        source = %request.source.display(),
        destination = %request.destination().display(),
        "Transferring"
    );

    let result = match request.direction {
        Direction::Get => {
            download(
                session.as_ref(),
                &home.join(&request.source),
                request.destination(),
                &options,
                progress,
            )
            .await
        }
        Direction::Put => {
            upload(
                session.as_ref(),
                &request.source,
                &home.join(request.destination()),
                progress,
            )
            .await
        }
    };

    provider.release(session).await;
    Ok(result?)
}
