//! Parallel patch deploys.
//!
//! A deploy brings every named server's checkout to the local `HEAD` and then
//! applies the local uncommitted changes on top:
//!
//! 1. The local revision and the local patch are computed once, eagerly, and
//!    shared by all hosts.
//! 2. Each host runs independently on its own task. While the remote revision
//!    is checked, the patch is uploaded to a remote temp file in parallel.
//! 3. If the remote revision differs, the remote checkout is reset and pulled
//!    and the revision is read again.
//! 4. Only when both revisions agree is the checkout reset and the patch
//!    applied. The temp file is removed in every case.
//!
//! A failing host never affects the others; the [`DeployReport`] lists one
//! [`HostOutcome`] per server.

pub mod git;

use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::connection::{shell_quote, ConnectionError, RemoteSession, SessionProvider};
use crate::inventory::{Inventory, InventoryError, ResolvedHost};
use crate::task::{SharedTask, TaskError, TaskHandle};

pub use git::{GitError, GitWorkspace, LocalRepository};

/// Remote command allocating the patch's temp file.
pub const MKTEMP_COMMAND: &str = "mktemp";

/// Why one host's deploy failed.
#[derive(Error, Debug)]
pub enum DeployError {
    /// The remote checkout could not be brought to the local revision.
    #[error("Revision mismatch on {server}: local {local}, remote {remote}")]
    RevisionMismatch {
        /// Server name
        server: String,
        /// Local `HEAD`
        local: String,
        /// Remote `HEAD` after refreshing
        remote: String,
    },

    /// The server name could not be resolved.
    #[error(transparent)]
    Resolve(#[from] InventoryError),

    /// A session operation failed.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Reading the local revision or patch failed.
    #[error("Local repository error: {0}")]
    Local(#[source] Arc<GitError>),

    /// The host's task panicked or was cancelled.
    #[error(transparent)]
    Task(#[from] TaskError),
}

impl From<Arc<GitError>> for DeployError {
    fn from(e: Arc<GitError>) -> Self {
        DeployError::Local(e)
    }
}

impl DeployError {
    /// Whether this is a [`DeployError::RevisionMismatch`]
    pub fn is_revision_mismatch(&self) -> bool {
        matches!(self, DeployError::RevisionMismatch { .. })
    }
}

/// Where a host's deploy is, or where it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployPhase {
    /// Resolving the name and opening a session
    Connecting,
    /// Reading the remote revision
    CheckingRevision,
    /// Resetting and pulling the remote checkout
    Refreshing,
    /// Reading the remote revision after a refresh
    Rechecking,
    /// Patch uploaded to a remote temp file
    PatchStaged,
    /// Resetting the checkout and applying the patch
    Applying,
    /// Dropping the staged patch without applying it
    Discarding,
    /// Finished successfully
    Done,
    /// Finished with an error
    Failed,
}

impl fmt::Display for DeployPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeployPhase::Connecting => "connecting",
            DeployPhase::CheckingRevision => "checking revision",
            DeployPhase::Refreshing => "refreshing",
            DeployPhase::Rechecking => "rechecking",
            DeployPhase::PatchStaged => "patch staged",
            DeployPhase::Applying => "applying",
            DeployPhase::Discarding => "discarding",
            DeployPhase::Done => "done",
            DeployPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Result for one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostOutcome {
    /// Server name as given
    pub server: String,
    /// Last phase reached; [`DeployPhase::Done`] on success
    pub phase: DeployPhase,
    /// Revision the remote checkout ended on, when known
    pub revision: Option<String>,
    /// Whether a non-empty patch was applied
    pub patch_applied: bool,
    /// Error message on failure
    pub error: Option<String>,
    /// Whether the failure was a revision mismatch
    pub revision_mismatch: bool,
}

impl HostOutcome {
    /// Whether this host succeeded
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Outcome of a whole deploy.
#[derive(Debug, Clone, Serialize)]
pub struct DeployReport {
    /// One entry per requested server, in request order
    pub outcomes: Vec<HostOutcome>,
    /// Completion time
    pub finished_at: chrono::DateTime<chrono::Local>,
}

impl DeployReport {
    /// Hosts that failed
    pub fn failed(&self) -> impl Iterator<Item = &HostOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    /// Whether every host succeeded
    pub fn is_success(&self) -> bool {
        self.failed().next().is_none()
    }

    /// Process exit status: non-zero if any host failed
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }
}

/// Runs deploys across servers.
pub struct DeployOrchestrator {
    inventory: Arc<Inventory>,
    provider: Arc<dyn SessionProvider>,
    repo: Arc<dyn LocalRepository>,
}

struct DeployRun {
    inventory: Arc<Inventory>,
    provider: Arc<dyn SessionProvider>,
    revision: SharedTask<String, GitError>,
    patch: SharedTask<Bytes, GitError>,
}

impl DeployOrchestrator {
    /// Create an orchestrator
    pub fn new(
        inventory: Arc<Inventory>,
        provider: Arc<dyn SessionProvider>,
        repo: Arc<dyn LocalRepository>,
    ) -> Self {
        Self {
            inventory,
            provider,
            repo,
        }
    }

    /// Deploy to every server in `servers` concurrently.
    pub async fn run(&self, servers: &[String]) -> DeployReport {
        let repo = Arc::clone(&self.repo);
        let revision = SharedTask::spawn("local-revision", async move { repo.revision().await });
        let repo = Arc::clone(&self.repo);
        let patch = SharedTask::spawn("local-patch", async move { repo.patch().await });

        let run = Arc::new(DeployRun {
            inventory: Arc::clone(&self.inventory),
            provider: Arc::clone(&self.provider),
            revision,
            patch,
        });

        let tasks: Vec<_> = servers
            .iter()
            .map(|server| {
                let run = Arc::clone(&run);
                let name = server.clone();
                let handle = TaskHandle::<HostOutcome, DeployError>::spawn(
                    format!("deploy-{}", server),
                    async move { Ok(deploy_host(run, name).await) },
                );
                (server.clone(), handle)
            })
            .collect();

        let mut outcomes = Vec::with_capacity(tasks.len());
        for (server, handle) in tasks {
            let outcome = match handle.join().await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(server = %server, error = ?e, "Deploy task died");
                    failed_outcome(&server, DeployPhase::Failed, &e)
                }
            };
            outcomes.push(outcome);
        }

        let finished_at = chrono::Local::now();
        info!("Done at {}", finished_at.format("%Y-%m-%d %H:%M:%S"));

        DeployReport {
            outcomes,
            finished_at,
        }
    }
}

fn failed_outcome(server: &str, phase: DeployPhase, e: &DeployError) -> HostOutcome {
    HostOutcome {
        server: server.to_string(),
        phase,
        revision: None,
        patch_applied: false,
        error: Some(e.to_string()),
        revision_mismatch: e.is_revision_mismatch(),
    }
}

/// What a successful host deploy ended with.
struct Deployed {
    revision: String,
    patch_applied: bool,
}

struct Progress<'a> {
    server: &'a str,
    phase: DeployPhase,
}

impl Progress<'_> {
    fn enter(&mut self, phase: DeployPhase) {
        debug!(server = %self.server, from = %self.phase, to = %phase, "Deploy phase");
        self.phase = phase;
    }
}

async fn deploy_host(run: Arc<DeployRun>, server: String) -> HostOutcome {
    let mut progress = Progress {
        server: &server,
        phase: DeployPhase::Connecting,
    };

    match deploy_to(&run, &server, &mut progress).await {
        Ok(deployed) => {
            progress.enter(DeployPhase::Done);
            info!(server = %server, revision = %deployed.revision, "Deploy finished");
            HostOutcome {
                server: server.clone(),
                phase: DeployPhase::Done,
                revision: Some(deployed.revision),
                patch_applied: deployed.patch_applied,
                error: None,
                revision_mismatch: false,
            }
        }
        Err(e) => {
            if e.is_revision_mismatch() {
                error!(server = %server, "{}", e);
            } else {
                error!(server = %server, phase = %progress.phase, error = ?e, "Deploy failed");
            }
            failed_outcome(&server, progress.phase, &e)
        }
    }
}

async fn deploy_to(
    run: &DeployRun,
    server: &str,
    progress: &mut Progress<'_>,
) -> Result<Deployed, DeployError> {
    let host = run.inventory.resolve(Some(server)).await?;
    let session = run.provider.acquire(&host.target).await?;
    info!(server = %server, host = %host.target.socket_address(), "Connected");

    let result = deploy_with_session(run, &host, Arc::clone(&session), progress).await;
    run.provider.release(session).await;
    result
}

async fn deploy_with_session(
    run: &DeployRun,
    host: &ResolvedHost,
    session: Arc<dyn RemoteSession>,
    progress: &mut Progress<'_>,
) -> Result<Deployed, DeployError> {
    let dir = host.target.home_dir.clone();

    let staging = TaskHandle::spawn(
        format!("stage-{}", host.name()),
        stage_patch(Arc::clone(&session), run.patch.clone()),
    );

    progress.enter(DeployPhase::CheckingRevision);
    let converged = converge(run, host, session.as_ref(), &dir, progress).await;
    let staged = staging.join().await;

    let temp = staged.as_ref().ok().and_then(Clone::clone);
    if temp.is_some() && converged.is_ok() {
        progress.enter(DeployPhase::PatchStaged);
    }

    let result = match (converged, staged) {
        (Err(e), _) | (Ok(_), Err(e)) => Err(e),
        (Ok(revisions), Ok(_)) if revisions.local == revisions.remote => {
            progress.enter(DeployPhase::Applying);
            apply(session.as_ref(), &dir, temp.as_deref())
                .await
                .map(|()| Deployed {
                    revision: revisions.local,
                    patch_applied: temp.is_some(),
                })
        }
        (Ok(revisions), Ok(_)) => {
            progress.enter(DeployPhase::Discarding);
            Err(DeployError::RevisionMismatch {
                server: host.name().to_string(),
                local: revisions.local,
                remote: revisions.remote,
            })
        }
    };

    if let Some(temp) = &temp {
        remove_temp(session.as_ref(), temp).await;
    }
    result
}

struct Revisions {
    local: String,
    remote: String,
}

/// Read the remote revision; refresh the checkout once if it differs.
async fn converge(
    run: &DeployRun,
    host: &ResolvedHost,
    session: &dyn RemoteSession,
    dir: &str,
    progress: &mut Progress<'_>,
) -> Result<Revisions, DeployError> {
    let remote = remote_revision(session, dir).await?;
    let local = run.revision.join().await?;
    if remote == local {
        debug!(server = %host.name(), revision = %local, "Revisions match");
        return Ok(Revisions { local, remote });
    }

    info!(server = %host.name(), local = %local, remote = %remote, "Remote revision differs, refreshing");
    progress.enter(DeployPhase::Refreshing);
    session.run(&in_dir(dir, "git reset --hard")).await?;
    session.run(&in_dir(dir, "git pull")).await?;

    progress.enter(DeployPhase::Rechecking);
    let remote = remote_revision(session, dir).await?;
    Ok(Revisions { local, remote })
}

async fn remote_revision(session: &dyn RemoteSession, dir: &str) -> Result<String, DeployError> {
    let output = session.run(&in_dir(dir, git::REVISION_COMMAND)).await?;
    Ok(output.stdout_text())
}

/// Upload the shared patch to a fresh remote temp file.
///
/// `None` when there is nothing to apply.
async fn stage_patch(
    session: Arc<dyn RemoteSession>,
    patch: SharedTask<Bytes, GitError>,
) -> Result<Option<String>, DeployError> {
    let patch = patch.join().await?;
    if patch.is_empty() {
        debug!(server = %session.identifier(), "No local changes to stage");
        return Ok(None);
    }

    let temp = session.run(MKTEMP_COMMAND).await?.stdout_text();
    if temp.is_empty() {
        return Err(ConnectionError::CommandFailed {
            command: MKTEMP_COMMAND.to_string(),
            exit_code: 0,
            stderr: "no temp file path returned".to_string(),
        }
        .into());
    }

    if let Err(e) = session.send_file(Path::new(&temp), &patch, None).await {
        remove_temp(session.as_ref(), &temp).await;
        return Err(e.into());
    }
    debug!(server = %session.identifier(), path = %temp, bytes = patch.len(), "Patch staged");
    Ok(Some(temp))
}

async fn apply(
    session: &dyn RemoteSession,
    dir: &str,
    temp: Option<&str>,
) -> Result<(), DeployError> {
    session.run(&in_dir(dir, "git reset --hard")).await?;
    if let Some(temp) = temp {
        let command = format!("git apply --index {}", shell_quote(temp));
        session.run(&in_dir(dir, &command)).await?;
    }
    Ok(())
}

async fn remove_temp(session: &dyn RemoteSession, temp: &str) {
    let command = format!("rm -f {}", shell_quote(temp));
    if let Err(e) = session.run(&command).await {
        warn!(server = %session.identifier(), path = %temp, error = %e, "Failed to remove staged patch");
    }
}

fn in_dir(dir: &str, command: &str) -> String {
    format!("cd {} && {}", shell_quote(dir), command)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_dir_quotes() {
        assert_eq!(in_dir("/srv/app", "git pull"), "cd /srv/app && git pull");
        assert_eq!(
            in_dir("/srv/my app", "git pull"),
            "cd '/srv/my app' && git pull"
        );
    }

    #[test]
    fn test_report_exit_code() {
        let ok = HostOutcome {
            server: "a".into(),
            phase: DeployPhase::Done,
            revision: Some("abc".into()),
            patch_applied: true,
            error: None,
            revision_mismatch: false,
        };
        let err = DeployError::RevisionMismatch {
            server: "b".into(),
            local: "abc".into(),
            remote: "def".into(),
        };
        let bad = failed_outcome("b", DeployPhase::Discarding, &err);
        assert!(bad.revision_mismatch);
        assert_eq!(
            bad.error.as_deref(),
            Some("Revision mismatch on b: local abc, remote def")
        );

        let report = DeployReport {
            outcomes: vec![ok.clone()],
            finished_at: chrono::Local::now(),
        };
        assert_eq!(report.exit_code(), 0);

        let report = DeployReport {
            outcomes: vec![ok, bad],
            finished_at: chrono::Local::now(),
        };
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.failed().count(), 1);
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(DeployPhase::PatchStaged.to_string(), "patch staged");
        assert_eq!(
            serde_json::to_string(&DeployPhase::CheckingRevision).unwrap(),
            "\"checking_revision\""
        );
    }
}
