//! Shared test utilities and fixtures for the devfleet test suite.
//!
//! This module provides:
//! - [`MockSession`]: an in-memory [`RemoteSession`] with a virtual
//!   filesystem, a command log and scripted command replies
//! - [`MockConnector`]: hands out pre-built mock sessions by server name
//! - [`FakeRepository`]: a [`LocalRepository`] with fixed revision and patch
//! - Config builders and local tree helpers
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use devfleet::config::{Config, ServerConfig};
use devfleet::connection::{
    CommandOutput, CommandStream, ConnectionError, ConnectionResult, DirEntry, FileStat,
    ProgressCallback, RemoteSession, SessionConnector, SessionTarget,
};
use devfleet::deploy::{GitError, LocalRepository};

/// Remote home directory used by the fixtures.
pub const HOME: &str = "/home/dev/project";

/// Temp file name returned by the mock's `mktemp`.
pub const TEMP_PATCH: &str = "/tmp/tmp.patch";

// ============================================================================
// Mock Session
// ============================================================================

/// Scripted reply to a remote command.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Exit 0 with this stdout
    Stdout(String),
    /// Exit with this non-zero status
    Exit(u32),
    /// The transport dies while running the command
    Drop,
}

/// In-memory session.
///
/// Commands are matched against scripted rules by substring, in the order the
/// rules were added. Each rule replays its replies in order and then keeps
/// repeating the last one. `mkdir -p`, `rm -f` and `mktemp` act on the
/// virtual filesystem unless a rule overrides them.
pub struct MockSession {
    identifier: String,
    home_dir: String,
    connected: AtomicBool,
    files: RwLock<BTreeMap<PathBuf, Vec<u8>>>,
    dirs: RwLock<BTreeSet<PathBuf>>,
    commands: RwLock<Vec<String>>,
    rules: RwLock<Vec<(String, VecDeque<Reply>)>>,
    closes: AtomicUsize,
    close_calls: AtomicUsize,
    probe_dead: AtomicBool,
    probe_exit: RwLock<u32>,
    probe_delay: RwLock<Option<Duration>>,
    close_delay: RwLock<Option<Duration>>,
}

impl MockSession {
    /// Connected session named `identifier` with home dir [`HOME`].
    pub fn new(identifier: impl Into<String>) -> Arc<Self> {
        let mut dirs = BTreeSet::new();
        dirs.insert(PathBuf::from(HOME));
        Arc::new(Self {
            identifier: identifier.into(),
            home_dir: HOME.to_string(),
            connected: AtomicBool::new(true),
            files: RwLock::new(BTreeMap::new()),
            dirs: RwLock::new(dirs),
            commands: RwLock::new(Vec::new()),
            rules: RwLock::new(Vec::new()),
            closes: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            probe_dead: AtomicBool::new(false),
            probe_exit: RwLock::new(0),
            probe_delay: RwLock::new(None),
            close_delay: RwLock::new(None),
        })
    }

    /// Reply to commands containing `pattern` with `replies`, in order.
    pub fn script(&self, pattern: &str, replies: Vec<Reply>) {
        self.rules
            .write()
            .push((pattern.to_string(), replies.into_iter().collect()));
    }

    /// Make `git rev-parse HEAD` print `revisions` in order.
    pub fn script_revisions(&self, revisions: &[&str]) {
        self.script(
            "git rev-parse HEAD",
            revisions
                .iter()
                .map(|r| Reply::Stdout(format!("{}\n", r)))
                .collect(),
        );
    }

    /// Make the liveness probe fail at the transport level.
    pub fn kill_probe(&self) {
        self.probe_dead.store(true, Ordering::SeqCst);
    }

    /// Make the liveness probe exit with `code`.
    pub fn set_probe_exit(&self, code: u32) {
        *self.probe_exit.write() = code;
    }

    /// Make the liveness probe take `delay` before answering.
    pub fn set_probe_delay(&self, delay: Duration) {
        *self.probe_delay.write() = Some(delay);
    }

    /// Make `close()` take `delay` before releasing the connection.
    pub fn set_close_delay(&self, delay: Duration) {
        *self.close_delay.write() = Some(delay);
    }

    /// Mark the session as disconnected without closing it.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Commands run so far
    pub fn commands(&self) -> Vec<String> {
        self.commands.read().clone()
    }

    /// Commands containing `pattern`
    pub fn commands_matching(&self, pattern: &str) -> Vec<String> {
        self.commands
            .read()
            .iter()
            .filter(|c| c.contains(pattern))
            .cloned()
            .collect()
    }

    /// Number of times the connection was actually released
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Number of `close()` calls
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Content of a remote file
    pub fn file(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.files.read().get(path.as_ref()).cloned()
    }

    /// Whether a remote file exists
    pub fn has_file(&self, path: impl AsRef<Path>) -> bool {
        self.files.read().contains_key(path.as_ref())
    }

    /// Create a remote file and its parent directories
    pub fn put_file(&self, path: impl AsRef<Path>, content: impl Into<Vec<u8>>) {
        let path = path.as_ref().to_path_buf();
        self.add_ancestors(&path);
        self.files.write().insert(path, content.into());
    }

    /// Create a remote directory and its parents
    pub fn put_dir(&self, path: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        self.add_ancestors(&path);
        self.dirs.write().insert(path);
    }

    fn add_ancestors(&self, path: &Path) {
        let mut dirs = self.dirs.write();
        for ancestor in path.ancestors().skip(1) {
            if ancestor.as_os_str().is_empty() {
                continue;
            }
            dirs.insert(ancestor.to_path_buf());
        }
    }

    fn ensure_connected(&self) -> ConnectionResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ConnectionError::ConnectionClosed)
        }
    }

    fn scripted(&self, command: &str) -> Option<Reply> {
        let mut rules = self.rules.write();
        let (_, replies) = rules.iter_mut().find(|(p, _)| command.contains(p.as_str()))?;
        if replies.len() > 1 {
            replies.pop_front()
        } else {
            replies.front().cloned()
        }
    }

    fn builtin(&self, command: &str) -> Reply {
        let argv = shell_words::split(command).unwrap_or_default();
        match argv.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
            ["mkdir", "-p", path] => {
                self.put_dir(path);
                Reply::Stdout(String::new())
            }
            ["rm", "-f", path] => {
                self.files.write().remove(Path::new(path));
                Reply::Stdout(String::new())
            }
            ["mktemp"] => {
                self.put_file(TEMP_PATCH, Vec::new());
                Reply::Stdout(format!("{}\n", TEMP_PATCH))
            }
            _ => Reply::Stdout(String::new()),
        }
    }
}

#[async_trait]
impl RemoteSession for MockSession {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn home_dir(&self) -> &str {
        &self.home_dir
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn run(&self, command: &str) -> ConnectionResult<CommandOutput> {
        self.ensure_connected()?;
        self.commands.write().push(command.to_string());

        let reply = match self.scripted(command) {
            Some(reply) => reply,
            None => self.builtin(command),
        };

        match reply {
            Reply::Stdout(stdout) => Ok(CommandOutput {
                stdout: stdout.into_bytes(),
                stderr: Vec::new(),
                exit_code: 0,
            }),
            Reply::Exit(code) => Err(ConnectionError::CommandFailed {
                command: command.to_string(),
                exit_code: code,
                stderr: "scripted failure".to_string(),
            }),
            Reply::Drop => {
                self.connected.store(false, Ordering::SeqCst);
                Err(ConnectionError::SshError("channel closed".to_string()))
            }
        }
    }

    async fn run_stream(&self, command: &str) -> ConnectionResult<CommandStream> {
        self.ensure_connected()?;
        self.commands.write().push(command.to_string());

        let delay = *self.probe_delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.probe_dead.load(Ordering::SeqCst) {
            return Err(ConnectionError::SshError("broken pipe".to_string()));
        }
        let code = *self.probe_exit.read();
        Ok(CommandStream::completed(b"\n".to_vec(), Vec::new(), code))
    }

    async fn send_file(
        &self,
        remote_path: &Path,
        content: &[u8],
        progress: Option<ProgressCallback>,
    ) -> ConnectionResult<()> {
        self.ensure_connected()?;
        self.put_file(remote_path, content.to_vec());
        if let Some(progress) = progress {
            progress(content.len() as u64, content.len() as u64);
        }
        Ok(())
    }

    async fn download_content(
        &self,
        remote_path: &Path,
        progress: Option<ProgressCallback>,
    ) -> ConnectionResult<Vec<u8>> {
        self.ensure_connected()?;
        let content = self
            .file(remote_path)
            .ok_or_else(|| ConnectionError::NotFound(remote_path.display().to_string()))?;
        if let Some(progress) = progress {
            progress(content.len() as u64, content.len() as u64);
        }
        Ok(content)
    }

    async fn stat(&self, path: &Path) -> ConnectionResult<Option<FileStat>> {
        self.ensure_connected()?;
        if let Some(content) = self.files.read().get(path) {
            return Ok(Some(FileStat::file(content.len() as u64)));
        }
        if self.dirs.read().contains(path) {
            return Ok(Some(FileStat::dir()));
        }
        Ok(None)
    }

    async fn list_dir(&self, path: &Path) -> ConnectionResult<Vec<DirEntry>> {
        self.ensure_connected()?;
        if !self.dirs.read().contains(path) {
            return Err(ConnectionError::NotFound(path.display().to_string()));
        }

        let name_of = |p: &Path| p.file_name().map(|n| n.to_string_lossy().into_owned());
        let mut entries: Vec<DirEntry> = Vec::new();
        for (file, content) in self.files.read().iter() {
            if file.parent() == Some(path) {
                if let Some(name) = name_of(file) {
                    entries.push(DirEntry {
                        name,
                        stat: FileStat::file(content.len() as u64),
                    });
                }
            }
        }
        for dir in self.dirs.read().iter() {
            if dir.parent() == Some(path) {
                if let Some(name) = name_of(dir) {
                    entries.push(DirEntry {
                        name,
                        stat: FileStat::dir(),
                    });
                }
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn close(&self) -> ConnectionResult<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.close_delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.connected.swap(false, Ordering::SeqCst) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

// ============================================================================
// Mock Connector
// ============================================================================

/// Opens pre-registered mock sessions by server name.
#[derive(Default)]
pub struct MockConnector {
    sessions: RwLock<HashMap<String, Vec<Arc<MockSession>>>>,
    connects: RwLock<Vec<SessionTarget>>,
}

impl MockConnector {
    /// Empty connector; unknown servers fail to connect
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Hand out `session` for `server`. Several sessions for one server are
    /// handed out in registration order; the last one is reused.
    pub fn add(&self, server: &str, session: Arc<MockSession>) {
        self.sessions
            .write()
            .entry(server.to_string())
            .or_default()
            .push(session);
    }

    /// Targets connected to so far
    pub fn connects(&self) -> Vec<SessionTarget> {
        self.connects.read().clone()
    }
}

#[async_trait]
impl SessionConnector for MockConnector {
    async fn connect(&self, target: &SessionTarget) -> ConnectionResult<Arc<dyn RemoteSession>> {
        self.connects.write().push(target.clone());
        let mut sessions = self.sessions.write();
        let queue = sessions.get_mut(&target.name).ok_or_else(|| {
            ConnectionError::ConnectionFailed(format!("no route to {}", target.host))
        })?;
        let session: Arc<dyn RemoteSession> = if queue.len() > 1 {
            queue.remove(0)
        } else {
            Arc::<MockSession>::clone(&queue[0])
        };
        Ok(session)
    }
}

// ============================================================================
// Fake Repository
// ============================================================================

/// Local repository with a fixed revision and patch.
pub struct FakeRepository {
    revision: Result<String, String>,
    patch: Bytes,
    revision_calls: AtomicUsize,
    patch_calls: AtomicUsize,
}

impl FakeRepository {
    /// Repository at `revision` with uncommitted changes `patch`
    pub fn new(revision: &str, patch: &str) -> Arc<Self> {
        Arc::new(Self {
            revision: Ok(revision.to_string()),
            patch: Bytes::from(patch.to_string()),
            revision_calls: AtomicUsize::new(0),
            patch_calls: AtomicUsize::new(0),
        })
    }

    /// Repository whose `git rev-parse` fails
    pub fn broken(stderr: &str) -> Arc<Self> {
        Arc::new(Self {
            revision: Err(stderr.to_string()),
            patch: Bytes::new(),
            revision_calls: AtomicUsize::new(0),
            patch_calls: AtomicUsize::new(0),
        })
    }

    /// How often the revision was computed
    pub fn revision_calls(&self) -> usize {
        self.revision_calls.load(Ordering::SeqCst)
    }

    /// How often the patch was computed
    pub fn patch_calls(&self) -> usize {
        self.patch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocalRepository for FakeRepository {
    async fn revision(&self) -> Result<String, GitError> {
        self.revision_calls.fetch_add(1, Ordering::SeqCst);
        self.revision.clone().map_err(|stderr| GitError::Failed {
            command: "git rev-parse HEAD".to_string(),
            exit_code: Some(128),
            stderr,
        })
    }

    async fn patch(&self) -> Result<Bytes, GitError> {
        self.patch_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.patch.clone())
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// Config with one static server per name, all rooted at [`HOME`].
pub fn fleet_config(servers: &[&str]) -> Config {
    let mut config = Config::default();
    for (i, name) in servers.iter().enumerate() {
        config.servers.insert(
            name.to_string(),
            ServerConfig {
                address: format!("10.0.0.{}", i + 1),
                user: "dev".to_string(),
                home_dir: HOME.to_string(),
                private_key: None,
                host_key_policy: None,
            },
        );
    }
    config.default = servers.first().map(|s| s.to_string());
    config
}

/// Write `files` (relative path, content) under `root`.
pub fn write_tree(root: &Path, files: &[(&str, &str)]) {
    for (path, content) in files {
        let path = root.join(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }
}

/// Every file and directory under `root`, relative, with file contents.
pub fn read_tree(root: &Path) -> BTreeMap<PathBuf, Option<Vec<u8>>> {
    walkdir::WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .map(|entry| {
            let entry = entry.unwrap();
            let relative = entry.path().strip_prefix(root).unwrap().to_path_buf();
            let content = if entry.file_type().is_file() {
                Some(std::fs::read(entry.path()).unwrap())
            } else {
                None
            };
            (relative, content)
        })
        .collect()
}
