//! SSH sessions backed by russh.
//!
//! A [`RusshSession`] owns one client handle. Commands open a fresh channel
//! each; file operations share a single SFTP sub-channel that is opened on
//! first use and kept until the session closes.

use async_trait::async_trait;
use russh::client::{Handle, Handler};
use russh::keys::key::PublicKey;
use russh::keys::load_secret_key;
use russh::{Channel, ChannelMsg};
use russh_keys::agent::client::AgentClient;
use russh_sftp::client::SftpSession;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, trace, warn};

use super::config::{HostKeyPolicy, SessionOptions, SessionTarget};
use super::{
    CommandOutput, CommandStream, ConnectionError, ConnectionResult, DirEntry, FileStat,
    ProgressCallback, RemoteSession, RusshError,
};

/// SFTP read/write chunk size; progress is reported once per chunk.
const CHUNK_SIZE: usize = 64 * 1024;

/// Capacity of the in-memory pipes behind [`CommandStream`].
const STREAM_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostKeyStatus {
    Verified,
    Unknown,
    Mismatch,
}

/// Parsed `~/.ssh/known_hosts`.
#[derive(Default)]
struct KnownHosts {
    entries: Vec<(Vec<String>, PublicKey)>,
}

impl KnownHosts {
    fn load() -> Self {
        let Some(path) = dirs::home_dir().map(|h| h.join(".ssh").join("known_hosts")) else {
            return Self::default();
        };
        match std::fs::read_to_string(&path) {
            Ok(content) => Self::parse(&content),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "known_hosts not readable");
                Self::default()
            }
        }
    }

    /// Parse `patterns keytype base64 [comment]` lines; hashed or malformed
    /// entries are skipped.
    fn parse(content: &str) -> Self {
        let mut entries = Vec::new();
        for line in content.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(patterns), Some(_key_type), Some(encoded)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let Ok(blob) =
                base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded)
            else {
                continue;
            };
            match russh::keys::key::parse_public_key(&blob, None) {
                Ok(key) => entries.push((patterns.split(',').map(String::from).collect(), key)),
                Err(_) => trace!(patterns = %patterns, "Skipping unparseable known_hosts key"),
            }
        }
        debug!(entry_count = entries.len(), "Loaded known_hosts entries");
        Self { entries }
    }

    fn check(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyStatus {
        let fingerprint = key.fingerprint();
        let mut listed = false;
        for (patterns, known) in &self.entries {
            if patterns.iter().any(|p| host_pattern_matches(p, host, port)) {
                if known.fingerprint() == fingerprint {
                    return HostKeyStatus::Verified;
                }
                listed = true;
            }
        }
        if listed {
            HostKeyStatus::Mismatch
        } else {
            HostKeyStatus::Unknown
        }
    }
}

/// Match one known_hosts pattern (`host`, `[host]:port`, or a glob).
fn host_pattern_matches(pattern: &str, host: &str, port: u16) -> bool {
    if let Some(rest) = pattern.strip_prefix('[') {
        return match rest.split_once("]:") {
            Some((p_host, p_port)) => p_host == host && p_port.parse::<u16>().ok() == Some(port),
            None => false,
        };
    }
    if port != 22 {
        return false;
    }
    if pattern.contains(['*', '?']) {
        return glob::Pattern::new(pattern).map_or(false, |p| p.matches(host));
    }
    pattern == host
}

/// russh client callbacks: host key verification.
struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    known_hosts: KnownHosts,
}

impl ClientHandler {
    fn new(target: &SessionTarget, policy: HostKeyPolicy) -> Self {
        let known_hosts = match policy {
            HostKeyPolicy::AcceptAny => KnownHosts::default(),
            _ => KnownHosts::load(),
        };
        Self {
            host: target.host.clone(),
            port: target.port,
            policy,
            known_hosts,
        }
    }
}

#[async_trait]
impl Handler for ClientHandler {
    type Error = RusshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        if self.policy == HostKeyPolicy::AcceptAny {
            trace!(host = %self.host, "Host key check disabled");
            return Ok(true);
        }

        match self
            .known_hosts
            .check(&self.host, self.port, server_public_key)
        {
            HostKeyStatus::Verified => {
                debug!(host = %self.host, "Host key verified against known_hosts");
                Ok(true)
            }
            HostKeyStatus::Unknown if self.policy == HostKeyPolicy::AcceptNew => {
                warn!(host = %self.host, "Host not found in known_hosts, accepting");
                Ok(true)
            }
            HostKeyStatus::Unknown => {
                warn!(host = %self.host, "Host not found in known_hosts, rejecting");
                Ok(false)
            }
            HostKeyStatus::Mismatch => {
                warn!(
                    host = %self.host,
                    "HOST KEY VERIFICATION FAILED! Server key does not match known_hosts entry."
                );
                Ok(false)
            }
        }
    }
}

/// An authenticated SSH connection.
pub struct RusshSession {
    identifier: String,
    home_dir: String,
    handle: RwLock<Option<Handle<ClientHandler>>>,
    sftp: Mutex<Option<Arc<SftpSession>>>,
    connected: Arc<AtomicBool>,
}

impl RusshSession {
    /// Connect and authenticate, bounded by the configured connect timeout.
    pub async fn connect(
        target: &SessionTarget,
        options: &SessionOptions,
    ) -> ConnectionResult<Self> {
        let timeout = options.connect_timeout();
        debug!(
            server = %target.name,
            address = %target.socket_address(),
            user = %target.username,
            "Opening SSH session"
        );

        let handle = tokio::time::timeout(timeout, Self::do_connect(target, options))
            .await
            .map_err(|_| ConnectionError::Timeout(timeout.as_secs()))??;

        debug!(server = %target.name, "SSH session established");
        Ok(Self {
            identifier: target.name.clone(),
            home_dir: target.home_dir.clone(),
            handle: RwLock::new(Some(handle)),
            sftp: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(true)),
        })
    }

    async fn do_connect(
        target: &SessionTarget,
        options: &SessionOptions,
    ) -> ConnectionResult<Handle<ClientHandler>> {
        let config = Arc::new(russh::client::Config::default());

        let addr = target.socket_address();
        let socket = tokio::net::TcpStream::connect(&addr).await.map_err(|e| {
            ConnectionError::ConnectionFailed(format!("Failed to connect to {}: {}", addr, e))
        })?;
        socket.set_nodelay(true).map_err(|e| {
            ConnectionError::ConnectionFailed(format!("Failed to set TCP_NODELAY: {}", e))
        })?;

        let policy = target.host_key_policy.unwrap_or(options.host_key_policy);
        let handler = ClientHandler::new(target, policy);

        let mut session = russh::client::connect_stream(config, socket, handler)
            .await
            .map_err(|e| {
                ConnectionError::ConnectionFailed(format!("SSH handshake with {} failed: {}", addr, e))
            })?;

        Self::authenticate(&mut session, target, options).await?;
        Ok(session)
    }

    /// Configured (or default) key first, then the agent.
    async fn authenticate(
        session: &mut Handle<ClientHandler>,
        target: &SessionTarget,
        options: &SessionOptions,
    ) -> ConnectionResult<()> {
        let key_path = target.key_path();
        let key_error = match Self::try_key_auth(session, &target.username, &key_path).await {
            Ok(()) => {
                debug!(key = %key_path.display(), "Authenticated using key");
                return Ok(());
            }
            Err(e) => e,
        };
        trace!(error = %key_error, "Key authentication unavailable");

        if options.use_agent {
            match Self::try_agent_auth(session, &target.username).await {
                Ok(()) => {
                    debug!("Authenticated using SSH agent");
                    return Ok(());
                }
                Err(e) => trace!(error = %e, "Agent authentication unavailable"),
            }
        }

        Err(ConnectionError::AuthenticationFailed(format!(
            "{}@{}: {}",
            target.username, target.host, key_error
        )))
    }

    async fn try_key_auth(
        session: &mut Handle<ClientHandler>,
        user: &str,
        key_path: &Path,
    ) -> ConnectionResult<()> {
        if !key_path.exists() {
            return Err(ConnectionError::AuthenticationFailed(format!(
                "Key file not found: {}",
                key_path.display()
            )));
        }

        let key_pair = load_secret_key(key_path, None).map_err(|e| {
            ConnectionError::AuthenticationFailed(format!(
                "Failed to load key {}: {}",
                key_path.display(),
                e
            ))
        })?;

        let authenticated = session
            .authenticate_publickey(user, Arc::new(key_pair))
            .await
            .map_err(|e| {
                ConnectionError::AuthenticationFailed(format!(
                    "Key authentication failed for {}: {}",
                    key_path.display(),
                    e
                ))
            })?;

        if authenticated {
            Ok(())
        } else {
            Err(ConnectionError::AuthenticationFailed(format!(
                "Key {} rejected",
                key_path.display()
            )))
        }
    }

    async fn try_agent_auth(
        session: &mut Handle<ClientHandler>,
        user: &str,
    ) -> ConnectionResult<()> {
        let mut agent = AgentClient::connect_env().await.map_err(|e| {
            ConnectionError::AuthenticationFailed(format!("Failed to connect to SSH agent: {}", e))
        })?;

        let identities = agent.request_identities().await.map_err(|e| {
            ConnectionError::AuthenticationFailed(format!("Failed to get agent identities: {}", e))
        })?;

        for identity in identities {
            let (returned_agent, result) = session
                .authenticate_future(user, identity.clone(), agent)
                .await;
            agent = returned_agent;

            match result {
                Ok(true) => return Ok(()),
                Ok(false) => trace!("Agent identity rejected, trying next"),
                Err(e) => trace!(error = %e, "Agent authentication attempt failed"),
            }
        }

        Err(ConnectionError::AuthenticationFailed(
            "No SSH agent identity accepted".to_string(),
        ))
    }

    fn ensure_connected(&self) -> ConnectionResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ConnectionError::ConnectionClosed)
        }
    }

    /// Open a channel and start `command` on it.
    async fn exec(&self, command: &str) -> ConnectionResult<Channel<russh::client::Msg>> {
        self.ensure_connected()?;
        trace!(server = %self.identifier, command = %command, "Executing remote command");

        let handle_guard = self.handle.read().await;
        let handle = handle_guard
            .as_ref()
            .ok_or(ConnectionError::ConnectionClosed)?;

        let channel = match handle.channel_open_session().await {
            Ok(channel) => channel,
            Err(e) => {
                self.connected.store(false, Ordering::SeqCst);
                return Err(ConnectionError::SshError(format!(
                    "Failed to open channel: {}",
                    e
                )));
            }
        };
        drop(handle_guard);

        channel.exec(true, command).await.map_err(|e| {
            ConnectionError::SshError(format!("Failed to execute command: {}", e))
        })?;
        Ok(channel)
    }

    /// The session's SFTP sub-channel, opened on first use.
    async fn sftp(&self) -> ConnectionResult<Arc<SftpSession>> {
        self.ensure_connected()?;
        let mut slot = self.sftp.lock().await;
        if let Some(sftp) = slot.as_ref() {
            return Ok(Arc::clone(sftp));
        }

        let handle_guard = self.handle.read().await;
        let handle = handle_guard
            .as_ref()
            .ok_or(ConnectionError::ConnectionClosed)?;

        let channel = handle.channel_open_session().await.map_err(|e| {
            ConnectionError::TransferFailed(format!("Failed to open channel: {}", e))
        })?;
        channel.request_subsystem(true, "sftp").await.map_err(|e| {
            ConnectionError::TransferFailed(format!("Failed to request SFTP subsystem: {}", e))
        })?;
        let sftp = SftpSession::new(channel.into_stream()).await.map_err(|e| {
            ConnectionError::TransferFailed(format!("Failed to create SFTP session: {}", e))
        })?;

        trace!(server = %self.identifier, "SFTP sub-channel opened");
        let sftp = Arc::new(sftp);
        *slot = Some(Arc::clone(&sftp));
        Ok(sftp)
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn is_not_found(error: &russh_sftp::client::error::Error) -> bool {
    let message = error.to_string().to_lowercase();
    message.contains("no such file") || message.contains("not found")
}

fn report(progress: &Option<ProgressCallback>, done: u64, total: u64) {
    if let Some(callback) = progress {
        callback(done, total);
    }
}

#[async_trait]
impl RemoteSession for RusshSession {
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
        let mut channel = self.exec(command).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                    stderr.extend_from_slice(data)
                }
                ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        let exit_code = exit_code.ok_or_else(|| {
            ConnectionError::SshError(format!("'{}' ended without an exit status", command))
        })?;
        trace!(exit_code, "Command completed");

        if exit_code != 0 {
            return Err(ConnectionError::CommandFailed {
                command: command.to_string(),
                exit_code,
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    async fn run_stream(&self, command: &str) -> ConnectionResult<CommandStream> {
        let mut channel = self.exec(command).await?;

        let (stdout_reader, stdout_writer) = tokio::io::duplex(STREAM_BUFFER);
        let (stderr_reader, stderr_writer) = tokio::io::duplex(STREAM_BUFFER);
        let (exit_tx, exit_rx) = oneshot::channel();
        let connected = Arc::clone(&self.connected);

        tokio::spawn(async move {
            // A writer becomes None once its reader is gone; output is then discarded.
            let mut stdout = Some(stdout_writer);
            let mut stderr = Some(stderr_writer);
            let mut exit_code = None;

            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { ref data } => {
                        if let Some(w) = stdout.as_mut() {
                            if w.write_all(data).await.is_err() {
                                stdout = None;
                            }
                        }
                    }
                    ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                        if let Some(w) = stderr.as_mut() {
                            if w.write_all(data).await.is_err() {
                                stderr = None;
                            }
                        }
                    }
                    ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
                    ChannelMsg::Close => break,
                    _ => {}
                }
            }
            drop(stdout);
            drop(stderr);

            let result = match exit_code {
                Some(code) => Ok(code),
                None => {
                    connected.store(false, Ordering::SeqCst);
                    Err(ConnectionError::ConnectionClosed)
                }
            };
            let _ = exit_tx.send(result);
        });

        Ok(CommandStream::new(
            Box::pin(stdout_reader),
            Box::pin(stderr_reader),
            exit_rx,
        ))
    }

    async fn send_file(
        &self,
        remote_path: &Path,
        content: &[u8],
        progress: Option<ProgressCallback>,
    ) -> ConnectionResult<()> {
        debug!(
            remote = %remote_path.display(),
            size = content.len(),
            "Uploading content via SFTP"
        );
        let sftp = self.sftp().await?;

        let mut remote_file = sftp.create(path_string(remote_path)).await.map_err(|e| {
            ConnectionError::TransferFailed(format!(
                "Failed to create remote file {}: {}",
                remote_path.display(),
                e
            ))
        })?;

        let total = content.len() as u64;
        let mut done = 0u64;
        report(&progress, done, total);

        for chunk in content.chunks(CHUNK_SIZE) {
            remote_file.write_all(chunk).await.map_err(|e| {
                ConnectionError::TransferFailed(format!(
                    "Failed to write to remote file {}: {}",
                    remote_path.display(),
                    e
                ))
            })?;
            done += chunk.len() as u64;
            report(&progress, done, total);
        }

        remote_file.shutdown().await.map_err(|e| {
            ConnectionError::TransferFailed(format!(
                "Failed to close remote file {}: {}",
                remote_path.display(),
                e
            ))
        })?;
        Ok(())
    }

    async fn download_content(
        &self,
        remote_path: &Path,
        progress: Option<ProgressCallback>,
    ) -> ConnectionResult<Vec<u8>> {
        debug!(remote = %remote_path.display(), "Downloading content via SFTP");
        let sftp = self.sftp().await?;
        let path = path_string(remote_path);

        let total = match sftp.metadata(path.clone()).await {
            Ok(attrs) => attrs.size.unwrap_or(0),
            Err(e) if is_not_found(&e) => {
                return Err(ConnectionError::NotFound(path));
            }
            Err(e) => return Err(e.into()),
        };

        let mut remote_file = sftp.open(path).await.map_err(|e| {
            ConnectionError::TransferFailed(format!(
                "Failed to open remote file {}: {}",
                remote_path.display(),
                e
            ))
        })?;

        let mut content = Vec::with_capacity(total as usize);
        let mut buf = vec![0u8; CHUNK_SIZE];
        report(&progress, 0, total);

        loop {
            let n = remote_file.read(&mut buf).await.map_err(|e| {
                ConnectionError::TransferFailed(format!(
                    "Failed to read remote file {}: {}",
                    remote_path.display(),
                    e
                ))
            })?;
            if n == 0 {
                break;
            }
            content.extend_from_slice(&buf[..n]);
            report(&progress, content.len() as u64, total.max(content.len() as u64));
        }

        debug!(size = content.len(), "Content download completed");
        Ok(content)
    }

    async fn stat(&self, path: &Path) -> ConnectionResult<Option<FileStat>> {
        trace!(path = %path.display(), "Getting file stats via SFTP");
        let sftp = self.sftp().await?;

        match sftp.metadata(path_string(path)).await {
            Ok(attrs) => Ok(Some(FileStat {
                size: attrs.size.unwrap_or(0),
                mode: attrs.permissions,
                mtime: attrs.mtime,
                is_dir: attrs.is_dir(),
            })),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_dir(&self, path: &Path) -> ConnectionResult<Vec<DirEntry>> {
        let sftp = self.sftp().await?;

        let read_dir = match sftp.read_dir(path_string(path)).await {
            Ok(read_dir) => read_dir,
            Err(e) if is_not_found(&e) => {
                return Err(ConnectionError::NotFound(path_string(path)))
            }
            Err(e) => {
                return Err(ConnectionError::TransferFailed(format!(
                    "Failed to read remote directory {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let mut entries: Vec<DirEntry> = read_dir
            .filter_map(|entry| {
                let name = entry.file_name();
                if name == "." || name == ".." {
                    return None;
                }
                let attrs = entry.metadata();
                Some(DirEntry {
                    name,
                    stat: FileStat {
                        size: attrs.size.unwrap_or(0),
                        mode: attrs.permissions,
                        mtime: attrs.mtime,
                        is_dir: attrs.is_dir(),
                    },
                })
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn close(&self) -> ConnectionResult<()> {
        self.connected.store(false, Ordering::SeqCst);

        drop(self.sftp.lock().await.take());

        let handle = self.handle.write().await.take();
        if let Some(handle) = handle {
            debug!(server = %self.identifier, "Closing SSH session");
            let _ = handle
                .disconnect(
                    russh::Disconnect::ByApplication,
                    "Session closed by client",
                    "en",
                )
                .await;
        }

        Ok(())
    }
}

impl std::fmt::Debug for RusshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RusshSession")
            .field("identifier", &self.identifier)
            .field("home_dir", &self.home_dir)
            .field("connected", &self.is_connected())
            .finish()
    }
}
