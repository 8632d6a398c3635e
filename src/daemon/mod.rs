//! Long-running session server.
//!
//! `devfleet serve` keeps one [`SessionRegistry`] alive across commands, so
//! repeated deploys and transfers reuse their SSH sessions while the
//! [`LivenessMonitor`] drops the ones that die.
//!
//! A request is the command name followed by its arguments, NUL-separated,
//! ended by the client half-closing the connection. The response is a stream
//! of [`Frame`]s ending with an [`FrameKind::Exit`] frame. Interactive work
//! (the ssh shell, the browser) is handed back to the client as
//! [`FrameKind::Exec`] and [`FrameKind::BrowseUrl`] frames. While a request
//! runs, its log lines reach the client as [`FrameKind::Stderr`] frames when
//! the process subscriber carries the [`LogRouter`] layer.

pub mod codec;
pub mod logs;

use futures::SinkExt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::Config;
use crate::connection::{
    LivenessMonitor, MonitorHandle, PooledProvider, RusshConnector, SessionProvider,
    SessionRegistry,
};
use crate::deploy::{DeployOrchestrator, LocalRepository};
use crate::error::{Error, Result};
use crate::inventory::Inventory;
use crate::transfer::{self, Direction, TransferRequest};

pub use codec::{Frame, FrameCodec, FrameKind};
pub use logs::{ClientLogLayer, LogRouter};

/// Largest request accepted.
pub const MAX_REQUEST_LEN: u64 = 64 * 1024;

const SEPARATOR: char = '\0';

/// A command sent to the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Deploy to the named servers
    Deploy {
        /// Server names
        servers: Vec<String>,
    },
    /// Transfer files; local paths must be absolute
    Transfer(TransferRequest),
    /// Open an interactive shell
    Ssh {
        /// Server name, `None` for the default
        server: Option<String>,
    },
    /// Open a server's HTTP port in the browser
    Open {
        /// Server name, `None` for the default
        server: Option<String>,
        /// Port
        port: u16,
    },
}

fn optional(part: &str) -> Option<String> {
    if part.is_empty() {
        None
    } else {
        Some(part.to_string())
    }
}

fn flag(part: &str) -> Result<bool> {
    match part {
        "" => Ok(false),
        "1" => Ok(true),
        other => Err(Error::Protocol(format!("invalid flag '{}'", other))),
    }
}

impl Request {
    /// Wire parts: command name first.
    pub fn to_parts(&self) -> Vec<String> {
        match self {
            Request::Deploy { servers } => std::iter::once("deploy".to_string())
                .chain(servers.iter().cloned())
                .collect(),
            Request::Transfer(t) => vec![
                "transfer".to_string(),
                t.server.clone().unwrap_or_default(),
                t.direction.to_string(),
                t.source.to_string_lossy().into_owned(),
                t.destination
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                if t.skip_existing { "1" } else { "" }.to_string(),
                t.pattern.clone().unwrap_or_default(),
            ],
            Request::Ssh { server } => vec!["ssh".to_string(), server.clone().unwrap_or_default()],
            Request::Open { server, port } => vec![
                "open".to_string(),
                server.clone().unwrap_or_default(),
                port.to_string(),
            ],
        }
    }

    /// Encoded request body.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_parts().join("\0").into_bytes()
    }

    /// Parse a request body.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| Error::Protocol(format!("request is not UTF-8: {}", e)))?;
        let parts: Vec<&str> = text.split(SEPARATOR).collect();

        match parts.as_slice() {
            ["deploy", servers @ ..] => Ok(Request::Deploy {
                servers: servers.iter().map(|s| s.to_string()).collect(),
            }),
            ["transfer", server, direction, source, destination, skip, pattern] => {
                let direction: Direction = direction
                    .parse()
                    .map_err(|e: crate::connection::ConnectionError| {
                        Error::Protocol(e.to_string())
                    })?;
                Ok(Request::Transfer(TransferRequest {
                    server: optional(server),
                    direction,
                    source: PathBuf::from(source),
                    destination: optional(destination).map(PathBuf::from),
                    skip_existing: flag(skip)?,
                    pattern: optional(pattern),
                }))
            }
            ["ssh", server] => Ok(Request::Ssh {
                server: optional(server),
            }),
            ["open", server, port] => Ok(Request::Open {
                server: optional(server),
                port: port
                    .parse()
                    .map_err(|_| Error::Protocol(format!("invalid port '{}'", port)))?,
            }),
            [command, ..] => Err(Error::Protocol(format!(
                "unknown or malformed request '{}'",
                command
            ))),
            [] => Err(Error::Protocol("empty request".to_string())),
        }
    }
}

type FrameSink = FramedWrite<TcpStream, FrameCodec>;

/// Response frames produced while a request runs.
type FrameSender = UnboundedSender<Frame>;

fn emit(out: &FrameSender, frame: Frame) {
    // The receiver lives until the request finishes.
    let _ = out.send(frame);
}

/// The session server.
pub struct Daemon {
    inventory: Arc<Inventory>,
    provider: Arc<dyn SessionProvider>,
    repo: Arc<dyn LocalRepository>,
    registry: Option<Arc<SessionRegistry>>,
    monitor: Option<MonitorHandle>,
    logs: LogRouter,
}

impl Daemon {
    /// Daemon over an arbitrary provider, without a liveness monitor.
    pub fn new(
        inventory: Arc<Inventory>,
        provider: Arc<dyn SessionProvider>,
        repo: Arc<dyn LocalRepository>,
    ) -> Self {
        Self {
            inventory,
            provider,
            repo,
            registry: None,
            monitor: None,
            logs: LogRouter::new(),
        }
    }

    /// Forward request log lines through `router`, whose layer the caller
    /// has installed in the subscriber.
    pub fn with_log_router(mut self, router: LogRouter) -> Self {
        self.logs = router;
        self
    }

    /// Daemon pooling SSH sessions in a registry watched by a
    /// [`LivenessMonitor`]. Must be called inside a tokio runtime.
    pub fn pooled(config: &Config, inventory: Arc<Inventory>, repo: Arc<dyn LocalRepository>) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let connector = Arc::new(RusshConnector::new(config.ssh.clone()));
        let provider = Arc::new(PooledProvider::new(Arc::clone(&registry), connector));
        let monitor = LivenessMonitor::start(Arc::clone(&registry), config.monitor.clone());

        Self {
            inventory,
            provider,
            repo,
            registry: Some(registry),
            monitor: Some(monitor),
            logs: LogRouter::new(),
        }
    }

    /// Accept connections until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(address = %listener.local_addr()?, "Daemon listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            let daemon = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = daemon.handle_connection(stream, peer).await {
                    warn!(peer = %peer, error = %e, "Connection failed");
                }
            });
        }
    }

    /// Stop the monitor and close every pooled session.
    pub async fn shutdown(&self) {
        if let Some(monitor) = &self.monitor {
            monitor.stop();
        }
        if let Some(registry) = &self.registry {
            registry.close_all().await;
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let mut body = Vec::new();
        (&mut stream)
            .take(MAX_REQUEST_LEN + 1)
            .read_to_end(&mut body)
            .await?;

        let parsed = if body.len() as u64 > MAX_REQUEST_LEN {
            Err(Error::Protocol(format!(
                "request too large (limit {} bytes)",
                MAX_REQUEST_LEN
            )))
        } else {
            Request::parse(&body)
        };

        let mut frames = FramedWrite::new(stream, FrameCodec);
        let code = match parsed {
            Ok(request) => {
                debug!(peer = %peer, request = ?request, "Request received");
                self.run_request(request, peer, &mut frames).await?
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "Rejected request");
                frames.send(Frame::stderr(format!("Error: {}", e))).await?;
                2
            }
        };

        frames.send(Frame::exit(code)).await?;
        frames.get_mut().shutdown().await?;
        Ok(())
    }

    /// Run `request`, writing its frames and log lines to the client as they
    /// are produced. Returns the exit code.
    async fn run_request(
        &self,
        request: Request,
        peer: SocketAddr,
        frames: &mut FrameSink,
    ) -> Result<i32> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = self.logs.register(tx.clone());
        let span = info_span!("request", client = client.id(), peer = %peer);

        let result = {
            let work = self.dispatch(request, &tx).instrument(span);
            tokio::pin!(work);
            loop {
                tokio::select! {
                    result = &mut work => break result,
                    Some(frame) = rx.recv() => frames.send(frame).await?,
                }
            }
        };

        drop(client);
        drop(tx);
        while let Some(frame) = rx.recv().await {
            frames.send(frame).await?;
        }

        match result {
            Ok(code) => Ok(code),
            Err(e) => {
                error!(peer = %peer, error = ?e, "Request failed");
                frames.send(Frame::stderr(format!("Error: {}", e))).await?;
                Ok(e.exit_code())
            }
        }
    }

    async fn dispatch(&self, request: Request, out: &FrameSender) -> Result<i32> {
        match request {
            Request::Deploy { servers } => {
                let orchestrator = DeployOrchestrator::new(
                    Arc::clone(&self.inventory),
                    Arc::clone(&self.provider),
                    Arc::clone(&self.repo),
                );
                let report = orchestrator.run(&servers).await;
                for outcome in &report.outcomes {
                    let line = match &outcome.error {
                        None => format!(
                            "{}: ok ({})",
                            outcome.server,
                            outcome.revision.as_deref().unwrap_or("unknown")
                        ),
                        Some(error) => format!("{}: FAILED: {}", outcome.server, error),
                    };
                    emit(out, Frame::stdout(line));
                }
                Ok(report.exit_code())
            }
            Request::Transfer(request) => {
                let summary =
                    transfer::execute(&self.inventory, self.provider.as_ref(), &request, None)
                        .await?;
                emit(
                    out,
                    Frame::stdout(format!(
                        "{} files transferred ({} bytes), {} skipped, {} filtered",
                        summary.files_transferred,
                        summary.bytes_transferred,
                        summary.files_skipped,
                        summary.files_filtered
                    )),
                );
                Ok(0)
            }
            Request::Ssh { server } => {
                let host = self.inventory.resolve(server.as_deref()).await?;
                emit(out, Frame::exec(host.ssh_command_line()));
                Ok(0)
            }
            Request::Open { server, port } => {
                let host = self.inventory.resolve(server.as_deref()).await?;
                emit(out, Frame::browse_url(host.http_url(port)));
                Ok(0)
            }
        }
    }
}

/// Send `request` to the daemon at `address` and return its response frames.
pub async fn request(address: &str, request: &Request) -> Result<FramedRead<TcpStream, FrameCodec>> {
    let mut stream = TcpStream::connect(address).await?;
    stream.write_all(&request.to_bytes()).await?;
    stream.shutdown().await?;
    Ok(FramedRead::new(stream, FrameCodec))
}
