//! Connection configuration
//!
//! Per-host connection targets and the session options shared by every
//! connection the process opens.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::ConnectionError;

/// Default connection timeout in seconds
pub const DEFAULT_CONNECT_TIMEOUT: u64 = 30;

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Private key used when a host does not name one
pub const DEFAULT_PRIVATE_KEY: &str = "~/.ssh/id_rsa";

/// How the server's host key is checked against `~/.ssh/known_hosts`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Reject mismatches, accept hosts that are not listed yet
    #[default]
    AcceptNew,
    /// Reject mismatches and unknown hosts
    Strict,
    /// Accept any key (short-lived cloud instances)
    AcceptAny,
}

/// Options applied to every session the process opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOptions {
    /// TCP connect + handshake timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Host key policy for static hosts
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,

    /// Fall back to the SSH agent when key authentication fails
    #[serde(default = "default_true")]
    pub use_agent: bool,
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_true() -> bool {
    true
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            host_key_policy: HostKeyPolicy::default(),
            use_agent: true,
        }
    }
}

impl SessionOptions {
    /// Connect timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}

/// Everything needed to open a session to one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionTarget {
    /// Logical server name, used as the registry key
    pub name: String,
    /// Hostname or IP address
    pub host: String,
    /// SSH port
    pub port: u16,
    /// Login user
    pub username: String,
    /// Remote working directory
    pub home_dir: String,
    /// Private key file; `None` means [`DEFAULT_PRIVATE_KEY`]
    pub private_key: Option<PathBuf>,
    /// Overrides [`SessionOptions::host_key_policy`] for this host
    pub host_key_policy: Option<HostKeyPolicy>,
}

impl SessionTarget {
    /// Target for `username@host` on the default port.
    pub fn new(name: impl Into<String>, host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            username: username.into(),
            home_dir: String::from("."),
            private_key: None,
            host_key_policy: None,
        }
    }

    /// Set the port
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the remote working directory
    pub fn home_dir(mut self, home_dir: impl Into<String>) -> Self {
        self.home_dir = home_dir.into();
        self
    }

    /// Set the private key file
    pub fn private_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.private_key = Some(path.into());
        self
    }

    /// Override the host key policy
    pub fn host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key_policy = Some(policy);
        self
    }

    /// Key file to authenticate with, `~` expanded.
    pub fn key_path(&self) -> PathBuf {
        match &self.private_key {
            Some(path) => expand_path(&path.to_string_lossy()),
            None => expand_path(DEFAULT_PRIVATE_KEY),
        }
    }

    /// `host:port` as passed to the TCP connect.
    pub fn socket_address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Split `host[:port]` into its parts.
///
/// IPv6 literals must be bracketed when a port is given (`[::1]:2222`).
pub fn parse_address(address: &str) -> Result<(String, u16), ConnectionError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(ConnectionError::InvalidConfig(
            "empty server address".to_string(),
        ));
    }

    if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(|| {
            ConnectionError::InvalidConfig(format!("unterminated '[' in address '{}'", address))
        })?;
        let port = match tail.strip_prefix(':') {
            Some(port) => parse_port(port, address)?,
            None if tail.is_empty() => DEFAULT_SSH_PORT,
            None => {
                return Err(ConnectionError::InvalidConfig(format!(
                    "unexpected text after ']' in address '{}'",
                    address
                )))
            }
        };
        return Ok((host.to_string(), port));
    }

    match address.split_once(':') {
        Some((host, port)) if !port.contains(':') => Ok((host.to_string(), parse_port(port, address)?)),
        // bare IPv6 literal
        Some(_) => Ok((address.to_string(), DEFAULT_SSH_PORT)),
        None => Ok((address.to_string(), DEFAULT_SSH_PORT)),
    }
}

fn parse_port(port: &str, address: &str) -> Result<u16, ConnectionError> {
    port.parse::<u16>().map_err(|_| {
        ConnectionError::InvalidConfig(format!("invalid port '{}' in address '{}'", port, address))
    })
}

/// Expand `~` and environment variables in a path
pub fn expand_path(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or_else(|_| path.into());
    PathBuf::from(expanded.as_ref())
}
