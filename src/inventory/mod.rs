//! Host resolution.
//!
//! Turns a logical server name from the command line into everything needed
//! to reach it. Names go through the alias table first; a missing name falls
//! back to the configured default. Names of the form `aws.<instance>` are
//! cloud hosts whose address is looked up through [`InstanceDiscovery`] at
//! resolve time; every other name must have a `[servers.<name>]` entry.

pub mod discovery;

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::connection::config::parse_address;
use crate::connection::{HostKeyPolicy, SessionTarget, DEFAULT_SSH_PORT};

pub use discovery::{CloudInstance, InstanceDiscovery, StaticDiscovery};
#[cfg(feature = "aws")]
pub use discovery::Ec2Discovery;

/// Prefix marking a server name as an EC2 instance name.
pub const CLOUD_PREFIX: &str = "aws.";

/// Host resolution failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InventoryError {
    /// No server was named and no default is configured.
    #[error("No server given and no default server configured")]
    NoServer,

    /// The name has no configuration entry.
    #[error("Unknown server '{0}'")]
    UnknownServer(String),

    /// The server's configuration entry is unusable.
    #[error("Invalid configuration for server '{name}': {message}")]
    InvalidServer {
        /// Server name
        name: String,
        /// What is wrong
        message: String,
    },

    /// Cloud hosts cannot be resolved in this build or configuration.
    #[error("Cannot resolve cloud server '{name}': {reason}")]
    CloudUnavailable {
        /// Server name
        name: String,
        /// Why discovery is unavailable
        reason: String,
    },

    /// No instance carries the requested Name tag.
    #[error("No EC2 instance named '{0}'")]
    InstanceNotFound(String),

    /// The instance exists but has no usable address.
    #[error("EC2 instance '{name}' is {state}, not running")]
    InstanceNotRunning {
        /// Instance name
        name: String,
        /// Reported instance state
        state: String,
    },

    /// The discovery API call failed.
    #[error("Instance discovery failed: {0}")]
    Discovery(String),
}

/// How a server is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HostKind {
    /// Fixed address from the config file
    Static,
    /// EC2 instance looked up by Name tag
    Cloud,
}

/// A server name resolved to a connection target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedHost {
    /// Connection target
    pub target: SessionTarget,
    /// Addressing kind
    pub kind: HostKind,
}

impl ResolvedHost {
    /// Logical server name
    pub fn name(&self) -> &str {
        &self.target.name
    }

    /// Arguments of the equivalent interactive `ssh` invocation.
    ///
    /// Cloud hosts skip known_hosts entirely, since their addresses and keys
    /// change whenever the instance is replaced.
    pub fn ssh_command(&self) -> Vec<String> {
        let mut args = vec!["ssh".to_string()];
        if self.kind == HostKind::Cloud {
            args.extend(
                [
                    "-o",
                    "UserKnownHostsFile=/dev/null",
                    "-o",
                    "StrictHostKeyChecking=no",
                ]
                .map(String::from),
            );
        }
        args.push("-A".to_string());
        args.push("-i".to_string());
        args.push(self.target.key_path().to_string_lossy().to_string());
        if self.target.port != DEFAULT_SSH_PORT {
            args.push("-p".to_string());
            args.push(self.target.port.to_string());
        }
        args.push(format!("{}@{}", self.target.username, self.target.host));
        args
    }

    /// [`ResolvedHost::ssh_command`] as one shell-quoted line.
    pub fn ssh_command_line(&self) -> String {
        shell_words::join(self.ssh_command())
    }

    /// `http://<address>:<port>` for a service the host exposes.
    pub fn http_url(&self, port: u16) -> String {
        if self.target.host.contains(':') {
            format!("http://[{}]:{}", self.target.host, port)
        } else {
            format!("http://{}:{}", self.target.host, port)
        }
    }
}

/// Resolves server names against a [`Config`].
pub struct Inventory {
    config: Config,
    discovery: Option<Arc<dyn InstanceDiscovery>>,
}

impl Inventory {
    /// Inventory without cloud discovery
    pub fn new(config: Config) -> Self {
        Self {
            config,
            discovery: None,
        }
    }

    /// Attach an instance discovery backend for `aws.` names
    pub fn with_discovery(mut self, discovery: Arc<dyn InstanceDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Inventory with EC2 discovery when the config has an `[aws]` section.
    #[cfg(feature = "aws")]
    pub async fn from_config(config: Config) -> Self {
        let discovery = match &config.aws {
            Some(aws) => {
                Some(Arc::new(Ec2Discovery::new(aws).await) as Arc<dyn InstanceDiscovery>)
            }
            None => None,
        };
        Self { config, discovery }
    }

    /// Inventory for `config`; cloud discovery needs the `aws` feature.
    #[cfg(not(feature = "aws"))]
    pub async fn from_config(config: Config) -> Self {
        Self::new(config)
    }

    /// The loaded configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Map an alias to the server it names; other names pass through.
    pub fn resolve_alias<'a>(&'a self, name: &'a str) -> &'a str {
        self.config
            .aliases
            .get(name)
            .map(String::as_str)
            .unwrap_or(name)
    }

    /// The server a command addresses: the alias-resolved `name`, or the
    /// configured default.
    pub fn server_name(&self, name: Option<&str>) -> Result<String, InventoryError> {
        let name = match name {
            Some(name) => name,
            None => self
                .config
                .default
                .as_deref()
                .ok_or(InventoryError::NoServer)?,
        };
        Ok(self.resolve_alias(name).to_string())
    }

    /// Resolve `name` (or the default) to a connection target.
    pub async fn resolve(&self, name: Option<&str>) -> Result<ResolvedHost, InventoryError> {
        let name = self.server_name(name)?;
        debug!(server = %name, "Resolving server");

        match name.strip_prefix(CLOUD_PREFIX) {
            Some(instance) => self.resolve_cloud(&name, instance).await,
            None => self.resolve_static(&name),
        }
    }

    fn resolve_static(&self, name: &str) -> Result<ResolvedHost, InventoryError> {
        let server = self
            .config
            .servers
            .get(name)
            .ok_or_else(|| InventoryError::UnknownServer(name.to_string()))?;

        let (host, port) =
            parse_address(&server.address).map_err(|e| InventoryError::InvalidServer {
                name: name.to_string(),
                message: e.to_string(),
            })?;

        let mut target = SessionTarget::new(name, host, &server.user)
            .port(port)
            .home_dir(&server.home_dir);
        if let Some(key) = &server.private_key {
            target = target.private_key(key);
        }
        target.host_key_policy = server.host_key_policy;

        Ok(ResolvedHost {
            target,
            kind: HostKind::Static,
        })
    }

    async fn resolve_cloud(&self, name: &str, instance: &str) -> Result<ResolvedHost, InventoryError> {
        let aws = self
            .config
            .aws
            .as_ref()
            .ok_or_else(|| InventoryError::CloudUnavailable {
                name: name.to_string(),
                reason: "no [aws] section in the configuration".to_string(),
            })?;
        let settings = aws
            .instances
            .get(instance)
            .ok_or_else(|| InventoryError::UnknownServer(name.to_string()))?;
        let discovery = self
            .discovery
            .as_ref()
            .ok_or_else(|| InventoryError::CloudUnavailable {
                name: name.to_string(),
                reason: "instance discovery is not enabled in this build".to_string(),
            })?;

        let found = discovery
            .find_by_name(instance)
            .await?
            .ok_or_else(|| InventoryError::InstanceNotFound(instance.to_string()))?;

        let address = found
            .address(aws.use_private_ip)
            .ok_or_else(|| InventoryError::InstanceNotRunning {
                name: instance.to_string(),
                state: found.state.clone(),
            })?;
        debug!(server = %name, instance_id = %found.id, address = %address, "Instance resolved");

        let mut target = SessionTarget::new(name, address, &settings.user)
            .home_dir(&settings.home_dir)
            .host_key_policy(HostKeyPolicy::AcceptAny);
        if let Some(key) = &settings.private_key {
            target = target.private_key(key);
        }

        Ok(ResolvedHost {
            target,
            kind: HostKind::Cloud,
        })
    }
}
