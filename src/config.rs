//! Configuration file for devfleet.
//!
//! A single TOML file, `.devfleet.toml` in the working directory by default,
//! describes the servers, their aliases, cloud access, and the timing of the
//! session layer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::connection::{HostKeyPolicy, MonitorConfig, SessionOptions};
use crate::error::{Error, Result};

/// Config file looked up in the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = ".devfleet.toml";

/// Default daemon listen address.
pub const DEFAULT_DAEMON_ADDR: &str = "127.0.0.1:11397";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Server used when a command names none
    #[serde(default)]
    pub default: Option<String>,

    /// Alternative names for servers
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,

    /// Statically addressed servers
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,

    /// EC2 access and per-instance settings for `aws.<name>` servers
    #[serde(default)]
    pub aws: Option<AwsConfig>,

    /// SSH session options
    #[serde(default)]
    pub ssh: SessionOptions,

    /// Liveness monitor timing
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Daemon settings
    #[serde(default)]
    pub daemon: DaemonConfig,
}

/// A statically addressed server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// `host[:port]`
    pub address: String,
    /// Login user
    pub user: String,
    /// Remote working directory (a git checkout for deploys)
    pub home_dir: String,
    /// Private key file, `~` allowed
    #[serde(default)]
    pub private_key: Option<String>,
    /// Per-server host key policy
    #[serde(default)]
    pub host_key_policy: Option<HostKeyPolicy>,
}

/// EC2 access settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwsConfig {
    /// AWS region
    pub region: String,
    /// Access key id; the SDK's default chain is used when absent
    #[serde(default)]
    pub access_key_id: Option<String>,
    /// Secret access key
    #[serde(default)]
    pub secret_access_key: Option<String>,
    /// Connect to instances on their private address
    #[serde(default)]
    pub use_private_ip: bool,
    /// Per-instance login settings, keyed by the instance's Name tag
    #[serde(default)]
    pub instances: BTreeMap<String, CloudInstanceConfig>,
}

/// Login settings for one EC2 instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudInstanceConfig {
    /// Login user
    pub user: String,
    /// Remote working directory
    pub home_dir: String,
    /// Private key file, `~` allowed
    #[serde(default)]
    pub private_key: Option<String>,
}

/// Daemon settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Listen address
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    DEFAULT_DAEMON_ADDR.to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

impl Config {
    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::ConfigParse {
            path: PathBuf::from("<string>"),
            message: e.to_string(),
        })
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| Error::ConfigRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| Error::ConfigParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Load the given file, or [`DEFAULT_CONFIG_FILE`] when it exists.
    ///
    /// An explicitly named file must exist; a missing default file yields an
    /// empty configuration.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::from_file(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"
default = "box"

[aliases]
prod = "box"

[servers.box]
address = "10.0.0.5:2222"
user = "dev"
home_dir = "/home/dev/project"
private_key = "~/.ssh/id_ed25519"

[aws]
region = "eu-west-1"
use_private_ip = true

[aws.instances.trainer]
user = "ubuntu"
home_dir = "/home/ubuntu/project"

[ssh]
connect_timeout = 15

[monitor]
probe_interval = 30
"#;

    #[test]
    fn test_parse_sample() {
        let config = Config::from_toml(SAMPLE).unwrap();

        assert_eq!(config.default.as_deref(), Some("box"));
        assert_eq!(config.aliases.get("prod").map(String::as_str), Some("box"));

        let server = &config.servers["box"];
        assert_eq!(server.address, "10.0.0.5:2222");
        assert_eq!(server.private_key.as_deref(), Some("~/.ssh/id_ed25519"));

        let aws = config.aws.as_ref().unwrap();
        assert!(aws.use_private_ip);
        assert_eq!(aws.instances["trainer"].user, "ubuntu");
        assert_eq!(aws.access_key_id, None);

        assert_eq!(config.ssh.connect_timeout, 15);
        assert_eq!(config.monitor.probe_interval, 30);
        assert_eq!(config.monitor.probe_timeout, 10);
        assert_eq!(config.daemon.bind, DEFAULT_DAEMON_ADDR);
    }

    #[test]
    fn test_empty_config() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_missing_required_field() {
        let err = Config::from_toml("[servers.box]\naddress = \"h\"\n").unwrap_err();
        assert!(matches!(err, Error::ConfigParse { .. }));
    }

    #[test]
    fn test_load_explicit_missing_file() {
        let err = Config::load(Some(Path::new("/nonexistent/devfleet.toml"))).unwrap_err();
        assert!(matches!(err, Error::ConfigRead { .. }));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.servers.len(), 1);
    }
}
