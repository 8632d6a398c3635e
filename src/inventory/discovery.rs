//! Cloud instance lookup.

use async_trait::async_trait;
use serde::Serialize;

use super::InventoryError;

#[cfg(feature = "aws")]
use crate::config::AwsConfig;

/// Instance state in which an address is usable.
pub const RUNNING: &str = "running";

/// An instance as reported by the cloud provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CloudInstance {
    /// Provider instance id
    pub id: String,
    /// Value of the Name tag
    pub name: String,
    /// Lifecycle state (`running`, `stopped`, ...)
    pub state: String,
    /// Public IPv4 address
    pub public_ip: Option<String>,
    /// Private IPv4 address
    pub private_ip: Option<String>,
}

impl CloudInstance {
    /// Whether the instance is running
    pub fn is_running(&self) -> bool {
        self.state == RUNNING
    }

    /// Address to connect to, or `None` unless the instance is running.
    pub fn address(&self, use_private_ip: bool) -> Option<String> {
        if !self.is_running() {
            return None;
        }
        if use_private_ip {
            self.private_ip.clone()
        } else {
            self.public_ip.clone()
        }
    }
}

/// Looks instances up by their Name tag.
#[async_trait]
pub trait InstanceDiscovery: Send + Sync {
    /// The instance tagged `name`. When several match, a running one wins.
    async fn find_by_name(&self, name: &str) -> Result<Option<CloudInstance>, InventoryError>;
}

/// Prefer a running instance among several carrying the same name.
fn pick(mut candidates: Vec<CloudInstance>) -> Option<CloudInstance> {
    match candidates.iter().position(CloudInstance::is_running) {
        Some(index) => Some(candidates.swap_remove(index)),
        None => candidates.into_iter().next(),
    }
}

/// Fixed instance list.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    instances: Vec<CloudInstance>,
}

impl StaticDiscovery {
    /// Discovery over `instances`
    pub fn new(instances: Vec<CloudInstance>) -> Self {
        Self { instances }
    }
}

#[async_trait]
impl InstanceDiscovery for StaticDiscovery {
    async fn find_by_name(&self, name: &str) -> Result<Option<CloudInstance>, InventoryError> {
        Ok(pick(
            self.instances
                .iter()
                .filter(|i| i.name == name)
                .cloned()
                .collect(),
        ))
    }
}

/// EC2 lookup through `DescribeInstances` with a `tag:Name` filter.
#[cfg(feature = "aws")]
pub struct Ec2Discovery {
    client: aws_sdk_ec2::Client,
}

#[cfg(feature = "aws")]
impl Ec2Discovery {
    /// Build a client for the configured region.
    ///
    /// Explicit keys from the config take precedence over the SDK's default
    /// credential chain.
    pub async fn new(config: &AwsConfig) -> Self {
        use aws_config::BehaviorVersion;

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_sdk_ec2::config::Region::new(config.region.clone()));

        if let (Some(id), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            loader = loader.credentials_provider(aws_sdk_ec2::config::Credentials::new(
                id.clone(),
                secret.clone(),
                None,
                None,
                "devfleet",
            ));
        }

        let sdk_config = loader.load().await;
        Self {
            client: aws_sdk_ec2::Client::new(&sdk_config),
        }
    }
}

#[cfg(feature = "aws")]
#[async_trait]
impl InstanceDiscovery for Ec2Discovery {
    async fn find_by_name(&self, name: &str) -> Result<Option<CloudInstance>, InventoryError> {
        use aws_sdk_ec2::types::Filter;

        let resp = self
            .client
            .describe_instances()
            .filters(Filter::builder().name("tag:Name").values(name).build())
            .send()
            .await
            .map_err(|e| InventoryError::Discovery(format!("Failed to describe instances: {}", e)))?;

        let mut candidates = Vec::new();
        for reservation in resp.reservations() {
            for instance in reservation.instances() {
                let state = instance
                    .state()
                    .and_then(|s| s.name())
                    .map(|n| n.as_str().to_string())
                    .unwrap_or_else(|| "unknown".to_string());

                candidates.push(CloudInstance {
                    id: instance.instance_id().unwrap_or_default().to_string(),
                    name: name.to_string(),
                    state,
                    public_ip: instance.public_ip_address().map(|s| s.to_string()),
                    private_ip: instance.private_ip_address().map(|s| s.to_string()),
                });
            }
        }

        Ok(pick(candidates))
    }
}
