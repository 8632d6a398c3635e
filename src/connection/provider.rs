//! How callers obtain sessions.
//!
//! A [`SessionConnector`] opens new sessions; a [`SessionProvider`] decides
//! whether a caller gets a fresh one or a pooled one, and what happens when
//! the caller is done with it.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::config::{SessionOptions, SessionTarget};
use super::registry::SessionRegistry;
use super::{ConnectionResult, RemoteSession, RusshSession};

/// Opens new sessions.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    /// Open and authenticate a session to `target`.
    async fn connect(&self, target: &SessionTarget) -> ConnectionResult<Arc<dyn RemoteSession>>;
}

/// Connector producing [`RusshSession`]s.
#[derive(Debug, Clone, Default)]
pub struct RusshConnector {
    options: SessionOptions,
}

impl RusshConnector {
    /// Create a connector with the given session options
    pub fn new(options: SessionOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl SessionConnector for RusshConnector {
    async fn connect(&self, target: &SessionTarget) -> ConnectionResult<Arc<dyn RemoteSession>> {
        let session = RusshSession::connect(target, &self.options).await?;
        Ok(Arc::new(session))
    }
}

/// Hands out sessions and takes them back.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Get a connected session for `target`.
    async fn acquire(&self, target: &SessionTarget) -> ConnectionResult<Arc<dyn RemoteSession>>;

    /// Return a session obtained from [`SessionProvider::acquire`].
    async fn release(&self, session: Arc<dyn RemoteSession>);
}

/// One fresh session per acquire, closed on release.
pub struct DirectProvider {
    connector: Arc<dyn SessionConnector>,
}

impl DirectProvider {
    /// Create a provider over `connector`
    pub fn new(connector: Arc<dyn SessionConnector>) -> Self {
        Self { connector }
    }
}

#[async_trait]
impl SessionProvider for DirectProvider {
    async fn acquire(&self, target: &SessionTarget) -> ConnectionResult<Arc<dyn RemoteSession>> {
        self.connector.connect(target).await
    }

    async fn release(&self, session: Arc<dyn RemoteSession>) {
        if let Err(e) = session.close().await {
            debug!(session = %session.identifier(), error = %e, "Error closing session");
        }
    }
}

/// Reuses sessions through a [`SessionRegistry`].
///
/// Acquire checks the server's session out of the registry, opening a new one
/// when none is pooled or the pooled one has disconnected. Release publishes a
/// still-connected session back under its identifier and closes anything else.
pub struct PooledProvider {
    registry: Arc<SessionRegistry>,
    connector: Arc<dyn SessionConnector>,
}

impl PooledProvider {
    /// Create a provider over `registry`, opening misses with `connector`
    pub fn new(registry: Arc<SessionRegistry>, connector: Arc<dyn SessionConnector>) -> Self {
        Self {
            registry,
            connector,
        }
    }

    /// The backing registry
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }
}

#[async_trait]
impl SessionProvider for PooledProvider {
    async fn acquire(&self, target: &SessionTarget) -> ConnectionResult<Arc<dyn RemoteSession>> {
        match self.registry.checkout(&target.name).await {
            Ok(session) if session.is_connected() => {
                debug!(server = %target.name, "Reusing pooled session");
                return Ok(session);
            }
            Ok(stale) => {
                debug!(server = %target.name, "Pooled session disconnected, reopening");
                let _ = stale.close().await;
            }
            Err(_) => {}
        }
        self.connector.connect(target).await
    }

    async fn release(&self, session: Arc<dyn RemoteSession>) {
        if session.is_connected() {
            let key = session.identifier().to_string();
            self.registry.publish(key, session).await;
        } else {
            let _ = session.close().await;
        }
    }
}
