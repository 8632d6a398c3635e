//! Session registry and liveness monitor.
//!
//! The registry holds at most one idle session per server key. Callers take a
//! session out with [`SessionRegistry::checkout`] and hand it back with
//! [`SessionRegistry::publish`]; while checked out, the session belongs to the
//! caller alone.
//!
//! [`LivenessMonitor`] probes every registered session on a fixed interval and
//! evicts the ones whose transport has died. Each cycle snapshots the map
//! under the lock, releases it, then re-acquires it per entry for the probe,
//! so checkouts and publishes interleave with a running cycle.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use super::{ConnectionError, ConnectionResult, RemoteSession};

/// Command used to check that a session still carries traffic
pub const PROBE_COMMAND: &str = "echo";

/// Errors from registry lookups.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No idle session is registered under the key.
    #[error("No pooled session for '{0}'")]
    NotFound(String),
}

/// Mutex-guarded map of idle sessions.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<dyn RemoteSession>>>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return the session registered under `key`.
    pub async fn checkout(&self, key: &str) -> Result<Arc<dyn RemoteSession>, RegistryError> {
        let session = self
            .sessions
            .lock()
            .await
            .remove(key)
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))?;
        trace!(key = %key, "Session checked out");
        Ok(session)
    }

    /// Register `session` under `key`, replacing any previous entry.
    ///
    /// A replaced session that is not the same object is closed in the
    /// background.
    pub async fn publish(&self, key: impl Into<String>, session: Arc<dyn RemoteSession>) {
        let key = key.into();
        let previous = self
            .sessions
            .lock()
            .await
            .insert(key.clone(), Arc::clone(&session));
        trace!(key = %key, "Session published");

        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous, &session) {
                debug!(key = %key, "Replaced pooled session, closing the old one");
                close_detached(previous);
            }
        }
    }

    /// Whether a session is registered under `key`
    pub async fn contains(&self, key: &str) -> bool {
        self.sessions.lock().await.contains_key(key)
    }

    /// Number of registered sessions
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Whether the registry is empty
    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Registered keys, sorted
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Copy of the current entries sorted by key, taken under the lock.
    pub async fn snapshot(&self) -> Vec<(String, Arc<dyn RemoteSession>)> {
        let mut entries: Vec<_> = self
            .sessions
            .lock()
            .await
            .iter()
            .map(|(key, session)| (key.clone(), Arc::clone(session)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Run one liveness pass over every registered session.
    pub async fn probe_cycle(&self, config: &MonitorConfig) -> ProbeReport {
        let mut report = ProbeReport::default();

        for (key, session) in self.snapshot().await {
            let mut sessions = self.sessions.lock().await;

            if !session.is_connected() {
                report.skipped += 1;
                continue;
            }
            report.probed += 1;

            let failure = match probe(&*session, config).await {
                Ok(()) => None,
                Err(e) if !e.is_transport_failure() => {
                    debug!(key = %key, error = %e, "Probe returned an error, session kept");
                    None
                }
                Err(e) => Some(e),
            };

            let Some(failure) = failure else {
                report.alive += 1;
                continue;
            };

            info!(key = %key, error = %failure, "Failed to ping server, evicting session");
            let still_registered = sessions
                .get(&key)
                .map_or(false, |current| Arc::ptr_eq(current, &session));
            if still_registered {
                sessions.remove(&key);
            }
            drop(sessions);

            // A replacement published since the snapshot stays registered.
            if still_registered {
                report.evicted.push(key);
            } else {
                debug!(key = %key, "Dead session was already replaced");
            }
            close_detached(session);
        }

        report
    }

    /// Close and remove every registered session.
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.sessions.lock().await.drain().collect();
        for (key, session) in drained {
            if let Err(e) = session.close().await {
                debug!(key = %key, error = %e, "Error closing pooled session");
            }
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry").finish_non_exhaustive()
    }
}

/// Run the probe command on `session`, bounded by the probe timeout.
pub async fn probe(session: &dyn RemoteSession, config: &MonitorConfig) -> ConnectionResult<()> {
    let timeout = config.probe_timeout();
    match tokio::time::timeout(timeout, run_probe(session)).await {
        Ok(result) => result,
        Err(_) => Err(ConnectionError::Timeout(timeout.as_secs())),
    }
}

/// Run the probe command and drain its output.
async fn run_probe(session: &dyn RemoteSession) -> ConnectionResult<()> {
    let mut stream = session.run_stream(PROBE_COMMAND).await?;
    let mut sink = Vec::new();
    stream.stdout.read_to_end(&mut sink).await?;
    stream.wait().await.map(|_| ())
}

/// Close a session on its own task so the caller never waits on it.
fn close_detached(session: Arc<dyn RemoteSession>) {
    tokio::spawn(async move {
        if let Err(e) = session.close().await {
            debug!(session = %session.identifier(), error = %e, "Error closing session");
        }
    });
}

/// Outcome of one probe cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeReport {
    /// Sessions the probe command ran on
    pub probed: usize,
    /// Sessions that answered
    pub alive: usize,
    /// Sessions already marked disconnected, left alone
    pub skipped: usize,
    /// Keys whose session was removed from the registry and scheduled for
    /// closing
    pub evicted: Vec<String>,
}

/// Liveness monitor timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Seconds between probe cycles
    #[serde(default = "default_probe_interval")]
    pub probe_interval: u64,

    /// Seconds a single probe may take before the session counts as dead
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout: u64,
}

fn default_probe_interval() -> u64 {
    60
}

fn default_probe_timeout() -> u64 {
    10
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval: default_probe_interval(),
            probe_timeout: default_probe_timeout(),
        }
    }
}

impl MonitorConfig {
    /// Interval between cycles
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval.max(1))
    }

    /// Per-probe timeout
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout.max(1))
    }
}

/// Background prober for a [`SessionRegistry`].
pub struct LivenessMonitor;

impl LivenessMonitor {
    /// Spawn the prober. It runs until the returned handle is stopped or
    /// dropped.
    pub fn start(registry: Arc<SessionRegistry>, config: MonitorConfig) -> MonitorHandle {
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.probe_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                match AssertUnwindSafe(registry.probe_cycle(&config))
                    .catch_unwind()
                    .await
                {
                    Ok(report) if !report.evicted.is_empty() => {
                        info!(evicted = ?report.evicted, alive = report.alive, "Probe cycle finished");
                    }
                    Ok(report) => trace!(alive = report.alive, "Probe cycle finished"),
                    Err(panic) => {
                        let detail = panic
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown panic".to_string());
                        error!(detail = %detail, "Probe cycle panicked");
                    }
                }
            }
        });

        MonitorHandle { task }
    }
}

/// Owns the prober task; dropping it stops the prober.
#[derive(Debug)]
pub struct MonitorHandle {
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Stop the prober
    pub fn stop(&self) {
        self.task.abort();
    }

    /// Whether the prober task is still running
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
