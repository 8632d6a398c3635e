//! # Devfleet - Development Server Fleet Toolkit
//!
//! Devfleet drives a set of development servers over SSH: it keeps sessions
//! alive and reusable, moves files and whole directory trees in both
//! directions, and deploys the local working tree to many servers at once.
//!
//! ## Core Concepts
//!
//! - **Sessions**: one authenticated SSH connection per server, running shell
//!   commands and moving files over SFTP
//! - **Registry**: pooled sessions keyed by server name, pruned by a
//!   background liveness monitor
//! - **Inventory**: server names, aliases and EC2-backed hosts resolved to
//!   connection targets
//! - **Deploys**: bring each remote checkout to the local `HEAD` and apply the
//!   local uncommitted changes on top, all servers in parallel
//! - **Daemon**: a local server that keeps the registry alive between commands
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 CLI  /  daemon (serve)                       │
//! └──────────────────────────────────────────────────────────────┘
//!                │                              │
//!                ▼                              ▼
//! ┌──────────────────────────┐    ┌──────────────────────────────┐
//! │   Deploy Orchestrator    │    │      Directory Transfer      │
//! │ (one task per server)    │    │  (recursive get / put)       │
//! └──────────────────────────┘    └──────────────────────────────┘
//!                │                              │
//!                └──────────────┬───────────────┘
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │   Inventory  ──▶  SessionProvider  ──▶  SessionRegistry      │
//! │                                         + LivenessMonitor    │
//! └──────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │              RemoteSession (russh + russh-sftp)              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use devfleet::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load(None)?;
//!     let inventory = Arc::new(Inventory::from_config(config.clone()).await);
//!     let provider = Arc::new(DirectProvider::new(Arc::new(RusshConnector::new(config.ssh))));
//!
//!     let orchestrator =
//!         DeployOrchestrator::new(inventory, provider, Arc::new(GitWorkspace::current()));
//!     let report = orchestrator.run(&["box".to_string()]).await;
//!     std::process::exit(report.exit_code());
//! }
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod prelude {
    //! Convenient re-exports of commonly used types and traits.

    pub use std::sync::Arc;

    pub use crate::config::Config;
    pub use crate::connection::{
        ConnectionError, DirectProvider, LivenessMonitor, PooledProvider, RemoteSession,
        RusshConnector, RusshSession, SessionOptions, SessionProvider, SessionRegistry,
        SessionTarget,
    };
    pub use crate::deploy::{DeployOrchestrator, DeployReport, GitWorkspace};
    pub use crate::error::{Error, Result};
    pub use crate::inventory::{Inventory, ResolvedHost};
    pub use crate::task::{SharedTask, TaskHandle};
    pub use crate::transfer::{DownloadOptions, TransferRequest, TransferSummary};
}

// ============================================================================
// Core Modules
// ============================================================================

/// Error types and result aliases.
pub mod error;

/// Configuration file loading.
pub mod config;

/// Spawned tasks with a single eventual result.
pub mod task;

// ============================================================================
// Infrastructure
// ============================================================================

/// Remote sessions, the session registry and its liveness monitor.
///
/// [`RemoteSession`](connection::RemoteSession) is the seam every other
/// module talks to; [`RusshSession`](connection::RusshSession) is the SSH
/// implementation.
pub mod connection;

/// Server name resolution, including EC2 instance lookup.
pub mod inventory;

// ============================================================================
// Operations
// ============================================================================

/// Recursive file and directory transfer.
pub mod transfer;

/// Parallel patch deploys.
pub mod deploy;

/// Session server and its wire protocol.
pub mod daemon;

pub use error::{Error, Result};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
