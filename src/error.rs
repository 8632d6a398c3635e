//! Error types for devfleet.
//!
//! Each layer has its own error enum next to its code; [`Error`] gathers
//! them for callers that drive several layers at once.

use std::path::PathBuf;
use thiserror::Error;

use crate::connection::{ConnectionError, RegistryError};
use crate::deploy::DeployError;
use crate::inventory::InventoryError;
use crate::task::TaskError;

/// Result type alias for devfleet operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for devfleet.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// The config file could not be read.
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead {
        /// Path to the config file
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML or misses required fields.
    #[error("Failed to parse config file '{path}': {message}")]
    ConfigParse {
        /// Path to the config file
        path: PathBuf,
        /// Parser message
        message: String,
    },

    // ========================================================================
    // Layer Errors
    // ========================================================================
    /// Host resolution failed.
    #[error(transparent)]
    Inventory(#[from] InventoryError),

    /// A session operation failed.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Registry lookup failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A deploy to one host failed.
    #[error(transparent)]
    Deploy(#[from] DeployError),

    /// A spawned task did not produce a value.
    #[error(transparent)]
    Task(#[from] TaskError),

    // ========================================================================
    // Daemon Errors
    // ========================================================================
    /// Malformed daemon request or response.
    #[error("Daemon protocol error: {0}")]
    Protocol(String),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::ConfigRead { .. } | Error::ConfigParse { .. } | Error::Inventory(_) => 2,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transparent_display() {
        let err: Error = ConnectionError::NotFound("/srv/data".into()).into();
        assert_eq!(err.to_string(), "No such remote path: /srv/data");
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_config_errors_exit_code() {
        let err = Error::ConfigParse {
            path: PathBuf::from(".devfleet.toml"),
            message: "expected table".into(),
        };
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().contains(".devfleet.toml"));
    }
}
