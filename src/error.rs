//! Error types for the relay.
//!
//! Bootstrap and discovery failures are fatal for startup; registry and
//! protocol errors are logged and never interrupt other zones.

use std::path::PathBuf;

use thiserror::Error;

/// Startup failures. Any of these aborts the process with exit status 2,
/// except [`BootstrapError::InvalidConfig`] which is a usage error.
#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("could not create data directory {}: {source}", .path.display())]
    DataDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not determine compute node UUID: {0:#}")]
    NodeIdentity(anyhow::Error),

    #[error("could not discover master endpoint: {0}")]
    Discovery(#[from] DiscoveryError),
}

impl BootstrapError {
    /// Process exit status for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            BootstrapError::InvalidConfig(_) => 1,
            _ => 2,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DiscoveryError {
    /// Every absent variable is listed, not only the first.
    #[error("missing required environment variables: {}", .0.join(", "))]
    MissingEnv(Vec<String>),

    #[error("master discovery cancelled")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("no relay channel open for zone {0}")]
    NotFound(String),

    #[error("failed to open relay channel for zone {zone}: {reason:#}")]
    Open { zone: String, reason: anyhow::Error },
}

/// Problems with a zwatch control message. The message is dropped and no
/// reply is sent.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("bad message received on zwatch socket: {0:?}")]
    Malformed(String),

    #[error("invalid command received on zwatch socket: {0:?}")]
    InvalidCommand(String),
}
