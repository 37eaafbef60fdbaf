//! Data structures shared between the relay's subsystems.
//!
//! Zone lifecycle notifications arrive as text on the zwatch socket and
//! are turned into [`ZoneEvent`]s, which the registry task applies in the
//! order it receives them.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Name of the zone the relay itself runs in.
pub const GLOBAL_ZONE: &str = "global";

/// A lifecycle change for one zone.
///
/// Ordering across separate zwatch connections is best effort: a `Start`
/// and `Stop` for the same zone sent close together may be applied in
/// either order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZoneEvent {
    /// The zone booted; a relay channel should be opened in it.
    Start { zone: String },
    /// The zone is going down; its relay channel should be closed.
    Stop { zone: String },
}

impl ZoneEvent {
    /// Parses a `<zone>:<command>` control message.
    pub fn parse(msg: &str) -> Result<Self, ProtocolError> {
        let msg = msg.trim();
        let pieces: Vec<&str> = msg.split(':').collect();
        let (zone, command) = match pieces.as_slice() {
            [zone, command] if !zone.is_empty() => (zone.to_string(), *command),
            _ => return Err(ProtocolError::Malformed(msg.to_string())),
        };
        match command {
            "start" => Ok(ZoneEvent::Start { zone }),
            "stop" => Ok(ZoneEvent::Stop { zone }),
            other => Err(ProtocolError::InvalidCommand(other.to_string())),
        }
    }
}

/// Where a relay channel listens: a filesystem socket or, for development
/// off SmartOS, a local TCP port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SocketSpec {
    Port(u16),
    Path(PathBuf),
}

impl SocketSpec {
    pub fn is_port(&self) -> bool {
        matches!(self, SocketSpec::Port(_))
    }
}

impl std::str::FromStr for SocketSpec {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.parse::<u16>() {
            Ok(port) => SocketSpec::Port(port),
            Err(_) => SocketSpec::Path(PathBuf::from(s)),
        })
    }
}

impl fmt::Display for SocketSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketSpec::Port(port) => write!(f, "port {}", port),
            SocketSpec::Path(path) => write!(f, "{}", path.display()),
        }
    }
}
