use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::types::SocketSpec;

pub const DEFAULT_POLL: u64 = 30;
pub const DEFAULT_DATA_DIR: &str = "/var/run/smartdc/amon-relay";
pub const DEFAULT_SOCKET: &str = "/var/run/.smartdc-amon.sock";
pub const DEFAULT_ZWATCH_SOCKET: &str = "/var/run/.smartdc-amon-zwatch.sock";

/// Unresolved settings, layered from defaults, config files, environment
/// and command-line flags.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    pub data_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compute_node_uuid: Option<String>,
    pub poll: u64,
    pub socket: SocketSpec,
    pub zwatch_socket: PathBuf,
    pub all_zones: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: DEFAULT_DATA_DIR.into(),
            master_url: None,
            compute_node_uuid: None,
            poll: DEFAULT_POLL,
            socket: SocketSpec::Path(DEFAULT_SOCKET.into()),
            zwatch_socket: DEFAULT_ZWATCH_SOCKET.into(),
            all_zones: false,
        }
    }
}

/// Command-line values. Only flags actually given are serialized so they
/// override the lower layers without clobbering them with defaults.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compute_node_uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket: Option<SocketSpec>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub all_zones: bool,
}

impl Settings {
    pub fn load(overrides: &Overrides) -> anyhow::Result<Self> {
        Self::figment(overrides)
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
    }

    fn figment(overrides: &Overrides) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file("amon-relay.toml"))
            .merge(Json::file("amon-relay.json"))
            .merge(Env::prefixed("AMON_RELAY_"))
            .merge(Serialized::defaults(overrides.clone()))
    }

    /// Rejects flag combinations that can never work.
    pub fn validate(&self) -> Result<(), String> {
        if self.all_zones && self.socket.is_port() {
            return Err("cannot use '-Z' and a port number to '-s'".into());
        }
        if self.poll == 0 {
            return Err("poll interval must be at least one second".into());
        }
        Ok(())
    }
}

/// Fully resolved relay configuration. Immutable once bootstrap finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub socket: SocketSpec,
    pub zwatch_socket: PathBuf,
    pub poll: u64,
    pub compute_node_uuid: String,
    pub master_url: String,
    pub all_zones: bool,
}
