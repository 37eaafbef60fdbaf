//! Startup sequence: turns layered [`Settings`] into a resolved [`Config`].
//!
//! Steps run in order and the first failure aborts the rest.

use std::time::Duration;

use log::info;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, Settings};
use crate::discovery;
use crate::error::BootstrapError;
use crate::node::SystemInfo;

pub async fn bootstrap(
    settings: Settings,
    sysinfo: &dyn SystemInfo,
    cancel: &CancellationToken,
) -> Result<Config, BootstrapError> {
    settings.validate().map_err(BootstrapError::InvalidConfig)?;

    tokio::fs::create_dir_all(&settings.data_dir)
        .await
        .map_err(|source| BootstrapError::DataDir {
            path: settings.data_dir.clone(),
            source,
        })?;

    let compute_node_uuid = match settings.compute_node_uuid {
        Some(uuid) => uuid,
        None => sysinfo
            .node_uuid()
            .await
            .map_err(BootstrapError::NodeIdentity)?,
    };

    info!(
        "config: data_dir={} socket={} zwatch_socket={} poll={}s compute_node_uuid={} master_url={} all_zones={}",
        settings.data_dir.display(),
        settings.socket,
        settings.zwatch_socket.display(),
        settings.poll,
        compute_node_uuid,
        settings.master_url.as_deref().unwrap_or("(discover)"),
        settings.all_zones,
    );

    let master_url = match settings.master_url {
        Some(url) => url,
        None => {
            discovery::discover_master(Duration::from_secs(settings.poll), cancel).await?
        }
    };

    Ok(Config {
        data_dir: settings.data_dir,
        socket: settings.socket,
        zwatch_socket: settings.zwatch_socket,
        poll: settings.poll,
        compute_node_uuid,
        master_url,
        all_zones: settings.all_zones,
    })
}
