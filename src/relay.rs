//! Relay orchestration after bootstrap.

use std::sync::Arc;

use anyhow::Result;
use log::{error, info};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::channel::ChannelOpener;
use crate::config::Config;
use crate::registry::ZoneChannelRegistry;
use crate::types::ZoneEvent;
use crate::zones::ZoneManager;
use crate::zwatch::ZwatchListener;

/// Runs the relay until `shutdown` fires.
///
/// In all-zones mode the zwatch listener is bound before the initial fan-out
/// so zone changes during startup queue up instead of being missed. All
/// channels are closed before returning.
pub async fn run(
    config: Config,
    zones: Arc<dyn ZoneManager>,
    opener: Arc<dyn ChannelOpener>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut registry = ZoneChannelRegistry::new(&config, zones, opener);
    let (event_tx, event_rx) = mpsc::channel::<ZoneEvent>(128);

    let listener_handle = if config.all_zones {
        let listener = match ZwatchListener::bind(&config.zwatch_socket, &shutdown).await? {
            Some(listener) => listener,
            None => return Ok(()),
        };
        Some(tokio::spawn(listener.run(event_tx, shutdown.child_token())))
    } else {
        drop(event_tx);
        None
    };

    if let Err(e) = registry.populate(config.all_zones).await {
        shutdown.cancel();
        if let Some(handle) = listener_handle {
            if let Err(e) = handle.await {
                error!("zwatch listener task failed: {}", e);
            }
        }
        registry.close_all().await;
        return Err(e.context("listing zones"));
    }

    if listener_handle.is_some() {
        registry.run(event_rx, shutdown.clone()).await;
    } else {
        shutdown.cancelled().await;
    }

    info!("Shutting down {} relay channel(s)", registry.len());
    if let Some(handle) = listener_handle {
        if let Err(e) = handle.await {
            error!("zwatch listener task failed: {}", e);
        }
    }
    registry.close_all().await;
    Ok(())
}
