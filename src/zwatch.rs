//! zwatch control listener.
//!
//! The other end of this socket is the `amon-zwatch` service, which opens
//! one connection per zone lifecycle change and writes `<zone>:<command>`
//! (`start` or `stop`) before closing its end. Nothing is ever written back.
//! Parsed events are forwarded to the registry task; bad messages are
//! logged and dropped.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::types::ZoneEvent;

/// Delay between bind attempts while another process holds the socket.
const BIND_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Longest control message accepted; anything beyond is cut off.
const MAX_MESSAGE_LEN: u64 = 4096;

pub struct ZwatchListener {
    listener: UnixListener,
    path: PathBuf,
}

impl ZwatchListener {
    /// Binds the control socket, waiting out `EADDRINUSE`.
    ///
    /// A socket file nobody accepts on is left over from a dead relay and is
    /// removed straight away. A live peer is waited on indefinitely.
    /// Returns `Ok(None)` if cancelled first.
    pub async fn bind(path: &Path, cancel: &CancellationToken) -> Result<Option<Self>> {
        loop {
            match UnixListener::bind(path) {
                Ok(listener) => {
                    info!("amon-relay listening to zwatch on {}", path.display());
                    return Ok(Some(Self {
                        listener,
                        path: path.to_path_buf(),
                    }));
                }
                Err(e) if e.kind() == ErrorKind::AddrInUse => {
                    if UnixStream::connect(path).await.is_err() {
                        warn!("Removing stale zwatch socket {}", path.display());
                        match std::fs::remove_file(path) {
                            Ok(()) => continue,
                            Err(e) if e.kind() == ErrorKind::NotFound => continue,
                            Err(e) => warn!("Could not remove {}: {}", path.display(), e),
                        }
                    }
                    warn!(
                        "zwatch socket {} in use. Retrying in {:?}...",
                        path.display(),
                        BIND_RETRY_DELAY
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(BIND_RETRY_DELAY) => {}
                    }
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("binding {}", path.display()));
                }
            }
        }
    }

    /// Accepts control connections until cancelled. Each connection is read
    /// on its own task, so events reach `events` in the order their
    /// connections finish.
    pub async fn run(self, events: mpsc::Sender<ZoneEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                conn = self.listener.accept() => match conn {
                    Ok((stream, _)) => {
                        let events = events.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, events).await {
                                warn!("zwatch connection failed: {:#}", e);
                            }
                        });
                    }
                    Err(e) => error!("zwatch accept failed: {}", e),
                },
            }
        }

        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!("Could not remove {}: {}", self.path.display(), e);
        }
        info!("zwatch listener stopped");
    }
}

async fn handle_connection(stream: UnixStream, events: mpsc::Sender<ZoneEvent>) -> Result<()> {
    let mut buf = Vec::new();
    stream
        .take(MAX_MESSAGE_LEN)
        .read_to_end(&mut buf)
        .await
        .context("reading zwatch message")?;
    let msg = String::from_utf8_lossy(&buf);
    debug!("zwatch message received: {}", msg);

    match ZoneEvent::parse(&msg) {
        Ok(event) => {
            if events.send(event).await.is_err() {
                warn!("Registry is gone; dropping zwatch message {:?}", msg);
            }
        }
        Err(e) => error!("{}", e),
    }
    Ok(())
}
