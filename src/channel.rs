//! Per-zone relay channels.
//!
//! A channel listens on the relay socket inside one zone and keeps a local
//! copy of that zone's agent probes, refreshed from the master every poll
//! interval. Agents connecting to the socket are handed the cached probe
//! document.

use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UnixListener, UnixStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::types::SocketSpec;

/// Root under which each non-global zone's filesystem is mounted.
const ZONES_ROOT: &str = "/zones";

/// Upper bound for a single poll of the master.
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// How long an agent gets to read the cached probes.
const ANSWER_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything needed to open a channel for one zone.
#[derive(Debug, Clone)]
pub struct ChannelParams {
    pub zone: String,
    pub owner: String,
    pub socket: SocketSpec,
    /// Listen on `socket` directly instead of inside the zone's root.
    pub local_mode: bool,
    pub master_url: String,
    pub data_dir: PathBuf,
    pub poll: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    Closed,
}

/// One open relay path. Owned by the registry.
#[derive(Debug)]
pub struct ZoneChannel {
    zone: String,
    owner: String,
    address: SocketSpec,
    state: ChannelState,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ZoneChannel {
    pub fn new(
        zone: String,
        owner: String,
        address: SocketSpec,
        cancel: CancellationToken,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            zone,
            owner,
            address,
            state: ChannelState::Open,
            cancel,
            task,
        }
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn address(&self) -> &SocketSpec {
        &self.address
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Stops the channel's task and waits for it to release the socket.
    /// Closing twice is a no-op.
    pub async fn close(&mut self) {
        if self.state == ChannelState::Closed {
            return;
        }
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Relay task for zone {} ended abnormally: {}", self.zone, e);
            }
        }
        self.state = ChannelState::Closed;
    }
}

#[async_trait]
pub trait ChannelOpener: Send + Sync {
    async fn open(&self, params: ChannelParams) -> Result<ZoneChannel>;
}

/// Opens real channels: binds the socket and spawns the serve loop.
pub struct RelayChannelOpener {
    client: reqwest::Client,
}

impl RelayChannelOpener {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(POLL_TIMEOUT)
            .build()
            .context("building master HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ChannelOpener for RelayChannelOpener {
    async fn open(&self, params: ChannelParams) -> Result<ZoneChannel> {
        let address = channel_address(&params)?;
        let root = zone_root(&params);
        let listener = ChannelListener::bind(&address, root.as_deref())
            .await
            .with_context(|| format!("binding {}", address))?;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(serve(
            listener,
            params.clone(),
            self.client.clone(),
            cancel.clone(),
        ));
        Ok(ZoneChannel::new(
            params.zone,
            params.owner,
            address,
            cancel,
            Some(task),
        ))
    }
}

/// The zone's root directory as seen from the global zone, or `None` for a
/// local channel.
fn zone_root(params: &ChannelParams) -> Option<PathBuf> {
    (!params.local_mode).then(|| Path::new(ZONES_ROOT).join(&params.zone).join("root"))
}

/// Where the channel for `params.zone` listens. Non-global zones share the
/// configured path, resolved inside each zone's root.
pub fn channel_address(params: &ChannelParams) -> Result<SocketSpec> {
    let root = match zone_root(params) {
        Some(root) => root,
        None => return Ok(params.socket.clone()),
    };
    match &params.socket {
        SocketSpec::Port(port) => bail!(
            "cannot listen on port {} inside zone {}",
            port,
            params.zone
        ),
        SocketSpec::Path(path) => {
            let relative = path.strip_prefix("/").unwrap_or(path);
            Ok(SocketSpec::Path(root.join(relative)))
        }
    }
}

/// Fails if any directory between `root` and `path` is a symlink. Paths
/// under a zone root belong to the zone and must not redirect the global
/// zone elsewhere.
fn refuse_symlinks(root: &Path, path: &Path) -> Result<()> {
    for dir in path.ancestors().skip(1) {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        match std::fs::symlink_metadata(dir) {
            Ok(meta) if meta.file_type().is_symlink() => {
                bail!("{} is a symlink", dir.display())
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Removes a socket file left behind by a dead listener. Anything else at
/// `path` (a live socket, a symlink, a regular file) is left alone and
/// reported.
async fn clear_stale_socket(path: &Path) -> Result<()> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if !meta.file_type().is_socket() {
        bail!("{} exists and is not a socket", path.display());
    }
    if UnixStream::connect(path).await.is_ok() {
        bail!("{} is in use by another listener", path.display());
    }
    std::fs::remove_file(path)?;
    debug!("Removed stale socket {}", path.display());
    Ok(())
}

/// Device and inode of a filesystem entry, without following symlinks.
fn file_id(path: &Path) -> Option<(u64, u64)> {
    std::fs::symlink_metadata(path)
        .ok()
        .map(|meta| (meta.dev(), meta.ino()))
}

enum ChannelListener {
    Unix {
        listener: UnixListener,
        path: PathBuf,
        id: Option<(u64, u64)>,
    },
    Tcp(TcpListener),
}

impl ChannelListener {
    async fn bind(address: &SocketSpec, zone_root: Option<&Path>) -> Result<Self> {
        match address {
            SocketSpec::Port(port) => Ok(ChannelListener::Tcp(
                TcpListener::bind(("127.0.0.1", *port)).await?,
            )),
            SocketSpec::Path(path) => {
                if let Some(root) = zone_root {
                    refuse_symlinks(root, path)?;
                }
                clear_stale_socket(path).await?;
                let listener = UnixListener::bind(path)?;
                Ok(ChannelListener::Unix {
                    listener,
                    path: path.clone(),
                    id: file_id(path),
                })
            }
        }
    }

    async fn accept(&self) -> std::io::Result<Box<dyn AsyncWrite + Unpin + Send>> {
        match self {
            ChannelListener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            ChannelListener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
        }
    }

    /// Unlinks the socket, unless the path has since been taken over by
    /// another listener.
    fn cleanup(&self) {
        if let ChannelListener::Unix { path, id, .. } = self {
            if id.is_none() || file_id(path) != *id {
                debug!("Socket {} was replaced; leaving it", path.display());
                return;
            }
            if let Err(e) = std::fs::remove_file(path) {
                debug!("Could not remove socket {}: {}", path.display(), e);
            }
        }
    }
}

async fn serve(
    listener: ChannelListener,
    params: ChannelParams,
    client: reqwest::Client,
    cancel: CancellationToken,
) {
    let cache = params.data_dir.join(format!("{}.json", params.zone));
    info!(
        "Relay channel open for zone {} (owner={})",
        params.zone, params.owner
    );

    tokio::join!(
        poll_loop(&client, &params, &cache, &cancel),
        accept_loop(&listener, &params.zone, &cache, &cancel),
    );

    listener.cleanup();
    info!("Relay channel closed for zone {}", params.zone);
}

async fn poll_loop(
    client: &reqwest::Client,
    params: &ChannelParams,
    cache: &Path,
    cancel: &CancellationToken,
) {
    let mut ticker = tokio::time::interval(params.poll);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            res = poll_master(client, params, cache) => {
                if let Err(e) = res {
                    warn!("Polling master for zone {} failed: {:#}", params.zone, e);
                }
            }
        }
    }
}

/// Answers each agent on its own task so a slow reader holds up neither
/// other agents nor `close`. Unfinished answers are aborted on cancel.
async fn accept_loop(
    listener: &ChannelListener,
    zone: &str,
    cache: &Path,
    cancel: &CancellationToken,
) {
    let mut answers = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            conn = listener.accept() => match conn {
                Ok(stream) => {
                    let cache = cache.to_path_buf();
                    let zone = zone.to_string();
                    answers.spawn(async move {
                        match tokio::time::timeout(ANSWER_TIMEOUT, answer(stream, &cache)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => warn!("Failed to answer agent in zone {}: {}", zone, e),
                            Err(_) => warn!(
                                "Agent in zone {} did not take its probes within {:?}; dropping it",
                                zone, ANSWER_TIMEOUT
                            ),
                        }
                    });
                }
                Err(e) => warn!("Accept failed in zone {}: {}", zone, e),
            },
            Some(_) = answers.join_next(), if !answers.is_empty() => {}
        }
    }
    answers.shutdown().await;
}

async fn poll_master(client: &reqwest::Client, params: &ChannelParams, cache: &Path) -> Result<()> {
    let url = format!("{}/agentprobes", params.master_url.trim_end_matches('/'));
    let body = client
        .get(&url)
        .query(&[("zone", params.zone.as_str())])
        .send()
        .await
        .with_context(|| format!("GET {}", url))?
        .error_for_status()?
        .bytes()
        .await?;
    tokio::fs::write(cache, &body)
        .await
        .with_context(|| format!("writing {}", cache.display()))?;
    debug!("Updated probes for zone {} ({} bytes)", params.zone, body.len());
    Ok(())
}

async fn answer(mut stream: Box<dyn AsyncWrite + Unpin + Send>, cache: &Path) -> std::io::Result<()> {
    let body = match tokio::fs::read(cache).await {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => b"[]".to_vec(),
        Err(e) => return Err(e),
    };
    stream.write_all(&body).await?;
    stream.shutdown().await
}
