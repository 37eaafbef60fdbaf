//! The zone → channel registry.
//!
//! The registry is owned by a single task. Zone events from the zwatch
//! listener reach it through an `mpsc` channel, so every mutation of the map
//! runs to completion before the next one starts and no lock is needed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelOpener, ChannelParams, ZoneChannel};
use crate::config::Config;
use crate::error::RegistryError;
use crate::types::{SocketSpec, ZoneEvent, GLOBAL_ZONE};
use crate::zones::ZoneManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    Opened,
    /// The zone has no owner and is not managed.
    Skipped,
}

pub struct ZoneChannelRegistry {
    channels: HashMap<String, ZoneChannel>,
    zones: Arc<dyn ZoneManager>,
    opener: Arc<dyn ChannelOpener>,
    node_uuid: String,
    socket: SocketSpec,
    master_url: String,
    data_dir: PathBuf,
    poll: Duration,
}

impl ZoneChannelRegistry {
    pub fn new(config: &Config, zones: Arc<dyn ZoneManager>, opener: Arc<dyn ChannelOpener>) -> Self {
        Self {
            channels: HashMap::new(),
            zones,
            opener,
            node_uuid: config.compute_node_uuid.clone(),
            socket: config.socket.clone(),
            master_url: config.master_url.clone(),
            data_dir: config.data_dir.clone(),
            poll: Duration::from_secs(config.poll),
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn get(&self, zone: &str) -> Option<&ZoneChannel> {
        self.channels.get(zone)
    }

    /// Opens a channel for `zone`.
    ///
    /// The global zone uses the node's own identity; every other zone needs
    /// an `owner-uuid`, and a zone without one is skipped. A live channel
    /// already registered for the zone is closed and replaced.
    pub async fn open(&mut self, zone: &str) -> Result<OpenOutcome, RegistryError> {
        let (owner, local_mode) = if zone == GLOBAL_ZONE {
            (self.node_uuid.clone(), true)
        } else {
            match self.zones.get_owner(zone).await {
                Ok(Some(owner)) => (owner, false),
                Ok(None) => {
                    warn!("No \"owner-uuid\" attribute found on zone {}. Skipping.", zone);
                    return Ok(OpenOutcome::Skipped);
                }
                Err(e) => {
                    warn!("Could not read owner of zone {}: {:#}. Skipping.", zone, e);
                    return Ok(OpenOutcome::Skipped);
                }
            }
        };

        let params = ChannelParams {
            zone: zone.to_string(),
            owner,
            socket: self.socket.clone(),
            local_mode,
            master_url: self.master_url.clone(),
            data_dir: self.data_dir.clone(),
            poll: self.poll,
        };
        // The old channel must release the shared path before the new one binds it.
        if let Some(mut displaced) = self.channels.remove(zone) {
            warn!("Zone {} already had an open relay channel; closing the old one", zone);
            displaced.close().await;
        }

        debug!(
            "Starting new amon-relay for zone {} at {} (owner={})",
            zone, params.socket, params.owner
        );
        let channel = self
            .opener
            .open(params)
            .await
            .map_err(|reason| RegistryError::Open {
                zone: zone.to_string(),
                reason,
            })?;
        info!(
            "amon-relay listening in zone {} at {} (owner={})",
            channel.zone(),
            channel.address(),
            channel.owner()
        );

        self.channels.insert(zone.to_string(), channel);
        Ok(OpenOutcome::Opened)
    }

    /// Closes and forgets the channel for `zone`.
    pub async fn close(&mut self, zone: &str) -> Result<(), RegistryError> {
        let mut channel = self
            .channels
            .remove(zone)
            .ok_or_else(|| RegistryError::NotFound(zone.to_string()))?;
        channel.close().await;
        info!("amon-relay shut down in zone {}", zone);
        Ok(())
    }

    pub async fn close_all(&mut self) {
        let zones: Vec<String> = self.channels.keys().cloned().collect();
        for zone in zones {
            if let Err(e) = self.close(&zone).await {
                warn!("{}", e);
            }
        }
    }

    /// Opens the startup set of channels: just the global zone, or every
    /// running zone when `all_zones` is set. Returns how many opened.
    pub async fn populate(&mut self, all_zones: bool) -> Result<usize> {
        let zones = if all_zones {
            self.zones.list_zones().await?
        } else {
            vec![GLOBAL_ZONE.to_string()]
        };
        info!("Opening relay channels for {} zone(s)", zones.len());

        let mut opened = 0;
        for zone in zones {
            match self.open(&zone).await {
                Ok(OpenOutcome::Opened) => opened += 1,
                Ok(OpenOutcome::Skipped) => {}
                Err(e) => error!("{}", e),
            }
        }
        Ok(opened)
    }

    pub async fn apply(&mut self, event: ZoneEvent) {
        let result = match &event {
            ZoneEvent::Start { zone } => {
                debug!("Starting zone: {}", zone);
                self.open(zone).await.map(|_| ())
            }
            ZoneEvent::Stop { zone } => self.close(zone).await,
        };
        match result {
            Ok(()) => {}
            Err(e @ RegistryError::NotFound(_)) => warn!("{}", e),
            Err(e) => error!("{}", e),
        }
    }

    /// Applies events until the sender side goes away or `cancel` fires.
    pub async fn run(&mut self, mut events: mpsc::Receiver<ZoneEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.apply(event).await,
                    None => {
                        debug!("Zone event channel closed");
                        break;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::channel::ChannelState;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    pub(crate) struct FakeZones {
        pub zones: Vec<String>,
        pub owners: HashMap<String, String>,
        pub list_calls: AtomicUsize,
        pub list_error: bool,
    }

    impl FakeZones {
        pub fn new(zones: &[&str], owners: &[(&str, &str)]) -> Self {
            Self {
                zones: zones.iter().map(|z| z.to_string()).collect(),
                owners: owners
                    .iter()
                    .map(|(z, o)| (z.to_string(), o.to_string()))
                    .collect(),
                list_calls: AtomicUsize::new(0),
                list_error: false,
            }
        }
    }

    #[async_trait]
    impl ZoneManager for FakeZones {
        async fn list_zones(&self) -> Result<Vec<String>> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            if self.list_error {
                anyhow::bail!("zoneadm exited with 1");
            }
            Ok(self.zones.clone())
        }

        async fn get_owner(&self, zone: &str) -> Result<Option<String>> {
            match zone {
                "broken" => Err(anyhow::anyhow!("zonecfg exited with 1")),
                _ => Ok(self.owners.get(zone).cloned()),
            }
        }
    }

    /// Hands out task-less channels and remembers each one's cancel token,
    /// so tests can see which channels were closed.
    #[derive(Default)]
    pub(crate) struct FakeOpener {
        pub opened: Mutex<Vec<(ChannelParams, CancellationToken)>>,
    }

    impl FakeOpener {
        pub fn opened_zones(&self) -> Vec<String> {
            self.opened
                .lock()
                .unwrap()
                .iter()
                .map(|(p, _)| p.zone.clone())
                .collect()
        }

        pub fn live_count(&self, zone: &str) -> usize {
            self.opened
                .lock()
                .unwrap()
                .iter()
                .filter(|(p, c)| p.zone == zone && !c.is_cancelled())
                .count()
        }
    }

    #[async_trait]
    impl ChannelOpener for FakeOpener {
        async fn open(&self, params: ChannelParams) -> Result<ZoneChannel> {
            if params.zone == "unbindable" {
                anyhow::bail!("Address already in use");
            }
            let cancel = CancellationToken::new();
            self.opened.lock().unwrap().push((params.clone(), cancel.clone()));
            Ok(ZoneChannel::new(
                params.zone,
                params.owner,
                params.socket,
                cancel,
                None,
            ))
        }
    }

    pub(crate) fn test_config(all_zones: bool) -> Config {
        Config {
            data_dir: "/var/run/smartdc/amon-relay".into(),
            socket: SocketSpec::Path("/var/run/.smartdc-amon.sock".into()),
            zwatch_socket: "/var/run/.smartdc-amon-zwatch.sock".into(),
            poll: 30,
            compute_node_uuid: "44454c4c-3200-1042-8038-b4c04f383253".into(),
            master_url: "http://10.99.99.20".into(),
            all_zones,
        }
    }

    fn registry(zones: Arc<FakeZones>, opener: Arc<FakeOpener>, all_zones: bool) -> ZoneChannelRegistry {
        ZoneChannelRegistry::new(&test_config(all_zones), zones, opener)
    }

    #[tokio::test]
    async fn global_zone_uses_local_identity() {
        let zones = Arc::new(FakeZones::new(&[], &[]));
        let opener = Arc::new(FakeOpener::default());
        let mut reg = registry(zones, opener.clone(), false);

        assert_eq!(reg.open(GLOBAL_ZONE).await.unwrap(), OpenOutcome::Opened);
        let opened = opener.opened.lock().unwrap();
        let (params, _) = &opened[0];
        assert!(params.local_mode);
        assert_eq!(params.owner, "44454c4c-3200-1042-8038-b4c04f383253");
        assert_eq!(params.master_url, "http://10.99.99.20");
        assert_eq!(params.poll, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn zone_without_owner_is_skipped() {
        let zones = Arc::new(FakeZones::new(&[], &[]));
        let opener = Arc::new(FakeOpener::default());
        let mut reg = registry(zones, opener.clone(), true);

        assert_eq!(reg.open("orphan").await.unwrap(), OpenOutcome::Skipped);
        assert_eq!(reg.open("broken").await.unwrap(), OpenOutcome::Skipped);
        assert!(reg.is_empty());
        assert!(opener.opened_zones().is_empty());
    }

    #[tokio::test]
    async fn open_failure_is_an_error_and_registers_nothing() {
        let zones = Arc::new(FakeZones::new(&[], &[("unbindable", "owner-1")]));
        let opener = Arc::new(FakeOpener::default());
        let mut reg = registry(zones, opener, true);

        let err = reg.open("unbindable").await.unwrap_err();
        assert!(matches!(err, RegistryError::Open { .. }));
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn reopening_a_live_zone_replaces_and_closes_the_old_channel() {
        let zones = Arc::new(FakeZones::new(&[], &[("zoneA", "owner-a")]));
        let opener = Arc::new(FakeOpener::default());
        let mut reg = registry(zones, opener.clone(), true);

        reg.open("zoneA").await.unwrap();
        reg.open("zoneA").await.unwrap();

        assert_eq!(reg.len(), 1);
        assert_eq!(opener.opened_zones(), vec!["zoneA", "zoneA"]);
        assert_eq!(opener.live_count("zoneA"), 1);
        assert_eq!(reg.get("zoneA").unwrap().state(), ChannelState::Open);
    }

    #[tokio::test]
    async fn close_removes_the_entry_and_closes_the_channel() {
        let zones = Arc::new(FakeZones::new(&[], &[("zoneA", "owner-a")]));
        let opener = Arc::new(FakeOpener::default());
        let mut reg = registry(zones, opener.clone(), true);

        reg.open("zoneA").await.unwrap();
        reg.close("zoneA").await.unwrap();
        assert!(reg.is_empty());
        assert_eq!(opener.live_count("zoneA"), 0);
    }

    #[tokio::test]
    async fn close_of_unknown_zone_is_not_found() {
        let zones = Arc::new(FakeZones::new(&[], &[]));
        let mut reg = registry(zones, Arc::new(FakeOpener::default()), true);

        match reg.close("ghost").await {
            Err(RegistryError::NotFound(zone)) => assert_eq!(zone, "ghost"),
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn single_zone_mode_opens_only_global() {
        let zones = Arc::new(FakeZones::new(&["global", "zoneA"], &[("zoneA", "owner-a")]));
        let opener = Arc::new(FakeOpener::default());
        let mut reg = registry(zones.clone(), opener.clone(), false);

        assert_eq!(reg.populate(false).await.unwrap(), 1);
        assert_eq!(opener.opened_zones(), vec![GLOBAL_ZONE]);
        assert_eq!(zones.list_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn all_zones_mode_opens_every_owned_zone() {
        let zones = Arc::new(FakeZones::new(
            &["global", "zoneA", "broken", "orphan", "zoneB"],
            &[("zoneA", "owner-a"), ("zoneB", "owner-b")],
        ));
        let opener = Arc::new(FakeOpener::default());
        let mut reg = registry(zones, opener.clone(), true);

        assert_eq!(reg.populate(true).await.unwrap(), 3);
        assert_eq!(reg.len(), 3);
        assert!(reg.get("broken").is_none());
        assert!(reg.get("orphan").is_none());

        let opened = opener.opened.lock().unwrap();
        for (params, _) in opened.iter() {
            match params.zone.as_str() {
                "global" => assert!(params.local_mode),
                "zoneA" => {
                    assert!(!params.local_mode);
                    assert_eq!(params.owner, "owner-a");
                }
                "zoneB" => {
                    assert!(!params.local_mode);
                    assert_eq!(params.owner, "owner-b");
                }
                other => panic!("unexpected zone {}", other),
            }
        }
    }

    #[tokio::test]
    async fn run_applies_events_in_order_until_sender_drops() {
        let zones = Arc::new(FakeZones::new(&[], &[("zoneA", "owner-a"), ("zoneB", "owner-b")]));
        let opener = Arc::new(FakeOpener::default());
        let mut reg = registry(zones, opener.clone(), true);

        let (tx, rx) = mpsc::channel(8);
        tx.send(ZoneEvent::Start { zone: "zoneA".into() }).await.unwrap();
        tx.send(ZoneEvent::Start { zone: "zoneB".into() }).await.unwrap();
        tx.send(ZoneEvent::Stop { zone: "zoneA".into() }).await.unwrap();
        tx.send(ZoneEvent::Stop { zone: "never-started".into() }).await.unwrap();
        drop(tx);

        reg.run(rx, CancellationToken::new()).await;

        assert_eq!(reg.len(), 1);
        assert!(reg.get("zoneB").is_some());
        assert_eq!(opener.live_count("zoneA"), 0);
    }

    #[tokio::test]
    async fn close_all_closes_everything() {
        let zones = Arc::new(FakeZones::new(&["global", "zoneA"], &[("zoneA", "owner-a")]));
        let opener = Arc::new(FakeOpener::default());
        let mut reg = registry(zones, opener.clone(), true);

        reg.populate(true).await.unwrap();
        reg.close_all().await;
        assert!(reg.is_empty());
        assert_eq!(opener.live_count("global"), 0);
        assert_eq!(opener.live_count("zoneA"), 0);
    }

    #[tokio::test]
    async fn reopening_a_real_channel_keeps_its_socket_reachable() {
        use crate::channel::RelayChannelOpener;
        use tokio::io::AsyncReadExt;
        use tokio::net::UnixStream;

        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("relay.sock");
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            socket: SocketSpec::Path(sock.clone()),
            master_url: "http://127.0.0.1:1".into(),
            ..test_config(false)
        };
        let mut reg = ZoneChannelRegistry::new(
            &config,
            Arc::new(FakeZones::new(&[], &[])),
            Arc::new(RelayChannelOpener::new().unwrap()),
        );

        reg.open(GLOBAL_ZONE).await.unwrap();
        reg.open(GLOBAL_ZONE).await.unwrap();

        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get(GLOBAL_ZONE).unwrap().state(), ChannelState::Open);
        assert!(sock.exists());

        let mut stream = UnixStream::connect(&sock).await.unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();
        assert_eq!(body, "[]");

        reg.close_all().await;
        assert!(!sock.exists());
    }
}
