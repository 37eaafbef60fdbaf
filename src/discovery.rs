//! Master endpoint discovery.
//!
//! When no master URL is configured the relay asks the fleet inventory for
//! the machine tagged as the monitoring master and uses its first address.
//! The query is retried on a fixed interval until it yields an address or
//! the cancellation token fires.

use std::time::Duration;

use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::error::DiscoveryError;
use crate::inventory::{FleetInventory, MapiInventory, MASTER_ROLE};

pub const ENV_MAPI_URL: &str = "MAPI_URL";
pub const ENV_MAPI_USERNAME: &str = "MAPI_USERNAME";
pub const ENV_MAPI_PASSWORD: &str = "MAPI_PASSWORD";
pub const ENV_UFDS_ADMIN_UUID: &str = "UFDS_ADMIN_UUID";

/// Credentials and identity needed to query the inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryEnv {
    pub mapi_url: String,
    pub mapi_username: String,
    pub mapi_password: String,
    pub admin_uuid: String,
}

impl DiscoveryEnv {
    pub fn from_env() -> Result<Self, DiscoveryError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Collects all four values, reporting every missing name at once.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, DiscoveryError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut missing = Vec::new();
        let mut get = |name: &str| match lookup(name).filter(|v| !v.is_empty()) {
            Some(v) => v,
            None => {
                missing.push(name.to_string());
                String::new()
            }
        };
        let env = DiscoveryEnv {
            mapi_url: get(ENV_MAPI_URL),
            mapi_username: get(ENV_MAPI_USERNAME),
            mapi_password: get(ENV_MAPI_PASSWORD),
            admin_uuid: get(ENV_UFDS_ADMIN_UUID),
        };
        if missing.is_empty() {
            Ok(env)
        } else {
            Err(DiscoveryError::MissingEnv(missing))
        }
    }
}

/// Discovers the master using the process environment and the machine API.
pub async fn discover_master(
    poll: Duration,
    cancel: &CancellationToken,
) -> Result<String, DiscoveryError> {
    let env = DiscoveryEnv::from_env()?;
    let inventory = MapiInventory::new(&env.mapi_url, &env.mapi_username, &env.mapi_password);
    resolve_master_endpoint(&inventory, &env.admin_uuid, poll, cancel).await
}

/// Polls `inventory` until the first master candidate has an address.
///
/// Only the first candidate is considered; picking among several masters
/// is not supported.
pub async fn resolve_master_endpoint(
    inventory: &dyn FleetInventory,
    admin_uuid: &str,
    poll: Duration,
    cancel: &CancellationToken,
) -> Result<String, DiscoveryError> {
    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        debug!("Looking up master (attempt {})", attempt);
        match inventory.list_machines(admin_uuid, MASTER_ROLE).await {
            Ok(machines) => match machines.first() {
                Some(machine) => match machine.address() {
                    Some(address) => {
                        let url = format!("http://{}", address);
                        info!("Found master {} at {}", machine.name, url);
                        return Ok(url);
                    }
                    None => warn!(
                        "Master machine {} has no IP address yet. Retrying in {:?}...",
                        machine.name, poll
                    ),
                },
                None => warn!(
                    "No machine tagged smartdc_role={} found. Retrying in {:?}...",
                    MASTER_ROLE, poll
                ),
            },
            Err(e) => error!("Master lookup failed: {:#}. Retrying in {:?}...", e, poll),
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(DiscoveryError::Cancelled),
            _ = tokio::time::sleep(poll) => {}
        }
    }
}
