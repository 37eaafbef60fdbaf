//! Fleet-inventory client used to locate the master.
//!
//! The inventory is the SDC machine API (MAPI). Machines carry a
//! `smartdc_role` tag; the master runs in a machine tagged `amon` owned by
//! the administrative user.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

/// Tag value identifying the monitoring-master machine.
pub const MASTER_ROLE: &str = "amon";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Machine {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ips: Vec<MachineIp>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct MachineIp {
    #[serde(default)]
    pub address: String,
}

impl Machine {
    /// The first non-empty address of this machine, if any.
    pub fn address(&self) -> Option<&str> {
        self.ips
            .iter()
            .map(|ip| ip.address.as_str())
            .find(|a| !a.is_empty())
    }
}

#[async_trait]
pub trait FleetInventory: Send + Sync {
    async fn list_machines(&self, owner: &str, role: &str) -> Result<Vec<Machine>>;
}

pub struct MapiInventory {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl MapiInventory {
    pub fn new(base_url: &str, username: &str, password: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
        }
    }
}

#[async_trait]
impl FleetInventory for MapiInventory {
    async fn list_machines(&self, owner: &str, role: &str) -> Result<Vec<Machine>> {
        let url = format!("{}/machines", self.base_url);
        let resp = self
            .client
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .query(&[("owner_uuid", owner), ("tag.smartdc_role", role)])
            .send()
            .await
            .with_context(|| format!("GET {}", url))?
            .error_for_status()
            .with_context(|| format!("GET {}", url))?;
        resp.json::<Vec<Machine>>()
            .await
            .context("decoding machine list")
    }
}
