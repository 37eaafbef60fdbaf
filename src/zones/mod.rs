use anyhow::Result;
use async_trait::async_trait;

pub mod zoneadm;
pub use zoneadm::ZoneadmZones;

#[async_trait]
pub trait ZoneManager: Send + Sync {
    /// Names of the zones currently running on this node, global included.
    async fn list_zones(&self) -> Result<Vec<String>>;

    /// The owning customer of a zone, or `None` if the zone has no
    /// `owner-uuid` attribute.
    async fn get_owner(&self, zone: &str) -> Result<Option<String>>;
}
