use super::ZoneManager;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use log::debug;
use tokio::process::Command;

/// Zone manager backed by the SmartOS `zoneadm` and `zonecfg` tools.
pub struct ZoneadmZones {
    zoneadm: String,
    zonecfg: String,
}

impl Default for ZoneadmZones {
    fn default() -> Self {
        Self {
            zoneadm: "/usr/sbin/zoneadm".into(),
            zonecfg: "/usr/sbin/zonecfg".into(),
        }
    }
}

impl ZoneadmZones {
    pub fn new() -> Self {
        Self::default()
    }

    async fn run(program: &str, args: &[&str]) -> Result<String> {
        debug!("Running {} {}", program, args.join(" "));
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .with_context(|| format!("executing {}", program))?;
        if !output.status.success() {
            bail!(
                "{} {} exited with {}: {}",
                program,
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ZoneManager for ZoneadmZones {
    async fn list_zones(&self) -> Result<Vec<String>> {
        let out = Self::run(&self.zoneadm, &["list", "-p"]).await?;
        Ok(parse_zone_list(&out))
    }

    async fn get_owner(&self, zone: &str) -> Result<Option<String>> {
        let out = Self::run(
            &self.zonecfg,
            &["-z", zone, "info", "attr", "name=owner-uuid"],
        )
        .await?;
        Ok(parse_attr_value(&out))
    }
}

/// Parses `zoneadm list -p` output (`id:name:state:path:...`), keeping
/// running zones only.
fn parse_zone_list(out: &str) -> Vec<String> {
    out.lines()
        .filter_map(|line| {
            let mut fields = line.split(':');
            let _id = fields.next()?;
            let name = fields.next()?;
            let state = fields.next()?;
            (state == "running" && !name.is_empty()).then(|| name.to_string())
        })
        .collect()
}

fn parse_attr_value(out: &str) -> Option<String> {
    out.lines()
        .filter_map(|line| line.trim().strip_prefix("value:"))
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_uses_system_zone_tools() {
        let zones = ZoneadmZones::default();
        assert_eq!(zones.zoneadm, "/usr/sbin/zoneadm");
        assert_eq!(zones.zonecfg, "/usr/sbin/zonecfg");
    }

    #[test]
    fn lists_running_zones() {
        let out = "0:global:running:/::liveimg:shared:\n\
                   3:f3a2b1c4:running:/zones/f3a2b1c4:f3a2b1c4:joyent:excl:\n\
                   -:d00dfeed:installed:/zones/d00dfeed:d00dfeed:joyent:excl:\n";
        assert_eq!(parse_zone_list(out), vec!["global", "f3a2b1c4"]);
    }

    #[test]
    fn reads_owner_attr() {
        let out = "attr:\n\tname: owner-uuid\n\ttype: string\n\tvalue: 930896af-bf8c-48d4-885c-6573a94b1853\n";
        assert_eq!(
            parse_attr_value(out).as_deref(),
            Some("930896af-bf8c-48d4-885c-6573a94b1853")
        );
        assert_eq!(parse_attr_value(""), None);
    }
}
