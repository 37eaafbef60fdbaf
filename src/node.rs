//! Compute node identity.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

#[async_trait]
pub trait SystemInfo: Send + Sync {
    /// The UUID of the compute node this relay runs on.
    async fn node_uuid(&self) -> Result<String>;
}

/// Reads the node UUID from the SmartOS `sysinfo` tool.
pub struct SysinfoCommand {
    program: String,
}

impl SysinfoCommand {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for SysinfoCommand {
    fn default() -> Self {
        Self {
            program: "sysinfo".into(),
        }
    }
}

#[derive(Deserialize)]
struct SysinfoOutput {
    #[serde(rename = "UUID")]
    uuid: Option<String>,
}

#[async_trait]
impl SystemInfo for SysinfoCommand {
    async fn node_uuid(&self) -> Result<String> {
        let output = Command::new(&self.program)
            .output()
            .await
            .with_context(|| format!("executing {}", self.program))?;
        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        parse_sysinfo(&output.stdout)
    }
}

fn parse_sysinfo(stdout: &[u8]) -> Result<String> {
    let info: SysinfoOutput =
        serde_json::from_slice(stdout).context("parsing sysinfo output")?;
    match info.uuid {
        Some(uuid) if !uuid.is_empty() => Ok(uuid),
        _ => Err(anyhow!("sysinfo output has no \"UUID\" field")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_runs_sysinfo_from_path() {
        assert_eq!(SysinfoCommand::new().program, "sysinfo");
        assert_eq!(SysinfoCommand::default().program, "sysinfo");
    }

    #[test]
    fn reads_uuid_field() {
        let out = br#"{"UUID": "44454c4c-3200-1042-8038-b4c04f383253", "Hostname": "cn0"}"#;
        assert_eq!(
            parse_sysinfo(out).unwrap(),
            "44454c4c-3200-1042-8038-b4c04f383253"
        );
    }

    #[test]
    fn missing_uuid_or_bad_json_fails() {
        assert!(parse_sysinfo(br#"{"Hostname": "cn0"}"#).is_err());
        assert!(parse_sysinfo(br#"{"UUID": ""}"#).is_err());
        assert!(parse_sysinfo(b"not json").is_err());
    }

    #[tokio::test]
    async fn missing_program_fails() {
        let sysinfo = SysinfoCommand {
            program: "/nonexistent/sysinfo".into(),
        };
        assert!(sysinfo.node_uuid().await.is_err());
    }
}
