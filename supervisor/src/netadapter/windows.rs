//! Windows adapter: netsh-based configuration with a sealed restore path.
//!
//! `save_config` captures a `netsh` interface dump. Because restoring means
//! executing that dump through `netsh -f`, the blob is HMAC-tagged under a
//! key held only in this process, and every line must pass the directive
//! allowlist in [`super::script`] before execution.

use super::cmd::run_tool;
use super::{NetworkAdapter, SavedConfig, Seal, script};
use crate::error::SupervisorError;
use async_trait::async_trait;
use rand::RngCore;
use rand::rngs::OsRng;
use std::net::Ipv4Addr;
use tokio::sync::Mutex;

const TOOL_DIRS: &[&str] = &["C:\\Windows\\System32", "C:\\Windows\\SysWOW64"];

pub struct WindowsAdapter {
    diversion: Mutex<Option<Ipv4Addr>>,
}

impl WindowsAdapter {
    pub fn new() -> Self {
        Self {
            diversion: Mutex::new(None),
        }
    }
}

impl Default for WindowsAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkAdapter for WindowsAdapter {
    async fn create_tap(
        &self,
        name: &str,
        host_ip: Ipv4Addr,
        _vm_ip: Ipv4Addr,
        mask: Ipv4Addr,
    ) -> Result<(), SupervisorError> {
        // The TAP driver provides the adapter; we only address it.
        run_tool(
            "netsh.exe",
            TOOL_DIRS,
            &[
                "interface",
                "ip",
                "set",
                "address",
                &format!("name={name}"),
                "static",
                &host_ip.to_string(),
                &mask.to_string(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn destroy_tap(&self, name: &str) -> Result<(), SupervisorError> {
        // Leave the driver-owned adapter in place; hand addressing back to DHCP.
        run_tool(
            "netsh.exe",
            TOOL_DIRS,
            &[
                "interface",
                "ip",
                "set",
                "address",
                &format!("name={name}"),
                "dhcp",
            ],
        )
        .await?;
        Ok(())
    }

    async fn save_config(&self) -> Result<SavedConfig, SupervisorError> {
        let dump = run_tool("netsh.exe", TOOL_DIRS, &["-c", "interface", "dump"]).await?;
        let blob = dump.into_bytes();
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        let tag = script::hmac_sha256(&key, &blob);
        Ok(SavedConfig::new("windows", blob, Some(Seal { key, tag })))
    }

    async fn restore_config(&self, saved: SavedConfig) -> Result<(), SupervisorError> {
        if saved.platform() != "windows" {
            return Err(SupervisorError::NetworkSetup(format!(
                "snapshot from {:?} cannot restore a windows host",
                saved.platform()
            )));
        }
        let Some(seal) = saved.seal() else {
            return Err(SupervisorError::NetworkSetup(
                "saved network blob is missing its integrity seal".to_string(),
            ));
        };
        if !script::verify(&seal.key, saved.blob(), &seal.tag) {
            return Err(SupervisorError::NetworkSetup(
                "saved network blob failed integrity verification".to_string(),
            ));
        }

        let text = String::from_utf8_lossy(saved.blob()).into_owned();
        let filtered = script::filter_script(&text)?;

        let mut suffix = [0u8; 8];
        OsRng.fill_bytes(&mut suffix);
        let path = std::env::temp_dir().join(format!("torgate-restore-{}.txt", hex::encode(suffix)));
        tokio::fs::write(&path, filtered).await?;
        let result = run_tool(
            "netsh.exe",
            TOOL_DIRS,
            &["-f", &path.to_string_lossy()],
        )
        .await;
        let _ = tokio::fs::remove_file(&path).await;
        result?;
        Ok(())
    }

    async fn setup_routing(&self, _tap_name: &str, vm_ip: Ipv4Addr) -> Result<(), SupervisorError> {
        run_tool(
            "route.exe",
            TOOL_DIRS,
            &[
                "add",
                "0.0.0.0",
                "mask",
                "0.0.0.0",
                &vm_ip.to_string(),
                "metric",
                "1",
            ],
        )
        .await?;
        let mut diversion = self.diversion.lock().await;
        *diversion = Some(vm_ip);
        tracing::info!(gateway = %vm_ip, "diversion route installed");
        Ok(())
    }

    async fn teardown_routing(&self) -> Result<(), SupervisorError> {
        let mut diversion = self.diversion.lock().await;
        let Some(vm_ip) = diversion.take() else {
            return Ok(());
        };
        if let Err(err) = run_tool(
            "route.exe",
            TOOL_DIRS,
            &["delete", "0.0.0.0", "mask", "0.0.0.0", &vm_ip.to_string()],
        )
        .await
        {
            tracing::warn!(error = %err, "diversion route removal reported an error");
        }
        Ok(())
    }

    async fn flush_dns(&self) -> Result<(), SupervisorError> {
        run_tool("ipconfig.exe", TOOL_DIRS, &["/flushdns"]).await?;
        Ok(())
    }
}
