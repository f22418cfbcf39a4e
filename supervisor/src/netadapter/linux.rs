//! Linux adapter: iproute2 for TAP and routing, resolv.conf for DNS.

use super::cmd::run_tool;
use super::{NetworkAdapter, SavedConfig, mask_to_prefix};
use crate::error::SupervisorError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use tokio::sync::Mutex;

const TOOL_DIRS: &[&str] = &["/usr/sbin", "/sbin", "/usr/bin", "/bin"];
const RESOLV_CONF: &str = "/etc/resolv.conf";

#[derive(Serialize, Deserialize)]
struct LinuxSnapshot {
    routes: String,
    resolv: String,
}

struct Diversion {
    tap: String,
    vm_ip: Ipv4Addr,
}

pub struct LinuxAdapter {
    diversion: Mutex<Option<Diversion>>,
}

impl LinuxAdapter {
    pub fn new() -> Self {
        Self {
            diversion: Mutex::new(None),
        }
    }
}

impl Default for LinuxAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkAdapter for LinuxAdapter {
    async fn create_tap(
        &self,
        name: &str,
        host_ip: Ipv4Addr,
        _vm_ip: Ipv4Addr,
        mask: Ipv4Addr,
    ) -> Result<(), SupervisorError> {
        let prefix = mask_to_prefix(mask)?;
        run_tool(
            "ip",
            TOOL_DIRS,
            &["tuntap", "add", "dev", name, "mode", "tap"],
        )
        .await?;
        run_tool(
            "ip",
            TOOL_DIRS,
            &["addr", "add", &format!("{host_ip}/{prefix}"), "dev", name],
        )
        .await?;
        run_tool("ip", TOOL_DIRS, &["link", "set", name, "up"]).await?;
        tracing::info!(tap = name, %host_ip, prefix, "tap device up");
        Ok(())
    }

    async fn destroy_tap(&self, name: &str) -> Result<(), SupervisorError> {
        run_tool(
            "ip",
            TOOL_DIRS,
            &["tuntap", "del", "dev", name, "mode", "tap"],
        )
        .await?;
        Ok(())
    }

    async fn save_config(&self) -> Result<SavedConfig, SupervisorError> {
        let routes = run_tool("ip", TOOL_DIRS, &["route", "show"]).await?;
        let resolv = tokio::fs::read_to_string(RESOLV_CONF)
            .await
            .unwrap_or_default();
        let snapshot = LinuxSnapshot { routes, resolv };
        Ok(SavedConfig::new(
            "linux",
            serde_json::to_vec(&snapshot)?,
            None,
        ))
    }

    async fn restore_config(&self, saved: SavedConfig) -> Result<(), SupervisorError> {
        if saved.platform() != "linux" {
            return Err(SupervisorError::NetworkSetup(format!(
                "snapshot from {:?} cannot restore a linux host",
                saved.platform()
            )));
        }
        let snapshot: LinuxSnapshot = serde_json::from_slice(saved.blob())?;

        // Re-install the original default route, if there was one.
        if let Some(line) = snapshot
            .routes
            .lines()
            .find(|l| l.starts_with("default "))
        {
            let mut args = vec!["route", "replace"];
            args.extend(line.split_whitespace());
            run_tool("ip", TOOL_DIRS, &args).await?;
        }

        if !snapshot.resolv.is_empty() {
            tokio::fs::write(RESOLV_CONF, snapshot.resolv).await?;
        }
        tracing::info!("host routing and dns restored");
        Ok(())
    }

    async fn setup_routing(&self, tap_name: &str, vm_ip: Ipv4Addr) -> Result<(), SupervisorError> {
        run_tool(
            "ip",
            TOOL_DIRS,
            &[
                "route",
                "replace",
                "default",
                "via",
                &vm_ip.to_string(),
                "dev",
                tap_name,
            ],
        )
        .await?;
        // Point the stub resolver at the VM; the snapshot restores the
        // original file afterwards.
        tokio::fs::write(RESOLV_CONF, format!("nameserver {vm_ip}\n")).await?;

        let mut diversion = self.diversion.lock().await;
        *diversion = Some(Diversion {
            tap: tap_name.to_string(),
            vm_ip,
        });
        tracing::info!(tap = tap_name, gateway = %vm_ip, "diversion route installed");
        Ok(())
    }

    async fn teardown_routing(&self) -> Result<(), SupervisorError> {
        let mut diversion = self.diversion.lock().await;
        let Some(active) = diversion.take() else {
            return Ok(());
        };
        let result = run_tool(
            "ip",
            TOOL_DIRS,
            &[
                "route",
                "del",
                "default",
                "via",
                &active.vm_ip.to_string(),
                "dev",
                &active.tap,
            ],
        )
        .await;
        if let Err(err) = result {
            // The route may already be gone (device destroyed, VM down).
            tracing::warn!(error = %err, "diversion route removal reported an error");
        }
        Ok(())
    }

    async fn flush_dns(&self) -> Result<(), SupervisorError> {
        run_tool("resolvectl", TOOL_DIRS, &["flush-caches"]).await?;
        Ok(())
    }
}
