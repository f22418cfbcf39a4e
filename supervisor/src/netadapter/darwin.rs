//! macOS adapter.
//!
//! The hypervisor's vmnet layer owns interface creation here, so
//! `create_tap`/`destroy_tap` are deliberate no-ops. Coverage of the
//! address space is achieved with two half-default routes (0.0.0.0/1 and
//! 128.0.0.0/1): they win over the true default by prefix length while
//! leaving the original route in place, which the hypervisor's shared
//! network needs to reach the Internet at all.

use super::cmd::run_tool;
use super::{NetworkAdapter, SavedConfig};
use crate::error::SupervisorError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use tokio::sync::Mutex;

const TOOL_DIRS: &[&str] = &["/usr/sbin", "/sbin", "/usr/bin", "/bin"];
const HALF_DEFAULTS: &[&str] = &["0.0.0.0/1", "128.0.0.0/1"];

#[derive(Serialize, Deserialize)]
struct DarwinSnapshot {
    gateway: Option<String>,
}

pub struct DarwinAdapter {
    diversion: Mutex<Option<Ipv4Addr>>,
}

impl DarwinAdapter {
    pub fn new() -> Self {
        Self {
            diversion: Mutex::new(None),
        }
    }
}

impl Default for DarwinAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkAdapter for DarwinAdapter {
    async fn create_tap(
        &self,
        name: &str,
        _host_ip: Ipv4Addr,
        _vm_ip: Ipv4Addr,
        _mask: Ipv4Addr,
    ) -> Result<(), SupervisorError> {
        tracing::debug!(tap = name, "interface creation delegated to the hypervisor");
        Ok(())
    }

    async fn destroy_tap(&self, name: &str) -> Result<(), SupervisorError> {
        tracing::debug!(tap = name, "interface teardown delegated to the hypervisor");
        Ok(())
    }

    async fn save_config(&self) -> Result<SavedConfig, SupervisorError> {
        let gateway = match run_tool("route", TOOL_DIRS, &["-n", "get", "default"]).await {
            Ok(out) => out
                .lines()
                .find_map(|l| l.trim().strip_prefix("gateway:"))
                .map(|gw| gw.trim().to_string()),
            Err(err) => {
                tracing::warn!(error = %err, "no default route to snapshot");
                None
            }
        };
        let snapshot = DarwinSnapshot { gateway };
        Ok(SavedConfig::new(
            "darwin",
            serde_json::to_vec(&snapshot)?,
            None,
        ))
    }

    async fn restore_config(&self, saved: SavedConfig) -> Result<(), SupervisorError> {
        if saved.platform() != "darwin" {
            return Err(SupervisorError::NetworkSetup(format!(
                "snapshot from {:?} cannot restore a darwin host",
                saved.platform()
            )));
        }
        let snapshot: DarwinSnapshot = serde_json::from_slice(saved.blob())?;
        if let Some(gateway) = snapshot.gateway {
            // The true default was never removed; re-add only if it vanished.
            if run_tool("route", TOOL_DIRS, &["-n", "get", "default"])
                .await
                .is_err()
            {
                run_tool("route", TOOL_DIRS, &["-n", "add", "default", &gateway]).await?;
            }
        }
        Ok(())
    }

    async fn setup_routing(&self, _tap_name: &str, vm_ip: Ipv4Addr) -> Result<(), SupervisorError> {
        let gateway = vm_ip.to_string();
        for net in HALF_DEFAULTS {
            run_tool("route", TOOL_DIRS, &["-n", "add", "-net", net, &gateway]).await?;
        }
        let mut diversion = self.diversion.lock().await;
        *diversion = Some(vm_ip);
        tracing::info!(gateway = %vm_ip, "half-default diversion routes installed");
        Ok(())
    }

    async fn teardown_routing(&self) -> Result<(), SupervisorError> {
        let mut diversion = self.diversion.lock().await;
        let Some(vm_ip) = diversion.take() else {
            return Ok(());
        };
        let gateway = vm_ip.to_string();
        for net in HALF_DEFAULTS {
            if let Err(err) =
                run_tool("route", TOOL_DIRS, &["-n", "delete", "-net", net, &gateway]).await
            {
                tracing::warn!(net, error = %err, "diversion route removal reported an error");
            }
        }
        Ok(())
    }

    async fn flush_dns(&self) -> Result<(), SupervisorError> {
        run_tool("dscacheutil", TOOL_DIRS, &["-flushcache"]).await?;
        Ok(())
    }
}
