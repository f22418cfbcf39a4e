//! Platform-polymorphic host network operations.
//!
//! All mutation of the OS routing table and DNS state goes through one
//! implementation of [`NetworkAdapter`], selected at construction for the
//! detected operating system. The variants differ in behavior on purpose
//! (see each module); callers only see the shared contract.

mod cmd;
mod darwin;
mod linux;
pub mod script;
mod windows;

pub use darwin::DarwinAdapter;
pub use linux::LinuxAdapter;
pub use windows::WindowsAdapter;

use crate::error::SupervisorError;
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Snapshot of the host network state taken by `save_config`. The payload
/// is private to the adapter that produced it; the supervisor only holds
/// it between `SaveNetwork` and `RestoreNetwork`.
#[derive(Debug)]
pub struct SavedConfig {
    platform: &'static str,
    blob: Vec<u8>,
    seal: Option<Seal>,
}

/// Session-local integrity key and tag over the blob, used by adapters
/// whose restore path executes the blob through a system tool.
#[derive(Debug)]
pub(crate) struct Seal {
    pub key: [u8; 32],
    pub tag: [u8; 32],
}

impl SavedConfig {
    pub(crate) fn new(platform: &'static str, blob: Vec<u8>, seal: Option<Seal>) -> Self {
        Self {
            platform,
            blob,
            seal,
        }
    }

    pub fn platform(&self) -> &str {
        self.platform
    }

    pub(crate) fn blob(&self) -> &[u8] {
        &self.blob
    }

    pub(crate) fn seal(&self) -> Option<&Seal> {
        self.seal.as_ref()
    }
}

#[async_trait]
pub trait NetworkAdapter: Send + Sync {
    /// Create the TAP device and assign the host-side address.
    async fn create_tap(
        &self,
        name: &str,
        host_ip: Ipv4Addr,
        vm_ip: Ipv4Addr,
        mask: Ipv4Addr,
    ) -> Result<(), SupervisorError>;

    async fn destroy_tap(&self, name: &str) -> Result<(), SupervisorError>;

    /// Capture the current routing and DNS state into an opaque snapshot.
    async fn save_config(&self) -> Result<SavedConfig, SupervisorError>;

    /// Undo what `setup_routing` changed and reapply the snapshot.
    async fn restore_config(&self, saved: SavedConfig) -> Result<(), SupervisorError>;

    /// Install the diversion so traffic destined elsewhere traverses the VM.
    async fn setup_routing(&self, tap_name: &str, vm_ip: Ipv4Addr) -> Result<(), SupervisorError>;

    /// Remove the diversion route. Idempotent; used by both the failsafe
    /// and the restore path.
    async fn teardown_routing(&self) -> Result<(), SupervisorError>;

    /// Best-effort OS DNS cache flush.
    async fn flush_dns(&self) -> Result<(), SupervisorError>;
}

pub fn platform_adapter() -> Arc<dyn NetworkAdapter> {
    #[cfg(target_os = "macos")]
    {
        Arc::new(DarwinAdapter::new())
    }
    #[cfg(target_os = "windows")]
    {
        Arc::new(WindowsAdapter::new())
    }
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        Arc::new(LinuxAdapter::new())
    }
}

pub(crate) fn mask_to_prefix(mask: Ipv4Addr) -> Result<u32, SupervisorError> {
    let bits = u32::from(mask);
    let prefix = bits.leading_ones();
    if bits.checked_shl(prefix).unwrap_or(0) != 0 {
        return Err(SupervisorError::NetworkSetup(format!(
            "subnet mask {mask} is not contiguous"
        )));
    }
    Ok(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_to_prefix_accepts_contiguous_masks() {
        assert_eq!(mask_to_prefix("255.255.255.252".parse().unwrap()).unwrap(), 30);
        assert_eq!(mask_to_prefix("255.255.255.0".parse().unwrap()).unwrap(), 24);
        assert_eq!(mask_to_prefix("255.0.0.0".parse().unwrap()).unwrap(), 8);
    }

    #[test]
    fn mask_to_prefix_rejects_holes() {
        assert!(mask_to_prefix("255.0.255.0".parse().unwrap()).is_err());
    }
}
