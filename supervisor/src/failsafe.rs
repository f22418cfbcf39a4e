//! Traffic failsafe: block host egress whenever the VM is not serving it.

use crate::netadapter::NetworkAdapter;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct Failsafe {
    net: Arc<dyn NetworkAdapter>,
    engaged: Mutex<bool>,
}

impl Failsafe {
    pub fn new(net: Arc<dyn NetworkAdapter>) -> Self {
        Self {
            net,
            engaged: Mutex::new(false),
        }
    }

    /// Remove the diversion route so no unprotected traffic leaks while
    /// the VM is down. Idempotent.
    pub async fn activate(&self) {
        let mut engaged = self.engaged.lock().await;
        if *engaged {
            return;
        }
        if let Err(err) = self.net.teardown_routing().await {
            tracing::warn!(error = %err, "failsafe could not remove the diversion route");
        }
        *engaged = true;
        tracing::info!("failsafe engaged; host egress blocked");
    }

    /// Clear the flag. Restoring host routing is RestoreNetwork's job,
    /// never the failsafe's.
    pub async fn deactivate(&self) {
        let mut engaged = self.engaged.lock().await;
        if *engaged {
            tracing::info!("failsafe released");
        }
        *engaged = false;
    }

    pub async fn is_active(&self) -> bool {
        *self.engaged.lock().await
    }
}
