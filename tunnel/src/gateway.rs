//! Gateway loop: one reader task pulling packets off the tunnel device
//! into the interceptor, plus the session reaper.

use crate::device::TunTransport;
use crate::dns::DnsRelay;
use crate::error::TunnelError;
use crate::intercept::Interceptor;
use crate::manager::SessionManager;
use crate::socks::Socks5Connector;
use std::net::SocketAddr;
use std::sync::Arc;

/// One read buffer sized past any MTU the device may present.
const READ_BUFFER: usize = 65535;

pub struct Gateway {
    tun: Arc<dyn TunTransport>,
    interceptor: Interceptor,
    manager: Arc<SessionManager>,
}

impl Gateway {
    pub fn new(tun: Arc<dyn TunTransport>, socks: SocketAddr, dns: SocketAddr) -> Self {
        let connector = Arc::new(Socks5Connector::new(socks));
        let manager = SessionManager::new(tun.clone(), connector);
        let relay = Arc::new(DnsRelay::new(dns, tun.clone()));
        let interceptor = Interceptor::new(manager.clone(), relay);
        Self {
            tun,
            interceptor,
            manager,
        }
    }

    /// Serve until the tunnel device dies. Per-packet problems never
    /// surface; only the device ending the stream does.
    pub async fn run(self) -> Result<(), TunnelError> {
        let reaper = self.manager.spawn_reaper();
        let mut buf = vec![0u8; READ_BUFFER];
        let result = loop {
            match self.tun.recv(&mut buf).await {
                Ok(0) => {
                    tracing::info!("tunnel device closed");
                    break Ok(());
                }
                Ok(n) => self.interceptor.handle_packet(&buf[..n]).await,
                Err(err) => {
                    tracing::error!(error = %err, "tunnel read failed");
                    break Err(TunnelError::Device(err));
                }
            }
        };
        reaper.abort();
        result
    }
}
