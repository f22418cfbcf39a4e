//! UDP DNS relay.
//!
//! Each intercepted query becomes one short-lived task holding a permit
//! from a bounded semaphore: fresh datagram socket, optional `protect`
//! callback so the lookup does not re-enter the tunnel, verbatim forward
//! upstream, deadline-bounded receive, transaction-id check, reply written
//! back with source and destination swapped. Every failure is silent; the
//! application's stub resolver retries on its own.

use crate::device::TunTransport;
use crate::packet::{self, Ipv4Header, UdpDatagram};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;

pub const MAX_IN_FLIGHT: usize = 32;
const QUERY_DEADLINE: Duration = Duration::from_secs(5);
const MAX_REPLY: usize = 4096;

#[cfg(unix)]
pub type SocketHandle = std::os::fd::RawFd;
#[cfg(windows)]
pub type SocketHandle = std::os::windows::io::RawSocket;

/// Platform hook run on every relay socket before it talks upstream
/// (VpnService.protect and friends), so resolver traffic bypasses the
/// tunnel instead of looping back into it.
pub type SocketProtector = Arc<dyn Fn(SocketHandle) -> io::Result<()> + Send + Sync>;

pub struct DnsRelay {
    upstream: SocketAddr,
    tun: Arc<dyn TunTransport>,
    limit: Arc<Semaphore>,
    protect: Option<SocketProtector>,
}

impl DnsRelay {
    pub fn new(upstream: SocketAddr, tun: Arc<dyn TunTransport>) -> Self {
        Self {
            upstream,
            tun,
            limit: Arc::new(Semaphore::new(MAX_IN_FLIGHT)),
            protect: None,
        }
    }

    pub fn with_protector(mut self, protect: SocketProtector) -> Self {
        self.protect = Some(protect);
        self
    }

    /// Fire-and-forget; the caller never learns about per-query failures.
    pub fn handle_query(&self, ip: &Ipv4Header, udp: &UdpDatagram<'_>) {
        if udp.payload.len() < 2 {
            return;
        }
        let query = udp.payload.to_vec();
        let upstream = self.upstream;
        let tun = self.tun.clone();
        let limit = self.limit.clone();
        let protect = self.protect.clone();
        let (client, server) = (ip.src, ip.dst);
        let (client_port, server_port) = (udp.src_port, udp.dst_port);

        tokio::spawn(async move {
            let Ok(_permit) = limit.acquire_owned().await else {
                return;
            };
            match resolve_one(upstream, protect, query).await {
                Ok(Some(reply)) => {
                    let response =
                        packet::build_udp_packet(server, client, server_port, client_port, &reply);
                    if let Err(err) = tun.send(&response).await {
                        tracing::trace!(error = %err, "dns reply write failed");
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::trace!(error = %err, "dns query dropped");
                }
            }
        });
    }
}

fn socket_handle(socket: &UdpSocket) -> SocketHandle {
    #[cfg(unix)]
    {
        use std::os::fd::AsRawFd;
        socket.as_raw_fd()
    }
    #[cfg(windows)]
    {
        use std::os::windows::io::AsRawSocket;
        socket.as_raw_socket()
    }
}

/// Returns `Ok(None)` when the reply must be discarded (mismatched
/// transaction id).
async fn resolve_one(
    upstream: SocketAddr,
    protect: Option<SocketProtector>,
    query: Vec<u8>,
) -> io::Result<Option<Vec<u8>>> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    if let Some(protect) = protect {
        protect(socket_handle(&socket))?;
    }

    socket.send_to(&query, upstream).await?;

    let mut buf = vec![0u8; MAX_REPLY];
    let (n, _) = tokio::time::timeout(QUERY_DEADLINE, socket.recv_from(&mut buf))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dns upstream deadline"))??;

    if n < 2 || buf[..2] != query[..2] {
        tracing::trace!("dns reply transaction id mismatch");
        return Ok(None);
    }
    buf.truncate(n);
    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::ChannelTun;
    use crate::packet::{IP_PROTO_UDP, pseudo_checksum};
    use std::net::Ipv4Addr;

    fn query_packet(txid: [u8; 2]) -> Vec<u8> {
        let mut payload = vec![txid[0], txid[1]];
        payload.extend_from_slice(&[0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0]);
        payload.extend_from_slice(b"\x07example\x03com\x00\x00\x01\x00\x01");
        packet::build_udp_packet(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(1, 1, 1, 1),
            44444,
            53,
            &payload,
        )
    }

    fn parts(packet: &[u8]) -> (Ipv4Header, u16, u16, Vec<u8>) {
        let ip = Ipv4Header::parse(packet).unwrap();
        let udp = UdpDatagram::parse(&packet[ip.header_len..ip.total_len]).unwrap();
        (ip, udp.src_port, udp.dst_port, udp.payload.to_vec())
    }

    #[tokio::test]
    async fn relays_and_swaps_source_destination() {
        let resolver = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let resolver_addr = resolver.local_addr().unwrap();

        // Upstream stub: echo the txid followed by a fixed body, 32 bytes.
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, from) = resolver.recv_from(&mut buf).await.unwrap();
            assert!(n > 2);
            let mut reply = vec![buf[0], buf[1]];
            reply.extend_from_slice(&[0u8; 30]);
            resolver.send_to(&reply, from).await.unwrap();
        });

        let (tun, mut outbound) = ChannelTun::new();
        let relay = DnsRelay::new(resolver_addr, tun);

        let request = query_packet([0xab, 0xcd]);
        let ip = Ipv4Header::parse(&request).unwrap();
        let udp = UdpDatagram::parse(&request[ip.header_len..ip.total_len]).unwrap();
        relay.handle_query(&ip, &udp);

        let written = tokio::time::timeout(Duration::from_secs(5), outbound.recv())
            .await
            .unwrap()
            .unwrap();
        let (reply_ip, src_port, dst_port, payload) = parts(&written);

        assert_eq!(reply_ip.src, Ipv4Addr::new(1, 1, 1, 1));
        assert_eq!(reply_ip.dst, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(src_port, 53);
        assert_eq!(dst_port, 44444);
        assert_eq!(payload.len(), 32);
        assert_eq!(&payload[..2], &[0xab, 0xcd]);

        // Checksums on the synthesized reply verify.
        assert_eq!(packet::checksum(&written[..reply_ip.header_len]), 0);
        assert_eq!(
            pseudo_checksum(
                reply_ip.src,
                reply_ip.dst,
                IP_PROTO_UDP,
                &written[reply_ip.header_len..reply_ip.total_len]
            ),
            0
        );
    }

    #[tokio::test]
    async fn mismatched_transaction_id_is_discarded() {
        let resolver = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let resolver_addr = resolver.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (_, from) = resolver.recv_from(&mut buf).await.unwrap();
            // Reply under the wrong transaction id.
            resolver.send_to(&[0xde, 0xad, 0, 0], from).await.unwrap();
        });

        let (tun, mut outbound) = ChannelTun::new();
        let relay = DnsRelay::new(resolver_addr, tun);

        let request = query_packet([0xab, 0xcd]);
        let ip = Ipv4Header::parse(&request).unwrap();
        let udp = UdpDatagram::parse(&request[ip.header_len..ip.total_len]).unwrap();
        relay.handle_query(&ip, &udp);

        let outcome = tokio::time::timeout(Duration::from_millis(500), outbound.recv()).await;
        assert!(outcome.is_err(), "mismatched reply must not reach the tunnel");
    }

    #[tokio::test]
    async fn protect_callback_sees_the_socket() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let resolver = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let resolver_addr = resolver.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (_, from) = resolver.recv_from(&mut buf).await.unwrap();
            resolver
                .send_to(&[buf[0], buf[1], 0, 0], from)
                .await
                .unwrap();
        });

        let protected = Arc::new(AtomicUsize::new(0));
        let seen = protected.clone();
        let (tun, mut outbound) = ChannelTun::new();
        let relay = DnsRelay::new(resolver_addr, tun).with_protector(Arc::new(move |_fd| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let request = query_packet([0x01, 0x02]);
        let ip = Ipv4Header::parse(&request).unwrap();
        let udp = UdpDatagram::parse(&request[ip.header_len..ip.total_len]).unwrap();
        relay.handle_query(&ip, &udp);

        tokio::time::timeout(Duration::from_secs(5), outbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(protected.load(Ordering::SeqCst), 1);
    }
}
