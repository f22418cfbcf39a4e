//! Packet interceptor: the sole dispatch point from the tunnel into the
//! TCP core and the DNS relay. Anything else, ICMP included, is silently
//! dropped, as is anything that fails to parse.

use crate::dns::DnsRelay;
use crate::manager::SessionManager;
use crate::packet::{IP_PROTO_TCP, IP_PROTO_UDP, Ipv4Header, TcpSegment, UdpDatagram};
use std::sync::Arc;

const DNS_PORT: u16 = 53;

pub struct Interceptor {
    manager: Arc<SessionManager>,
    dns: Arc<DnsRelay>,
}

impl Interceptor {
    pub fn new(manager: Arc<SessionManager>, dns: Arc<DnsRelay>) -> Self {
        Self { manager, dns }
    }

    pub async fn handle_packet(&self, raw: &[u8]) {
        let Some(ip) = Ipv4Header::parse(raw) else {
            return;
        };
        let transport = &raw[ip.header_len..ip.total_len];
        match ip.protocol {
            IP_PROTO_TCP => {
                let Some(seg) = TcpSegment::parse(transport) else {
                    return;
                };
                self.manager.handle_segment(&ip, &seg).await;
            }
            IP_PROTO_UDP => {
                let Some(udp) = UdpDatagram::parse(transport) else {
                    return;
                };
                if udp.dst_port == DNS_PORT {
                    self.dns.handle_query(&ip, &udp);
                }
            }
            _ => {}
        }
    }
}
