//! Per-flow TCP termination.
//!
//! Each session speaks the RFC 793 subset needed to terminate one end of a
//! connection an application opened through the tunnel, while the other
//! end is an upstream SOCKS-connected byte stream. All sequence arithmetic
//! is wrapping 32-bit; SYN and FIN each count for one. The session never
//! opens a kernel socket for tunneled traffic itself; every segment sent
//! back to the application is synthesized.

use crate::device::TunTransport;
use crate::packet::{self, Ipv4Header, TcpSegment, flags};
use crate::socks::{BoxedStream, UpstreamConnector};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const MAX_SEGMENT_SIZE: usize = 1400;
pub const ADVERTISED_WINDOW: u16 = 65535;

const UPSTREAM_READ_BUFFER: usize = 32 * 1024;

/// Flow identity: structural equality over the 4-tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
}

impl SessionKey {
    pub fn from_segment(ip: &Ipv4Header, seg: &TcpSegment<'_>) -> Self {
        Self {
            src_ip: ip.src,
            src_port: seg.src_port,
            dst_ip: ip.dst,
            dst_port: seg.dst_port,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Listen,
    SynReceived,
    Established,
    CloseWait,
    LastAck,
    FinWait1,
    FinWait2,
    TimeWait,
    Closed,
}

struct SessionInner {
    state: TcpState,
    client_isn: u32,
    our_isn: u32,
    /// Next byte we expect from the client.
    client_seq: u32,
    /// Next sequence number we will send.
    our_seq: u32,
    upstream: Option<WriteHalf<BoxedStream>>,
    upstream_connected: bool,
    handshake_acked: bool,
    last_activity: Instant,
    tasks: Vec<JoinHandle<()>>,
}

pub struct TcpSession {
    key: SessionKey,
    tun: Arc<dyn TunTransport>,
    connector: Arc<dyn UpstreamConnector>,
    connect_limit: Arc<Semaphore>,
    inner: Mutex<SessionInner>,
}

impl TcpSession {
    pub fn new(
        key: SessionKey,
        tun: Arc<dyn TunTransport>,
        connector: Arc<dyn UpstreamConnector>,
        connect_limit: Arc<Semaphore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            tun,
            connector,
            connect_limit,
            inner: Mutex::new(SessionInner {
                state: TcpState::Listen,
                client_isn: 0,
                our_isn: 0,
                client_seq: 0,
                our_seq: 0,
                upstream: None,
                upstream_connected: false,
                handshake_acked: false,
                last_activity: Instant::now(),
                tasks: Vec::new(),
            }),
        })
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub async fn state(&self) -> TcpState {
        self.inner.lock().await.state
    }

    pub async fn last_activity(&self) -> Instant {
        self.inner.lock().await.last_activity
    }

    /// Drive the state machine with one inbound segment. The caller (the
    /// session manager) routes all packets for one key through a single
    /// dispatch, so two segments never race on the same session.
    pub async fn handle_segment(self: &Arc<Self>, seg: &TcpSegment<'_>) {
        let mut inner = self.inner.lock().await;
        inner.last_activity = Instant::now();

        if seg.has(flags::RST) {
            tracing::trace!(key = ?self.key, "rst from client");
            close_locked(&mut inner);
            return;
        }

        match inner.state {
            TcpState::Listen => self.on_listen(&mut inner, seg).await,
            TcpState::SynReceived => self.on_syn_received(&mut inner, seg).await,
            TcpState::Established => self.on_established(&mut inner, seg).await,
            TcpState::CloseWait => {}
            TcpState::LastAck => {
                if seg.has(flags::ACK) && seg.ack == inner.our_seq {
                    close_locked(&mut inner);
                }
            }
            TcpState::FinWait1 => {
                if seg.has(flags::FIN) {
                    inner.client_seq = inner.client_seq.wrapping_add(1);
                    let (seq, ack) = (inner.our_seq, inner.client_seq);
                    self.emit(flags::ACK, seq, ack, &[]).await;
                    inner.state = TcpState::TimeWait;
                } else if seg.has(flags::ACK) && seg.ack == inner.our_seq {
                    inner.state = TcpState::FinWait2;
                }
            }
            TcpState::FinWait2 => {
                if seg.has(flags::FIN) {
                    inner.client_seq = inner.client_seq.wrapping_add(1);
                    let (seq, ack) = (inner.our_seq, inner.client_seq);
                    self.emit(flags::ACK, seq, ack, &[]).await;
                    inner.state = TcpState::TimeWait;
                }
            }
            // Reaped on timeout; everything else is ignored.
            TcpState::TimeWait => {}
            TcpState::Closed => {}
        }
    }

    async fn on_listen(self: &Arc<Self>, inner: &mut SessionInner, seg: &TcpSegment<'_>) {
        if !seg.has(flags::SYN) || seg.has(flags::ACK) {
            return;
        }
        inner.client_isn = seg.seq;
        inner.client_seq = seg.seq.wrapping_add(1);
        inner.our_isn = rand::random::<u32>();
        inner.our_seq = inner.our_isn;

        let mss = (MAX_SEGMENT_SIZE as u16).to_be_bytes();
        let options = [2, 4, mss[0], mss[1]];
        let packet = packet::build_tcp_packet_with_options(
            self.key.dst_ip,
            self.key.src_ip,
            self.key.dst_port,
            self.key.src_port,
            inner.our_seq,
            inner.client_seq,
            flags::SYN | flags::ACK,
            ADVERTISED_WINDOW,
            &options,
            &[],
        );
        if let Err(err) = self.tun.send(&packet).await {
            tracing::trace!(error = %err, "syn-ack write failed");
        }

        inner.our_seq = inner.our_seq.wrapping_add(1); // our SYN occupies one
        inner.state = TcpState::SynReceived;

        // Upstream CONNECT runs off this task, gated by the shared
        // connect-parallelism limit; promotion happens when both the
        // handshake ACK and the connect completion have been seen, in
        // either order.
        let session = self.clone();
        let dst = SocketAddrV4::new(self.key.dst_ip, self.key.dst_port);
        let handle = tokio::spawn(async move {
            let permit = session.connect_limit.clone().acquire_owned().await.ok();
            let outcome = session.connector.connect(dst).await;
            drop(permit);
            match outcome {
                Ok(stream) => session.upstream_ready(stream).await,
                Err(err) => session.upstream_failed(err).await,
            }
        });
        inner.tasks.push(handle);
    }

    async fn on_syn_received(self: &Arc<Self>, inner: &mut SessionInner, seg: &TcpSegment<'_>) {
        if !seg.has(flags::ACK) || seg.ack != inner.our_seq {
            return;
        }
        inner.handshake_acked = true;
        if inner.upstream_connected {
            inner.state = TcpState::Established;
            tracing::trace!(key = ?self.key, "established");
        }
    }

    async fn on_established(self: &Arc<Self>, inner: &mut SessionInner, seg: &TcpSegment<'_>) {
        if !seg.payload.is_empty() {
            if seg.seq == inner.client_seq {
                if let Some(upstream) = inner.upstream.as_mut() {
                    if upstream.write_all(seg.payload).await.is_err() {
                        let (seq, ack) = (inner.our_seq, inner.client_seq);
                        self.emit(flags::RST | flags::ACK, seq, ack, &[]).await;
                        close_locked(inner);
                        return;
                    }
                }
                inner.client_seq = inner.client_seq.wrapping_add(seg.payload.len() as u32);
            }
            // In order or not, acknowledge the high-water mark; the peer
            // retransmits anything we did not take.
            let (seq, ack) = (inner.our_seq, inner.client_seq);
            self.emit(flags::ACK, seq, ack, &[]).await;
        }

        if seg.has(flags::FIN) {
            inner.client_seq = inner.client_seq.wrapping_add(1);
            let (seq, ack) = (inner.our_seq, inner.client_seq);
            self.emit(flags::ACK, seq, ack, &[]).await;
            inner.state = TcpState::CloseWait;

            // Half-close toward the upstream, then finish our side.
            if let Some(mut upstream) = inner.upstream.take() {
                let _ = upstream.shutdown().await;
            }
            self.emit(flags::FIN | flags::ACK, seq, ack, &[]).await;
            inner.our_seq = inner.our_seq.wrapping_add(1);
            inner.state = TcpState::LastAck;
        }
    }

    /// Upstream CONNECT finished; wire up the byte pump.
    async fn upstream_ready(self: Arc<Self>, stream: BoxedStream) {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut inner = self.inner.lock().await;
        if inner.state == TcpState::Closed {
            return;
        }
        inner.upstream = Some(write_half);
        inner.upstream_connected = true;
        if inner.handshake_acked && inner.state == TcpState::SynReceived {
            inner.state = TcpState::Established;
            tracing::trace!(key = ?self.key, "established");
        }
        let session = self.clone();
        let handle = tokio::spawn(async move { session.pump_upstream(read_half).await });
        inner.tasks.push(handle);
    }

    async fn upstream_failed(self: Arc<Self>, err: std::io::Error) {
        let mut inner = self.inner.lock().await;
        if inner.state == TcpState::Closed {
            return;
        }
        tracing::debug!(key = ?self.key, error = %err, "upstream connect failed");
        let (seq, ack) = (inner.our_seq, inner.client_seq);
        self.emit(flags::RST | flags::ACK, seq, ack, &[]).await;
        close_locked(&mut inner);
    }

    /// One logical reader per flow: each upstream read becomes one PSH+ACK
    /// train; EOF turns into our FIN.
    async fn pump_upstream(self: Arc<Self>, mut read_half: ReadHalf<BoxedStream>) {
        let mut buf = vec![0u8; UPSTREAM_READ_BUFFER];
        loop {
            let n = match read_half.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    tracing::trace!(key = ?self.key, error = %err, "upstream read failed");
                    break;
                }
            };

            let mut inner = self.inner.lock().await;
            // Once our FIN is out (or the flow is gone) no more data may
            // follow it onto the wire.
            if matches!(
                inner.state,
                TcpState::Closed | TcpState::LastAck | TcpState::TimeWait
            ) {
                return;
            }
            for chunk in buf[..n].chunks(MAX_SEGMENT_SIZE) {
                let (seq, ack) = (inner.our_seq, inner.client_seq);
                self.emit(flags::PSH | flags::ACK, seq, ack, chunk).await;
                inner.our_seq = inner.our_seq.wrapping_add(chunk.len() as u32);
            }
            inner.last_activity = Instant::now();
        }

        let mut inner = self.inner.lock().await;
        if inner.state == TcpState::Established {
            let (seq, ack) = (inner.our_seq, inner.client_seq);
            self.emit(flags::FIN | flags::ACK, seq, ack, &[]).await;
            inner.our_seq = inner.our_seq.wrapping_add(1);
            inner.state = TcpState::FinWait1;
        }
    }

    async fn emit(&self, tcp_flags: u8, seq: u32, ack: u32, payload: &[u8]) {
        let packet = packet::build_tcp_packet(
            self.key.dst_ip,
            self.key.src_ip,
            self.key.dst_port,
            self.key.src_port,
            seq,
            ack,
            tcp_flags,
            ADVERTISED_WINDOW,
            payload,
        );
        if let Err(err) = self.tun.send(&packet).await {
            tracing::trace!(error = %err, "segment write failed");
        }
    }

    /// Tear the session down: upstream dropped, pump and connect tasks
    /// stopped. The tasks hold their own reference to the session, so
    /// nothing they touch can dangle; aborting here guarantees no further
    /// writes reach the tunnel on behalf of this flow.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        close_locked(&mut inner);
    }
}

fn close_locked(inner: &mut SessionInner) {
    inner.state = TcpState::Closed;
    inner.upstream = None;
    for task in inner.tasks.drain(..) {
        task.abort();
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::ChannelTun;
    use crate::session::testing::PipeConnector;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn key() -> SessionKey {
        SessionKey {
            src_ip: Ipv4Addr::new(10, 0, 0, 2),
            src_port: 55000,
            dst_ip: Ipv4Addr::new(1, 2, 3, 4),
            dst_port: 443,
        }
    }

    fn limit() -> Arc<Semaphore> {
        Arc::new(Semaphore::new(64))
    }

    fn client_segment(seq: u32, ack: u32, fl: u8, payload: &'static [u8]) -> Vec<u8> {
        let k = key();
        packet::build_tcp_packet(
            k.src_ip, k.dst_ip, k.src_port, k.dst_port, seq, ack, fl, 65535, payload,
        )
    }

    async fn feed(session: &Arc<TcpSession>, raw: &[u8]) {
        let ip = Ipv4Header::parse(raw).unwrap();
        let seg = TcpSegment::parse(&raw[ip.header_len..ip.total_len]).unwrap();
        session.handle_segment(&seg).await;
    }

    async fn next_segment(rx: &mut UnboundedReceiver<Vec<u8>>) -> (u32, u32, u8, Vec<u8>) {
        let raw = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a segment")
            .expect("tun closed");
        let ip = Ipv4Header::parse(&raw).unwrap();
        let seg = TcpSegment::parse(&raw[ip.header_len..ip.total_len]).unwrap();
        (seg.seq, seg.ack, seg.flags, seg.payload.to_vec())
    }

    async fn wait_for_state(session: &Arc<TcpSession>, want: TcpState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if session.state().await == want {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("never reached {want:?}"));
    }

    #[tokio::test]
    async fn syn_elicits_syn_ack_with_isn_and_mss() {
        let (tun, mut outbound) = ChannelTun::new();
        let (connector, mut upstreams) = PipeConnector::new();
        let session = TcpSession::new(key(), tun, connector, limit());

        feed(&session, &client_segment(1000, 0, flags::SYN, b"")).await;

        let raw = outbound.recv().await.unwrap();
        let ip = Ipv4Header::parse(&raw).unwrap();
        let seg = TcpSegment::parse(&raw[ip.header_len..ip.total_len]).unwrap();
        assert_eq!(seg.flags, flags::SYN | flags::ACK);
        assert_eq!(seg.ack, 1001);
        assert_eq!(seg.window, ADVERTISED_WINDOW);
        // Reply flows server -> client.
        assert_eq!(ip.src, key().dst_ip);
        assert_eq!(ip.dst, key().src_ip);
        // MSS option is announced.
        let header = &raw[ip.header_len..];
        assert_eq!(((header[12] >> 4) as usize) * 4, 24);
        assert_eq!(&header[20..24], &[2, 4, 0x05, 0x78]);

        assert_eq!(session.state().await, TcpState::SynReceived);
        assert!(upstreams.recv().await.is_some(), "upstream connect started");
    }

    #[tokio::test]
    async fn promotion_waits_for_both_ack_and_upstream() {
        let (tun, mut outbound) = ChannelTun::new();
        let (connector, mut upstreams) = PipeConnector::new();
        let session = TcpSession::new(key(), tun, connector, limit());

        feed(&session, &client_segment(1000, 0, flags::SYN, b"")).await;
        let (syn_ack_seq, ..) = next_segment(&mut outbound).await;
        let _server = upstreams.recv().await.unwrap();

        feed(
            &session,
            &client_segment(1001, syn_ack_seq.wrapping_add(1), flags::ACK, b""),
        )
        .await;
        wait_for_state(&session, TcpState::Established).await;
    }

    #[tokio::test]
    async fn refused_upstream_resets_the_client() {
        let (tun, mut outbound) = ChannelTun::new();
        let session = TcpSession::new(key(), tun, PipeConnector::refusing(), limit());

        feed(&session, &client_segment(1000, 0, flags::SYN, b"")).await;
        let (_, _, syn_ack_flags, _) = next_segment(&mut outbound).await;
        assert_eq!(syn_ack_flags, flags::SYN | flags::ACK);

        let (_, _, rst_flags, _) = next_segment(&mut outbound).await;
        assert_eq!(rst_flags, flags::RST | flags::ACK);
        wait_for_state(&session, TcpState::Closed).await;
    }

    #[tokio::test]
    async fn out_of_window_data_is_reacked_not_delivered() {
        let (tun, mut outbound) = ChannelTun::new();
        let (connector, mut upstreams) = PipeConnector::new();
        let session = TcpSession::new(key(), tun, connector, limit());

        feed(&session, &client_segment(1000, 0, flags::SYN, b"")).await;
        let (syn_ack_seq, ..) = next_segment(&mut outbound).await;
        let mut server = upstreams.recv().await.unwrap();
        feed(
            &session,
            &client_segment(1001, syn_ack_seq.wrapping_add(1), flags::ACK, b""),
        )
        .await;
        wait_for_state(&session, TcpState::Established).await;

        // Retransmit of an already-acked position.
        feed(
            &session,
            &client_segment(900, syn_ack_seq.wrapping_add(1), flags::ACK, b"stale"),
        )
        .await;
        let (_, ack, fl, payload) = next_segment(&mut outbound).await;
        assert_eq!(fl, flags::ACK);
        assert_eq!(ack, 1001, "high-water mark is re-acked");
        assert!(payload.is_empty());

        // Nothing may have reached the upstream.
        let mut probe = [0u8; 8];
        let read = tokio::time::timeout(Duration::from_millis(200), server.read(&mut probe)).await;
        assert!(read.is_err(), "stale bytes must not be delivered");
    }

    #[tokio::test]
    async fn rst_closes_immediately() {
        let (tun, mut outbound) = ChannelTun::new();
        let (connector, _upstreams) = PipeConnector::new();
        let session = TcpSession::new(key(), tun, connector, limit());

        feed(&session, &client_segment(1000, 0, flags::SYN, b"")).await;
        let _ = next_segment(&mut outbound).await;
        feed(&session, &client_segment(1001, 0, flags::RST, b"")).await;
        assert_eq!(session.state().await, TcpState::Closed);
    }
}
