//! Session table and dispatch.
//!
//! All packets for one 4-tuple funnel through a single dispatch call, so
//! per-session mutation never races. The table itself tolerates concurrent
//! lookup from the reaper.

use crate::device::TunTransport;
use crate::packet::{self, Ipv4Header, TcpSegment, flags};
use crate::session::{ADVERTISED_WINDOW, SessionKey, TcpSession, TcpState};
use crate::socks::UpstreamConnector;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const MAX_SESSIONS: usize = 1024;
pub const REAPER_INTERVAL: Duration = Duration::from_secs(30);

/// Upstream connects in flight at once, across all flows.
pub const FLOW_IO_PARALLELISM: usize = 64;

const SYN_RECEIVED_IDLE: Duration = Duration::from_secs(10);
const TIME_WAIT_IDLE: Duration = Duration::from_secs(60);
const DEFAULT_IDLE: Duration = Duration::from_secs(300);

pub struct SessionManager {
    sessions: RwLock<HashMap<SessionKey, Arc<TcpSession>>>,
    tun: Arc<dyn TunTransport>,
    connector: Arc<dyn UpstreamConnector>,
    connect_limit: Arc<Semaphore>,
}

impl SessionManager {
    pub fn new(tun: Arc<dyn TunTransport>, connector: Arc<dyn UpstreamConnector>) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            tun,
            connector,
            connect_limit: Arc::new(Semaphore::new(FLOW_IO_PARALLELISM)),
        })
    }

    /// Periodic state-dependent reaping. Cooperative: a session is only
    /// torn down between packets, never mid-dispatch.
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAPER_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.reap().await;
            }
        })
    }

    pub async fn handle_segment(&self, ip: &Ipv4Header, seg: &TcpSegment<'_>) {
        let key = SessionKey::from_segment(ip, seg);

        if seg.has(flags::SYN) && !seg.has(flags::ACK) {
            // A SYN on a tracked key replaces the old flow; beyond the cap
            // the peer gets a RST so it stops retrying.
            let (evicted, session) = {
                let mut sessions = self.sessions.write().await;
                let evicted = sessions.remove(&key);
                if sessions.len() >= MAX_SESSIONS {
                    (evicted, None)
                } else {
                    let session = TcpSession::new(
                        key,
                        self.tun.clone(),
                        self.connector.clone(),
                        self.connect_limit.clone(),
                    );
                    sessions.insert(key, session.clone());
                    (evicted, Some(session))
                }
            };
            if let Some(prior) = evicted {
                tracing::debug!(?key, "evicting tracked session for fresh syn");
                prior.close().await;
            }
            match session {
                Some(session) => session.handle_segment(seg).await,
                None => {
                    tracing::debug!(?key, "session table full");
                    self.send_rst(ip, seg).await;
                }
            }
            return;
        }

        let session = self.sessions.read().await.get(&key).cloned();
        match session {
            Some(session) => {
                session.handle_segment(seg).await;
                if session.state().await == TcpState::Closed {
                    self.sessions.write().await.remove(&key);
                }
            }
            None => {
                // Unknown flow: one RST, no state.
                self.send_rst(ip, seg).await;
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn send_rst(&self, ip: &Ipv4Header, seg: &TcpSegment<'_>) {
        let ack = if seg.has(flags::SYN) {
            seg.seq.wrapping_add(1)
        } else {
            seg.ack
        };
        let packet = packet::build_tcp_packet(
            ip.dst,
            ip.src,
            seg.dst_port,
            seg.src_port,
            seg.ack,
            ack,
            flags::RST | flags::ACK,
            ADVERTISED_WINDOW,
            &[],
        );
        if let Err(err) = self.tun.send(&packet).await {
            tracing::trace!(error = %err, "rst write failed");
        }
    }

    async fn reap(&self) {
        let now = Instant::now();
        let mut doomed = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for (key, session) in sessions.iter() {
                let state = session.state().await;
                let idle = now.saturating_duration_since(session.last_activity().await);
                let expired = match state {
                    TcpState::Closed => true,
                    TcpState::SynReceived => idle >= SYN_RECEIVED_IDLE,
                    TcpState::TimeWait => idle >= TIME_WAIT_IDLE,
                    _ => idle >= DEFAULT_IDLE,
                };
                if expired {
                    doomed.push((*key, session.clone()));
                }
            }
        }
        for (key, session) in doomed {
            let state = session.state().await;
            tracing::debug!(?key, ?state, "reaping session");
            session.close().await;
            self.sessions.write().await.remove(&key);
        }
    }
}
