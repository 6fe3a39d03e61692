//! Session registry (C4): per-session state keyed by session id, with a
//! single lock guarding every multi-map update so that `bound_channel`,
//! `claim_times`, and the tcp/udp maps stay atomic with respect to each
//! other (spec §4.4).
//!
//! The lock here is a [`parking_lot::Mutex`] and is never held across an
//! `.await` point (spec §5): methods either do everything synchronously and
//! return plain data, or hand back cloned `Arc`s for the caller to use after
//! releasing the lock.

use crate::tunnel::{ChannelId, SessionId};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWrite;
use tokio::net::UdpSocket;
use tokio::sync::Notify;

pub type BoxedWriter = Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Unpin + Send>>>;

pub struct TcpSession {
    pub id: SessionId,
    pub local_write: BoxedWriter,
    pub bound_channel: Option<ChannelId>,
    pub target: String,
    pub first_frame: Bytes,
    pub connected: Arc<Notify>,
    pub claim_times: HashMap<ChannelId, Instant>,
}

pub struct UdpSession {
    pub id: SessionId,
    pub listener: Arc<UdpSocket>,
    pub client_addr: Option<SocketAddr>,
    pub bound_channel: Option<ChannelId>,
    pub connected: Arc<Notify>,
    pub started: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    /// This call won the race and performed the bind.
    Bound,
    /// A different CLAIM_ACK already bound this session; this one is a
    /// no-op.
    AlreadyBound,
    /// The session no longer exists (already closed/removed) — the ACK is
    /// simply discarded (spec §9 "Unbound ACKs").
    Unknown,
}

#[derive(Default)]
struct Inner {
    tcp: HashMap<SessionId, TcpSession>,
    udp: HashMap<SessionId, UdpSession>,
}

#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert_tcp(&self, session: TcpSession) {
        self.inner.lock().tcp.insert(session.id.clone(), session);
    }

    pub fn insert_udp(&self, session: UdpSession) {
        self.inner.lock().udp.insert(session.id.clone(), session);
    }

    pub fn remove_tcp(&self, id: &str) -> Option<TcpSession> {
        self.inner.lock().tcp.remove(id)
    }

    pub fn remove_udp(&self, id: &str) -> Option<UdpSession> {
        self.inner.lock().udp.remove(id)
    }

    pub fn contains_tcp(&self, id: &str) -> bool {
        self.inner.lock().tcp.contains_key(id)
    }

    /// Record a CLAIM dispatch time, used only for latency logging (spec
    /// §3's `claim_times`).
    pub fn record_claim_time(&self, id: &str, channel: ChannelId, at: Instant) {
        if let Some(session) = self.inner.lock().tcp.get_mut(id) {
            session.claim_times.insert(channel, at);
        }
    }

    pub fn claim_age(&self, id: &str, channel: ChannelId, now: Instant) -> Option<std::time::Duration> {
        self.inner.lock().tcp.get(id).and_then(|s| s.claim_times.get(&channel)).map(|t| now.saturating_duration_since(*t))
    }

    /// Resolve the CLAIM_ACK race: the first caller for a given session id
    /// wins the bind, everyone else is a no-op (spec §4.3, §8 invariant).
    pub fn try_bind_tcp(&self, id: &str, channel: ChannelId) -> BindOutcome {
        let mut inner = self.inner.lock();
        match inner.tcp.get_mut(id) {
            None => BindOutcome::Unknown,
            Some(session) => {
                if session.bound_channel.is_some() {
                    BindOutcome::AlreadyBound
                } else {
                    session.bound_channel = Some(channel);
                    session.claim_times.clear();
                    BindOutcome::Bound
                }
            }
        }
    }

    /// Returns the fully-resolved `(target, first_frame)` for a session that
    /// was just bound, so the caller can build the `TCP:` frame outside the
    /// lock.
    pub fn tcp_dial_info(&self, id: &str) -> Option<(String, Bytes)> {
        self.inner.lock().tcp.get(id).map(|s| (s.target.clone(), s.first_frame.clone()))
    }

    pub fn bound_channel_tcp(&self, id: &str) -> Option<ChannelId> {
        self.inner.lock().tcp.get(id).and_then(|s| s.bound_channel)
    }

    pub fn bound_channel_udp(&self, id: &str) -> Option<ChannelId> {
        self.inner.lock().udp.get(id).and_then(|s| s.bound_channel)
    }

    /// Bind a UDP session to the lowest-numbered live channel; fails only if
    /// the caller already determined no channel is live (this method just
    /// records the bind the caller already chose).
    pub fn bind_udp(&self, id: &str, channel: ChannelId) -> bool {
        if let Some(session) = self.inner.lock().udp.get_mut(id) {
            session.bound_channel = Some(channel);
            true
        } else {
            false
        }
    }

    pub fn mark_udp_started(&self, id: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.udp.get_mut(id) {
            Some(session) if !session.started => {
                session.started = true;
                true
            }
            _ => false,
        }
    }

    /// Latch the first-observed SOCKS5 UDP peer address; later datagrams
    /// from a different peer are rejected by the caller (spec §4.4).
    pub fn latch_udp_client(&self, id: &str, addr: SocketAddr) -> bool {
        let mut inner = self.inner.lock();
        match inner.udp.get_mut(id) {
            Some(session) => match session.client_addr {
                None => {
                    session.client_addr = Some(addr);
                    true
                }
                Some(existing) => existing == addr,
            },
            None => false,
        }
    }

    pub fn udp_client_addr(&self, id: &str) -> Option<SocketAddr> {
        self.inner.lock().udp.get(id).and_then(|s| s.client_addr)
    }

    pub fn udp_socket(&self, id: &str) -> Option<Arc<UdpSocket>> {
        self.inner.lock().udp.get(id).map(|s| s.listener.clone())
    }

    pub fn connected_notify_tcp(&self, id: &str) -> Option<Arc<Notify>> {
        self.inner.lock().tcp.get(id).map(|s| s.connected.clone())
    }

    pub fn connected_notify_udp(&self, id: &str) -> Option<Arc<Notify>> {
        self.inner.lock().udp.get(id).map(|s| s.connected.clone())
    }

    pub fn local_writer_tcp(&self, id: &str) -> Option<BoxedWriter> {
        self.inner.lock().tcp.get(id).map(|s| s.local_write.clone())
    }

    /// Every tcp/udp session currently bound to `channel`, for channel-loss
    /// eviction (spec §4.1 reconnect behavior).
    pub fn sessions_bound_to(&self, channel: ChannelId) -> (Vec<SessionId>, Vec<SessionId>) {
        let inner = self.inner.lock();
        let tcp = inner.tcp.iter().filter(|(_, s)| s.bound_channel == Some(channel)).map(|(id, _)| id.clone()).collect();
        let udp = inner.udp.iter().filter(|(_, s)| s.bound_channel == Some(channel)).map(|(id, _)| id.clone()).collect();
        (tcp, udp)
    }

    pub fn tcp_len(&self) -> usize {
        self.inner.lock().tcp.len()
    }

    pub fn udp_len(&self) -> usize {
        self.inner.lock().udp.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::sink;

    fn dummy_writer() -> BoxedWriter {
        Arc::new(tokio::sync::Mutex::new(Box::new(sink()) as Box<dyn AsyncWrite + Unpin + Send>))
    }

    #[test]
    fn only_the_first_claim_ack_binds() {
        let reg = SessionRegistry::new();
        reg.insert_tcp(TcpSession {
            id: "s1".into(),
            local_write: dummy_writer(),
            bound_channel: None,
            target: "example.com:443".into(),
            first_frame: Bytes::new(),
            connected: Arc::new(Notify::new()),
            claim_times: HashMap::new(),
        });

        assert_eq!(reg.try_bind_tcp("s1", 1), BindOutcome::Bound);
        assert_eq!(reg.try_bind_tcp("s1", 0), BindOutcome::AlreadyBound);
        assert_eq!(reg.try_bind_tcp("s1", 2), BindOutcome::AlreadyBound);
        assert_eq!(reg.bound_channel_tcp("s1"), Some(1));
    }

    #[test]
    fn unknown_session_ack_is_discarded() {
        let reg = SessionRegistry::new();
        assert_eq!(reg.try_bind_tcp("ghost", 0), BindOutcome::Unknown);
    }

    #[tokio::test]
    async fn udp_latches_first_peer_only() {
        let reg = SessionRegistry::new();
        let sock = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        reg.insert_udp(UdpSession {
            id: "u1".into(),
            listener: sock,
            client_addr: None,
            bound_channel: None,
            connected: Arc::new(Notify::new()),
            started: false,
        });

        let peer_a: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let peer_b: SocketAddr = "127.0.0.1:40001".parse().unwrap();

        assert!(reg.latch_udp_client("u1", peer_a));
        assert_eq!(reg.udp_client_addr("u1"), Some(peer_a));
        // A second, different peer is rejected (latch already set).
        assert!(!reg.latch_udp_client("u1", peer_b));
        assert_eq!(reg.udp_client_addr("u1"), Some(peer_a));
        // The same peer repeating is fine.
        assert!(reg.latch_udp_client("u1", peer_a));
    }
}
