//! Pool (C3): owns the N parallel channels, routes outbound frames by
//! session id, runs the claim/bind race, and dispatches inbound frames to
//! sessions (spec §4.3).

use crate::config::WsClientConfig;
use crate::ech::EchConfigSource;
use crate::frame::{Frame, Side};
use crate::tunnel::channel::{self, WsWrite};
use crate::tunnel::registry::{BindOutcome, SessionRegistry, TcpSession, UdpSession};
use crate::tunnel::{ChannelId, SessionId};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as TokioMutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Anything that can emit one encoded frame on a channel. Exists so the
/// claim/bind race and inbound-frame dispatch logic of this module can be
/// driven in tests against a fake transport, without a live TLS+WebSocket
/// connection.
#[async_trait]
trait FrameSink: Send + Sync {
    async fn send(&self, frame: &Frame) -> std::io::Result<()>;
}

/// Production sink: the channel's writer-lock-serialized WebSocket write
/// half (spec §4.1 write contract).
struct WsFrameSink(Arc<TokioMutex<WsWrite>>);

#[async_trait]
impl FrameSink for WsFrameSink {
    async fn send(&self, frame: &Frame) -> std::io::Result<()> {
        channel::send_frame(&self.0, frame).await
    }
}

/// One entry of the pool: the live transport (if any) plus enough state for
/// [`Pool::handle_inbound`] to write back on it.
struct ChannelSlot {
    id: ChannelId,
    writer: SyncMutex<Option<Arc<dyn FrameSink>>>,
    live: AtomicBool,
}

impl ChannelSlot {
    fn writer(&self) -> Option<Arc<dyn FrameSink>> {
        self.writer.lock().clone()
    }
}

/// The client-side multi-channel dispatch core.
pub struct Pool {
    cfg: WsClientConfig,
    ech_source: Arc<dyn EchConfigSource>,
    registry: Arc<SessionRegistry>,
    slots: Vec<Arc<ChannelSlot>>,
}

impl Pool {
    pub fn new(cfg: WsClientConfig, ech_source: Arc<dyn EchConfigSource>) -> Arc<Self> {
        let slots = (0..cfg.pool_size)
            .map(|id| Arc::new(ChannelSlot { id, writer: SyncMutex::new(None), live: AtomicBool::new(false) }))
            .collect();
        Arc::new(Self { cfg, ech_source, registry: SessionRegistry::new(), slots })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Spawn the N channel tasks and return immediately (spec §4.3 `start()`).
    pub fn start(self: &Arc<Self>) {
        for slot in &self.slots {
            let weak = Arc::downgrade(self);
            let slot = slot.clone();
            tokio::spawn(run_channel(weak, slot));
        }
    }

    /// Record a fresh TCP session and fan out CLAIM on every live channel
    /// (spec §4.3 "Claim/bind algorithm").
    pub async fn register_tcp(self: &Arc<Self>, id: SessionId, target: String, first_frame: Bytes, local: crate::tunnel::registry::BoxedWriter) {
        self.registry.insert_tcp(TcpSession {
            id: id.clone(),
            local_write: local,
            bound_channel: None,
            target,
            first_frame,
            connected: Arc::new(tokio::sync::Notify::new()),
            claim_times: HashMap::new(),
        });

        let now = Instant::now();
        for slot in &self.slots {
            if !slot.live.load(Ordering::Acquire) {
                continue;
            }
            let Some(writer) = slot.writer() else { continue };
            self.registry.record_claim_time(&id, slot.id, now);
            let frame = Frame::Claim { id: id.clone(), channel: slot.id };
            if let Err(err) = writer.send(&frame).await {
                warn!(session = %id, channel = slot.id, error = %err, "CLAIM send failed");
            }
        }
    }

    /// Record a fresh UDP session; the socket is not yet bound to a channel
    /// (spec §4.3 `register_udp`).
    pub fn register_udp(&self, id: SessionId, socket: Arc<tokio::net::UdpSocket>) {
        self.registry.insert_udp(UdpSession {
            id,
            listener: socket,
            client_addr: None,
            bound_channel: None,
            connected: Arc::new(tokio::sync::Notify::new()),
            started: false,
        });
    }

    /// Pick the lowest-numbered live channel, bind, and emit UDP_CONNECT
    /// (spec §4.3 `send_udp_connect`). Fails only if no channel is live.
    pub async fn send_udp_connect(&self, id: &str, target: String) -> anyhow::Result<()> {
        let slot = self
            .slots
            .iter()
            .find(|s| s.live.load(Ordering::Acquire) && s.writer().is_some())
            .ok_or_else(|| anyhow::anyhow!("no live channel to bind UDP session {id}"))?;
        self.registry.bind_udp(id, slot.id);
        let writer = slot.writer().expect("checked above");
        writer.send(&Frame::UdpConnect { id: id.to_string(), target }).await?;
        Ok(())
    }

    /// Route to the session's bound channel; silent no-op if unbound
    /// (spec §4.3).
    pub async fn send_udp_data(&self, id: &str, payload: Bytes) {
        let Some(ch) = self.registry.bound_channel_udp(id) else { return };
        let Some(writer) = self.writer_for(ch) else { return };
        let _ = writer.send(&Frame::UdpData { id: id.to_string(), payload }).await;
    }

    pub async fn send_close(&self, id: &str) {
        let Some(ch) = self.registry.bound_channel_tcp(id) else { return };
        let Some(writer) = self.writer_for(ch) else { return };
        let _ = writer.send(&Frame::Close { id: id.to_string() }).await;
    }

    pub async fn send_udp_close(&self, id: &str) {
        let Some(ch) = self.registry.bound_channel_udp(id) else { return };
        let Some(writer) = self.writer_for(ch) else { return };
        let _ = writer.send(&Frame::UdpClose { id: id.to_string() }).await;
    }

    /// Fails if the session has not yet bound (spec §4.3 `send_data`).
    pub async fn send_data(&self, id: &str, payload: Bytes) -> anyhow::Result<()> {
        let ch = self
            .registry
            .bound_channel_tcp(id)
            .ok_or_else(|| anyhow::anyhow!(crate::error::TunnelError::SessionUnbound(id.to_string())))?;
        let writer = self
            .writer_for(ch)
            .ok_or_else(|| anyhow::anyhow!(crate::error::TunnelError::NoLiveChannel(id.to_string())))?;
        writer.send(&Frame::Data { id: id.to_string(), payload }).await?;
        Ok(())
    }

    /// Returns true on first CONNECTED/UDP_CONNECTED for `id`; false on
    /// timeout (spec §4.3 `wait_connected`).
    pub async fn wait_connected(&self, id: &str, wait: Duration) -> bool {
        let Some(notify) = self.registry.connected_notify_tcp(id).or_else(|| self.registry.connected_notify_udp(id)) else {
            return false;
        };
        timeout(wait, notify.notified()).await.is_ok()
    }

    fn writer_for(&self, channel: ChannelId) -> Option<Arc<dyn FrameSink>> {
        self.slots.get(channel).and_then(|s| s.writer())
    }

    /// Handle one decoded inbound frame received on `channel` (client read
    /// loop callback). Implements the CLAIM_ACK race resolution, DATA/
    /// UDP_DATA routing, and CONNECTED/CLOSE/ERROR handling of spec §4.3.
    async fn handle_inbound(&self, channel: ChannelId, frame: Frame) {
        match frame {
            Frame::ClaimAck { id, channel: ch } => self.handle_claim_ack(id, ch).await,
            Frame::Connected { id } => {
                if let Some(notify) = self.registry.connected_notify_tcp(&id) {
                    notify.notify_waiters();
                }
            }
            Frame::UdpConnected { id } => {
                if self.registry.mark_udp_started(&id) {
                    if let Some(notify) = self.registry.connected_notify_udp(&id) {
                        notify.notify_waiters();
                    }
                }
            }
            Frame::Error { message } => warn!(channel, error = %message, "server reported a protocol-level error"),
            Frame::Close { id } => self.evict_tcp(&id).await,
            Frame::UdpError { id, reason } => {
                warn!(session = %id, channel, reason, "UDP session failed to establish");
                self.registry.remove_udp(&id);
            }
            Frame::UdpClose { id } => {
                self.registry.remove_udp(&id);
            }
            Frame::Data { id, payload } => self.deliver_tcp(&id, channel, payload).await,
            Frame::UdpData { .. } => {
                // Client never receives the 2-field client->server shape.
                warn!(channel, "received client-direction UDP_DATA on the client side, dropping");
            }
            Frame::UdpDataReply { id, peer_host, peer_port, payload } => {
                self.deliver_udp(&id, peer_host, peer_port, payload).await;
            }
            Frame::Unknown { tag } => warn!(channel, tag, "unrecognized frame tag, ignoring"),
            Frame::Claim { .. } | Frame::Tcp { .. } | Frame::UdpConnect { .. } => {
                debug!(channel, "ignoring server-direction-only frame received by client");
            }
        }
    }

    async fn handle_claim_ack(&self, id: SessionId, channel: ChannelId) {
        match self.registry.try_bind_tcp(&id, channel) {
            BindOutcome::Unknown | BindOutcome::AlreadyBound => return,
            BindOutcome::Bound => {}
        }
        let Some((target, first_frame)) = self.registry.tcp_dial_info(&id) else { return };
        let Some(writer) = self.writer_for(channel) else {
            self.fail_tcp(&id).await;
            return;
        };
        let frame = Frame::Tcp { id: id.clone(), target, first_frame };
        if let Err(err) = writer.send(&frame).await {
            warn!(session = %id, channel, error = %err, "TCP frame emit failed, releasing session");
            self.fail_tcp(&id).await;
        }
    }

    async fn deliver_tcp(&self, id: &str, channel: ChannelId, payload: Bytes) {
        if self.registry.bound_channel_tcp(id) != Some(channel) {
            return;
        }
        let Some(writer) = self.registry.local_writer_tcp(id) else {
            debug!(error = %crate::error::TunnelError::UnknownSession(id.to_string()), "DATA for unknown session, dropping");
            return;
        };
        let mut guard = writer.lock().await;
        if let Err(err) = guard.write_all(&payload).await {
            drop(guard);
            debug!(
                session = %id,
                error = %crate::error::TunnelError::LocalIoFailure(id.to_string(), err),
                "local write failed, closing session"
            );
            self.send_close(id).await;
            self.registry.remove_tcp(id);
        }
    }

    async fn deliver_udp(&self, id: &str, peer_host: String, peer_port: u16, payload: Bytes) {
        let Some(socket) = self.registry.udp_socket(id) else {
            debug!(error = %crate::error::TunnelError::UnknownSession(id.to_string()), "UDP_DATA for unknown session, dropping");
            return;
        };
        let Some(client_addr) = self.registry.udp_client_addr(id) else { return };
        let reply = match crate::client::socks5::encode_udp_reply(&peer_host, peer_port, &payload) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(session = %id, error = %err, "failed to encode SOCKS5 UDP reply");
                return;
            }
        };
        if let Err(err) = socket.send_to(&reply, client_addr).await {
            debug!(
                session = %id,
                error = %crate::error::TunnelError::LocalIoFailure(id.to_string(), err),
                "UDP reply write failed"
            );
        }
    }

    async fn fail_tcp(&self, id: &str) {
        self.evict_tcp(id).await;
    }

    async fn evict_tcp(&self, id: &str) {
        if let Some(session) = self.registry.remove_tcp(id) {
            let mut guard = session.local_write.lock().await;
            let _ = guard.shutdown().await;
        }
    }

    /// Evict every session bound to `channel` on transport loss (spec §4.1
    /// "any session previously bound to that channel is considered lost").
    async fn evict_channel(&self, channel: ChannelId) {
        let (tcp_ids, udp_ids) = self.registry.sessions_bound_to(channel);
        for id in tcp_ids {
            info!(session = %id, channel, "evicting TCP session, bound channel reconnecting");
            self.evict_tcp(&id).await;
        }
        for id in udp_ids {
            info!(session = %id, channel, "evicting UDP session, bound channel reconnecting");
            self.registry.remove_udp(&id);
        }
    }
}

/// Per-slot lifetime: `Connecting -> Running -> Failing -> Connecting`,
/// terminal only when the pool itself is dropped (spec §4.1 state machine).
/// Takes only a [`Weak`] reference so the pool can be torn down without
/// waiting for every channel task to notice.
async fn run_channel(pool: Weak<Pool>, slot: Arc<ChannelSlot>) {
    loop {
        let Some(pool) = pool.upgrade() else { return };
        let dialed = match channel::connect(slot.id, &pool.cfg, &pool.ech_source).await {
            Ok(dialed) => dialed,
            Err(err) => {
                warn!(channel = slot.id, error = %err, "channel connect failed, retrying in 2s");
                drop(pool);
                tokio::time::sleep(Duration::from_secs(2)).await;
                continue;
            }
        };

        let writer = Arc::new(TokioMutex::new(dialed.write));
        *slot.writer.lock() = Some(Arc::new(WsFrameSink(writer.clone())) as Arc<dyn FrameSink>);
        slot.live.store(true, Ordering::Release);
        info!(channel = slot.id, "channel running");

        let ping_state = Arc::new(parking_lot::Mutex::new(channel::PingState::new()));
        let keepalive = tokio::spawn(keepalive_loop(writer.clone(), ping_state.clone()));

        let pool_for_loop = pool.clone();
        let channel_id = slot.id;
        let err = channel::run_read_loop(dialed.read, writer.clone(), ping_state, move |kind, bytes| {
            let pool = pool_for_loop.clone();
            async move {
                let frame = match decode_inbound(kind, &bytes) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(
                            channel = channel_id,
                            error = %crate::error::TunnelError::MalformedFrame(err.to_string()),
                            "malformed inbound frame, dropping"
                        );
                        return;
                    }
                };
                pool.handle_inbound(channel_id, frame).await;
            }
        })
        .await;

        keepalive.abort();
        slot.live.store(false, Ordering::Release);
        *slot.writer.lock() = None;
        warn!(
            channel = slot.id,
            error = %crate::error::TunnelError::TransportFailure(slot.id),
            io_error = %err,
            "channel down, evicting bound sessions"
        );
        pool.evict_channel(slot.id).await;
        drop(pool);
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

/// Dispatch by the WebSocket opcode the read loop already classified: Text
/// carries control tags, Binary carries `DATA:`/`UDP_DATA:` (spec §4.2).
/// The client only ever receives the server-direction `UDP_DATA:` shape, so
/// binary frames always decode as `Side::Client`.
fn decode_inbound(kind: crate::frame::WireKind, bytes: &Bytes) -> Result<Frame, crate::frame::FrameError> {
    match kind {
        crate::frame::WireKind::Text => Frame::decode_text(bytes),
        crate::frame::WireKind::Binary => Frame::decode_binary(bytes, Side::Client),
    }
}

/// Send a ping every 10s (spec §5 "Channel keepalive ping: every 10 s").
async fn keepalive_loop(writer: Arc<TokioMutex<WsWrite>>, ping_state: Arc<parking_lot::Mutex<channel::PingState>>) {
    let mut interval = tokio::time::interval(Duration::from_secs(10));
    loop {
        interval.tick().await;
        if channel::send_ping(&writer, &ping_state).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::registry::BoxedWriter;
    use tokio::io::AsyncReadExt;

    fn test_cfg(pool_size: usize) -> WsClientConfig {
        WsClientConfig {
            ws_scheme_is_tls: true,
            ws_host: "example.com".into(),
            ws_port: 443,
            http_upgrade_path_prefix: String::new(),
            pool_size,
            protocol_token: None,
            sni_pin_ip: None,
            doh_server: "https://dns.google/dns-query".into(),
            ech_domain: "example.com".into(),
        }
    }

    struct UnreachableEch;

    #[async_trait]
    impl EchConfigSource for UnreachableEch {
        async fn get(&self, _domain: &str) -> anyhow::Result<Bytes> {
            Err(anyhow::anyhow!("not used by these tests"))
        }
        async fn invalidate(&self, _domain: &str) {}
    }

    /// Records every frame handed to it instead of writing to a real
    /// transport, so the claim/bind race and inbound dispatch can be driven
    /// through the real `Pool` methods without a live channel.
    #[derive(Default)]
    struct RecordingSink {
        sent: SyncMutex<Vec<Frame>>,
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn send(&self, frame: &Frame) -> std::io::Result<()> {
            self.sent.lock().push(frame.clone());
            Ok(())
        }
    }

    fn live_slot(id: ChannelId, sink: Arc<RecordingSink>) -> Arc<ChannelSlot> {
        Arc::new(ChannelSlot {
            id,
            writer: SyncMutex::new(Some(sink as Arc<dyn FrameSink>)),
            live: AtomicBool::new(true),
        })
    }

    fn test_pool(sinks: &[Arc<RecordingSink>]) -> Arc<Pool> {
        let slots = sinks.iter().enumerate().map(|(id, sink)| live_slot(id, sink.clone())).collect();
        Arc::new(Pool {
            cfg: test_cfg(sinks.len()),
            ech_source: Arc::new(UnreachableEch),
            registry: SessionRegistry::new(),
            slots,
        })
    }

    fn duplex_local_writer() -> (BoxedWriter, tokio::io::DuplexStream) {
        let (local, peer) = tokio::io::duplex(4096);
        let (_read_half, write_half) = tokio::io::split(local);
        let writer: BoxedWriter = Arc::new(tokio::sync::Mutex::new(Box::new(write_half) as Box<dyn tokio::io::AsyncWrite + Unpin + Send>));
        (writer, peer)
    }

    #[tokio::test]
    async fn register_tcp_fans_out_claim_on_every_live_channel() {
        let sinks: Vec<_> = (0..3).map(|_| Arc::new(RecordingSink::default())).collect();
        let pool = test_pool(&sinks);
        let (local_write, _peer) = duplex_local_writer();

        pool.register_tcp("s1".into(), "example.com:443".into(), Bytes::new(), local_write).await;

        for (channel, sink) in sinks.iter().enumerate() {
            let sent = sink.sent.lock();
            assert_eq!(sent.len(), 1);
            match &sent[0] {
                Frame::Claim { id, channel: ch } => {
                    assert_eq!(id, "s1");
                    assert_eq!(*ch, channel);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn first_claim_ack_wins_the_race_and_only_that_channel_gets_the_tcp_frame() {
        let sinks: Vec<_> = (0..3).map(|_| Arc::new(RecordingSink::default())).collect();
        let pool = test_pool(&sinks);
        let (local_write, _peer) = duplex_local_writer();

        pool.register_tcp("s1".into(), "example.com:443".into(), Bytes::from_static(b"hello"), local_write).await;
        for sink in &sinks {
            sink.sent.lock().clear();
        }

        // Channel 2's CLAIM_ACK arrives first and wins the bind...
        pool.handle_claim_ack("s1".into(), 2).await;
        // ...a slower ACK from channel 0 arrives second and must be a no-op
        // (spec §8 "only the first CLAIM_ACK observed binds the session").
        pool.handle_claim_ack("s1".into(), 0).await;

        assert_eq!(pool.registry.bound_channel_tcp("s1"), Some(2));

        let won = sinks[2].sent.lock();
        assert_eq!(won.len(), 1);
        match &won[0] {
            Frame::Tcp { id, target, first_frame } => {
                assert_eq!(id, "s1");
                assert_eq!(target, "example.com:443");
                assert_eq!(first_frame.as_ref(), b"hello");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(sinks[0].sent.lock().is_empty());
        assert!(sinks[1].sent.lock().is_empty());
    }

    /// Drives a decoded inbound Binary `DATA:` frame, exactly as the fixed
    /// `decode_inbound` now hands it to `handle_inbound`, all the way to the
    /// session's local socket. This is the path the WireKind-dispatch bug
    /// silently broke: a regression here means inbound data frames are being
    /// mis-decoded or mis-routed again.
    #[tokio::test]
    async fn inbound_data_frame_reaches_the_bound_sessions_local_socket() {
        let sinks: Vec<_> = (0..1).map(|_| Arc::new(RecordingSink::default())).collect();
        let pool = test_pool(&sinks);
        let (local_write, mut peer) = duplex_local_writer();

        pool.register_tcp("s1".into(), "example.com:443".into(), Bytes::new(), local_write).await;
        pool.handle_claim_ack("s1".into(), 0).await;
        assert_eq!(pool.registry.bound_channel_tcp("s1"), Some(0));

        let encoded = Frame::Data { id: "s1".into(), payload: Bytes::from_static(b"echo") }.encode().unwrap();
        let decoded = decode_inbound(crate::frame::WireKind::Binary, &encoded).unwrap();
        pool.handle_inbound(0, decoded).await;

        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"echo");
    }

    /// A `DATA:` frame arriving on a channel the session isn't bound to must
    /// be dropped, not delivered (spec §4.3 inbound routing).
    #[tokio::test]
    async fn inbound_data_frame_on_the_wrong_channel_is_dropped() {
        let sinks: Vec<_> = (0..2).map(|_| Arc::new(RecordingSink::default())).collect();
        let pool = test_pool(&sinks);
        let (local_write, mut peer) = duplex_local_writer();

        pool.register_tcp("s1".into(), "example.com:443".into(), Bytes::new(), local_write).await;
        pool.handle_claim_ack("s1".into(), 0).await;

        pool.handle_inbound(1, Frame::Data { id: "s1".into(), payload: Bytes::from_static(b"nope") }).await;

        let mut buf = [0u8; 4];
        let res = tokio::time::timeout(Duration::from_millis(50), peer.read_exact(&mut buf)).await;
        assert!(res.is_err(), "no bytes should have been delivered to the wrong channel's session");
    }
}
