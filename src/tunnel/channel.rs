//! Channel (C1): one TLS-1.3+ECH WebSocket transport.
//!
//! This module is the per-connection mechanics — dialing, the writer-lock
//! serialized send, the ping/pong sequence tracker, and the read loop that
//! decodes frames and hands them to a caller-supplied callback. The
//! persistent per-slot state (current transport, reconnect state machine)
//! lives one level up in [`crate::tunnel::pool`], which is what actually
//! owns a channel's lifetime across reconnects.

use crate::config::WsClientConfig;
use crate::ech::EchConfigSource;
use crate::frame::{Frame, WireKind};
use crate::tls;
use crate::tunnel::ChannelId;
use anyhow::{anyhow, Context};
use bytes::Bytes;
use fastwebsockets::{FragmentCollector, Frame as WsFrame, OpCode, Payload, WebSocketRead, WebSocketWrite};
use http_body_util::Empty;
use hyper::header::{CONNECTION, HOST, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION, UPGRADE};
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::future::Future;
use std::io::{self, ErrorKind};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex as TokioMutex;
use tokio_rustls::client::TlsStream;
use tracing::{debug, trace, warn};

pub type WsRead = WebSocketRead<ReadHalf<TokioIo<TlsStream<TcpStream>>>>;
pub type WsWrite = WebSocketWrite<WriteHalf<TokioIo<TlsStream<TcpStream>>>>;

#[derive(Debug)]
pub struct PingState {
    ping_seq: u8,
    pong_seq: u8,
    max_diff: u8,
}

impl PingState {
    pub const fn new() -> Self {
        Self { ping_seq: 0, pong_seq: 0, max_diff: 3 }
    }

    pub fn is_ok(&self) -> bool {
        self.ping_seq - self.pong_seq <= self.max_diff
    }

    pub fn ping_inc(&mut self) {
        match self.ping_seq.checked_add(1) {
            Some(ping) => self.ping_seq = ping,
            None => self.reset(),
        }
    }

    pub fn set_pong_seq(&mut self, seq: u8) {
        if seq > self.pong_seq && seq <= self.ping_seq {
            self.pong_seq = seq;
        }
        if self.ping_seq == self.pong_seq && self.ping_seq > u8::MAX / 2 {
            self.reset();
        }
    }

    fn reset(&mut self) {
        self.ping_seq = 0;
        self.pong_seq = 0;
    }
}

/// Result of a successful connect procedure (spec §4.1 steps 1-4).
pub struct Dialed {
    pub read: WsRead,
    pub write: WsWrite,
}

/// Run the full connect procedure once: ECH config → TLS-1.3 client config
/// with a fatal ECH-rejection policy → optional SNI-pinned dial → WebSocket
/// upgrade. Retries the TLS handshake once internally, refreshing the ECH
/// config between attempts (spec §5 "TLS ECH retries: 2 attempts").
pub async fn connect(
    channel_id: ChannelId,
    cfg: &WsClientConfig,
    ech_source: &Arc<dyn EchConfigSource>,
) -> anyhow::Result<Dialed> {
    let mut last_err = None;
    for attempt in 0..2 {
        match try_connect(channel_id, cfg, ech_source).await {
            Ok(dialed) => return Ok(dialed),
            Err(err) => {
                warn!(channel = channel_id, attempt, error = %err, "ECH handshake attempt failed");
                ech_source.invalidate(&cfg.ech_domain).await;
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow!("ECH handshake failed with no recorded error")))
}

async fn try_connect(channel_id: ChannelId, cfg: &WsClientConfig, ech_source: &Arc<dyn EchConfigSource>) -> anyhow::Result<Dialed> {
    let ech_bytes = ech_source.get(&cfg.ech_domain).await.map_err(|err| {
        anyhow!(crate::error::TunnelError::EchUnavailable(cfg.ech_domain.clone())).context(err)
    })?;

    let tls_config = tls::build_client_config(ech_bytes)?;
    let connector = tokio_rustls::TlsConnector::from(tls_config);

    let dial_ip: IpAddr = match cfg.sni_pin_ip {
        Some(ip) => ip,
        None => resolve_first(&cfg.ws_host).await?,
    };
    let tcp = TcpStream::connect((dial_ip, cfg.ws_port))
        .await
        .with_context(|| format!("TCP connect to {dial_ip}:{} failed", cfg.ws_port))?;
    tcp.set_nodelay(true).ok();

    let server_name = tls::server_name_for(&cfg.ws_host)?;
    let tls_stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|err| anyhow!("{}", tls::classify_handshake_error(&cfg.ws_host, &err)))?;

    let io = TokioIo::new(tls_stream);

    let mut req = Request::builder()
        .method("GET")
        .uri(format!("/{}", cfg.http_upgrade_path_prefix))
        .header(HOST, &cfg.ws_host)
        .header(UPGRADE, "websocket")
        .header(CONNECTION, "upgrade")
        .header(SEC_WEBSOCKET_KEY, fastwebsockets::handshake::generate_key())
        .header(SEC_WEBSOCKET_VERSION, "13");
    if let Some(token) = &cfg.protocol_token {
        req = req.header(SEC_WEBSOCKET_PROTOCOL, token);
    }
    let req = req
        .body(Empty::<Bytes>::new())
        .with_context(|| format!("failed to build WebSocket upgrade request to {}", cfg.ws_host))?;

    let (ws, _response) = tokio::time::timeout(
        std::time::Duration::from_secs(10),
        fastwebsockets::handshake::client(&TokioExecutor::new(), req, io),
    )
    .await
    .map_err(|_| anyhow!("WebSocket handshake to {} timed out after 10s", cfg.ws_host))?
    .with_context(|| format!("WebSocket handshake with {} failed", cfg.ws_host))?;

    debug!(channel = channel_id, host = %cfg.ws_host, "channel connected");
    let (read, write) = ws.split(tokio::io::split);
    Ok(Dialed { read, write })
}

async fn resolve_first(host: &str) -> anyhow::Result<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    let resolver = hickory_resolver::TokioAsyncResolver::tokio_from_system_conf()
        .with_context(|| "failed to build DNS resolver from system config")?;
    let lookup = resolver.lookup_ip(host).await.with_context(|| format!("failed to resolve {host}"))?;
    lookup.iter().next().ok_or_else(|| anyhow!("no addresses found for {host}"))
}

/// Encode and write a single frame under the writer lock (spec §4.1
/// "Write contract" — serialized, never held across any other await).
/// Generic over the underlying stream so both the client dial side
/// ([`WsWrite`]) and the server upgrade side (`TokioIo<Upgraded>`) share one
/// implementation.
pub async fn send_frame<W>(ws_tx: &TokioMutex<WebSocketWrite<W>>, frame: &Frame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = frame.encode().map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
    let ws_frame = match frame.wire_kind() {
        WireKind::Text => WsFrame::text(Payload::Owned(bytes.to_vec())),
        WireKind::Binary => WsFrame::binary(Payload::Owned(bytes.to_vec())),
    };
    let mut guard = ws_tx.lock().await;
    guard.write_frame(ws_frame).await.map_err(|err| io::Error::new(ErrorKind::ConnectionAborted, err))
}

pub async fn send_ping<W>(ws_tx: &TokioMutex<WebSocketWrite<W>>, ping_state: &parking_lot::Mutex<PingState>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let seq = {
        let mut state = ping_state.lock();
        if !state.is_ok() {
            return Err(io::Error::new(ErrorKind::BrokenPipe, "no pong received for too many pings"));
        }
        state.ping_inc();
        state.ping_seq
    };
    trace!("sending ping({seq})");
    ws_tx
        .lock()
        .await
        .write_frame(WsFrame::new(true, OpCode::Ping, None, Payload::Owned(vec![seq])))
        .await
        .map_err(|err| io::Error::new(ErrorKind::BrokenPipe, err))
}

pub async fn send_close<W>(ws_tx: &TokioMutex<WebSocketWrite<W>>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    ws_tx
        .lock()
        .await
        .write_frame(WsFrame::close(1000, &[]))
        .await
        .map_err(|err| io::Error::new(ErrorKind::BrokenPipe, err))
}

/// Read loop: decode every inbound WebSocket message and hand it to
/// `on_frame`. Runs until the transport fails or the peer closes, at which
/// point the resulting I/O error is returned for the caller to act on
/// (reconnect, evict bound sessions — spec §4.1 "Reconnect"; on the server
/// side, cancellation per spec §4.5/§5).
pub async fn run_read_loop<R, W, F, Fut>(
    ws_rx: WebSocketRead<R>,
    ws_tx: Arc<TokioMutex<WebSocketWrite<W>>>,
    ping_state: Arc<parking_lot::Mutex<PingState>>,
    mut on_frame: F,
) -> io::Error
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(WireKind, Bytes) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ws_rx = FragmentCollector::new(ws_rx);
    loop {
        let msg = match ws_rx
            .read_frame(&mut |frame| {
                let ws_tx = ws_tx.clone();
                async move { ws_tx.lock().await.write_frame(frame).await }
            })
            .await
        {
            Ok(msg) => msg,
            Err(err) => return io::Error::new(ErrorKind::ConnectionAborted, err),
        };

        trace!("received ws frame {:?}", msg.opcode);
        match msg.opcode {
            OpCode::Text => on_frame(WireKind::Text, Bytes::copy_from_slice(msg.payload.as_ref())).await,
            OpCode::Binary | OpCode::Continuation => {
                on_frame(WireKind::Binary, Bytes::copy_from_slice(msg.payload.as_ref())).await
            }
            OpCode::Close => return io::Error::new(ErrorKind::NotConnected, "websocket close"),
            // Pings are answered inline by the closure passed to read_frame above.
            OpCode::Ping => continue,
            OpCode::Pong => {
                if let Some(&seq) = msg.payload.first() {
                    let mut state = ping_state.lock();
                    state.set_pong_seq(seq);
                    trace!("received pong({seq})");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_state() {
        let mut ping_state = PingState::new();
        assert!(ping_state.is_ok());
        assert_eq!(ping_state.ping_seq, 0);
        assert_eq!(ping_state.pong_seq, 0);

        for it in 1..=3 {
            ping_state.ping_inc();
            assert_eq!(ping_state.ping_seq, it);
            assert_eq!(ping_state.pong_seq, 0);
            assert!(ping_state.is_ok());
        }

        ping_state.ping_inc();
        assert_eq!(ping_state.ping_seq, 4);
        assert!(!ping_state.is_ok());

        ping_state.set_pong_seq(1);
        assert!(ping_state.is_ok());
        ping_state.set_pong_seq(4);
        assert!(ping_state.is_ok());

        for _ in 5..=130 {
            ping_state.ping_inc();
        }
        assert_eq!(ping_state.ping_seq, 130);
        assert_eq!(ping_state.pong_seq, 4);
        assert!(!ping_state.is_ok());

        ping_state.set_pong_seq(130);
        assert_eq!(ping_state.ping_seq, 0);
        assert_eq!(ping_state.pong_seq, 0);
        assert!(ping_state.is_ok());

        for it in 1..=128 {
            ping_state.ping_inc();
            ping_state.set_pong_seq(it);
        }
        assert_eq!(ping_state.ping_seq, 0);
        assert_eq!(ping_state.pong_seq, 0);
        assert!(ping_state.is_ok());
    }
}
