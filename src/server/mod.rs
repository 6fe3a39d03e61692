//! Server demultiplexer (C5): accepts WSS connections gated by a CIDR
//! allow-list and a subprotocol token, then mirrors the client [`crate::tunnel::pool::Pool`]
//! on the gateway side — dialing origins and fanning frames back out over
//! the single channel it owns (spec §4.5).

pub mod origin;

use crate::config::WsServerConfig;
use crate::frame::{Frame, Side};
use crate::tls::ServerTlsMaterial;
use crate::tunnel::channel::{run_read_loop, send_frame, PingState};
use crate::tunnel::SessionId;
use bytes::Bytes;
use fastwebsockets::upgrade;
use http_body_util::Empty;
use hyper::body::Incoming;
use hyper::header::SEC_WEBSOCKET_PROTOCOL;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::Mutex as TokioMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type WsTx = Arc<TokioMutex<fastwebsockets::WebSocketWrite<tokio::io::WriteHalf<TokioIo<hyper::upgrade::Upgraded>>>>>;

#[derive(Default)]
struct Sessions {
    tcp: HashMap<SessionId, Arc<tokio::sync::Mutex<tokio::net::tcp::OwnedWriteHalf>>>,
    udp: HashMap<SessionId, Arc<tokio::net::UdpSocket>>,
    udp_targets: HashMap<SessionId, SocketAddr>,
}

/// Run the accept loop until the process is torn down. Each connection that
/// clears the CIDR check gets its own TLS handshake, HTTP upgrade, and
/// dedicated read loop / session table.
pub async fn serve(cfg: Arc<WsServerConfig>, tls: Arc<ServerTlsMaterial>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(cfg.listen).await?;
    info!(listen = %cfg.listen, "server demultiplexer ready");
    let acceptor = tokio_rustls::TlsAcceptor::from(tls.config.clone());

    loop {
        let (tcp, peer) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };

        if !cfg.cidr_allowed(peer.ip()) {
            debug!(%peer, "rejecting connection from disallowed source IP");
            continue;
        }

        let acceptor = acceptor.clone();
        let cfg = cfg.clone();
        let shutdown_child = shutdown.child_token();
        tokio::spawn(async move {
            if let Err(err) = handle_tls_conn(tcp, peer, acceptor, cfg, shutdown_child).await {
                debug!(%peer, error = %err, "connection ended");
            }
        });
    }
}

async fn handle_tls_conn(
    tcp: tokio::net::TcpStream,
    peer: SocketAddr,
    acceptor: tokio_rustls::TlsAcceptor,
    cfg: Arc<WsServerConfig>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    tcp.set_nodelay(true).ok();
    let tls_stream = acceptor.accept(tcp).await?;
    let io = TokioIo::new(tls_stream);

    let service = service_fn(move |req| {
        let cfg = cfg.clone();
        let cancel = cancel.clone();
        async move { handle_request(req, peer, cfg, cancel).await }
    });

    hyper::server::conn::http1::Builder::new().serve_connection(io, service).with_upgrades().await?;
    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    peer: SocketAddr,
    cfg: Arc<WsServerConfig>,
    cancel: CancellationToken,
) -> Result<Response<Empty<Bytes>>, hyper::Error> {
    if let Some(expected) = &cfg.token {
        let presented = req.headers().get(SEC_WEBSOCKET_PROTOCOL).and_then(|v| v.to_str().ok());
        if presented != Some(expected.as_str()) {
            warn!(%peer, "rejecting WebSocket upgrade: subprotocol token mismatch");
            let mut resp = Response::new(Empty::new());
            *resp.status_mut() = StatusCode::UNAUTHORIZED;
            return Ok(resp);
        }
    }

    let (response, fut) = match upgrade::upgrade(&mut req) {
        Ok(v) => v,
        Err(err) => {
            warn!(%peer, error = %err, "WebSocket upgrade failed");
            let mut resp = Response::new(Empty::new());
            *resp.status_mut() = StatusCode::FORBIDDEN;
            return Ok(resp);
        }
    };

    tokio::spawn(async move {
        match fut.await {
            Ok(ws) => run_connection(ws, peer, cancel).await,
            Err(err) => warn!(%peer, error = %err, "WebSocket upgrade future failed"),
        }
    });

    Ok(response)
}

/// One accepted WebSocket connection: single read loop, single session
/// table, all child tasks tied to `cancel` (spec §4.5 "owns one session
/// registry and runs a single read loop plus a context that cancels all
/// child tasks on WS close").
async fn run_connection(ws: fastwebsockets::WebSocket<TokioIo<hyper::upgrade::Upgraded>>, peer: SocketAddr, cancel: CancellationToken) {
    info!(%peer, "tunnel connection established");
    let (read, write) = ws.split(tokio::io::split);
    let ws_tx: WsTx = Arc::new(TokioMutex::new(write));
    let sessions = Arc::new(SyncMutex::new(Sessions::default()));
    let ping_state = Arc::new(parking_lot::Mutex::new(PingState::new()));

    let err = run_read_loop(read, ws_tx.clone(), ping_state, {
        let sessions = sessions.clone();
        let ws_tx = ws_tx.clone();
        let cancel = cancel.clone();
        move |kind, bytes| {
            let sessions = sessions.clone();
            let ws_tx = ws_tx.clone();
            let cancel = cancel.clone();
            async move { dispatch(kind, bytes, sessions, ws_tx, cancel).await }
        }
    })
    .await;

    debug!(%peer, error = %err, "tunnel connection read loop ended");
    cancel.cancel();
}

async fn dispatch(kind: crate::frame::WireKind, bytes: Bytes, sessions: Arc<SyncMutex<Sessions>>, ws_tx: WsTx, cancel: CancellationToken) {
    let frame = match decode_inbound(kind, &bytes) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(
                error = %crate::error::TunnelError::MalformedFrame(err.to_string()),
                "malformed inbound frame, dropping"
            );
            return;
        }
    };

    match frame {
        Frame::Claim { id, channel } => {
            let _ = send_frame(&ws_tx, &Frame::ClaimAck { id, channel }).await;
        }
        Frame::Tcp { id, target, first_frame } => handle_tcp_open(id, target, first_frame, sessions, ws_tx, cancel).await,
        Frame::Data { id, payload } => handle_tcp_data(id, payload, sessions, ws_tx).await,
        Frame::Close { id } => {
            sessions.lock().tcp.remove(&id);
        }
        Frame::UdpConnect { id, target } => handle_udp_open(id, target, sessions, ws_tx, cancel).await,
        Frame::UdpData { id, payload } => handle_udp_data(id, payload, sessions).await,
        Frame::UdpClose { id } => {
            sessions.lock().udp.remove(&id);
        }
        Frame::Unknown { tag } => warn!(tag, "unrecognized frame tag, ignoring"),
        other => debug!(?other, "ignoring client-direction-only frame received by server"),
    }
}

async fn handle_tcp_open(id: SessionId, target: String, first_frame: Bytes, sessions: Arc<SyncMutex<Sessions>>, ws_tx: WsTx, cancel: CancellationToken) {
    let stream = match origin::dial_tcp(&target).await {
        Ok(s) => s,
        Err(err) => {
            warn!(
                session = %id,
                %target,
                error = %crate::error::TunnelError::OriginFailure(id.clone(), err.to_string()),
                "origin TCP dial failed"
            );
            let _ = send_frame(&ws_tx, &Frame::Close { id }).await;
            return;
        }
    };
    let (read_half, mut write_half) = stream.into_split();
    if !first_frame.is_empty() {
        if let Err(err) = write_half.write_all(&first_frame).await {
            warn!(
                session = %id,
                error = %crate::error::TunnelError::OriginFailure(id.clone(), err.to_string()),
                "failed writing first frame to origin"
            );
            let _ = send_frame(&ws_tx, &Frame::Close { id }).await;
            return;
        }
    }

    sessions.lock().tcp.insert(id.clone(), Arc::new(tokio::sync::Mutex::new(write_half)));
    let _ = send_frame(&ws_tx, &Frame::Connected { id: id.clone() }).await;

    let pump_cancel = cancel.child_token();
    tokio::spawn(origin::run_tcp_pump(id, read_half, ws_tx, pump_cancel));
}

async fn handle_tcp_data(id: SessionId, payload: Bytes, sessions: Arc<SyncMutex<Sessions>>, ws_tx: WsTx) {
    let writer = sessions.lock().tcp.get(&id).cloned();
    let Some(writer) = writer else {
        debug!(error = %crate::error::TunnelError::UnknownSession(id), "DATA for unknown session, dropping");
        return;
    };
    let mut guard = writer.lock().await;
    if let Err(err) = guard.write_all(&payload).await {
        drop(guard);
        debug!(
            session = %id,
            error = %crate::error::TunnelError::OriginFailure(id.clone(), err.to_string()),
            "origin TCP write failed, closing"
        );
        sessions.lock().tcp.remove(&id);
        let _ = send_frame(&ws_tx, &Frame::Close { id }).await;
    }
}

async fn handle_udp_open(id: SessionId, target: String, sessions: Arc<SyncMutex<Sessions>>, ws_tx: WsTx, cancel: CancellationToken) {
    let (socket, target_addr) = match origin::dial_udp(&target).await {
        Ok(v) => v,
        Err(err) => {
            warn!(
                session = %id,
                %target,
                error = %crate::error::TunnelError::OriginFailure(id.clone(), err.to_string()),
                "origin UDP open failed"
            );
            let _ = send_frame(&ws_tx, &Frame::UdpError { id, reason: err.to_string() }).await;
            return;
        }
    };
    {
        let mut guard = sessions.lock();
        guard.udp.insert(id.clone(), socket.clone());
        guard.udp_targets.insert(id.clone(), target_addr);
    }
    let _ = send_frame(&ws_tx, &Frame::UdpConnected { id: id.clone() }).await;

    let pump_cancel = cancel.child_token();
    tokio::spawn(origin::run_udp_pump(id, socket, ws_tx, pump_cancel));
}

async fn handle_udp_data(id: SessionId, payload: Bytes, sessions: Arc<SyncMutex<Sessions>>) {
    let (socket, target_addr) = {
        let guard = sessions.lock();
        let socket = guard.udp.get(&id).cloned();
        let target_addr = guard.udp_targets.get(&id).copied();
        (socket, target_addr)
    };
    let (Some(socket), Some(target_addr)) = (socket, target_addr) else {
        debug!(error = %crate::error::TunnelError::UnknownSession(id), "UDP_DATA for unknown session, dropping");
        return;
    };
    if let Err(err) = socket.send_to(&payload, target_addr).await {
        debug!(
            session = %id,
            error = %crate::error::TunnelError::OriginFailure(id, err.to_string()),
            "origin UDP send failed"
        );
    }
}

/// Dispatch by the WebSocket opcode the read loop already classified (spec
/// §4.2): Text carries control tags, Binary carries `DATA:`/the
/// client-direction `UDP_DATA:` shape, hence `Side::Server`.
fn decode_inbound(kind: crate::frame::WireKind, bytes: &Bytes) -> Result<Frame, crate::frame::FrameError> {
    match kind {
        crate::frame::WireKind::Text => Frame::decode_text(bytes),
        crate::frame::WireKind::Binary => Frame::decode_binary(bytes, Side::Server),
    }
}
