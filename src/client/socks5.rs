//! Local SOCKS5 listener, including the UDP ASSOCIATE relay (spec §4.4).
//!
//! TCP CONNECT negotiation and UDP datagram framing are delegated to
//! `fast_socks5` (spec §1 calls SOCKS5 wire-parsing an external
//! collaborator); everything past the handshake — the claim/bind race, the
//! first-datagram peer latch, the opportunistic first-frame read — is this
//! tunnel's own.

use crate::tunnel::pool::Pool;
use crate::tunnel::{new_session_id, registry::BoxedWriter};
use bytes::{Bytes, BytesMut};
use fast_socks5::{
    new_udp_header, parse_udp_request,
    server::{Socks5ServerProtocol, states::CommandRead},
    util::target_addr::TargetAddr,
    Socks5Command,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, info, warn};

pub async fn serve(listen: SocketAddr, username: Option<String>, password: Option<String>, pool: Arc<Pool>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen).await?;
    info!(%listen, "SOCKS5 listener ready");
    loop {
        let (socket, peer) = listener.accept().await?;
        let pool = pool.clone();
        let username = username.clone();
        let password = password.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_conn(socket, username, password, pool).await {
                debug!(%peer, error = %err, "SOCKS5 connection ended");
            }
        });
    }
}

async fn handle_conn(socket: TcpStream, username: Option<String>, password: Option<String>, pool: Arc<Pool>) -> anyhow::Result<()> {
    let protocol = match (username, password) {
        (Some(user), Some(pass)) => {
            Socks5ServerProtocol::accept_password_auth(socket, |u, p| u == user.as_bytes() && p == pass.as_bytes()).await?.0
        }
        _ => Socks5ServerProtocol::accept_no_auth(socket).await?,
    };

    let (protocol, cmd, target_addr) = protocol.read_command().await?;
    match cmd {
        Socks5Command::TCPConnect => handle_connect(protocol, target_addr, pool).await,
        Socks5Command::UDPAssociate => handle_udp_associate(protocol, pool).await,
        Socks5Command::TCPBind => {
            protocol.reply_error(&fast_socks5::ReplyError::CommandNotSupported).await?;
            Ok(())
        }
    }
}

async fn handle_connect(
    protocol: Socks5ServerProtocol<TcpStream, CommandRead>,
    target_addr: TargetAddr,
    pool: Arc<Pool>,
) -> anyhow::Result<()> {
    let target = target_addr.to_string();
    let bind_addr: SocketAddr = "0.0.0.0:0".parse().unwrap();
    let mut socket = protocol.reply_success(bind_addr).await?;

    // Opportunistic first-frame capture, 100ms budget (spec §5 "TCP
    // first-frame opportunistic read: 100 ms (SOCKS5)").
    let mut buf = BytesMut::zeroed(32 * 1024);
    let first_frame = match tokio::time::timeout(Duration::from_millis(100), socket.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => Bytes::copy_from_slice(&buf[..n]),
        _ => Bytes::new(),
    };

    let id = new_session_id();
    let (read_half, write_half) = tokio::io::split(socket);
    let local_write: BoxedWriter = Arc::new(tokio::sync::Mutex::new(Box::new(write_half)));
    pool.register_tcp(id.clone(), target, first_frame, local_write.clone()).await;

    if !pool.wait_connected(&id, Duration::from_secs(5)).await {
        warn!(session = %id, "TCP session failed to connect within timeout");
        pool.send_close(&id).await;
        return Ok(());
    }

    crate::client::pump_local_reads(id, read_half, pool).await;
    Ok(())
}

async fn handle_udp_associate(
    protocol: Socks5ServerProtocol<TcpStream, CommandRead>,
    pool: Arc<Pool>,
) -> anyhow::Result<()> {
    let relay = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
    let relay_addr = relay.local_addr()?;
    // Keep the control TCP connection open for the lifetime of the
    // association (standard SOCKS5 UDP ASSOCIATE contract); its read is
    // simply used as an EOF signal that the client went away.
    let mut control = protocol.reply_success(relay_addr).await?;

    let id = new_session_id();
    pool.register_udp(id.clone(), relay.clone());

    let pool_for_relay = pool.clone();
    let id_for_relay = id.clone();
    let relay_task = tokio::spawn(async move { relay_loop(id_for_relay, relay, pool_for_relay).await });

    let mut discard = [0u8; 1];
    let _ = control.read(&mut discard).await;
    relay_task.abort();
    pool.send_udp_close(&id).await;
    Ok(())
}

/// One relay listener per UDP ASSOCIATE session (spec §4.4): latches the
/// first peer, decodes the SOCKS5 UDP header, triggers `send_udp_connect` on
/// the first datagram and `send_udp_data` thereafter.
async fn relay_loop(id: String, relay: Arc<UdpSocket>, pool: Arc<Pool>) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let (n, peer) = match relay.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(err) => {
                debug!(session = %id, error = %err, "UDP relay recv failed");
                return;
            }
        };

        if !pool.registry().latch_udp_client(&id, peer) {
            debug!(session = %id, %peer, "dropping datagram from unlatched peer");
            continue;
        }

        let (frag, target_addr, payload) = match parse_udp_request(&buf[..n]).await {
            Ok(v) => v,
            Err(err) => {
                debug!(session = %id, error = %err, "malformed SOCKS5 UDP datagram, dropping");
                continue;
            }
        };
        if frag != 0 {
            debug!(session = %id, "dropping fragmented SOCKS5 UDP datagram (FRAG != 0)");
            continue;
        }

        let payload = Bytes::copy_from_slice(payload);
        let target = target_addr.to_string();
        if pool.registry().mark_udp_started(&id) {
            if let Err(err) = pool.send_udp_connect(&id, target).await {
                warn!(session = %id, error = %err, "no live channel for UDP session");
                return;
            }
            if !pool.wait_connected(&id, Duration::from_secs(5)).await {
                warn!(session = %id, "UDP session failed to connect within timeout");
                pool.send_udp_close(&id).await;
                return;
            }
        }
        pool.send_udp_data(&id, payload).await;
    }
}

/// Wrap a server-direction UDP reply in the SOCKS5 UDP header so it can be
/// written straight back to the latched client address (spec §4.3 "wrapped
/// as a SOCKS5 UDP reply").
pub fn encode_udp_reply(peer_host: &str, peer_port: u16, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
    let target = match peer_host.parse::<std::net::IpAddr>() {
        Ok(ip) => TargetAddr::Ip(SocketAddr::new(ip, peer_port)),
        Err(_) => TargetAddr::Domain(peer_host.to_string(), peer_port),
    };
    let mut out = new_udp_header(target)?;
    out.extend_from_slice(payload);
    Ok(out)
}
