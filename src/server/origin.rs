//! Origin dial-out (C5 support): TCP connect / UDP socket open to the real
//! target on behalf of a tunneled session, and the read/receive pumps that
//! turn origin traffic back into `DATA`/`UDP_DATA` frames (spec §4.5).
//!
//! Every pump is bounded by a 1 s poll so that cancelling `cancel` (the
//! connection's [`CancellationToken`]) takes effect within 1 s even on an
//! idle socket (spec §4.5, §5).

use crate::frame::Frame;
use crate::tunnel::channel::send_frame;
use crate::tunnel::SessionId;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex as TokioMutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub async fn dial_tcp(target: &str) -> std::io::Result<TcpStream> {
    let stream = TcpStream::connect(target).await?;
    stream.set_nodelay(true).ok();
    Ok(stream)
}

pub async fn dial_udp(target: &str) -> anyhow::Result<(Arc<UdpSocket>, SocketAddr)> {
    let target_addr = tokio::net::lookup_host(target)
        .await?
        .next()
        .ok_or_else(|| anyhow::anyhow!("no addresses found for UDP target {target}"))?;
    let bind_addr: SocketAddr = if target_addr.is_ipv6() { "[::]:0".parse().unwrap() } else { "0.0.0.0:0".parse().unwrap() };
    let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
    Ok((socket, target_addr))
}

/// Reads from `origin` and emits `DATA:<id>|<bytes>` on `ws_tx` until EOF,
/// a read error, or cancellation. On EOF/error, emits `CLOSE:<id>` once.
pub async fn run_tcp_pump<R, W>(id: SessionId, mut origin: R, ws_tx: Arc<TokioMutex<fastwebsockets::WebSocketWrite<W>>>, cancel: CancellationToken)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 32 * 1024];
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            r = tokio::time::timeout(Duration::from_secs(1), origin.read(&mut buf)) => r,
        };
        let n = match read {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(err)) => {
                debug!(session = %id, error = %err, "origin TCP read failed");
                break;
            }
            Err(_) => continue, // 1s poll tick, no data yet
        };
        let frame = Frame::Data { id: id.clone(), payload: Bytes::copy_from_slice(&buf[..n]) };
        if send_frame(&ws_tx, &frame).await.is_err() {
            break;
        }
    }
    let _ = send_frame(&ws_tx, &Frame::Close { id }).await;
}

/// Receives datagrams from `origin` and emits
/// `UDP_DATA:<id>|<peer_host>:<peer_port>|<bytes>` on `ws_tx` until
/// cancellation or a receive error.
pub async fn run_udp_pump<W>(id: SessionId, origin: Arc<UdpSocket>, ws_tx: Arc<TokioMutex<fastwebsockets::WebSocketWrite<W>>>, cancel: CancellationToken)
where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let recv = tokio::select! {
            _ = cancel.cancelled() => break,
            r = tokio::time::timeout(Duration::from_secs(1), origin.recv_from(&mut buf)) => r,
        };
        let (n, peer) = match recv {
            Ok(Ok(v)) => v,
            Ok(Err(err)) => {
                debug!(session = %id, error = %err, "origin UDP recv failed");
                break;
            }
            Err(_) => continue,
        };
        let frame = Frame::UdpDataReply {
            id: id.clone(),
            peer_host: peer.ip().to_string(),
            peer_port: peer.port(),
            payload: Bytes::copy_from_slice(&buf[..n]),
        };
        if send_frame(&ws_tx, &frame).await.is_err() {
            break;
        }
    }
}
