//! Local HTTP(S) CONNECT proxy listener (spec §4 "local listeners").
//!
//! HTTP wire-parsing is out of scope for this tunnel (spec §1, it is a
//! standardized protocol treated as an external collaborator); we only need
//! enough of the request line to learn the target authority, so parsing is
//! done by hand rather than pulling in a full HTTP server stack for this
//! listener.

use crate::tunnel::new_session_id;
use crate::tunnel::pool::Pool;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

pub async fn serve(listen: SocketAddr, pool: Arc<Pool>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen).await?;
    info!(%listen, "HTTP(S) CONNECT proxy listener ready");
    loop {
        let (socket, peer) = listener.accept().await?;
        let pool = pool.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_conn(socket, pool).await {
                debug!(%peer, error = %err, "HTTP proxy connection ended");
            }
        });
    }
}

async fn handle_conn(mut socket: TcpStream, pool: Arc<Pool>) -> anyhow::Result<()> {
    let mut buf = BytesMut::zeroed(8 * 1024);
    let n = tokio::time::timeout(Duration::from_millis(100), socket.read(&mut buf)).await??;
    if n == 0 {
        return Ok(());
    }
    buf.truncate(n);

    let request_line_end = buf.windows(2).position(|w| w == b"\r\n").unwrap_or(buf.len());
    let request_line = std::str::from_utf8(&buf[..request_line_end]).unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let uri = parts.next().unwrap_or_default();

    if method.eq_ignore_ascii_case("CONNECT") {
        handle_connect(socket, uri, pool).await
    } else {
        handle_plain_http(socket, uri, Bytes::copy_from_slice(&buf), pool).await
    }
}

/// `CONNECT host:port HTTP/1.1` — reply 200 then tunnel raw bytes
/// (spec §4.3 TCP session flow, no first-frame to carry since the tunnel
/// starts clean after the 200 response).
async fn handle_connect(mut socket: TcpStream, authority: &str, pool: Arc<Pool>) -> anyhow::Result<()> {
    let target = authority.to_string();
    socket.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await?;
    run_session(socket, target, Bytes::new(), pool).await
}

/// Plain (non-CONNECT) HTTP request: target is the request's authority, and
/// the already-buffered request bytes are replayed as the TCP session's
/// first frame so nothing is lost.
async fn handle_plain_http(socket: TcpStream, uri: &str, buffered: Bytes, pool: Arc<Pool>) -> anyhow::Result<()> {
    let target = match target_from_uri(uri) {
        Some(t) => t,
        None => {
            warn!(uri, "could not determine proxy target from request line, dropping connection");
            return Ok(());
        }
    };
    run_session(socket, target, buffered, pool).await
}

fn target_from_uri(uri: &str) -> Option<String> {
    let without_scheme = uri.strip_prefix("http://").or_else(|| uri.strip_prefix("https://"))?;
    let authority = without_scheme.split('/').next()?;
    if authority.contains(':') {
        Some(authority.to_string())
    } else {
        Some(format!("{authority}:80"))
    }
}

async fn run_session(socket: TcpStream, target: String, first_frame: Bytes, pool: Arc<Pool>) -> anyhow::Result<()> {
    let id = new_session_id();
    let (read_half, write_half) = tokio::io::split(socket);
    let local_write = Arc::new(tokio::sync::Mutex::new(Box::new(write_half) as Box<dyn tokio::io::AsyncWrite + Unpin + Send>));
    pool.register_tcp(id.clone(), target, first_frame, local_write).await;

    if !pool.wait_connected(&id, Duration::from_secs(5)).await {
        warn!(session = %id, "HTTP proxy session failed to connect within timeout");
        pool.send_close(&id).await;
        return Ok(());
    }

    crate::client::pump_local_reads(id, read_half, pool).await;
    Ok(())
}
