//! Plain TCP port-forward listener (spec §4 "local listeners"): every
//! accepted connection is tunneled to a single, statically configured
//! target.

use crate::tunnel::new_session_id;
use crate::tunnel::pool::Pool;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

pub async fn serve(listen: SocketAddr, target: String, pool: Arc<Pool>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen).await?;
    info!(%listen, %target, "TCP port-forward listener ready");
    loop {
        let (socket, peer) = listener.accept().await?;
        let pool = pool.clone();
        let target = target.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_conn(socket, target, pool).await {
                debug!(%peer, error = %err, "TCP forward connection ended");
            }
        });
    }
}

async fn handle_conn(mut socket: TcpStream, target: String, pool: Arc<Pool>) -> anyhow::Result<()> {
    // Opportunistic first-frame capture, 5s budget (spec §5 "5 s (plain TCP
    // port-forward) before giving up and sending empty first frame").
    let mut buf = BytesMut::zeroed(32 * 1024);
    let first_frame = match tokio::time::timeout(Duration::from_secs(5), socket.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => Bytes::copy_from_slice(&buf[..n]),
        _ => Bytes::new(),
    };

    let id = new_session_id();
    let (read_half, write_half) = tokio::io::split(socket);
    let local_write = Arc::new(tokio::sync::Mutex::new(Box::new(write_half) as Box<dyn tokio::io::AsyncWrite + Unpin + Send>));
    pool.register_tcp(id.clone(), target, first_frame, local_write).await;

    if !pool.wait_connected(&id, Duration::from_secs(5)).await {
        warn!(session = %id, "TCP forward session failed to connect within timeout");
        pool.send_close(&id).await;
        return Ok(());
    }

    crate::client::pump_local_reads(id, read_half, pool).await;
    Ok(())
}
