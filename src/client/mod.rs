//! Client-side local listeners: SOCKS5 (+ UDP ASSOCIATE), HTTP(S) CONNECT
//! proxy, and plain TCP port-forward, all funneling into the shared [`Pool`]
//! (spec §4 "local listeners").

pub mod http_proxy;
pub mod socks5;
pub mod tcp_forward;

use crate::config::LocalListener;
use crate::tunnel::pool::Pool;
use crate::tunnel::SessionId;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, ReadHalf};
use tokio::net::TcpStream;
use tracing::debug;

/// Spawn one task per configured local listener.
pub fn spawn_listeners(listeners: Vec<LocalListener>, pool: Arc<Pool>) {
    for listener in listeners {
        let pool = pool.clone();
        tokio::spawn(async move {
            let result = match listener {
                LocalListener::Socks5 { listen, username, password } => socks5::serve(listen, username, password, pool).await,
                LocalListener::HttpProxy { listen } => http_proxy::serve(listen, pool).await,
                LocalListener::TcpForward { listen, target } => tcp_forward::serve(listen, target, pool).await,
            };
            if let Err(err) = result {
                tracing::error!(error = %err, "local listener exited");
            }
        });
    }
}

/// Pipe local reads into `DATA:` frames on the session's bound channel until
/// EOF or a send failure, then tear the session down (spec §4.3 "pipe local
/// reads to DATA frames on bound channel").
pub async fn pump_local_reads(id: SessionId, mut read_half: ReadHalf<TcpStream>, pool: Arc<Pool>) {
    let mut buf = vec![0u8; 32 * 1024];
    loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                debug!(session = %id, error = %err, "local read failed");
                break;
            }
        };
        if let Err(err) = pool.send_data(&id, bytes::Bytes::copy_from_slice(&buf[..n])).await {
            debug!(session = %id, error = %err, "send_data failed, tearing down session");
            break;
        }
    }
    pool.send_close(&id).await;
}
