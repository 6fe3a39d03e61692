//! Error kinds distinguished by the tunnel core (see design notes on error
//! handling policy: a session-scoped error closes only that session, a
//! transport-scoped error closes every session riding that channel).

use crate::tunnel::{ChannelId, SessionId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("channel {0} transport failed")]
    TransportFailure(ChannelId),

    #[error("no ECH config available yet for {0}")]
    EchUnavailable(String),

    #[error("server did not honor ECH for {0}")]
    EchRejected(String),

    #[error("no live channel to dispatch session {0}")]
    NoLiveChannel(SessionId),

    #[error("session {0} has not been bound to a channel yet")]
    SessionUnbound(SessionId),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("local I/O failure for session {0}: {1}")]
    LocalIoFailure(SessionId, #[source] std::io::Error),

    #[error("origin failure for session {0}: {1}")]
    OriginFailure(SessionId, String),

    #[error("unknown session {0}")]
    UnknownSession(SessionId),
}
