//! The tunnel core: C1 Channel, C2 frame codec (in [`crate::frame`]), C3
//! Pool, and C4 session registry.

pub mod channel;
pub mod pool;
pub mod registry;

/// Opaque unique session identifier, stable for the session's lifetime.
/// Matches `[0-9A-Za-z-]{1,64}` on the wire (spec §6).
pub type SessionId = String;

/// Index in `[0, N)` identifying one channel in the pool. Stable.
pub type ChannelId = usize;

/// Generate a fresh session id (UUID v4, as existing deployments use).
pub fn new_session_id() -> SessionId {
    uuid::Uuid::new_v4().to_string()
}
