//! Transport-obfuscating multi-channel TCP/UDP tunnel over ECH-protected
//! TLS WebSockets.

pub mod client;
pub mod config;
pub mod ech;
pub mod error;
pub mod frame;
pub mod server;
pub mod tls;
pub mod tunnel;
