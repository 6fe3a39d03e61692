//! Wire frame codec (C2).
//!
//! Control frames travel as WebSocket Text messages, ASCII, `|`-delimited.
//! Data frames travel as WebSocket Binary messages with an ASCII tag
//! terminated by `:` followed by `|`-delimited fields, the last field being
//! opaque payload bytes. Every parser here splits on the first N occurrences
//! of `|` only, so a binary payload may itself contain `|` bytes.

use crate::tunnel::SessionId;
use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// WebSocket max message size we negotiate and enforce on encode.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

static SESSION_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9A-Za-z-]{1,64}$").unwrap());

pub fn is_valid_session_id(id: &str) -> bool {
    SESSION_ID_RE.is_match(id)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("missing tag separator in {0:?}")]
    MissingTag(String),
    #[error("frame {tag:?} expects {expected} fields, got {got}")]
    WrongFieldCount {
        tag: String,
        expected: usize,
        got: usize,
    },
    #[error("invalid session id {0:?}")]
    InvalidSessionId(String),
    #[error("frame too large: {0} bytes exceeds {1}")]
    TooLarge(usize, usize),
    #[error("non-utf8 text frame")]
    NotUtf8,
}

/// A decoded control or data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Claim { id: SessionId, channel: usize },
    ClaimAck { id: SessionId, channel: usize },
    Tcp { id: SessionId, target: String, first_frame: Bytes },
    Connected { id: SessionId },
    Close { id: SessionId },
    Error { message: String },
    UdpConnect { id: SessionId, target: String },
    UdpConnected { id: SessionId },
    UdpClose { id: SessionId },
    UdpError { id: SessionId, reason: String },
    Data { id: SessionId, payload: Bytes },
    /// Client → server UDP payload. The origin address was already fixed by
    /// `UDP_CONNECT`, so no SOCKS5 UDP header travels on this path (spec
    /// §4.5's dispatch table: `UDP_DATA:<id>|<bytes>`).
    UdpData { id: SessionId, payload: Bytes },
    /// Server → client UDP payload, carrying the replying peer's address
    /// since an origin may answer from a different host:port than it was
    /// sent to (spec §4.3's inbound routing: `UDP_DATA:<id>|<host>:<port>|<bytes>`).
    ///
    /// Both directions share the `UDP_DATA:` wire tag; which shape applies
    /// is determined by [`Side`] at decode time, not by the bytes alone.
    UdpDataReply { id: SessionId, peer_host: String, peer_port: u16, payload: Bytes },
    /// Recognized tag, unrecognized meaning — dropped by the caller with a
    /// warning, the connection otherwise stays up.
    Unknown { tag: String },
}

/// Whether a frame must be carried as a WebSocket Text or Binary message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireKind {
    Text,
    Binary,
}

/// Which end of the tunnel is decoding — needed because `UDP_DATA:` carries
/// a different field count depending on direction (see [`Frame::UdpData`]
/// vs [`Frame::UdpDataReply`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Decoding frames received from the server (we are the client).
    Client,
    /// Decoding frames received from a client (we are the server).
    Server,
}

impl Frame {
    pub fn wire_kind(&self) -> WireKind {
        match self {
            Frame::Data { .. } | Frame::UdpData { .. } | Frame::UdpDataReply { .. } => WireKind::Binary,
            // First-frame bytes may be non-UTF-8 but existing deployments
            // carry the TCP: open frame as Text regardless (spec §6, §9).
            _ => WireKind::Text,
        }
    }

    /// Split `s` on the first `n` occurrences of `sep`, returning exactly
    /// `n + 1` slices (the last one carries any remaining `sep` bytes
    /// verbatim).
    fn splitn_bytes(s: &[u8], sep: u8, n: usize) -> Option<Vec<&[u8]>> {
        let mut out = Vec::with_capacity(n + 1);
        let mut rest = s;
        for _ in 0..n {
            let idx = rest.iter().position(|&b| b == sep)?;
            out.push(&rest[..idx]);
            rest = &rest[idx + 1..];
        }
        out.push(rest);
        Some(out)
    }

    fn parse_tag(raw: &[u8]) -> Result<(&str, &[u8]), FrameError> {
        let idx = raw
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(|| FrameError::MissingTag(String::from_utf8_lossy(raw).into_owned()))?;
        let tag = std::str::from_utf8(&raw[..idx]).map_err(|_| FrameError::NotUtf8)?;
        Ok((tag, &raw[idx + 1..]))
    }

    fn validate_id(raw: &[u8]) -> Result<SessionId, FrameError> {
        let s = std::str::from_utf8(raw).map_err(|_| FrameError::NotUtf8)?;
        if !is_valid_session_id(s) {
            return Err(FrameError::InvalidSessionId(s.to_string()));
        }
        Ok(s.to_string())
    }

    fn str_field(raw: &[u8]) -> Result<String, FrameError> {
        std::str::from_utf8(raw).map(str::to_string).map_err(|_| FrameError::NotUtf8)
    }

    /// Decode a WebSocket Text message.
    pub fn decode_text(raw: &[u8]) -> Result<Frame, FrameError> {
        if raw.is_empty() {
            return Err(FrameError::Empty);
        }
        let (tag, rest) = Self::parse_tag(raw)?;
        match tag {
            "CLAIM" => {
                let f = Self::splitn_bytes(rest, b'|', 1)
                    .ok_or_else(|| wrong_count("CLAIM", 2))?;
                let id = Self::validate_id(f[0])?;
                let channel = parse_usize(f[1], "CLAIM")?;
                Ok(Frame::Claim { id, channel })
            }
            "CLAIM_ACK" => {
                let f = Self::splitn_bytes(rest, b'|', 1)
                    .ok_or_else(|| wrong_count("CLAIM_ACK", 2))?;
                let id = Self::validate_id(f[0])?;
                let channel = parse_usize(f[1], "CLAIM_ACK")?;
                Ok(Frame::ClaimAck { id, channel })
            }
            "TCP" => {
                let f = Self::splitn_bytes(rest, b'|', 2)
                    .ok_or_else(|| wrong_count("TCP", 3))?;
                let id = Self::validate_id(f[0])?;
                let target = Self::str_field(f[1])?;
                let first_frame = Bytes::copy_from_slice(f[2]);
                Ok(Frame::Tcp { id, target, first_frame })
            }
            "CONNECTED" => Ok(Frame::Connected { id: Self::validate_id(rest)? }),
            "CLOSE" => Ok(Frame::Close { id: Self::validate_id(rest)? }),
            "ERROR" => Ok(Frame::Error { message: Self::str_field(rest)? }),
            "UDP_CONNECT" => {
                let f = Self::splitn_bytes(rest, b'|', 1)
                    .ok_or_else(|| wrong_count("UDP_CONNECT", 2))?;
                let id = Self::validate_id(f[0])?;
                let target = Self::str_field(f[1])?;
                Ok(Frame::UdpConnect { id, target })
            }
            "UDP_CONNECTED" => Ok(Frame::UdpConnected { id: Self::validate_id(rest)? }),
            "UDP_CLOSE" => Ok(Frame::UdpClose { id: Self::validate_id(rest)? }),
            "UDP_ERROR" => {
                let f = Self::splitn_bytes(rest, b'|', 1)
                    .ok_or_else(|| wrong_count("UDP_ERROR", 2))?;
                let id = Self::validate_id(f[0])?;
                let reason = Self::str_field(f[1])?;
                Ok(Frame::UdpError { id, reason })
            }
            other => Ok(Frame::Unknown { tag: other.to_string() }),
        }
    }

    /// Decode a WebSocket Binary message (`DATA:` / `UDP_DATA:`). `side`
    /// disambiguates `UDP_DATA:`'s direction-dependent field count.
    pub fn decode_binary(raw: &[u8], side: Side) -> Result<Frame, FrameError> {
        if raw.is_empty() {
            return Err(FrameError::Empty);
        }
        let (tag, rest) = Self::parse_tag(raw)?;
        match tag {
            "DATA" => {
                let f = Self::splitn_bytes(rest, b'|', 1)
                    .ok_or_else(|| wrong_count("DATA", 2))?;
                let id = Self::validate_id(f[0])?;
                Ok(Frame::Data { id, payload: Bytes::copy_from_slice(f[1]) })
            }
            // Wire tag is shared by both directions; the field count (and
            // therefore the shape) differs by `side` (see [`Side`]).
            "UDP_DATA" => match side {
                Side::Server => {
                    let f = Self::splitn_bytes(rest, b'|', 1).ok_or_else(|| wrong_count("UDP_DATA", 2))?;
                    let id = Self::validate_id(f[0])?;
                    Ok(Frame::UdpData { id, payload: Bytes::copy_from_slice(f[1]) })
                }
                Side::Client => {
                    let f = Self::splitn_bytes(rest, b'|', 2).ok_or_else(|| wrong_count("UDP_DATA", 3))?;
                    let id = Self::validate_id(f[0])?;
                    let host_port = Self::str_field(f[1])?;
                    let (peer_host, peer_port) = host_port
                        .rsplit_once(':')
                        .and_then(|(h, p)| p.parse::<u16>().ok().map(|p| (h.to_string(), p)))
                        .ok_or_else(|| FrameError::WrongFieldCount {
                            tag: "UDP_DATA".into(),
                            expected: 3,
                            got: 0,
                        })?;
                    Ok(Frame::UdpDataReply { id, peer_host, peer_port, payload: Bytes::copy_from_slice(f[2]) })
                }
            },
            other => Ok(Frame::Unknown { tag: other.to_string() }),
        }
    }

    /// Encode as the bytes of either a Text or Binary WebSocket message.
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let out: Bytes = match self {
            Frame::Claim { id, channel } => format!("CLAIM:{id}|{channel}").into_bytes().into(),
            Frame::ClaimAck { id, channel } => format!("CLAIM_ACK:{id}|{channel}").into_bytes().into(),
            Frame::Tcp { id, target, first_frame } => {
                let mut buf = format!("TCP:{id}|{target}|").into_bytes();
                buf.extend_from_slice(first_frame);
                buf.into()
            }
            Frame::Connected { id } => format!("CONNECTED:{id}").into_bytes().into(),
            Frame::Close { id } => format!("CLOSE:{id}").into_bytes().into(),
            Frame::Error { message } => format!("ERROR:{message}").into_bytes().into(),
            Frame::UdpConnect { id, target } => format!("UDP_CONNECT:{id}|{target}").into_bytes().into(),
            Frame::UdpConnected { id } => format!("UDP_CONNECTED:{id}").into_bytes().into(),
            Frame::UdpClose { id } => format!("UDP_CLOSE:{id}").into_bytes().into(),
            Frame::UdpError { id, reason } => format!("UDP_ERROR:{id}|{reason}").into_bytes().into(),
            Frame::Data { id, payload } => {
                let mut buf = format!("DATA:{id}|").into_bytes();
                buf.extend_from_slice(payload);
                buf.into()
            }
            Frame::UdpData { id, payload } => {
                let mut buf = format!("UDP_DATA:{id}|").into_bytes();
                buf.extend_from_slice(payload);
                buf.into()
            }
            Frame::UdpDataReply { id, peer_host, peer_port, payload } => {
                let mut buf = format!("UDP_DATA:{id}|{peer_host}:{peer_port}|").into_bytes();
                buf.extend_from_slice(payload);
                buf.into()
            }
            Frame::Unknown { tag } => return Err(FrameError::MissingTag(tag.clone())),
        };
        if out.len() > MAX_MESSAGE_SIZE {
            return Err(FrameError::TooLarge(out.len(), MAX_MESSAGE_SIZE));
        }
        Ok(out)
    }
}

fn wrong_count(tag: &str, expected: usize) -> FrameError {
    FrameError::WrongFieldCount { tag: tag.to_string(), expected, got: 0 }
}

fn parse_usize(raw: &[u8], tag: &str) -> Result<usize, FrameError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| wrong_count(tag, 2))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_roundtrip() {
        let f = Frame::Claim { id: "abc-123".into(), channel: 2 };
        let enc = f.encode().unwrap();
        assert_eq!(enc.as_ref(), b"CLAIM:abc-123|2");
        assert_eq!(Frame::decode_text(&enc).unwrap(), f);
    }

    #[test]
    fn data_payload_with_pipes_is_preserved() {
        let payload = Bytes::from_static(b"a|b|c||");
        let f = Frame::Data { id: "s1".into(), payload: payload.clone() };
        let enc = f.encode().unwrap();
        match Frame::decode_binary(&enc, Side::Client).unwrap() {
            Frame::Data { id, payload: p } => {
                assert_eq!(id, "s1");
                assert_eq!(p, payload);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn udp_data_client_to_server_splits_on_first_pipe_only() {
        let payload = Bytes::from_static(b"\x00\x01|weird|payload");
        let f = Frame::UdpData { id: "u1".into(), payload: payload.clone() };
        let enc = f.encode().unwrap();
        match Frame::decode_binary(&enc, Side::Server).unwrap() {
            Frame::UdpData { id, payload: p } => {
                assert_eq!(id, "u1");
                assert_eq!(p, payload);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn udp_data_reply_splits_on_first_two_pipes_only() {
        let payload = Bytes::from_static(b"\x00\x01|weird|payload");
        let f = Frame::UdpDataReply {
            id: "u1".into(),
            peer_host: "127.0.0.1".into(),
            peer_port: 5353,
            payload: payload.clone(),
        };
        let enc = f.encode().unwrap();
        match Frame::decode_binary(&enc, Side::Client).unwrap() {
            Frame::UdpDataReply { id, peer_host, peer_port, payload: p } => {
                assert_eq!(id, "u1");
                assert_eq!(peer_host, "127.0.0.1");
                assert_eq!(peer_port, 5353);
                assert_eq!(p, payload);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn empty_payload_is_accepted() {
        let f = Frame::Data { id: "s1".into(), payload: Bytes::new() };
        let enc = f.encode().unwrap();
        assert_eq!(Frame::decode_binary(&enc, Side::Client).unwrap(), f);
    }

    #[test]
    fn max_first_frame_32kib_roundtrips() {
        let payload = Bytes::from(vec![b'x'; 32 * 1024]);
        let f = Frame::Tcp { id: "s1".into(), target: "example.com:443".into(), first_frame: payload.clone() };
        let enc = f.encode().unwrap();
        assert_eq!(Frame::decode_text(&enc).unwrap(), f);
    }

    #[test]
    fn unknown_tag_does_not_error() {
        match Frame::decode_text(b"FROBNICATE:abc|def").unwrap() {
            Frame::Unknown { tag } => assert_eq!(tag, "FROBNICATE"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_tag_separator_is_malformed() {
        assert_eq!(Frame::decode_text(b"NOTAG").unwrap_err(), FrameError::MissingTag("NOTAG".into()));
    }

    #[test]
    fn empty_frame_is_malformed() {
        assert_eq!(Frame::decode_text(b"").unwrap_err(), FrameError::Empty);
        assert_eq!(Frame::decode_binary(b"", Side::Client).unwrap_err(), FrameError::Empty);
    }

    #[test]
    fn invalid_session_id_is_rejected() {
        assert!(matches!(
            Frame::decode_text(b"CONNECTED:not a valid id!!").unwrap_err(),
            FrameError::InvalidSessionId(_)
        ));
    }

    #[test]
    fn over_max_message_size_fails_encode() {
        let payload = Bytes::from(vec![0u8; MAX_MESSAGE_SIZE + 1]);
        let f = Frame::Data { id: "s1".into(), payload };
        assert!(matches!(f.encode().unwrap_err(), FrameError::TooLarge(_, _)));
    }
}
