//! Wire protocol for the relay tunnel.
//!
//! Every datagram on the tunnel is one of two shapes, disambiguated purely
//! by length:
//!
//! - **Address-data frame** (length >= 7): bytes `[0..4)` are the peer's
//!   IPv4 address in network order, `[4..6)` the peer's UDP port in
//!   little-endian, and `[6..]` the payload (at least one byte).
//! - **Control tag** (length 1..=6): the first byte is an ASCII tag, `'k'`
//!   (keep-alive) or `'d'` (disconnect) from client to server, `'K'` or
//!   `'D'` in the other direction.
//!
//! The 7-byte minimum is what makes the two shapes distinguishable without
//! an explicit type byte: the session token is 6 bytes, so it also rides
//! below the address-data threshold.

use base64::Engine as _;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Size of the address header (IPv4 + port) in bytes
pub const ADDR_HEADER_SIZE: usize = 6;

/// Minimum size of an address-data frame (header + at least one data byte)
pub const ADDR_DATA_MIN_SIZE: usize = ADDR_HEADER_SIZE + 1;

/// Size of the session token in bytes
pub const TOKEN_SIZE: usize = 6;

/// Receive buffer size for tunnel and worker sockets
pub const MAX_DATAGRAM_SIZE: usize = 2048;

/// Framing errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: expected at least {expected}, got {actual}")]
    TooShort { expected: usize, actual: usize },
}

/// Append an address-data frame for `addr` carrying `data` to `buf`.
///
/// Panics if `data` is empty: that is a caller bug, since a 6-byte frame
/// parses as a control tag on the receiving side. IPv6 peers are
/// unrepresentable by the `SocketAddrV4` signature.
pub fn encode_addr_data(buf: &mut Vec<u8>, addr: SocketAddrV4, data: &[u8]) {
    assert!(!data.is_empty(), "address-data payload must not be empty");

    buf.extend_from_slice(&addr.ip().octets());
    buf.extend_from_slice(&addr.port().to_le_bytes());
    buf.extend_from_slice(data);
}

/// Decode an address-data frame into the peer address and its payload.
///
/// The payload borrows from `frame`; callers that retain it must copy.
pub fn decode_addr_data(frame: &[u8]) -> Result<(SocketAddrV4, &[u8]), FrameError> {
    if frame.len() < ADDR_DATA_MIN_SIZE {
        return Err(FrameError::TooShort {
            expected: ADDR_DATA_MIN_SIZE,
            actual: frame.len(),
        });
    }

    let ip = Ipv4Addr::new(frame[0], frame[1], frame[2], frame[3]);
    let port = u16::from_le_bytes([frame[4], frame[5]]);
    Ok((SocketAddrV4::new(ip, port), &frame[ADDR_HEADER_SIZE..]))
}

/// Control tags sent by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientTag {
    KeepAlive,
    Disconnect,
}

impl ClientTag {
    pub fn as_byte(self) -> u8 {
        match self {
            Self::KeepAlive => b'k',
            Self::Disconnect => b'd',
        }
    }
}

/// Control tags sent by the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerTag {
    KeepAlive,
    Disconnect,
}

impl ServerTag {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'K' => Some(Self::KeepAlive),
            b'D' => Some(Self::Disconnect),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Self::KeepAlive => b'K',
            Self::Disconnect => b'D',
        }
    }
}

/// Per-session tunnel credential, issued by the relay on admission.
///
/// The client treats the token as opaque: it is written verbatim on the
/// tunnel until the relay answers with a keep-alive, and re-sent later as a
/// liveness probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Token([u8; TOKEN_SIZE]);

impl Token {
    pub fn new(bytes: [u8; TOKEN_SIZE]) -> Self {
        Self(bytes)
    }

    /// Generate a random token (relay side and tests)
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TOKEN_SIZE] {
        &self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

// The relay has emitted both encodings over time: a JSON array of bytes and
// a base64 string. Accept either.
impl<'de> Deserialize<'de> for Token {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Bytes(Vec<u8>),
            Text(String),
        }

        let bytes = match Repr::deserialize(deserializer)? {
            Repr::Bytes(bytes) => bytes,
            Repr::Text(text) => base64::engine::general_purpose::STANDARD
                .decode(text.as_bytes())
                .map_err(|_| D::Error::custom("token is not valid base64"))?,
        };

        let bytes: [u8; TOKEN_SIZE] = bytes
            .try_into()
            .map_err(|_| D::Error::custom(format!("token must be {TOKEN_SIZE} bytes")))?;
        Ok(Self(bytes))
    }
}
