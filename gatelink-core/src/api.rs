//! Data model for the relay's HTTP admission API.

use crate::proto::Token;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tunnel protocol version, sent as the `proto` query parameter
pub const PROTOCOL_VERSION: &str = "1.0";

/// Result codes returned in `ConnectionResponse::error_code`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionCode(pub u8);

impl ConnectionCode {
    pub const OK: Self = Self(0);
    pub const ALREADY_CONNECTED: Self = Self(1);
    pub const SERVER_FULL: Self = Self(2);
    pub const INTERNAL_ERROR: Self = Self(3);
    pub const VERSION_MISMATCH: Self = Self(4);

    pub fn message(self) -> &'static str {
        match self {
            Self::OK => "ok",
            Self::ALREADY_CONNECTED => "already connected",
            Self::SERVER_FULL => "server full",
            Self::INTERNAL_ERROR => "internal error",
            Self::VERSION_MISMATCH => "version mismatch",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ConnectionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Body of a `POST /api/connect` response.
///
/// A successful admission carries `token` and `port`; a refusal carries
/// `error_code` and/or `error_message`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<Token>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ConnectionCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Body of a `GET /api/user` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: i64,
    pub email: String,
    pub port: u16,
    pub creation_time: String,
    pub last_used_time: String,
}
