//! Client error kinds.
//!
//! The variants here are the distinctions the rest of the client (and the
//! front-end) actually acts on; everything else is wrapped into `Io` or
//! `Network`. Cancellation is modeled as an error so it can flow out of any
//! task, and is filtered back to a clean exit at the session boundary.

use gatelink_core::api::ConnectionCode;
use gatelink_core::key::KeyError;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    InvalidKey(#[from] KeyError),

    #[error("access key was not accepted")]
    Unauthorized,

    #[error("server is down for maintenance")]
    Maintenance,

    #[error("server refused the connection: {0}")]
    Refused(ConnectionCode),

    #[error("unexpected server response: {0}")]
    InvalidServer(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("server stopped responding")]
    ServerUnresponsive,

    #[error("failed to disconnect from the relay")]
    FailedToDisconnect,

    #[error("cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ClientError {
    /// Cancellation and closed-socket conditions are a clean shutdown, not
    /// a failure; they must never masquerade as a session error.
    pub fn is_cancellation(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::NotConnected | io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}

/// Normalize a task result at the session boundary
pub fn ignore_cancelled(result: Result<(), ClientError>) -> Result<(), ClientError> {
    match result {
        Err(err) if err.is_cancellation() => Ok(()),
        other => other,
    }
}
