//! Core library for the gatelink reverse UDP proxy.
//!
//! This library holds everything shared between the proxy client and tools
//! that speak to the relay:
//!
//! - `proto`: tunnel wire format (address-data frames, control tags) and
//!   the per-session token
//! - `key`: user access keys (base32-rendered bearer credentials)
//! - `api`: data model for the relay's HTTP admission API
//!
//! The library is pure data and codec code; all sockets and task
//! orchestration live in the client crate.

pub mod api;
pub mod key;
pub mod proto;

pub use key::UserKey;
pub use proto::Token;
