//! Client half of the gatelink reverse UDP proxy.
//!
//! A host behind NAT publishes a local game server (UDP 127.0.0.1:8888) on
//! a relay's public UDP port. The client obtains a port and session token
//! from the relay's HTTP admission API, authenticates a single UDP tunnel
//! with the token, and then bridges every remote peer to the game through
//! a per-peer local socket on a synthetic loopback address. The game's
//! master-server traffic is redirected to 127.0.0.1:28004 and carried over
//! the same relay.

pub mod admission;
pub mod cli;
pub mod config;
pub mod error;
pub mod master;
pub mod registry;
pub mod session;
pub mod tunnel;
pub mod worker;
