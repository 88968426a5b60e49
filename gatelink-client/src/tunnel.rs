//! The tunnel: one connected UDP socket to the relay.
//!
//! Exactly one task reads the socket and exactly one task writes it. The
//! writer drains the shared outbound queue and fills silence with
//! keep-alives; the reader demultiplexes relay traffic onto per-peer
//! workers and tracks relay liveness. Control bytes and data frames share
//! the socket and are told apart by length alone (see
//! `gatelink_core::proto`).

use crate::error::ClientError;
use crate::registry::{PeerAddr, Registry};
use gatelink_core::proto::{
    decode_addr_data, ClientTag, ServerTag, Token, ADDR_DATA_MIN_SIZE, MAX_DATAGRAM_SIZE,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{interval_at, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-read deadline on the tunnel socket
const TUNNEL_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Silence longer than this means the relay is gone
const SERVER_SILENCE_LIMIT: Duration = Duration::from_secs(30);

/// Keep-alive cadence in the absence of outbound traffic
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(3);

/// Overall budget for the token handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Cadence of token writes during the handshake
const HANDSHAKE_PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Authenticate the tunnel: write the token until the relay answers with a
/// keep-alive byte.
///
/// The relay drops token datagrams it has not yet associated, so the write
/// is repeated every 100 ms until the `'K'` ack arrives or the 5 s budget
/// runs out.
pub async fn send_token(
    socket: &UdpSocket,
    token: &Token,
    cancel: &CancellationToken,
) -> Result<(), ClientError> {
    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];

    loop {
        if Instant::now() >= deadline {
            return Err(ClientError::Network("handshake timed out".to_string()));
        }

        socket.send(token.as_bytes()).await?;

        let received = tokio::select! {
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            received = timeout(HANDSHAKE_PROBE_INTERVAL, socket.recv(&mut buf)) => received,
        };

        match received {
            Ok(Ok(n)) if n > 0 && buf[0] == ServerTag::KeepAlive.as_byte() => return Ok(()),
            Ok(Ok(_)) => {}
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => {} // no reply yet, write again
        }
    }
}

/// Tunnel reader: demultiplex relay traffic onto per-peer workers.
///
/// Returns `Ok` on a clean relay-initiated disconnect, `ServerUnresponsive`
/// after 30 s of silence, and clears the registry on the way out so the
/// next session starts fresh.
pub async fn run_reader(
    socket: Arc<UdpSocket>,
    token: Token,
    registry: Arc<Registry>,
    outbound: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
) -> Result<(), ClientError> {
    let result = reader_loop(&socket, &token, &registry, &outbound, &cancel).await;
    registry.clear();
    result
}

async fn reader_loop(
    socket: &UdpSocket,
    token: &Token,
    registry: &Arc<Registry>,
    outbound: &mpsc::Sender<Vec<u8>>,
    cancel: &CancellationToken,
) -> Result<(), ClientError> {
    let mut last_success = Instant::now();
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            received = timeout(TUNNEL_READ_TIMEOUT, socket.recv(&mut buf)) => received,
        };

        let n = match received {
            Ok(Ok(n)) => n,
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => {
                if last_success.elapsed() > SERVER_SILENCE_LIMIT {
                    warn!("tunnel: server stopped responding");
                    return Err(ClientError::ServerUnresponsive);
                }

                debug!("tunnel: read timeout, re-sending token");
                // Blocking send; can only stick if the writer exited,
                // which ends the session anyway.
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                    sent = outbound.send(token.as_bytes().to_vec()) => {
                        if sent.is_err() {
                            return Err(ClientError::Cancelled);
                        }
                    }
                }
                continue;
            }
        };

        last_success = Instant::now();

        if n == 0 {
            // Empty datagrams carry nothing representable.
            continue;
        }

        if n >= ADDR_DATA_MIN_SIZE {
            let (addr, payload) = match decode_addr_data(&buf[..n]) {
                Ok(decoded) => decoded,
                Err(err) => {
                    warn!("tunnel: undecodable frame: {err}");
                    continue;
                }
            };

            let peer = PeerAddr::from(addr);
            let channel = registry.get_or_create(peer, false);
            match channel.try_send(payload.to_vec()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("tunnel: worker channel for {peer} is full, dropping");
                }
                Err(TrySendError::Closed(_)) => {
                    // The worker is between exit and registry removal; the
                    // peer's next frame will spawn a fresh one.
                    debug!("tunnel: worker channel for {peer} is closed");
                }
            }
        } else {
            match ServerTag::from_byte(buf[0]) {
                Some(ServerTag::KeepAlive) => debug!("tunnel: keep-alive from relay"),
                Some(ServerTag::Disconnect) => {
                    info!("tunnel: relay acknowledged disconnect");
                    return Ok(());
                }
                None => warn!("tunnel: unexpected control byte {:#04x}", buf[0]),
            }
        }
    }
}

/// Tunnel writer: drain the outbound queue, fill silence with keep-alives.
///
/// Any item sent on the queue pushes the next keep-alive a full interval
/// out. A write error is fatal for the session.
pub async fn run_writer(
    socket: Arc<UdpSocket>,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) -> Result<(), ClientError> {
    let mut ticker = interval_at(
        tokio::time::Instant::now() + KEEP_ALIVE_INTERVAL,
        KEEP_ALIVE_INTERVAL,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let data = tokio::select! {
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            item = outbound.recv() => match item {
                Some(data) => {
                    ticker.reset();
                    data
                }
                None => return Ok(()),
            },
            _ = ticker.tick() => vec![ClientTag::KeepAlive.as_byte()],
        };

        socket.send(&data).await?;
    }
}
