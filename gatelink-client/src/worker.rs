//! Peer worker: one local UDP socket standing in for one remote peer.
//!
//! The worker binds a socket on the peer's synthetic loopback IP so the
//! game sees every remote peer as a distinct source address. Two legs run
//! concurrently: relay-to-game (drain the inbound channel into the fixed
//! game endpoint) and game-to-relay (read the local socket, frame, and
//! enqueue on the shared outbound queue). Either leg exiting stops the
//! other; both must finish before the worker reports done and removes
//! itself from the registry.

use crate::error::ClientError;
use crate::registry::PeerAddr;
use gatelink_core::proto::{encode_addr_data, ADDR_HEADER_SIZE, MAX_DATAGRAM_SIZE};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// The local game server every worker bridges to
pub const GAME_ADDR: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 8888);

/// Fixed local port of the master-flavored worker
pub const MASTER_LOCAL_PORT: u16 = 28004;

/// Deadline for the bind step only
const BIND_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause after a non-fatal read error on the master socket
const MASTER_READ_ERROR_PAUSE: Duration = Duration::from_millis(100);

pub struct Worker<'a> {
    pub remote_addr: PeerAddr,
    pub local_ip: Ipv4Addr,
    pub is_master: bool,
    pub inbound: &'a mut mpsc::Receiver<Vec<u8>>,
    pub outbound: mpsc::Sender<Vec<u8>>,
    pub cancel: CancellationToken,
    /// Per-read idle deadline; `None` for the long-lived master worker
    pub idle_timeout: Option<Duration>,
}

pub async fn run(worker: Worker<'_>) -> Result<(), ClientError> {
    let port = if worker.is_master { MASTER_LOCAL_PORT } else { 0 };
    let bind_addr = SocketAddrV4::new(worker.local_ip, port);

    let socket = timeout(BIND_TIMEOUT, UdpSocket::bind(bind_addr))
        .await
        .map_err(|_| ClientError::Network(format!("worker: bind to {bind_addr} timed out")))??;

    info!(
        "worker: listening on {} for peer {} (master: {})",
        socket.local_addr()?,
        worker.remote_addr,
        worker.is_master
    );

    // Each leg cancels the shared token on exit so the other leg follows.
    let legs = worker.cancel.child_token();

    let to_game = {
        let legs = legs.clone();
        let inbound = worker.inbound;
        let socket = &socket;
        async move {
            run_to_game(socket, inbound, &legs).await;
            legs.cancel();
        }
    };

    let from_game = {
        let legs = legs.clone();
        let socket = &socket;
        async move {
            let result = run_from_game(
                socket,
                worker.remote_addr,
                worker.is_master,
                worker.idle_timeout,
                &worker.outbound,
                &legs,
            )
            .await;
            legs.cancel();
            result
        }
    };

    let ((), result) = tokio::join!(to_game, from_game);
    result
}

/// Relay-to-game leg: drain queued payloads into the game endpoint
async fn run_to_game(
    socket: &UdpSocket,
    inbound: &mut mpsc::Receiver<Vec<u8>>,
    cancel: &CancellationToken,
) {
    loop {
        let data = tokio::select! {
            _ = cancel.cancelled() => return,
            data = inbound.recv() => match data {
                Some(data) => data,
                None => return,
            },
        };

        if let Err(err) = socket.send_to(&data, GAME_ADDR).await {
            // Transient: the game may not be up yet.
            warn!("worker: failed to write to game: {err}");
        }
    }
}

/// Game-to-relay leg: read local datagrams, frame them for the tunnel
async fn run_from_game(
    socket: &UdpSocket,
    remote_addr: PeerAddr,
    is_master: bool,
    idle_timeout: Option<Duration>,
    outbound: &mpsc::Sender<Vec<u8>>,
    cancel: &CancellationToken,
) -> Result<(), ClientError> {
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            received = read_datagram(socket, idle_timeout, &mut buf) => received,
        };

        let (n, src) = match received {
            Ok(pair) => pair,
            Err(ReadOutcome::IdleTimeout) => {
                info!("worker: timed out waiting for game traffic, exiting ({remote_addr})");
                return Ok(());
            }
            Err(ReadOutcome::Io(err)) => {
                if is_master {
                    // The master socket is a long-lived multiplexed channel;
                    // absorb read errors instead of tearing it down.
                    warn!("worker: master read error: {err}");
                    tokio::time::sleep(MASTER_READ_ERROR_PAUSE).await;
                    continue;
                }
                warn!("worker: failed to read: {err}");
                return Ok(());
            }
        };

        if src != SocketAddr::V4(GAME_ADDR) {
            warn!("worker: packet from unexpected addr: {src}");
            continue;
        }
        if n == 0 {
            // Empty datagrams are not representable on the tunnel.
            continue;
        }

        let mut frame = Vec::with_capacity(ADDR_HEADER_SIZE + n);
        encode_addr_data(&mut frame, remote_addr.to_socket_addr(), &buf[..n]);

        match outbound.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                // A full queue must never stall the worker; drop instead.
                warn!("worker: outbound queue is full, dropping datagram");
            }
            Err(TrySendError::Closed(_)) => return Ok(()),
        }
    }
}

enum ReadOutcome {
    IdleTimeout,
    Io(std::io::Error),
}

async fn read_datagram(
    socket: &UdpSocket,
    idle_timeout: Option<Duration>,
    buf: &mut [u8],
) -> Result<(usize, SocketAddr), ReadOutcome> {
    let received = match idle_timeout {
        Some(deadline) => timeout(deadline, socket.recv_from(buf))
            .await
            .map_err(|_| ReadOutcome::IdleTimeout)?,
        None => socket.recv_from(buf).await,
    };
    received.map_err(ReadOutcome::Io)
}
