//! Worker registry: one peer worker per remote address.
//!
//! The registry owns the only shared mutable state in the client: the map
//! from remote peer address to that peer's inbound channel, and the
//! synthetic loopback IP allocator. The mutex is held only around map
//! lookups and inserts, never across I/O. Worker tasks re-acquire it once,
//! at teardown, to delete their own entry; the entry is removed before the
//! inbound channel closes, so the tunnel reader only ever sees a live
//! channel or an absent entry.

use crate::worker;
use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Capacity of each worker's inbound channel and of the shared outbound
/// queue
pub const DATA_CHANNEL_SIZE: usize = 1000;

/// Idle read deadline after which a non-master worker evicts itself
pub const WORKER_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Value-typed registry key for a remote peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddr {
    ip: Ipv4Addr,
    port: u16,
}

impl PeerAddr {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn to_socket_addr(self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip, self.port)
    }
}

impl From<SocketAddrV4> for PeerAddr {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(*addr.ip(), addr.port())
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Advance a loopback address by one, big-endian
fn next_ip(ip: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip).wrapping_add(1))
}

struct Inner {
    peers: HashMap<PeerAddr, mpsc::Sender<Vec<u8>>>,
    local_ips: HashMap<Ipv4Addr, Ipv4Addr>,
    next_local_ip: Ipv4Addr,
}

pub struct Registry {
    inner: Mutex<Inner>,
    outbound: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
    workers: TaskTracker,
    idle_timeout: Duration,
}

impl Registry {
    pub fn new(outbound: mpsc::Sender<Vec<u8>>, cancel: CancellationToken) -> Arc<Self> {
        Self::with_idle_timeout(outbound, cancel, WORKER_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(
        outbound: mpsc::Sender<Vec<u8>>,
        cancel: CancellationToken,
        idle_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                peers: HashMap::new(),
                local_ips: HashMap::new(),
                next_local_ip: Ipv4Addr::new(127, 0, 0, 1),
            }),
            outbound,
            cancel,
            workers: TaskTracker::new(),
            idle_timeout,
        })
    }

    /// Look up the inbound channel for `addr`, spawning a fresh worker if
    /// the peer is new. The same address always yields the same channel
    /// until its worker exits.
    pub fn get_or_create(self: &Arc<Self>, addr: PeerAddr, is_master: bool) -> mpsc::Sender<Vec<u8>> {
        let (sender, receiver, local_ip) = {
            let mut inner = self.inner.lock().unwrap();

            if let Some(sender) = inner.peers.get(&addr) {
                return sender.clone();
            }

            let local_ip = match inner.local_ips.get(&addr.ip()) {
                Some(ip) => *ip,
                None => {
                    let ip = inner.next_local_ip;
                    inner.next_local_ip = next_ip(ip);
                    inner.local_ips.insert(addr.ip(), ip);
                    ip
                }
            };

            let (sender, receiver) = mpsc::channel(DATA_CHANNEL_SIZE);
            inner.peers.insert(addr, sender.clone());
            (sender, receiver, local_ip)
        };

        info!("creating worker for {addr} on {local_ip}");

        let registry = Arc::clone(self);
        self.workers.spawn(async move {
            let mut inbound = receiver;
            let result = worker::run(worker::Worker {
                remote_addr: addr,
                local_ip,
                is_master,
                inbound: &mut inbound,
                outbound: registry.outbound.clone(),
                cancel: registry.cancel.clone(),
                idle_timeout: (!is_master).then_some(registry.idle_timeout),
            })
            .await;

            if let Err(err) = result {
                warn!("worker for {addr} failed: {err}");
            }

            // Delete the entry first, then let the channel close on drop.
            registry.remove(addr);
            drop(inbound);
        });

        sender
    }

    fn remove(&self, addr: PeerAddr) {
        let mut inner = self.inner.lock().unwrap();
        inner.peers.remove(&addr);
        debug!("worker for {addr} removed from registry");
    }

    /// Forget all peers so the next session starts fresh. Running workers
    /// are not touched here; they drain via the session's cancellation.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.peers.clear();
    }

    /// The synthetic local IP assigned to a remote IP, if any
    pub fn local_ip_for(&self, remote_ip: Ipv4Addr) -> Option<Ipv4Addr> {
        self.inner.lock().unwrap().local_ips.get(&remote_ip).copied()
    }

    pub fn contains(&self, addr: PeerAddr) -> bool {
        self.inner.lock().unwrap().peers.contains_key(&addr)
    }

    /// Wait for every spawned worker to finish. Call after cancelling the
    /// session token.
    pub async fn join_workers(&self) {
        self.workers.close();
        self.workers.wait().await;
    }
}
