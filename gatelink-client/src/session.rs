//! Session supervisor.
//!
//! One session is: resolve addresses, obtain `(port, token)` from the
//! admission API, dial the relay, handshake, then supervise the tunnel
//! reader, tunnel writer, and master proxy until the first failure or an
//! external stop. The supervisor owns the session-scoped cancellation
//! token; the first non-ignorable child error becomes the session's cause
//! and cancels everything else. An external stop instead enters a graceful
//! disconnect exchange with the relay before teardown.
//!
//! `Client::run` wraps sessions in a bounded reconnect loop: only sessions
//! that stayed healthy for a while after becoming ready re-arm the retry
//! budget; everything that fails before `ready` is surfaced immediately.

use crate::admission::AdmissionClient;
use crate::config::ClientConfig;
use crate::error::{ignore_cancelled, ClientError};
use crate::master;
use crate::registry::{PeerAddr, Registry, DATA_CHANNEL_SIZE};
use crate::tunnel;
use gatelink_core::proto::ClientTag;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// How long a session must stay up past `ready` to count as healthy
const READY_GRACE: Duration = Duration::from_secs(10);

/// Reconnect attempts before giving up
const MAX_RETRY_ATTEMPTS: u32 = 5;

/// Disconnect handshake: retries and per-retry wait
const DISCONNECT_RETRIES: usize = 10;
const DISCONNECT_WAIT: Duration = Duration::from_millis(100);

/// The proxy client. Create once, `run()` until stopped.
pub struct Client {
    cfg: ClientConfig,
    stop: CancellationToken,
    ready_tx: watch::Sender<Option<String>>,
}

impl Client {
    pub fn new(cfg: ClientConfig) -> Self {
        let (ready_tx, _) = watch::channel(None);
        Self {
            cfg,
            stop: CancellationToken::new(),
            ready_tx,
        }
    }

    /// Handle for requesting a graceful stop from another task
    pub fn stop_handle(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Wait up to `wait` for the public address of the current session,
    /// `"{relay_ip}:{port}"`. Settles once per session and is republished
    /// after every automatic reconnect.
    pub async fn proxy_addr(&self, wait: Duration) -> Option<String> {
        let mut ready = self.ready_tx.subscribe();
        tokio::time::timeout(wait, async move {
            loop {
                let current = ready.borrow_and_update().clone();
                if current.is_some() {
                    return current;
                }
                if ready.changed().await.is_err() {
                    return None;
                }
            }
        })
        .await
        .ok()
        .flatten()
    }

    /// Run sessions until stopped, reconnecting with exponential backoff
    /// after failures of a previously healthy session.
    pub async fn run(&self) -> Result<(), ClientError> {
        let mut attempt: u32 = 0;

        loop {
            if self.stop.is_cancelled() {
                return Ok(());
            }

            let mut ready_at = None;
            let result = ignore_cancelled(self.run_session(&mut ready_at).await);
            self.ready_tx.send_replace(None);

            let err = match result {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            if self.stop.is_cancelled() {
                // A stop was requested; surface what the teardown left us.
                return Err(err);
            }

            let Some(ready_at) = ready_at else {
                // Never became ready: nothing to transparently recover.
                return Err(err);
            };

            if ready_at.elapsed() >= READY_GRACE {
                attempt = 1;
            } else {
                attempt += 1;
            }
            if attempt > MAX_RETRY_ATTEMPTS {
                warn!("giving up after {MAX_RETRY_ATTEMPTS} reconnect attempts");
                return Err(err);
            }

            let delay = backoff_delay(attempt);
            info!("session failed ({err}), reconnecting in {delay:?} (attempt {attempt})");
            tokio::select! {
                _ = self.stop.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_session(&self, ready_at: &mut Option<Instant>) -> Result<(), ClientError> {
        let cfg = &self.cfg;

        // RESOLVE
        let server_url = reqwest::Url::parse(&cfg.server_url)
            .map_err(|err| ClientError::InvalidServer(format!("bad server URL: {err}")))?;
        let server_host = server_url
            .host_str()
            .ok_or_else(|| ClientError::InvalidServer("server URL has no host".to_string()))?
            .to_string();

        info!("resolving master server address {}", cfg.master_addr);
        let master_addr = resolve_ipv4(&cfg.master_addr).await?;

        info!("resolving relay address {server_host}");
        let relay_ip = *resolve_ipv4(&format!("{server_host}:0")).await?.ip();

        // ADMIT
        info!("connecting to {}", cfg.server_url);
        let admission = AdmissionClient::new(&cfg.server_url, cfg.user_key)?;
        let (port, token) = admission.connect().await?;
        info!("connection established, public port {port}");

        // DIAL
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.connect(SocketAddrV4::new(relay_ip, port)).await?;

        // HANDSHAKE
        info!("sending token to {relay_ip}:{port}");
        tunnel::send_token(&socket, &token, &self.stop).await?;
        info!("token accepted");

        // RUNNING
        *ready_at = Some(Instant::now());
        self.ready_tx
            .send_replace(Some(format!("{relay_ip}:{port}")));

        let session = CancellationToken::new();
        let failure: Arc<Mutex<Option<ClientError>>> = Arc::new(Mutex::new(None));
        let (outbound_tx, outbound_rx) = mpsc::channel(DATA_CHANNEL_SIZE);
        let registry = Registry::new(outbound_tx.clone(), session.clone());

        // Pre-create the master peer: it takes the first synthetic slot,
        // so its worker binds 127.0.0.1:28004.
        registry.get_or_create(PeerAddr::from(master_addr), true);

        let socket = Arc::new(socket);
        let children = TaskTracker::new();

        supervise(
            &children,
            &session,
            &failure,
            "tunnel reader",
            tunnel::run_reader(
                Arc::clone(&socket),
                token,
                Arc::clone(&registry),
                outbound_tx.clone(),
                session.clone(),
            ),
        );
        supervise(
            &children,
            &session,
            &failure,
            "tunnel writer",
            tunnel::run_writer(Arc::clone(&socket), outbound_rx, session.clone()),
        );
        supervise(
            &children,
            &session,
            &failure,
            "master proxy",
            master::run_master_tcp_proxy(cfg.master_addr.clone(), session.clone()),
        );
        children.close();

        let result = tokio::select! {
            _ = self.stop.cancelled() => {
                info!("stop requested, disconnecting");
                self.disconnect(&outbound_tx, &session).await
            }
            _ = session.cancelled() => {
                let cause = failure.lock().unwrap().take();
                match cause {
                    Some(err) => Err(err),
                    None => Ok(()),
                }
            }
        };

        // Teardown: every child and worker must join before the session
        // reports done.
        session.cancel();
        children.wait().await;
        registry.join_workers().await;

        result
    }

    /// Graceful disconnect: enqueue `'d'` until the reader sees the
    /// relay's `'D'` echo and ends the session.
    async fn disconnect(
        &self,
        outbound: &mpsc::Sender<Vec<u8>>,
        session: &CancellationToken,
    ) -> Result<(), ClientError> {
        for _ in 0..DISCONNECT_RETRIES {
            if outbound
                .send(vec![ClientTag::Disconnect.as_byte()])
                .await
                .is_err()
            {
                // Writer is gone; nothing left to say goodbye to.
                return Ok(());
            }

            tokio::select! {
                _ = session.cancelled() => {
                    info!("disconnected from relay");
                    return Ok(());
                }
                _ = tokio::time::sleep(DISCONNECT_WAIT) => {}
            }
        }

        Err(ClientError::FailedToDisconnect)
    }
}

/// Spawn a supervised session task: its first non-ignorable error becomes
/// the session cause, and its exit (for any reason) ends the session.
fn supervise<F>(
    children: &TaskTracker,
    session: &CancellationToken,
    failure: &Arc<Mutex<Option<ClientError>>>,
    name: &'static str,
    task: F,
) where
    F: Future<Output = Result<(), ClientError>> + Send + 'static,
{
    let session = session.clone();
    let failure = Arc::clone(failure);
    children.spawn(async move {
        match task.await {
            Ok(()) => info!("{name}: stopped"),
            Err(err) if err.is_cancellation() => debug!("{name}: stopped on cancel"),
            Err(err) => {
                warn!("{name}: {err}");
                if !session.is_cancelled() {
                    if let Ok(mut slot) = failure.lock() {
                        slot.get_or_insert(err);
                    }
                }
            }
        }
        session.cancel();
    });
}

fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt)
}

async fn resolve_ipv4(addr: &str) -> Result<SocketAddrV4, ClientError> {
    let mut resolved = lookup_host(addr)
        .await
        .map_err(|err| ClientError::Network(format!("failed to resolve {addr}: {err}")))?;

    resolved
        .find_map(|candidate| match candidate {
            SocketAddr::V4(v4) => Some(v4),
            SocketAddr::V6(_) => None,
        })
        .ok_or_else(|| ClientError::Network(format!("{addr} has no IPv4 address")))
}
