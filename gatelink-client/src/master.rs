//! Master-server TCP proxy.
//!
//! The game is redirected to 127.0.0.1:28004 for its lobby traffic; this
//! listener forwards each TCP connection to the real master server so
//! announcements originate from a reachable address. The game's master
//! exchange is a short handshake, so each bridge is bounded at a few
//! seconds rather than kept open.

use crate::error::ClientError;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Local bind the client owns for master-server traffic
pub const MASTER_PROXY_ADDR: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 28004);

/// Bound on one bridging session, measured from accept
const BRIDGE_TIMEOUT: Duration = Duration::from_secs(3);

/// Accept loop for the local master proxy port
pub async fn run_master_tcp_proxy(
    master_addr: String,
    cancel: CancellationToken,
) -> Result<(), ClientError> {
    let listener = TcpListener::bind(MASTER_PROXY_ADDR).await?;
    info!("master proxy: listening on {MASTER_PROXY_ADDR}");

    loop {
        let (client, peer) = tokio::select! {
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            accepted = listener.accept() => accepted?,
        };

        info!("master proxy: accepted connection from {peer}");

        let master_addr = master_addr.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                bridged = timeout(BRIDGE_TIMEOUT, bridge(client, &master_addr)) => match bridged {
                    Ok(Ok(())) => debug!("master proxy: bridge for {peer} finished"),
                    Ok(Err(err)) => warn!("master proxy: bridge for {peer} failed: {err}"),
                    Err(_) => debug!("master proxy: bridge for {peer} timed out"),
                },
            }
        });
    }
}

/// Copy bytes both ways, half-closing each direction on EOF so end-of-
/// stream propagates to the other side.
async fn bridge(client: TcpStream, master_addr: &str) -> std::io::Result<()> {
    let master = TcpStream::connect(master_addr).await?;

    let (mut client_read, mut client_write) = client.into_split();
    let (mut master_read, mut master_write) = master.into_split();

    let upstream = async {
        let result = tokio::io::copy(&mut client_read, &mut master_write).await;
        let _ = master_write.shutdown().await;
        result
    };
    let downstream = async {
        let result = tokio::io::copy(&mut master_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        result
    };

    let (up, down) = tokio::join!(upstream, downstream);
    up.and(down).map(|_| ())
}
