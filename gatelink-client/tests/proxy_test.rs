//! End-to-end tests against stub relay, game, and master servers.
//!
//! Everything runs on loopback with real sockets. The game stub owns
//! 127.0.0.1:8888 and the proxy owns 127.0.0.1:28004, so the session test
//! holds both fixed ports; keep any new tests that need them inside it.

use anyhow::Result;
use gatelink_client::admission::AdmissionClient;
use gatelink_client::config::ClientConfig;
use gatelink_client::error::ClientError;
use gatelink_client::registry::{PeerAddr, Registry, DATA_CHANNEL_SIZE};
use gatelink_client::session::Client;
use gatelink_core::proto::{decode_addr_data, encode_addr_data, Token, ADDR_DATA_MIN_SIZE};
use gatelink_core::UserKey;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const TOKEN_BYTES: [u8; 6] = [10, 20, 30, 40, 50, 60];

/// Serve exactly one HTTP request with a canned response, then close.
async fn serve_http_once(listener: TcpListener, status: &'static str, body: String) {
    let (mut conn, _) = listener.accept().await.expect("http accept failed");
    let mut buf = [0u8; 2048];
    let _ = conn.read(&mut buf).await.expect("http read failed");

    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    conn.write_all(response.as_bytes())
        .await
        .expect("http write failed");
}

/// Receive tunnel datagrams until one is an address-data frame, skipping
/// keep-alives and re-sent tokens.
async fn recv_frame(relay: &UdpSocket) -> (SocketAddrV4, Vec<u8>) {
    let mut buf = [0u8; 2048];
    loop {
        let (n, _) = relay.recv_from(&mut buf).await.expect("relay recv failed");
        if n >= ADDR_DATA_MIN_SIZE {
            let (addr, payload) = decode_addr_data(&buf[..n]).expect("bad frame");
            return (addr, payload.to_vec());
        }
    }
}

#[tokio::test]
async fn test_full_session() -> Result<()> {
    // Stub game server on the fixed port the proxy bridges to.
    let game = UdpSocket::bind((Ipv4Addr::LOCALHOST, 8888)).await?;

    // Stub master server (TCP side).
    let master_listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let master_port = master_listener.local_addr()?.port();
    let master_task = tokio::spawn(async move {
        let (mut conn, _) = master_listener.accept().await.expect("master accept failed");
        let mut buf = [0u8; 64];
        let n = conn.read(&mut buf).await.expect("master read failed");
        assert_eq!(&buf[..n], b"ping");
        conn.write_all(b"pong").await.expect("master write failed");
    });

    // Stub relay: UDP tunnel endpoint plus a one-shot admission API.
    let relay = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let relay_port = relay.local_addr()?.port();

    let http_listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let http_port = http_listener.local_addr()?.port();
    let body = format!(
        "{{ \"token\": [10, 20, 30, 40, 50, 60], \"port\": {relay_port} }}"
    );
    tokio::spawn(serve_http_once(http_listener, "200 OK", body));

    let client = Arc::new(Client::new(ClientConfig {
        master_addr: format!("127.0.0.1:{master_port}"),
        server_url: format!("http://127.0.0.1:{http_port}"),
        user_key: UserKey::generate(),
    }));
    let stop = client.stop_handle();

    let run_handle = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.run().await })
    };

    // Handshake: expect the raw token, answer with a keep-alive.
    let mut buf = [0u8; 2048];
    let (n, tunnel_addr) = timeout(Duration::from_secs(5), relay.recv_from(&mut buf)).await??;
    assert_eq!(&buf[..n], &TOKEN_BYTES);
    relay.send_to(b"K", tunnel_addr).await?;

    // The public address is published once the token is accepted.
    let addr = client.proxy_addr(Duration::from_secs(5)).await;
    assert_eq!(addr, Some(format!("127.0.0.1:{relay_port}")));

    // Inject a frame from a remote peer; it must reach the game from the
    // peer's synthetic source address (the master holds 127.0.0.1, so the
    // first external peer gets 127.0.0.2).
    let peer = SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 5), 51000);
    let mut frame = Vec::new();
    encode_addr_data(&mut frame, peer, b"hello");
    relay.send_to(&frame, tunnel_addr).await?;

    let mut game_buf = [0u8; 2048];
    let (n, worker_addr) = timeout(Duration::from_secs(5), game.recv_from(&mut game_buf)).await??;
    assert_eq!(&game_buf[..n], b"hello");
    assert_eq!(worker_addr.ip(), IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2)));

    // The game's reply travels back keyed on the same peer.
    game.send_to(b"world", worker_addr).await?;
    let (frame_addr, payload) = timeout(Duration::from_secs(5), recv_frame(&relay)).await?;
    assert_eq!(frame_addr, peer);
    assert_eq!(payload, b"world");

    // Master UDP path: traffic the game sends to 127.0.0.1:28004 comes out
    // of the tunnel keyed on the real master's address.
    game.send_to(b"lobby", (Ipv4Addr::LOCALHOST, 28004)).await?;
    let (frame_addr, payload) = timeout(Duration::from_secs(5), recv_frame(&relay)).await?;
    assert_eq!(
        frame_addr,
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, master_port)
    );
    assert_eq!(payload, b"lobby");

    // Master TCP path: 127.0.0.1:28004 bridges to the real master.
    let mut lobby_conn = TcpStream::connect((Ipv4Addr::LOCALHOST, 28004)).await?;
    lobby_conn.write_all(b"ping").await?;
    let mut reply = [0u8; 64];
    let n = timeout(Duration::from_secs(5), lobby_conn.read(&mut reply)).await??;
    assert_eq!(&reply[..n], b"pong");
    drop(lobby_conn);
    master_task.await.expect("master task panicked");

    // Graceful stop: the client sends 'd' until the relay echoes 'D'.
    stop.cancel();
    let disconnect_requested = loop {
        let (n, _) = timeout(Duration::from_secs(5), relay.recv_from(&mut buf)).await??;
        if n == 1 && buf[0] == b'd' {
            break Instant::now();
        }
    };
    relay.send_to(b"D", tunnel_addr).await?;

    let result = timeout(Duration::from_secs(5), run_handle).await??;
    assert!(result.is_ok(), "run failed: {:?}", result);
    assert!(disconnect_requested.elapsed() <= Duration::from_millis(500));

    Ok(())
}

#[tokio::test]
async fn test_admission_success() -> Result<()> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(serve_http_once(
        listener,
        "200 OK",
        "{ \"token\": [1, 2, 3, 4, 5, 6], \"port\": 54321 }".to_string(),
    ));

    let admission = AdmissionClient::new(&format!("http://127.0.0.1:{port}"), UserKey::generate())?;
    let (udp_port, token) = admission.connect().await?;

    assert_eq!(udp_port, 54321);
    assert_eq!(token, Token::new([1, 2, 3, 4, 5, 6]));
    Ok(())
}

#[tokio::test]
async fn test_admission_unauthorized() -> Result<()> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(serve_http_once(listener, "401 Unauthorized", String::new()));

    let admission = AdmissionClient::new(&format!("http://127.0.0.1:{port}"), UserKey::generate())?;
    let result = admission.connect().await;

    assert!(matches!(result, Err(ClientError::Unauthorized)));
    Ok(())
}

#[tokio::test]
async fn test_admission_maintenance() -> Result<()> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(serve_http_once(
        listener,
        "503 Service Unavailable",
        String::new(),
    ));

    let admission = AdmissionClient::new(&format!("http://127.0.0.1:{port}"), UserKey::generate())?;
    let result = admission.connect().await;

    assert!(matches!(result, Err(ClientError::Maintenance)));
    Ok(())
}

#[tokio::test]
async fn test_admission_server_full() -> Result<()> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(serve_http_once(
        listener,
        "200 OK",
        "{ \"error_code\": 2 }".to_string(),
    ));

    let admission = AdmissionClient::new(&format!("http://127.0.0.1:{port}"), UserKey::generate())?;
    let result = admission.connect().await;

    match result {
        Err(err) => assert!(err.to_string().contains("server full")),
        Ok(_) => panic!("admission should have been refused"),
    }
    Ok(())
}

#[tokio::test]
async fn test_admission_invalid_response() -> Result<()> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(serve_http_once(listener, "200 OK", "{}".to_string()));

    let admission = AdmissionClient::new(&format!("http://127.0.0.1:{port}"), UserKey::generate())?;
    let result = admission.connect().await;

    assert!(matches!(result, Err(ClientError::InvalidServer(_))));
    Ok(())
}

#[tokio::test]
async fn test_idle_worker_eviction_and_reentry() {
    let (outbound_tx, _outbound_rx) = mpsc::channel(DATA_CHANNEL_SIZE);
    let cancel = CancellationToken::new();
    let registry =
        Registry::with_idle_timeout(outbound_tx, cancel.clone(), Duration::from_millis(200));

    let peer = PeerAddr::new(Ipv4Addr::new(198, 51, 100, 33), 7000);
    let first = registry.get_or_create(peer, false);
    assert!(registry.contains(peer));

    // No game traffic: the worker must evict itself and vacate its entry.
    let evicted = timeout(Duration::from_secs(5), async {
        while registry.contains(peer) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(evicted.is_ok(), "idle worker did not exit");

    // Re-entry spawns a fresh worker with the same synthetic IP.
    let second = registry.get_or_create(peer, false);
    assert!(!second.same_channel(&first));
    assert_eq!(
        registry.local_ip_for(peer.ip()),
        Some(Ipv4Addr::new(127, 0, 0, 1))
    );

    cancel.cancel();
    registry.join_workers().await;
}

#[tokio::test]
async fn test_reader_probes_then_declares_relay_dead() -> Result<()> {
    // A silent relay: the reader re-sends the token on each 10 s read
    // timeout and fails the tunnel once the silence passes 30 s.
    let tunnel = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let relay = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    tunnel.connect(relay.local_addr()?).await?;

    let (outbound_tx, mut outbound_rx) = mpsc::channel(DATA_CHANNEL_SIZE);
    let cancel = CancellationToken::new();
    let registry = Registry::new(outbound_tx.clone(), cancel.clone());
    let token = Token::new(TOKEN_BYTES);

    let reader = tokio::spawn(gatelink_client::tunnel::run_reader(
        Arc::new(tunnel),
        token,
        registry,
        outbound_tx,
        cancel.clone(),
    ));

    // First probe lands on the outbound queue after the first timeout.
    let probe = timeout(Duration::from_secs(15), outbound_rx.recv())
        .await
        .expect("no token probe before the dead-relay threshold")
        .expect("outbound queue closed");
    assert_eq!(probe, TOKEN_BYTES.to_vec());

    let result = timeout(Duration::from_secs(45), reader).await??;
    assert!(matches!(result, Err(ClientError::ServerUnresponsive)));

    Ok(())
}
