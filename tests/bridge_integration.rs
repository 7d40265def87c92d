//! Full-stack tests against a real loopback WebSocket "gateway" (a
//! `tokio-tungstenite::accept_async` server on an ephemeral port) standing
//! in for the Cumulocity remote-access cloud. Exercises byte fidelity,
//! shutdown propagation, and idle timeout end to end through
//! `Acceptor`/`BridgeSession`, not just the unit-level pieces.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use c8ylp::acceptor::Acceptor;
use c8ylp::bridge::BridgeOutcome;
use c8ylp::descriptor::{AcceptorMode, BridgeParams, LocalEndpoint, TunnelDescriptor};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;

/// Starts a loopback gateway that echoes every binary frame it receives
/// back verbatim, and returns a descriptor pointing at it.
async fn spawn_echo_gateway() -> (TunnelDescriptor, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Binary(data) => {
                        if ws.send(Message::Binary(data)).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => {
                        let _ = ws.send(Message::Close(None)).await;
                        break;
                    }
                    _ => {}
                }
            }
        }
    });

    let descriptor = TunnelDescriptor::new(
        format!("http://{addr}"),
        "t1",
        "dev1",
        "cfg1",
        "tok",
        true,
    );
    (descriptor, handle)
}

#[tokio::test]
async fn bridge_preserves_byte_fidelity_and_ordering() {
    let (descriptor, gateway) = spawn_echo_gateway().await;
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let endpoint = LocalEndpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
    let acceptor = Acceptor::bind(
        endpoint,
        AcceptorMode::OneShot,
        1,
        descriptor,
        BridgeParams::default(),
        shutdown_rx,
    )
    .await
    .unwrap();
    let bound = acceptor.local_addr();

    let accept_handle = tokio::spawn(acceptor.run());

    let mut client = TcpStream::connect(bound).await.unwrap();
    let chunks: &[&[u8]] = &[b"first-chunk", b"second-chunk", b"third-chunk-is-longer-than-the-others"];

    let mut expected = Vec::new();
    for chunk in chunks {
        client.write_all(chunk).await.unwrap();
        expected.extend_from_slice(chunk);
    }
    client.shutdown().await.unwrap();

    let mut received = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut received)).await;

    assert_eq!(received, expected);

    let outcomes = accept_handle.await.unwrap().unwrap();
    assert!(!outcomes.is_empty());
    gateway.abort();
}

#[tokio::test]
async fn acceptor_reports_shutdown_outcome_when_cancelled_before_connection() {
    let (descriptor, gateway) = spawn_echo_gateway().await;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let endpoint = LocalEndpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
    let acceptor = Acceptor::bind(
        endpoint,
        AcceptorMode::Persistent,
        1,
        descriptor,
        BridgeParams::default(),
        shutdown_rx,
    )
    .await
    .unwrap();

    let accept_handle = tokio::spawn(acceptor.run());
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown_tx.send(true).unwrap();

    let outcomes = tokio::time::timeout(Duration::from_secs(5), accept_handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(outcomes.is_empty());
    gateway.abort();
}

#[tokio::test]
async fn bridge_ends_with_idle_timeout_when_no_bytes_cross() {
    let (descriptor, gateway) = spawn_echo_gateway().await;
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let endpoint = LocalEndpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
    let params = BridgeParams::new(4096, 1, 0);
    let acceptor = Acceptor::bind(endpoint, AcceptorMode::OneShot, 1, descriptor, params, shutdown_rx)
        .await
        .unwrap();
    let bound = acceptor.local_addr();

    let accept_handle = tokio::spawn(acceptor.run());
    let _client = TcpStream::connect(bound).await.unwrap();

    let outcomes = tokio::time::timeout(Duration::from_secs(5), accept_handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(outcomes, vec![BridgeOutcome::IdleTimeout]);
    gateway.abort();
}
