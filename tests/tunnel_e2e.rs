//! End-to-end tunnel tests: a client multiplexer and a server relay
//! connected over real TCP links, relaying to real targets.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;

use moto::transport::{TcpDialer, TunnelDialer};
use moto::tunnel::{Adaptation, AdaptationConfig, LossRule, TunnelClient, TunnelServer};

fn adaptation() -> Arc<Adaptation> {
    Adaptation::new(
        AdaptationConfig {
            enabled: true,
            window_seconds: 1,
            probe_interval_ms: 100,
            rules: vec![
                LossRule {
                    loss_below: 1.0,
                    dup: 1,
                    frame_size: Some(32768),
                },
                LossRule {
                    loss_below: 101.0,
                    dup: 2,
                    frame_size: Some(8192),
                },
            ],
        },
        32768,
    )
}

/// Spin up a relay listening on an ephemeral port and a client with
/// `links` tunnel links dialed into it.
async fn tunnel_pair(links: usize) -> (Arc<TunnelClient>, Arc<TunnelServer>) {
    let server = TunnelServer::new(adaptation());
    let tunnel_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tunnel_addr = tunnel_listener.local_addr().unwrap().to_string();

    let accept_server = Arc::clone(&server);
    tokio::spawn(async move {
        loop {
            let Ok((stream, peer)) = tunnel_listener.accept().await else {
                break;
            };
            stream.set_nodelay(true).ok();
            let (reader, writer) = stream.into_split();
            accept_server.add_link(moto::transport::LinkIo {
                reader: Box::new(reader),
                writer: Box::new(writer),
                peer: peer.to_string(),
            });
        }
    });

    let client = TunnelClient::new(adaptation());
    let dialer = TcpDialer;
    for _ in 0..links {
        let io = dialer.dial(&tunnel_addr).await.unwrap();
        client.attach_link(io);
    }

    // Give the server a beat to register the accepted links.
    tokio::time::sleep(Duration::from_millis(50)).await;
    (client, server)
}

/// An echo target that answers every accepted connection.
async fn echo_target() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

#[tokio::test]
async fn test_echo_through_tunnel() {
    let (client, _server) = tunnel_pair(1).await;
    let target = echo_target().await;

    let mut stream = client.open(&target).await.unwrap();
    stream.write(b"hello through the overlay").await.unwrap();

    let chunk = timeout(Duration::from_secs(5), stream.read_chunk())
        .await
        .expect("echo within deadline")
        .expect("stream open");
    assert_eq!(&chunk[..], b"hello through the overlay");

    stream.close().await;
}

#[tokio::test]
async fn test_bulk_transfer_over_two_links() {
    let (client, _server) = tunnel_pair(2).await;
    let target = echo_target().await;

    let mut stream = client.open(&target).await.unwrap();

    // Multiple frame sizes worth of data; every byte must come back in
    // order even when frames fan out across both links.
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    stream.write(&payload).await.unwrap();

    let mut echoed = Vec::with_capacity(payload.len());
    while echoed.len() < payload.len() {
        let chunk = timeout(Duration::from_secs(10), stream.read_chunk())
            .await
            .expect("echo within deadline")
            .expect("stream open");
        echoed.extend_from_slice(&chunk);
    }
    assert_eq!(echoed, payload);

    stream.close().await;
}

#[tokio::test]
async fn test_sequential_streams_are_independent() {
    let (client, _server) = tunnel_pair(2).await;
    let target = echo_target().await;

    for round in 0..3u8 {
        let mut stream = client.open(&target).await.unwrap();
        let msg = vec![round; 1024];
        stream.write(&msg).await.unwrap();

        let mut echoed = Vec::new();
        while echoed.len() < msg.len() {
            let chunk = timeout(Duration::from_secs(5), stream.read_chunk())
                .await
                .expect("echo within deadline")
                .expect("stream open");
            echoed.extend_from_slice(&chunk);
        }
        assert_eq!(echoed, msg);
        stream.close().await;
    }
}

#[tokio::test]
async fn test_dial_failure_resets_stream() {
    let (client, _server) = tunnel_pair(1).await;

    // Nothing listens on port 1; the server responds with RST and the
    // client observes end-of-stream.
    let mut stream = client.open("127.0.0.1:1").await.unwrap();
    let eof = timeout(Duration::from_secs(5), stream.read_chunk())
        .await
        .expect("rst within deadline");
    assert!(eof.is_none());
}

#[tokio::test]
async fn test_server_drops_state_on_fin() {
    let (client, server) = tunnel_pair(1).await;
    let target = echo_target().await;

    let mut stream = client.open(&target).await.unwrap();
    stream.write(b"ping").await.unwrap();
    let _ = timeout(Duration::from_secs(5), stream.read_chunk())
        .await
        .expect("echo within deadline");
    assert_eq!(server.active_streams(), 1);

    stream.close().await;
    // FIN propagation is asynchronous.
    let mut tries = 0;
    while server.active_streams() != 0 && tries < 100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        tries += 1;
    }
    assert_eq!(server.active_streams(), 0);
}
