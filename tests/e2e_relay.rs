//! End-to-end relay tests over loopback TCP
//!
//! Topology for every test:
//!
//!   client --plain--> transit ==tunnel==> exit --plain--> echo server
//!
//! Covers:
//! 1. Round trip through both relays, with traffic counted on both sides
//! 2. Large transfers and many concurrent connections
//! 3. Key and cipher-mode mismatches (nothing reaches the destination)
//! 4. Legacy cipher interop and jitter prefixes

use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use stealthwire_core::{CipherMode, TrafficCounter};
use stealthwire_crypto::{RandomJitter, StreamConfig};
use stealthwire_exit::ExitSession;
use stealthwire_relay::TransitSession;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// =============================================================================
// HELPERS
// =============================================================================

struct Chain {
    client_addr: String,
    transit: Arc<TrafficCounter>,
    exit: Arc<TrafficCounter>,
    accepted: mpsc::UnboundedReceiver<()>,
    shutdown: CancellationToken,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Echo server that reports each accepted connection.
async fn start_echo_server() -> (String, mpsc::UnboundedReceiver<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let _ = tx.send(());
            tokio::spawn(async move {
                let (mut r, mut w) = socket.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
                let _ = w.shutdown().await;
            });
        }
    });

    (addr, rx)
}

async fn start_chain(transit_cfg: StreamConfig, exit_cfg: StreamConfig) -> Chain {
    init_tracing();
    let shutdown = CancellationToken::new();
    let (echo_addr, accepted) = start_echo_server().await;

    let exit_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let exit_addr = exit_listener.local_addr().unwrap().to_string();
    let exit_counter = Arc::new(TrafficCounter::new());
    let exit = ExitSession::new(2, exit_addr.clone(), echo_addr, exit_cfg, exit_counter.clone());
    tokio::spawn(exit.serve(exit_listener, shutdown.clone()));

    let transit_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client_addr = transit_listener.local_addr().unwrap().to_string();
    let transit_counter = Arc::new(TrafficCounter::new());
    let transit = TransitSession::new(1, client_addr.clone(), exit_addr, transit_cfg, transit_counter.clone())
        .with_connect_timeout(Duration::from_secs(5));
    tokio::spawn(transit.serve(transit_listener, shutdown.clone()));

    Chain {
        client_addr,
        transit: transit_counter,
        exit: exit_counter,
        accepted,
        shutdown,
    }
}

fn config(secret: &str, mode: CipherMode) -> StreamConfig {
    StreamConfig::new(secret, mode).unwrap()
}

/// Send `payload` and read back the same number of bytes.
async fn echo_round_trip(addr: &str, payload: Vec<u8>) -> Vec<u8> {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut r, mut w) = stream.into_split();
    let len = payload.len();

    let writer = tokio::spawn(async move {
        w.write_all(&payload).await.unwrap();
        w
    });

    let mut received = vec![0u8; len];
    tokio::time::timeout(Duration::from_secs(20), r.read_exact(&mut received))
        .await
        .expect("echo timed out")
        .unwrap();
    drop(writer.await.unwrap());
    received
}

async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

// =============================================================================
// 1. Round trip
// =============================================================================

#[tokio::test]
async fn test_hello_world_through_transit_and_exit() {
    let chain = start_chain(
        config("shared-secret", CipherMode::Directional),
        config("shared-secret", CipherMode::Directional),
    )
    .await;

    let echoed = echo_round_trip(&chain.client_addr, b"hello world".to_vec()).await;
    assert_eq!(echoed, b"hello world");

    let (transit, exit) = (chain.transit.clone(), chain.exit.clone());
    assert!(
        wait_until(|| {
            transit.upload() >= 11
                && transit.download() >= 11
                && exit.upload() >= 11
                && exit.download() >= 11
        })
        .await,
        "transit {}/{} exit {}/{}",
        transit.upload(),
        transit.download(),
        exit.upload(),
        exit.download()
    );

    chain.shutdown.cancel();
}

#[tokio::test]
async fn test_client_close_ends_connection() {
    let chain = start_chain(
        config("close", CipherMode::Directional),
        config("close", CipherMode::Directional),
    )
    .await;

    let mut client = TcpStream::connect(&chain.client_addr).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    // Half-close: the echo server sees EOF and closes, which travels back.
    client.shutdown().await.unwrap();
    let mut rest = Vec::new();
    let n = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);

    chain.shutdown.cancel();
}

// =============================================================================
// 2. Volume
// =============================================================================

#[tokio::test]
async fn test_large_transfer_is_byte_exact() {
    let chain = start_chain(
        config("bulk", CipherMode::Directional),
        config("bulk", CipherMode::Directional),
    )
    .await;

    let mut payload = vec![0u8; 1024 * 1024 + 17];
    rand::thread_rng().fill_bytes(&mut payload);

    let echoed = echo_round_trip(&chain.client_addr, payload.clone()).await;
    assert_eq!(echoed.len(), payload.len());
    assert!(echoed == payload, "payload corrupted in transit");

    let expected = payload.len() as u64;
    let transit = chain.transit.clone();
    assert!(wait_until(|| transit.upload() == expected && transit.download() == expected).await);

    chain.shutdown.cancel();
}

#[tokio::test]
async fn test_concurrent_connections() {
    let chain = start_chain(
        config("fan-out", CipherMode::Directional),
        config("fan-out", CipherMode::Directional),
    )
    .await;

    let mut handles = Vec::new();
    for i in 0..16u8 {
        let addr = chain.client_addr.clone();
        handles.push(tokio::spawn(async move {
            let payload = vec![i; 4096 + i as usize];
            let echoed = echo_round_trip(&addr, payload.clone()).await;
            assert_eq!(echoed, payload);
            payload.len() as u64
        }));
    }

    let mut total = 0;
    for handle in handles {
        total += handle.await.unwrap();
    }

    let exit = chain.exit.clone();
    assert!(wait_until(|| exit.upload() == total && exit.download() == total).await);

    chain.shutdown.cancel();
}

// =============================================================================
// 3. Mismatched keys and modes
// =============================================================================

async fn assert_rejected(mut chain: Chain) {
    let mut client = TcpStream::connect(&chain.client_addr).await.unwrap();
    client.write_all(b"hello world").await.unwrap();

    let mut buf = [0u8; 64];
    let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("rejected connection should close");
    // Closed or reset; no decrypted bytes come back.
    assert!(matches!(read, Ok(0) | Err(_)));

    let dialed = tokio::time::timeout(Duration::from_millis(200), chain.accepted.recv()).await;
    assert!(dialed.is_err(), "destination must not be reached");
    assert_eq!(chain.exit.upload(), 0);
    assert_eq!(chain.exit.download(), 0);
    assert_eq!(chain.transit.download(), 0);

    chain.shutdown.cancel();
}

#[tokio::test]
async fn test_wrong_key_rejected() {
    let chain = start_chain(
        config("client-key", CipherMode::Directional),
        config("server-key", CipherMode::Directional),
    )
    .await;
    assert_rejected(chain).await;
}

#[tokio::test]
async fn test_cipher_mode_mismatch_rejected() {
    let chain = start_chain(
        config("same-key", CipherMode::Legacy),
        config("same-key", CipherMode::Directional),
    )
    .await;
    assert_rejected(chain).await;
}

// =============================================================================
// 4. Legacy mode and jitter
// =============================================================================

#[tokio::test]
async fn test_legacy_mode_end_to_end() {
    let chain = start_chain(
        config("legacy-key", CipherMode::Legacy),
        config("legacy-key", CipherMode::Legacy),
    )
    .await;

    let echoed = echo_round_trip(&chain.client_addr, b"legacy wire format".to_vec()).await;
    assert_eq!(echoed, b"legacy wire format");

    chain.shutdown.cancel();
}

#[tokio::test]
async fn test_jitter_prefix_skipped_by_exit() {
    let transit_cfg =
        config("jitter", CipherMode::Directional).with_jitter(Arc::new(RandomJitter::new(48)));
    let exit_cfg = config("jitter", CipherMode::Directional).with_prefix_skip(48);
    let chain = start_chain(transit_cfg, exit_cfg).await;

    for _ in 0..3 {
        let echoed = echo_round_trip(&chain.client_addr, b"padded".to_vec()).await;
        assert_eq!(echoed, b"padded");
    }

    chain.shutdown.cancel();
}

#[tokio::test]
async fn test_cancel_stops_accepting_but_not_open_connections() {
    let chain = start_chain(
        config("drain", CipherMode::Directional),
        config("drain", CipherMode::Directional),
    )
    .await;

    let mut open = TcpStream::connect(&chain.client_addr).await.unwrap();
    open.write_all(b"before").await.unwrap();
    let mut buf = [0u8; 6];
    open.read_exact(&mut buf).await.unwrap();

    chain.shutdown.cancel();
    let addr = chain.client_addr.clone();
    assert!(
        wait_until(|| std::net::TcpStream::connect(&addr).is_err()).await,
        "listener should be closed"
    );

    // The connection accepted before cancellation still relays.
    open.write_all(b"after!").await.unwrap();
    open.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"after!");
}
