//! Electrum client tests against in-memory servers
//!
//! These tests verify:
//! 1. Round-robin routing and request/response correlation
//! 2. Subscription fan-out to floor(0.8 × other verified) connections
//! 3. Request migration with identical id and payload on connection loss
//! 4. Lagging and stale servers are dropped
//! 5. NoLiveConnections + on_disconnect when every server is gone
//! 6. Notification dispatch with duplicate suppression
//! 7. Keep-alive and handshake timeouts close stuck connections

mod common;

use beesync::electrum::{ConnectionState, ElectrumClient, ElectrumConfig, ElectrumError, ElectrumEvent};
use common::{eventually, wait_for, FakeNetwork, FakeServer};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn client(servers: &[FakeServer], config: ElectrumConfig) -> (ElectrumClient, mpsc::UnboundedReceiver<ElectrumEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let config = ElectrumConfig { endpoints: servers.iter().map(FakeServer::endpoint).collect(), ..config };
    let client = ElectrumClient::new(config, Arc::new(tx), FakeNetwork::new(servers));
    (client, rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<ElectrumEvent>) -> Vec<ElectrumEvent> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

/// Test: calls alternate across verified servers and get their own replies
#[tokio::test]
async fn requests_round_robin() {
    let servers = [FakeServer::new("a", 800_000), FakeServer::new("b", 800_000)];
    let (client, _events) = client(&servers, ElectrumConfig::default());
    client.connect().expect("connect");
    wait_for(&client, |s| s.verified() == 2).await;

    let mut answered_by = HashSet::new();
    for i in 0..4 {
        let tx = client.get_transaction(&format!("{:064x}", i)).await.expect("get_transaction");
        answered_by.insert(tx.split(':').next().unwrap_or_default().to_string());
    }
    assert_eq!(answered_by, HashSet::from(["a".to_string(), "b".to_string()]));
    assert_eq!(servers[0].calls("blockchain.transaction.get").len(), 2);
    assert_eq!(servers[1].calls("blockchain.transaction.get").len(), 2);
}

/// Test: with 3 verified servers a subscription reaches exactly 2
#[tokio::test]
async fn subscription_fans_out() {
    let servers = [FakeServer::new("a", 800_000), FakeServer::new("b", 800_000), FakeServer::new("c", 800_000)];
    let (client, _events) = client(&servers, ElectrumConfig::default());
    client.connect().expect("connect");
    wait_for(&client, |s| s.verified() == 3).await;

    let status = client.subscribe_to_script_hash("ab").await.expect("subscribe");
    assert_eq!(status, None);

    let reached = || servers.iter().filter(|s| !s.calls("blockchain.scripthash.subscribe").is_empty()).count();
    assert!(eventually(|| reached() >= 2).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(reached(), 2);

    // Plain RPCs never fan out
    client.get_script_hash_history("ab").await.expect("history");
    tokio::time::sleep(Duration::from_millis(50)).await;
    let history_calls: usize = servers.iter().map(|s| s.calls("blockchain.scripthash.get_history").len()).sum();
    assert_eq!(history_calls, 1);
}

/// Test: a request in flight on a dropped server is resent verbatim elsewhere
#[tokio::test]
async fn request_migrates_on_connection_loss() {
    let silent = FakeServer::new("a", 800_000).silent();
    let healthy = FakeServer::new("b", 800_000);
    let servers = [silent.clone(), healthy.clone()];
    let (client, _events) = client(&servers, ElectrumConfig::default());
    client.connect().expect("connect");
    wait_for(&client, |s| s.verified() == 2).await;

    // First routed call lands on the first endpoint
    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.get_block_header(42).await })
    };
    assert!(eventually(|| !silent.calls("blockchain.block.header").is_empty()).await);
    silent.kill();

    let header = pending.await.expect("join").expect("migrated request answered");
    assert_eq!(header, "b:blockchain.block.header");

    let original = silent.calls("blockchain.block.header");
    let resent = healthy.calls("blockchain.block.header");
    assert_eq!(original.len(), 1);
    assert_eq!(resent, original);

    let status = wait_for(&client, |s| s.verified() == 1).await;
    assert_eq!(status.connections[0].state, ConnectionState::Closed);
    assert!(status.running);
}

/// Test: an unanswered keep-alive ping closes the connection and its
/// in-flight call moves to the healthy server
#[tokio::test]
async fn unanswered_ping_closes_connection() {
    let stuck = FakeServer::new("a", 800_000).silent().ignoring_pings();
    let healthy = FakeServer::new("b", 800_000);
    let servers = [stuck.clone(), healthy.clone()];
    let config = ElectrumConfig::default().with_keep_alive(Duration::from_millis(100));
    let (client, mut events) = client(&servers, config);
    client.connect().expect("connect");
    wait_for(&client, |s| s.verified() == 2).await;

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.get_transaction("00").await })
    };
    assert!(eventually(|| !stuck.calls("blockchain.transaction.get").is_empty()).await);

    let tx = pending.await.expect("join").expect("migrated call answered");
    assert_eq!(tx, "b:blockchain.transaction.get");
    assert!(!stuck.calls("server.ping").is_empty());
    assert_eq!(healthy.calls("blockchain.transaction.get"), stuck.calls("blockchain.transaction.get"));

    let status = wait_for(&client, |s| s.verified() == 1).await;
    assert_eq!(status.connections[0].state, ConnectionState::Closed);
    assert!(status.connections[1].verified);
    assert!(status.running);
    assert!(!drain(&mut events).contains(&ElectrumEvent::Disconnected));
}

/// Test: a server that never finishes the handshake is dropped by the sweep,
/// failing calls queued behind it
#[tokio::test]
async fn handshake_timeout_closes_connection() {
    let server = FakeServer::new("slow", 800_000).stalling_handshake();
    let config = ElectrumConfig::default()
        .with_handshake_timeout(Duration::from_millis(100))
        .with_sweep_interval(Duration::from_millis(50));
    let (client, mut events) = client(&[server.clone()], config);
    client.connect().expect("connect");

    assert_eq!(client.get_transaction("00").await, Err(ElectrumError::NoLiveConnections));
    assert!(eventually(|| drain(&mut events).contains(&ElectrumEvent::Disconnected)).await);
    assert_eq!(server.calls("server.version").len(), 1);
    assert_eq!(server.calls("blockchain.headers.subscribe").len(), 1);
    assert!(server.calls("blockchain.transaction.get").is_empty());

    let status = client.status().await.expect("status");
    assert!(!status.running);
    assert_eq!(status.connections[0].state, ConnectionState::Closed);
}

/// Test: zero keep-alive and sweep intervals disable those timers
#[tokio::test]
async fn zero_intervals_disable_timers() {
    let server = FakeServer::new("a", 800_000).ignoring_pings();
    let config = ElectrumConfig::default().with_keep_alive(Duration::ZERO).with_sweep_interval(Duration::ZERO);
    let (client, _events) = client(&[server.clone()], config);
    client.connect().expect("connect");
    wait_for(&client, |s| s.verified() == 1).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.get_transaction("00").await.expect("tx"), "a:blockchain.transaction.get");
    assert!(server.calls("server.ping").is_empty());
    assert_eq!(client.status().await.expect("status").verified(), 1);
}

/// Test: a server more than 50 blocks behind the best tip is dropped
#[tokio::test]
async fn lagging_server_excluded() {
    let servers = [FakeServer::new("tip", 800_000), FakeServer::new("stale", 799_900)];
    let (client, mut events) = client(&servers, ElectrumConfig::default());
    client.connect().expect("connect");

    let status = wait_for(&client, |s| s.verified() == 1 && s.connections[1].state == ConnectionState::Closed).await;
    assert!(status.connections[0].verified);
    assert_eq!(status.height, 800_000);

    // Every call goes to the remaining server
    for _ in 0..3 {
        assert_eq!(client.get_transaction("00").await.expect("tx"), "tip:blockchain.transaction.get");
    }
    assert!(drain(&mut events).contains(&ElectrumEvent::HeightChanged(800_000)));
}

/// Test: a new best height re-checks already verified servers
#[tokio::test]
async fn new_tip_drops_verified_laggard() {
    let servers = [FakeServer::new("a", 800_000), FakeServer::new("b", 800_000)];
    let (client, _events) = client(&servers, ElectrumConfig::default());
    client.connect().expect("connect");
    wait_for(&client, |s| s.verified() == 2).await;

    servers[1].notify("blockchain.headers.subscribe", json!([{ "height": 800_051, "hex": "00" }]));
    let status = wait_for(&client, |s| s.verified() == 1).await;
    assert_eq!(status.height, 800_051);
    assert_eq!(status.connections[0].state, ConnectionState::Closed);
    assert!(status.connections[1].verified);
}

/// Test: servers below the configured last known height never verify
#[tokio::test]
async fn stale_server_below_last_known_height() {
    let servers = [FakeServer::new("old", 700_000)];
    let (client, mut events) = client(&servers, ElectrumConfig::default().with_last_known_height(800_000));
    client.connect().expect("connect");

    let result = client.get_transaction("00").await;
    assert_eq!(result, Err(ElectrumError::NoLiveConnections));
    assert!(eventually(|| drain(&mut events).contains(&ElectrumEvent::Disconnected)).await);
}

/// Test: losing the last server fails in-flight calls and fires on_disconnect
#[tokio::test]
async fn no_live_connections_and_disconnect() {
    let server = FakeServer::new("only", 800_000).silent();
    let (client, mut events) = client(&[server.clone()], ElectrumConfig::default());
    client.connect().expect("connect");
    wait_for(&client, |s| s.verified() == 1).await;

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.get_transaction("00").await })
    };
    assert!(eventually(|| !server.calls("blockchain.transaction.get").is_empty()).await);
    server.kill();

    assert_eq!(pending.await.expect("join"), Err(ElectrumError::NoLiveConnections));
    assert!(eventually(|| drain(&mut events).contains(&ElectrumEvent::Disconnected)).await);

    let status = client.status().await.expect("status");
    assert!(!status.running);
    assert_eq!(client.get_transaction("00").await, Err(ElectrumError::NoLiveConnections));
}

/// Test: unreachable servers end in NoLiveConnections
#[tokio::test]
async fn all_servers_refuse() {
    let servers = [FakeServer::new("a", 1).refusing(), FakeServer::new("b", 1).refusing()];
    let (client, mut events) = client(&servers, ElectrumConfig::default());
    client.connect().expect("connect");

    assert_eq!(client.get_estimate_fee(6).await, Err(ElectrumError::NoLiveConnections));
    assert!(eventually(|| drain(&mut events).contains(&ElectrumEvent::Disconnected)).await);
}

/// Test: calls made before any server verified are queued, then answered
#[tokio::test]
async fn requests_queue_until_verified() {
    let servers = [FakeServer::new("a", 800_000)];
    let (client, _events) = client(&servers, ElectrumConfig::default());

    assert_eq!(client.get_transaction("00").await, Err(ElectrumError::NoLiveConnections));

    client.connect().expect("connect");
    let fee = client.get_estimate_fee(6).await.expect("queued call answered");
    assert!((fee - 0.0002).abs() < 1e-12);
}

/// Test: notifications dispatch by topic; repeated statuses are suppressed
#[tokio::test]
async fn notifications_dispatch_and_dedupe() {
    let servers = [FakeServer::new("a", 800_000), FakeServer::new("b", 800_000)];
    let (client, mut events) = client(&servers, ElectrumConfig::default());
    client.connect().expect("connect");
    wait_for(&client, |s| s.verified() == 2).await;
    client.subscribe_to_script_hash("ab").await.expect("subscribe");

    let mut seen = Vec::new();
    servers[0].notify("blockchain.scripthash.subscribe", json!(["ab", "s1"]));
    assert!(eventually(|| {
        seen.extend(drain(&mut events));
        seen.iter().any(|e| matches!(e, ElectrumEvent::StatusChanged { .. }))
    })
    .await);

    // Same status from the redundant server, then a real change
    servers[1].notify("blockchain.scripthash.subscribe", json!(["ab", "s1"]));
    servers[1].notify("blockchain.scripthash.subscribe", json!(["ab", "s2"]));
    servers[0].notify("blockchain.headers.subscribe", json!([{ "height": 800_001, "hex": "00" }]));
    assert!(eventually(|| {
        seen.extend(drain(&mut events));
        seen.contains(&ElectrumEvent::HeightChanged(800_001))
            && seen.iter().filter(|e| matches!(e, ElectrumEvent::StatusChanged { .. })).count() >= 2
    })
    .await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    seen.extend(drain(&mut events));

    let statuses: Vec<_> = seen.iter().filter(|e| matches!(e, ElectrumEvent::StatusChanged { .. })).cloned().collect();
    assert_eq!(
        statuses,
        vec![
            ElectrumEvent::StatusChanged { key: "ab".into(), status: Some("s1".into()) },
            ElectrumEvent::StatusChanged { key: "ab".into(), status: Some("s2".into()) },
        ]
    );
}

/// Test: JSON error envelopes become structured server errors
#[tokio::test]
async fn server_error_envelope() {
    let servers = [FakeServer::new("a", 800_000)];
    let (client, _events) = client(&servers, ElectrumConfig::default());
    client.connect().expect("connect");

    let err = client.broadcast_transaction("0100").await.unwrap_err();
    assert_eq!(err, ElectrumError::Server { code: Some(1), message: "bad-txns-inputs-missingorspent".into() });
}

/// Test: close() fails pending work with Shutdown and stops the pool
#[tokio::test]
async fn close_shuts_down() {
    let server = FakeServer::new("a", 800_000).silent();
    let (client, _events) = client(&[server.clone()], ElectrumConfig::default());
    client.connect().expect("connect");
    wait_for(&client, |s| s.verified() == 1).await;

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.get_transaction("00").await })
    };
    assert!(eventually(|| !server.calls("blockchain.transaction.get").is_empty()).await);
    client.close().expect("close");

    assert_eq!(pending.await.expect("join"), Err(ElectrumError::Shutdown));
    let status = client.status().await.expect("status");
    assert!(!status.running);
    assert_eq!(status.verified(), 0);
}
