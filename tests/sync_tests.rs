//! KeyManager ↔ Electrum sync tests
//!
//! These tests verify:
//! 1. New addresses are subscribed and marked used when they have history
//! 2. Status notifications trigger a history refresh and extend the ring
//! 3. Branch keys reach the KeyStore
//! 4. watch_all subscribes only addresses not already subscribed

mod common;

use beesync::electrum::{ElectrumClient, ElectrumConfig};
use beesync::keys::{AddressInfo, Branch, KeyManager, KeyManagerConfig, NoopKeyEvents, SerializedKeys, WalletFormat};
use beesync::sync::{AddressWatcher, KeyStore};
use beesync::{ElectrumEvents, NetworkParams, Secp256k1Backend};
use common::{wait_for, FakeNetwork, FakeServer, TEST_MNEMONIC};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Default)]
struct MemoryStore {
    saved: Mutex<Vec<SerializedKeys>>,
}

impl KeyStore for MemoryStore {
    fn store_keys(&self, keys: &SerializedKeys) {
        self.saved.lock().unwrap().push(keys.clone());
    }
}

fn config() -> KeyManagerConfig {
    KeyManagerConfig::new(NetworkParams::bitcoin()).with_format(WalletFormat::Bip84).with_mnemonic(TEST_MNEMONIC)
}

/// Script hashes of receive/0 and change/0 for the test mnemonic.
async fn first_script_hashes() -> (String, String) {
    let manager = KeyManager::new(config(), Arc::new(NoopKeyEvents), Arc::new(Secp256k1Backend::new())).expect("manager");
    manager.load().await.expect("load");
    let receive = manager.get_receive_address().await.expect("receive");
    let change = manager.get_change_address().await.expect("change");
    (receive.script_hash, change.script_hash)
}

struct Harness {
    client: ElectrumClient,
    watcher: Arc<AddressWatcher>,
    manager: Arc<KeyManager>,
}

async fn harness(server: &FakeServer, store: Option<Arc<dyn KeyStore>>) -> Harness {
    harness_with(server, store, config()).await
}

async fn harness_with(server: &FakeServer, store: Option<Arc<dyn KeyStore>>, config: KeyManagerConfig) -> Harness {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let electrum = ElectrumConfig::new(vec![server.endpoint()]);
    let client = ElectrumClient::new(electrum, Arc::new(events_tx), FakeNetwork::new(&[server.clone()]));
    let watcher = AddressWatcher::new(client.clone(), store);
    watcher.forward(events_rx);

    let manager = KeyManager::new(config, watcher.clone(), Arc::new(Secp256k1Backend::new())).expect("manager");
    watcher.attach(&manager);
    client.connect().expect("connect");
    wait_for(&client, |s| s.verified() == 1).await;
    Harness { client, watcher, manager }
}

async fn ring_reaches(manager: &KeyManager, branch: Branch, len: usize) -> bool {
    for _ in 0..200 {
        if manager.addresses(branch).await.expect("addresses").len() >= len {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Test: an address with history on the server is marked used after load
#[tokio::test]
async fn new_address_with_history_marked_used() {
    let (receive_hash, _) = first_script_hashes().await;
    let server = FakeServer::new("a", 800_000);
    server.statuses.lock().unwrap().insert(receive_hash.clone(), "deadbeef".into());
    server.histories.lock().unwrap().insert(receive_hash.clone(), json!([{ "tx_hash": "11".repeat(32), "height": 799_990 }]));

    let h = harness(&server, None).await;
    h.manager.load().await.expect("load");

    assert!(ring_reaches(&h.manager, Branch::Receive, 11).await);
    assert!(h.manager.address_info(&receive_hash).expect("info").used);
    assert_eq!(h.manager.get_receive_address().await.expect("next").index, 1);
    assert_eq!(h.manager.addresses(Branch::Change).await.expect("change").len(), 10);

    // Every derived address was subscribed once
    assert!(common::eventually(|| server.calls("blockchain.scripthash.subscribe").len() >= 21).await);
    assert_eq!(server.calls("blockchain.scripthash.get_history").len(), 1);
}

/// Test: a status notification for a known address refreshes its history
#[tokio::test]
async fn status_notification_refreshes_history() {
    let (_, change_hash) = first_script_hashes().await;
    let server = FakeServer::new("a", 800_000);
    let h = harness(&server, None).await;
    h.manager.load().await.expect("load");
    assert!(common::eventually(|| server.calls("blockchain.scripthash.subscribe").len() >= 20).await);
    assert!(server.calls("blockchain.scripthash.get_history").is_empty());

    server.histories.lock().unwrap().insert(change_hash.clone(), json!([{ "tx_hash": "22".repeat(32), "height": 0 }]));
    server.notify("blockchain.scripthash.subscribe", json!([change_hash, "cafe"]));

    assert!(ring_reaches(&h.manager, Branch::Change, 11).await);
    assert!(h.manager.address_info(&change_hash).expect("info").used);
    assert_eq!(h.manager.get_change_address().await.expect("change").index, 1);
}

/// Test: branch keys are handed to the store as they are computed
#[tokio::test]
async fn branch_keys_reach_store() {
    let server = FakeServer::new("a", 800_000);
    let store = Arc::new(MemoryStore::default());
    let h = harness(&server, Some(store.clone() as Arc<dyn KeyStore>)).await;
    h.manager.load().await.expect("load");

    let saved = store.saved.lock().unwrap().clone();
    assert_eq!(saved.len(), 2);
    let last = saved.last().expect("keys");
    assert_eq!(last.network, "bitcoin");
    assert_eq!(last.format, WalletFormat::Bip84);
    assert!(last.master.as_deref().is_some_and(|k| k.starts_with("zpub")));
    assert_eq!(last.branches.keys().copied().collect::<Vec<_>>(), vec![Branch::Receive, Branch::Change]);
}

/// Test: after load every derived address is already subscribed, so watch_all
/// sends nothing twice
#[tokio::test]
async fn watch_all_skips_subscribed_addresses() {
    let server = FakeServer::new("a", 800_000);
    let h = harness(&server, None).await;
    h.manager.load().await.expect("load");

    assert_eq!(h.watcher.watch_all().await.expect("watch_all"), 0);
    assert_eq!(h.watcher.watched(), 20);
    assert!(common::eventually(|| server.calls("blockchain.scripthash.subscribe").len() >= 20).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.calls("blockchain.scripthash.subscribe").len(), 20);
}

/// Test: watch_all picks up cached addresses, and forgets every subscription
/// after a disconnect
#[tokio::test]
async fn watch_all_subscribes_cached_addresses() {
    let (receive_hash, _) = first_script_hashes().await;
    let server = FakeServer::new("a", 800_000);
    let cached = AddressInfo { path: "m/0/0".into(), display_address: "cached".into(), used: false };
    let h = harness_with(&server, None, config().with_address_info(receive_hash.clone(), cached)).await;
    h.manager.load().await.expect("load");

    assert_eq!(h.watcher.watch_all().await.expect("watch_all"), 1);
    assert_eq!(h.watcher.watched(), 20);
    assert!(common::eventually(|| server.calls("blockchain.scripthash.subscribe").len() >= 20).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let calls = server.calls("blockchain.scripthash.subscribe");
    assert_eq!(calls.len(), 20);
    assert_eq!(calls.iter().filter(|c| c["params"][0] == receive_hash.as_str()).count(), 1);

    h.client.close().expect("close");
    h.watcher.on_disconnect();
    assert_eq!(h.watcher.watched(), 0);
    assert!(h.watcher.watch_all().await.is_err());
    assert_eq!(h.watcher.watched(), 0);
}
