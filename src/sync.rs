//! Sync - wires the KeyManager to the Electrum client
//!
//! ```text
//! KeyManager ──on_new_address──▶ AddressWatcher ──subscribe──▶ ElectrumClient
//!      ▲                              │  ◀──status changed──────────┘
//!      └──────mark_used(history)──────┘
//! ```
//!
//! New branch keys go to an optional [`KeyStore`]; persistence itself lives
//! outside this crate.

use crate::electrum::{ElectrumClient, ElectrumError, ElectrumEvent, ElectrumEvents};
use crate::keys::{KeyManager, KeyManagerEvents, SerializedKeys};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Receives serialized public keys whenever branch keys are computed.
pub trait KeyStore: Send + Sync {
    fn store_keys(&self, keys: &SerializedKeys);
}

pub struct AddressWatcher {
    client: ElectrumClient,
    store: Option<Arc<dyn KeyStore>>,
    manager: OnceLock<Weak<KeyManager>>,
    /// Script hashes with a subscription sent on the current connections
    subscribed: Arc<Mutex<HashSet<String>>>,
}

impl AddressWatcher {
    pub fn new(client: ElectrumClient, store: Option<Arc<dyn KeyStore>>) -> Arc<Self> {
        Arc::new(Self { client, store, manager: OnceLock::new(), subscribed: Arc::default() })
    }

    /// Attach the manager fed by this watcher. Held weakly; the manager owns the watcher.
    pub fn attach(&self, manager: &Arc<KeyManager>) {
        let _ = self.manager.set(Arc::downgrade(manager));
    }

    pub fn client(&self) -> &ElectrumClient { &self.client }

    fn manager(&self) -> Option<Arc<KeyManager>> { self.manager.get().and_then(Weak::upgrade) }

    /// Subscribe every address the manager holds that is not subscribed yet.
    /// Cached addresses never go through `on_new_address`, so this picks them
    /// up after `load()`. Returns the number newly subscribed.
    pub async fn watch_all(&self) -> Result<usize, ElectrumError> {
        let Some(manager) = self.manager() else { return Ok(0) };
        let mut count = 0;
        for branch in manager.branches() {
            let addresses = manager.addresses(branch).await.map_err(|e| ElectrumError::InvalidRequest(e.to_string()))?;
            for address in addresses {
                if !self.claim(&address.script_hash) {
                    continue;
                }
                let status = match self.client.subscribe_to_script_hash(&address.script_hash).await {
                    Ok(status) => status,
                    Err(e) => {
                        self.release(&address.script_hash);
                        return Err(e);
                    }
                };
                if status.is_some() {
                    refresh(&self.client, &manager, &address.script_hash).await;
                }
                count += 1;
            }
        }
        tracing::info!("Watching {} addresses ({} new)", self.watched(), count);
        Ok(count)
    }

    /// Number of addresses currently subscribed.
    pub fn watched(&self) -> usize { self.subscriptions().len() }

    /// Mark a script hash subscribed. False when it already was.
    fn claim(&self, script_hash: &str) -> bool { self.subscriptions().insert(script_hash.to_string()) }

    fn release(&self, script_hash: &str) { self.subscriptions().remove(script_hash); }

    fn subscriptions(&self) -> MutexGuard<'_, HashSet<String>> {
        self.subscribed.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drive this watcher from a channel-based Electrum event stream.
    pub fn forward(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<ElectrumEvent>) -> JoinHandle<()> {
        let watcher = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ElectrumEvent::StatusChanged { key, status } => watcher.on_address_status_changed(&key, status.as_deref()),
                    ElectrumEvent::HeightChanged(height) => watcher.on_block_height_changed(height),
                    ElectrumEvent::Disconnected => watcher.on_disconnect(),
                }
            }
        })
    }

    fn spawn_refresh(&self, script_hash: &str, subscribe: bool) {
        let (Some(manager), Ok(runtime)) = (self.manager(), tokio::runtime::Handle::try_current()) else {
            tracing::debug!("No manager or runtime attached, ignoring {}", script_hash);
            return;
        };
        if subscribe && !self.claim(script_hash) {
            return;
        }
        let subscribed = Arc::clone(&self.subscribed);
        let client = self.client.clone();
        let script_hash = script_hash.to_string();
        runtime.spawn(async move {
            if subscribe {
                match client.subscribe_to_script_hash(&script_hash).await {
                    Ok(None) => return,
                    Ok(Some(_)) => {}
                    Err(e) => {
                        tracing::warn!("Subscribe {} failed: {}", script_hash, e);
                        subscribed.lock().unwrap_or_else(|e| e.into_inner()).remove(&script_hash);
                        return;
                    }
                }
            }
            refresh(&client, &manager, &script_hash).await;
        });
    }
}

/// Fetch history and mark the address used when it has any.
async fn refresh(client: &ElectrumClient, manager: &KeyManager, script_hash: &str) {
    match client.get_script_hash_history(script_hash).await {
        Ok(history) if !history.is_empty() => {
            if let Err(e) = manager.mark_used(script_hash, true).await {
                tracing::warn!("mark_used {} failed: {}", script_hash, e);
            }
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("History for {} failed: {}", script_hash, e),
    }
}

impl KeyManagerEvents for AddressWatcher {
    fn on_new_address(&self, script_hash: &str, address: &str, path: &str) {
        tracing::debug!("New address {} at {}", address, path);
        self.spawn_refresh(script_hash, true);
    }

    fn on_new_key(&self, keys: &SerializedKeys) {
        if let Some(store) = &self.store {
            store.store_keys(keys);
        }
    }
}

impl ElectrumEvents for AddressWatcher {
    fn on_address_status_changed(&self, key: &str, status: Option<&str>) {
        if status.is_some() {
            self.spawn_refresh(key, false);
        }
    }

    fn on_block_height_changed(&self, height: u64) {
        tracing::info!("Block height {}", height);
    }

    fn on_disconnect(&self) {
        self.subscriptions().clear();
        tracing::warn!("Lost every Electrum server; call connect() to retry");
    }
}
