//! KeyManager - aggregate root over the master key and per-branch rings
//!
//! # Gap-fill
//!
//! ```text
//! U = highest used index (or -1)
//! while last_derived - U < gap_limit:
//!     index = last_derived + 1
//!     cached address_info for m/<branch>/<index>?  → reuse, no callback
//!     else derive → script → display address + script hash
//!          → on_new_address(script_hash, address, path)
//!     append
//! ```
//!
//! Fills are serialized per branch by the ring's async mutex. The caches
//! (`address_infos`, `tx_infos`, serialized branch keys) sit behind std
//! locks that are never held across an await point.

use super::address::Address;
use super::events::KeyManagerEvents;
use super::extended::ExtendedKey;
use super::format::{Branch, WalletFormat};
use super::path::AddressPath;
use super::ring::KeyRing;
use super::{KeyError, DEFAULT_GAP_LIMIT};
use crate::crypto::{CurveBackend, HARDENED};
use crate::network::NetworkParams;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use zeroize::Zeroizing;

/// Imported extended-key texts for one node (master or branch).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchKeys {
    #[serde(default)]
    pub private: Option<String>,
    #[serde(default)]
    pub public: Option<String>,
}

impl BranchKeys {
    pub fn is_empty(&self) -> bool { self.private.is_none() && self.public.is_none() }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawKeys {
    #[serde(default)]
    pub master: BranchKeys,
    #[serde(default)]
    pub branches: BTreeMap<Branch, BranchKeys>,
}

/// Cached knowledge about one address, keyed by script hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressInfo {
    /// `m/<branch>/<index>` relative to the master key
    pub path: String,
    pub display_address: String,
    #[serde(default)]
    pub used: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub script_hash: String,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInfo {
    pub txid: String,
    /// Indexed by output position
    pub outputs: Vec<TxOutput>,
}

/// One input to sign: the output it spends and the sighash digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendInput {
    pub prev_txid: String,
    pub prev_index: u32,
    pub sighash: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSignature {
    /// DER-encoded ECDSA signature (no sighash type byte)
    pub signature: Vec<u8>,
    pub public_key: [u8; 33],
    pub path: String,
}

/// Public key texts handed to `on_new_key` for persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedKeys {
    pub network: String,
    pub format: WalletFormat,
    pub master: Option<String>,
    pub branches: BTreeMap<Branch, String>,
}

/// KeyManager configuration. Higher layers construct this.
#[derive(Clone)]
pub struct KeyManagerConfig {
    pub network: NetworkParams,
    pub format: WalletFormat,
    pub gap_limit: u32,
    pub seed: Option<Zeroizing<Vec<u8>>>,
    pub mnemonic: Option<Zeroizing<String>>,
    pub raw_keys: RawKeys,
    pub address_infos: HashMap<String, AddressInfo>,
    pub tx_infos: Vec<TxInfo>,
}

impl Default for KeyManagerConfig {
    fn default() -> Self { Self::new(NetworkParams::bitcoin()) }
}

impl KeyManagerConfig {
    pub fn new(network: NetworkParams) -> Self {
        Self {
            network,
            format: WalletFormat::default(),
            gap_limit: DEFAULT_GAP_LIMIT,
            seed: None,
            mnemonic: None,
            raw_keys: RawKeys::default(),
            address_infos: HashMap::new(),
            tx_infos: Vec::new(),
        }
    }
    pub fn with_format(mut self, format: WalletFormat) -> Self { self.format = format; self }
    pub fn with_wallet_type(mut self, wallet_type: &str) -> Result<Self, KeyError> {
        self.format = WalletFormat::from_wallet_type(wallet_type)?;
        Ok(self)
    }
    /// Clamped to at least 1 so every ring has an address to hand out.
    pub fn with_gap_limit(mut self, gap_limit: u32) -> Self { self.gap_limit = gap_limit.max(1); self }
    pub fn with_seed(mut self, seed: Vec<u8>) -> Self { self.seed = Some(Zeroizing::new(seed)); self }
    pub fn with_mnemonic(mut self, words: impl Into<String>) -> Self { self.mnemonic = Some(Zeroizing::new(words.into())); self }
    pub fn with_raw_keys(mut self, keys: RawKeys) -> Self { self.raw_keys = keys; self }
    pub fn with_master_private(mut self, text: impl Into<String>) -> Self { self.raw_keys.master.private = Some(text.into()); self }
    pub fn with_master_public(mut self, text: impl Into<String>) -> Self { self.raw_keys.master.public = Some(text.into()); self }
    pub fn with_branch_keys(mut self, branch: Branch, keys: BranchKeys) -> Self { self.raw_keys.branches.insert(branch, keys); self }
    pub fn with_address_info(mut self, script_hash: impl Into<String>, info: AddressInfo) -> Self {
        self.address_infos.insert(script_hash.into(), info);
        self
    }
    pub fn with_tx_info(mut self, info: TxInfo) -> Self { self.tx_infos.push(info); self }
}

impl fmt::Debug for KeyManagerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyManagerConfig")
            .field("network", &self.network.name)
            .field("format", &self.format)
            .field("gap_limit", &self.gap_limit)
            .field("seed", &self.seed.as_ref().map(|_| "<redacted>"))
            .field("mnemonic", &self.mnemonic.as_ref().map(|_| "<redacted>"))
            .field("address_infos", &self.address_infos.len())
            .field("tx_infos", &self.tx_infos.len())
            .finish()
    }
}

pub struct KeyManager {
    network: NetworkParams,
    format: WalletFormat,
    gap_limit: u32,
    backend: Arc<dyn CurveBackend>,
    events: Arc<dyn KeyManagerEvents>,
    seed: Option<Zeroizing<Vec<u8>>>,
    raw_keys: RawKeys,
    master: Mutex<Option<ExtendedKey>>,
    rings: BTreeMap<Branch, tokio::sync::Mutex<KeyRing>>,
    branch_keys: RwLock<BTreeMap<Branch, String>>,
    address_infos: RwLock<HashMap<String, AddressInfo>>,
    tx_infos: RwLock<HashMap<String, TxInfo>>,
}

impl KeyManager {
    pub fn new(
        config: KeyManagerConfig,
        events: Arc<dyn KeyManagerEvents>,
        backend: Arc<dyn CurveBackend>,
    ) -> Result<Arc<Self>, KeyError> {
        let KeyManagerConfig { network, format, gap_limit, seed, mnemonic, raw_keys, address_infos, tx_infos } = config;
        format.check_network(&network)?;

        let seed = match (seed, mnemonic) {
            (Some(seed), _) => Some(seed),
            (None, Some(words)) => {
                let mnemonic = bip39::Mnemonic::parse(words.as_str()).map_err(|e| KeyError::InvalidMnemonic(e.to_string()))?;
                Some(Zeroizing::new(mnemonic.to_seed("").to_vec()))
            }
            (None, None) => None,
        };

        let mut rings: BTreeMap<Branch, KeyRing> = format
            .branches(&network)
            .into_iter()
            .map(|branch| (branch, KeyRing::new(branch, format.script_type(branch))))
            .collect();
        for info in address_infos.values().filter(|info| info.used) {
            let path: AddressPath = info.path.parse()?;
            if let Some(ring) = rings.get_mut(&path.branch) {
                ring.set_used(path.index, true);
            }
        }

        Ok(Arc::new(Self {
            network,
            format,
            gap_limit: gap_limit.max(1),
            backend,
            events,
            seed,
            raw_keys,
            master: Mutex::new(None),
            rings: rings.into_iter().map(|(branch, ring)| (branch, tokio::sync::Mutex::new(ring))).collect(),
            branch_keys: RwLock::new(BTreeMap::new()),
            address_infos: RwLock::new(address_infos),
            tx_infos: RwLock::new(tx_infos.into_iter().map(|tx| (tx.txid.clone(), tx)).collect()),
        }))
    }

    pub fn network(&self) -> &NetworkParams { &self.network }
    pub fn format(&self) -> WalletFormat { self.format }
    pub fn gap_limit(&self) -> u32 { self.gap_limit }
    pub fn branches(&self) -> Vec<Branch> { self.rings.keys().copied().collect() }
    pub fn supports(&self, branch: Branch) -> bool { self.rings.contains_key(&branch) }

    /// Materialize the master key, compute branch keys and gap-fill every ring.
    pub async fn load(&self) -> Result<(), KeyError> {
        let has_master = self.master_key()?.is_some();
        let has_branch_keys = self.rings.keys().all(|b| self.raw_keys.branches.get(b).map_or(false, |k| !k.is_empty()));
        if !has_master && !has_branch_keys {
            return Err(KeyError::MissingMasterKey);
        }

        for (branch, ring) in &self.rings {
            let mut ring = ring.lock().await;
            let added = self.fill_locked(&mut ring)?;
            tracing::info!("Loaded {} {} branch: {} addresses ({} new)", self.format, branch, ring.len(), added);
        }
        Ok(())
    }

    /// Gap-fill one branch. Returns the number of newly derived addresses.
    pub async fn fill_branch(&self, branch: Branch) -> Result<usize, KeyError> {
        let ring = self.rings.get(&branch).ok_or(KeyError::UnsupportedBranch(branch))?;
        let mut ring = ring.lock().await;
        self.fill_locked(&mut ring)
    }

    pub async fn get_receive_address(self: &Arc<Self>) -> Result<Address, KeyError> {
        self.next_address(Branch::Receive).await
    }

    /// Served from the receive branch when the format has no change branch.
    pub async fn get_change_address(self: &Arc<Self>) -> Result<Address, KeyError> {
        let branch = if self.format.change_from_receive() { Branch::Receive } else { Branch::Change };
        self.next_address(branch).await
    }

    /// First unused address. When every derived address is used the latest
    /// one is returned and a fill runs in the background.
    async fn next_address(self: &Arc<Self>, branch: Branch) -> Result<Address, KeyError> {
        let lock = self.rings.get(&branch).ok_or(KeyError::UnsupportedBranch(branch))?;
        let mut ring = lock.lock().await;
        if ring.is_empty() {
            self.fill_locked(&mut ring)?;
        }
        if let Some(address) = ring.first_unused() {
            return Ok(address.clone());
        }
        let last = ring.last().cloned().ok_or(KeyError::MissingMasterKey)?;
        drop(ring);

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = manager.fill_branch(branch).await {
                tracing::warn!("Background fill of {} branch failed: {}", branch, e);
            }
        });
        Ok(last)
    }

    /// Record whether an address has history, extending its ring as needed.
    pub async fn mark_used(&self, script_hash: &str, used: bool) -> Result<(), KeyError> {
        let path = {
            let mut infos = self.infos_mut();
            let info = infos.get_mut(script_hash).ok_or_else(|| KeyError::UnknownAddress(script_hash.to_string()))?;
            info.used = used;
            info.path.clone()
        };
        let path: AddressPath = path.parse()?;
        let lock = self.rings.get(&path.branch).ok_or(KeyError::UnsupportedBranch(path.branch))?;
        let mut ring = lock.lock().await;
        ring.set_used(path.index, used);
        let added = self.fill_locked(&mut ring)?;
        tracing::debug!("Marked {} as used={} ({} new addresses)", path, used, added);
        Ok(())
    }

    pub async fn add_address_info(&self, script_hash: impl Into<String>, info: AddressInfo) -> Result<(), KeyError> {
        let path: AddressPath = info.path.parse()?;
        let lock = self.rings.get(&path.branch).ok_or(KeyError::UnsupportedBranch(path.branch))?;
        let used = info.used;
        self.infos_mut().insert(script_hash.into(), info);
        if used {
            let mut ring = lock.lock().await;
            ring.set_used(path.index, true);
            self.fill_locked(&mut ring)?;
        }
        Ok(())
    }

    pub fn add_tx_info(&self, info: TxInfo) {
        self.tx_infos.write().unwrap_or_else(|e| e.into_inner()).insert(info.txid.clone(), info);
    }

    pub fn address_info(&self, script_hash: &str) -> Option<AddressInfo> { self.infos().get(script_hash).cloned() }

    pub fn address_infos(&self) -> HashMap<String, AddressInfo> { self.infos().clone() }

    pub async fn addresses(&self, branch: Branch) -> Result<Vec<Address>, KeyError> {
        match self.rings.get(&branch) {
            Some(ring) => Ok(ring.lock().await.addresses().to_vec()),
            None if branch == Branch::Change && self.format.change_from_receive() => Ok(Vec::new()),
            None => Err(KeyError::UnsupportedBranch(branch)),
        }
    }

    /// Public text of a branch key, once computed.
    pub fn branch_public_key(&self, branch: Branch) -> Option<String> {
        self.branch_keys.read().unwrap_or_else(|e| e.into_inner()).get(&branch).cloned()
    }

    pub fn serialized_keys(&self) -> SerializedKeys {
        let master = self
            .master_key()
            .ok()
            .flatten()
            .and_then(|m| m.neuter(self.backend.as_ref()).ok())
            .and_then(|m| m.encode().ok());
        SerializedKeys {
            network: self.network.name.clone(),
            format: self.format,
            master,
            branches: self.branch_keys.read().unwrap_or_else(|e| e.into_inner()).clone(),
        }
    }

    pub fn is_watch_only(&self) -> bool {
        let master_private = matches!(self.master_key(), Ok(Some(ref m)) if m.has_private());
        let branch_private = self.raw_keys.branches.values().any(|k| k.private.is_some());
        !master_private && !branch_private
    }

    /// Sign each input with the key of the address that owns the spent output.
    pub fn sign(&self, inputs: &[SpendInput]) -> Result<Vec<InputSignature>, KeyError> {
        let backend = self.backend.as_ref();
        let mut signatures = Vec::with_capacity(inputs.len());
        for input in inputs {
            let unknown_output = || KeyError::UnknownOutput { txid: input.prev_txid.clone(), index: input.prev_index };
            let script_hash = {
                let txs = self.tx_infos.read().unwrap_or_else(|e| e.into_inner());
                let tx = txs.get(&input.prev_txid).ok_or_else(unknown_output)?;
                tx.outputs.get(input.prev_index as usize).ok_or_else(unknown_output)?.script_hash.clone()
            };
            let path = self
                .infos()
                .get(&script_hash)
                .map(|info| info.path.clone())
                .ok_or_else(|| KeyError::UnknownAddress(script_hash.clone()))?;
            let path: AddressPath = path.parse()?;

            let child = self.private_branch_key(path.branch)?.derive_child(backend, path.index)?;
            let secret = child.private_key().ok_or(KeyError::MissingPrivateKey)?;
            signatures.push(InputSignature {
                signature: backend.sign(secret, &input.sighash)?,
                public_key: child.public_key(backend)?,
                path: path.to_string(),
            });
        }
        tracing::info!("Signed {} inputs", signatures.len());
        Ok(signatures)
    }

    fn fill_locked(&self, ring: &mut KeyRing) -> Result<usize, KeyError> {
        if self.ensure_branch_key(ring)? {
            self.events.on_new_key(&self.serialized_keys());
        }

        let mut added = 0;
        let mut cached = if ring.needs_fill(self.gap_limit) { self.cached_addresses(ring.branch()) } else { HashMap::new() };
        while ring.needs_fill(self.gap_limit) {
            let index = ring.next_index();
            if index >= HARDENED {
                return Err(KeyError::IndexOutOfRange(u64::from(index)));
            }
            let address = match cached.remove(&index) {
                Some(address) => address,
                None => {
                    let address = ring.derive_address(self.backend.as_ref(), &self.network, index)?;
                    let path = address.path().to_string();
                    self.infos_mut().entry(address.script_hash.clone()).or_insert_with(|| AddressInfo {
                        path: path.clone(),
                        display_address: address.display_address.clone(),
                        used: false,
                    });
                    self.events.on_new_address(&address.script_hash, &address.display_address, &path);
                    added += 1;
                    address
                }
            };
            ring.push(address)?;
        }
        if added > 0 {
            tracing::debug!("Derived {} addresses on {} branch (now {})", added, ring.branch(), ring.len());
        }
        Ok(added)
    }

    /// Compute the ring's branch key if missing. Returns true when it did.
    fn ensure_branch_key(&self, ring: &mut KeyRing) -> Result<bool, KeyError> {
        if ring.key().is_some() {
            return Ok(false);
        }
        let backend = self.backend.as_ref();
        let versions = self.format.key_versions(&self.network);
        let raw = self.raw_keys.branches.get(&ring.branch());

        let key = if let Some(text) = raw.and_then(|k| k.public.as_deref()) {
            ExtendedKey::decode(backend, text, versions)?
        } else if let Some(text) = raw.and_then(|k| k.private.as_deref()) {
            ExtendedKey::decode(backend, text, versions)?
        } else {
            let master = self.master_key()?.ok_or(KeyError::MissingMasterKey)?;
            master.derive_child(backend, ring.branch().child_index())?
        };
        ring.set_key(key, backend)?;

        if let Some(key) = ring.key() {
            let text = key.encode()?;
            self.branch_keys.write().unwrap_or_else(|e| e.into_inner()).insert(ring.branch(), text);
        }
        Ok(true)
    }

    /// Account-level key: from the seed, else the imported private text,
    /// else the imported public text (watch-only).
    fn master_key(&self) -> Result<Option<ExtendedKey>, KeyError> {
        let mut master = self.master.lock().unwrap_or_else(|e| e.into_inner());
        if master.is_some() {
            return Ok(master.clone());
        }
        let backend = self.backend.as_ref();
        let versions = self.format.key_versions(&self.network);

        let key = if let Some(seed) = &self.seed {
            let root = ExtendedKey::from_seed(backend, seed, &self.network, versions)?;
            Some(root.derive_path(backend, &self.format.account_path(&self.network))?)
        } else if let Some(text) = self.raw_keys.master.private.as_deref() {
            Some(ExtendedKey::decode(backend, text, versions)?)
        } else if let Some(text) = self.raw_keys.master.public.as_deref() {
            Some(ExtendedKey::decode(backend, text, versions)?)
        } else {
            None
        };
        *master = key.clone();
        Ok(key)
    }

    fn private_branch_key(&self, branch: Branch) -> Result<ExtendedKey, KeyError> {
        if !self.supports(branch) {
            return Err(KeyError::UnsupportedBranch(branch));
        }
        if let Some(master) = self.master_key()?.filter(|m| m.has_private()) {
            return master.derive_child(self.backend.as_ref(), branch.child_index());
        }
        match self.raw_keys.branches.get(&branch).and_then(|k| k.private.as_deref()) {
            Some(text) => ExtendedKey::decode(self.backend.as_ref(), text, self.format.key_versions(&self.network)),
            None => Err(KeyError::MissingPrivateKey),
        }
    }

    /// Address infos recorded for one branch, keyed by index.
    fn cached_addresses(&self, branch: Branch) -> HashMap<u32, Address> {
        self.infos()
            .iter()
            .filter_map(|(script_hash, info)| {
                let path: AddressPath = info.path.parse().ok()?;
                (path.branch == branch).then(|| {
                    let address = Address {
                        display_address: info.display_address.clone(),
                        script_hash: script_hash.clone(),
                        index: path.index,
                        branch,
                    };
                    (path.index, address)
                })
            })
            .collect()
    }

    fn infos(&self) -> RwLockReadGuard<'_, HashMap<String, AddressInfo>> {
        self.address_infos.read().unwrap_or_else(|e| e.into_inner())
    }

    fn infos_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, AddressInfo>> {
        self.address_infos.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyManager")
            .field("network", &self.network.name)
            .field("format", &self.format)
            .field("gap_limit", &self.gap_limit)
            .field("branches", &self.branches())
            .finish()
    }
}
