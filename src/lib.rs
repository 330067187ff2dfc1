//! Beesync: HD key management and multi-server Electrum sync for
//! Bitcoin-family wallets.
//!
//! # Architecture
//!
//! ```text
//! NetworkParams (explicit, per currency)
//!   │
//!   ├── KeyManager (keys)
//!   │     ├── master ExtendedKey (seed / xprv / xpub)
//!   │     └── KeyRing per branch ── gap-limited Address list
//!   │
//!   ├── ElectrumClient (electrum)
//!   │     └── driver task ── connection slots ── reader/writer tasks
//!   │
//!   └── AddressWatcher (sync)
//!         new address → subscribe; status change → history → mark_used
//! ```
//!
//! # Layers
//!
//! | Module | Role |
//! |--------|------|
//! | `codec` | Base58Check / Bech32 |
//! | `crypto` | HMAC-SHA512 tweak, injectable curve backend |
//! | `network` | version bytes, prefixes, coin type |
//! | `keys` | extended keys, wallet formats, rings, KeyManager |
//! | `electrum` | wire protocol, connection pool, RPC surface |
//! | `sync` | KeyManager ↔ Electrum bridge |
//!
//! # Features
//!
//! - `native` - logging setup and the `beesync` CLI
//!
//! # Usage
//!
//! ```ignore
//! use beesync::keys::{KeyManager, KeyManagerConfig, NoopKeyEvents, WalletFormat};
//! use beesync::{NetworkParams, Secp256k1Backend};
//! use std::sync::Arc;
//!
//! let config = KeyManagerConfig::new(NetworkParams::bitcoin())
//!     .with_format(WalletFormat::Bip84)
//!     .with_mnemonic("abandon abandon ...");
//! let manager = KeyManager::new(config, Arc::new(NoopKeyEvents), Arc::new(Secp256k1Backend::new()))?;
//! manager.load().await?;
//! let address = manager.get_receive_address().await?;
//! ```

pub mod codec;
pub mod crypto;
pub mod electrum;
pub mod keys;
pub mod network;
pub mod sync;

#[cfg(feature = "native")]
pub mod logging;

pub use codec::CodecError;
pub use crypto::{CurveBackend, Secp256k1Backend};
pub use electrum::{ElectrumClient, ElectrumConfig, ElectrumError, ElectrumEvents};
pub use keys::{KeyError, KeyManager, KeyManagerConfig, KeyManagerEvents, WalletFormat};
pub use network::{KeyVersions, NetworkParams};
pub use sync::{AddressWatcher, KeyStore};
