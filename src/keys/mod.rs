//! Keys - HD derivation, address rings and the KeyManager
//!
//! ```text
//! seed / mnemonic / imported xprv|xpub
//!   │
//!   └── master (account) ExtendedKey
//!         ├── m/0  receive ring  ── Address{display_address, script_hash, index}
//!         ├── m/1  change ring
//!         └── m/2  nested-segwit ring (Bip44 on segwit networks)
//! ```
//!
//! Each ring keeps at least `gap_limit` unused addresses past the highest
//! used one. New addresses and branch keys are reported through
//! [`KeyManagerEvents`].

mod address;
mod events;
mod extended;
mod format;
mod manager;
mod path;
mod ring;

use crate::codec::CodecError;
use crate::network::KeyVersions;

pub use address::{decode_address, script_hash, Address, ScriptType};
pub use events::{KeyEvent, KeyManagerEvents, NoopKeyEvents};
pub use extended::ExtendedKey;
pub use format::{Branch, WalletFormat};
pub use manager::{
    AddressInfo, BranchKeys, InputSignature, KeyManager, KeyManagerConfig, RawKeys, SerializedKeys, SpendInput,
    TxInfo, TxOutput,
};
pub use path::{format_path, parse_index, parse_path, AddressPath};
pub use ring::KeyRing;

/// Default number of unused addresses kept past the last used one.
pub const DEFAULT_GAP_LIMIT: u32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("Private key required for this operation")]
    MissingPrivateKey,
    #[error("No master key, seed or branch key available")]
    MissingMasterKey,
    #[error("Index {0} out of range")]
    IndexOutOfRange(u64),
    #[error("Derivation depth limit (255) reached")]
    DepthTooHigh,
    #[error("Extended key version 0x{found:08x} does not match network (expected 0x{:08x}/0x{:08x})", .expected.private, .expected.public)]
    WrongNetworkVersion { found: u32, expected: KeyVersions },
    #[error("Unknown wallet type: {0}")]
    UnknownWalletType(String),
    #[error("Invalid mnemonic: {0}")]
    InvalidMnemonic(String),
    #[error("Invalid seed length: {0} bytes")]
    InvalidSeed(usize),
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("Invalid derivation path: {0}")]
    InvalidPath(String),
    #[error("Tweak out of range after {0} attempts")]
    TweakRetriesExhausted(u32),
    #[error("Branch {0} not supported by this wallet")]
    UnsupportedBranch(Branch),
    #[error("Unknown output {txid}:{index}")]
    UnknownOutput { txid: String, index: u32 },
    #[error("Unknown address: {0}")]
    UnknownAddress(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
}
