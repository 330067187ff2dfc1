//! Wallet formats and branches.
//!
//! | Format | Account path | Branches | Script | Key versions |
//! |--------|--------------|----------|--------|--------------|
//! | Bip32 | `m` | receive | P2PKH | legacy |
//! | Bip44 | `m/44'/coin'/0'` | receive, change, nested* | P2PKH (nested: P2WPKH-in-P2SH) | legacy |
//! | Bip49 | `m/49'/coin'/0'` | receive, change | P2WPKH-in-P2SH | nested |
//! | Bip84 | `m/84'/coin'/0'` | receive, change | P2WPKH | native |
//!
//! *only on networks with segwit enabled

use super::address::ScriptType;
use super::KeyError;
use crate::crypto::HARDENED;
use crate::network::{KeyVersions, NetworkParams};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Branch {
    Receive,
    Change,
    Nested,
}

impl Branch {
    pub const ALL: [Branch; 3] = [Branch::Receive, Branch::Change, Branch::Nested];

    pub fn child_index(&self) -> u32 {
        match self { Branch::Receive => 0, Branch::Change => 1, Branch::Nested => 2 }
    }

    pub fn from_child_index(index: u32) -> Option<Self> {
        match index { 0 => Some(Branch::Receive), 1 => Some(Branch::Change), 2 => Some(Branch::Nested), _ => None }
    }

    pub fn as_str(&self) -> &'static str {
        match self { Branch::Receive => "receive", Branch::Change => "change", Branch::Nested => "nested" }
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalletFormat {
    #[default]
    Bip32,
    Bip44,
    Bip49,
    Bip84,
}

impl WalletFormat {
    pub fn as_str(&self) -> &'static str {
        match self { WalletFormat::Bip32 => "bip32", WalletFormat::Bip44 => "bip44", WalletFormat::Bip49 => "bip49", WalletFormat::Bip84 => "bip84" }
    }

    /// Parse a wallet type string such as `wallet:bitcoin-bip84`. A bare
    /// `wallet:<currency>` is the legacy single-chain format.
    pub fn from_wallet_type(wallet_type: &str) -> Result<Self, KeyError> {
        let body = wallet_type.trim().strip_prefix("wallet:").unwrap_or(wallet_type.trim());
        match body.rsplit_once('-') {
            Some((_, suffix)) => suffix.parse(),
            None if wallet_type.trim().starts_with("wallet:") && !body.is_empty() => Ok(WalletFormat::Bip32),
            None => body.parse(),
        }
    }

    pub fn purpose(&self) -> Option<u32> {
        match self { WalletFormat::Bip32 => None, WalletFormat::Bip44 => Some(44), WalletFormat::Bip49 => Some(49), WalletFormat::Bip84 => Some(84) }
    }

    /// Path from the seed root to the account (master) key.
    pub fn account_path(&self, network: &NetworkParams) -> Vec<u32> {
        match self.purpose() {
            Some(purpose) => vec![purpose + HARDENED, network.coin_type + HARDENED, HARDENED],
            None => Vec::new(),
        }
    }

    pub fn key_versions(&self, network: &NetworkParams) -> KeyVersions {
        match self {
            WalletFormat::Bip32 | WalletFormat::Bip44 => network.legacy_keys,
            WalletFormat::Bip49 => network.nested_keys.unwrap_or(network.legacy_keys),
            WalletFormat::Bip84 => network.native_keys.unwrap_or(network.legacy_keys),
        }
    }

    pub fn branches(&self, network: &NetworkParams) -> Vec<Branch> {
        match self {
            WalletFormat::Bip32 => vec![Branch::Receive],
            WalletFormat::Bip44 if network.segwit => vec![Branch::Receive, Branch::Change, Branch::Nested],
            _ => vec![Branch::Receive, Branch::Change],
        }
    }

    /// Bip32 wallets hand out change from the receive branch. Their change
    /// branch is never filled and lists no addresses.
    pub fn change_from_receive(&self) -> bool { matches!(self, WalletFormat::Bip32) }

    pub fn script_type(&self, branch: Branch) -> ScriptType {
        match (self, branch) {
            (WalletFormat::Bip49, _) | (_, Branch::Nested) => ScriptType::P2shP2wpkh,
            (WalletFormat::Bip84, _) => ScriptType::P2wpkh,
            _ => ScriptType::P2pkh,
        }
    }

    /// Reject combinations the network cannot express.
    pub fn check_network(&self, network: &NetworkParams) -> Result<(), KeyError> {
        let ok = match self {
            WalletFormat::Bip32 | WalletFormat::Bip44 => true,
            WalletFormat::Bip49 => network.segwit,
            WalletFormat::Bip84 => network.segwit && network.bech32_hrp.is_some(),
        };
        if ok { Ok(()) } else { Err(KeyError::UnknownWalletType(format!("{} on {}", self, network.name))) }
    }
}

impl fmt::Display for WalletFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for WalletFormat {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bip32" => Ok(WalletFormat::Bip32),
            "bip44" => Ok(WalletFormat::Bip44),
            "bip49" => Ok(WalletFormat::Bip49),
            "bip84" => Ok(WalletFormat::Bip84),
            _ => Err(KeyError::UnknownWalletType(s.to_string())),
        }
    }
}
