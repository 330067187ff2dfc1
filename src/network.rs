//! Network parameters - explicit, immutable per-currency configuration
//!
//! Every component that needs prefixes or version bytes receives a
//! `NetworkParams` value at construction. There is no global registry.
//! Higher layers (currency plugins) build these from their own tables;
//! the presets below cover the networks the test-suite and CLI use.
//!
//! | Field | Used for |
//! |-------|----------|
//! | `pubkey_hash` | P2PKH address version byte |
//! | `script_hash` | P2SH address version byte |
//! | `bech32_hrp` | P2WPKH human-readable part (`None` = no native segwit) |
//! | `legacy_keys` | xprv/xpub version bytes (BIP32/BIP44) |
//! | `nested_keys` | yprv/ypub version bytes (BIP49) |
//! | `native_keys` | zprv/zpub version bytes (BIP84) |

use serde::{Deserialize, Serialize};

/// Version bytes for one extended-key flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyVersions {
    pub private: u32,
    pub public: u32,
}

impl KeyVersions {
    pub const fn new(private: u32, public: u32) -> Self { Self { private, public } }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkParams {
    pub name: String,
    /// SLIP-44 coin type used in BIP44/49/84 account paths
    pub coin_type: u32,
    pub pubkey_hash: u8,
    pub script_hash: u8,
    #[serde(default)]
    pub bech32_hrp: Option<String>,
    /// Whether segwit scripts (nested or native) are valid on this chain
    #[serde(default)]
    pub segwit: bool,
    pub legacy_keys: KeyVersions,
    #[serde(default)]
    pub nested_keys: Option<KeyVersions>,
    #[serde(default)]
    pub native_keys: Option<KeyVersions>,
    /// HMAC key for the BIP32 master node
    #[serde(default = "default_master_secret")]
    pub master_secret: String,
}

fn default_master_secret() -> String { "Bitcoin seed".into() }

impl NetworkParams {
    pub fn bitcoin() -> Self {
        Self {
            name: "bitcoin".into(),
            coin_type: 0,
            pubkey_hash: 0x00,
            script_hash: 0x05,
            bech32_hrp: Some("bc".into()),
            segwit: true,
            legacy_keys: KeyVersions::new(0x0488_ade4, 0x0488_b21e),
            nested_keys: Some(KeyVersions::new(0x049d_7878, 0x049d_7cb2)),
            native_keys: Some(KeyVersions::new(0x04b2_430c, 0x04b2_4746)),
            master_secret: default_master_secret(),
        }
    }

    pub fn testnet() -> Self {
        Self {
            name: "testnet".into(),
            coin_type: 1,
            pubkey_hash: 0x6f,
            script_hash: 0xc4,
            bech32_hrp: Some("tb".into()),
            segwit: true,
            legacy_keys: KeyVersions::new(0x0435_8394, 0x0435_87cf),
            nested_keys: Some(KeyVersions::new(0x044a_4e28, 0x044a_5262)),
            native_keys: Some(KeyVersions::new(0x045f_18bc, 0x045f_1cf6)),
            master_secret: default_master_secret(),
        }
    }

    pub fn litecoin() -> Self {
        Self {
            name: "litecoin".into(),
            coin_type: 2,
            pubkey_hash: 0x30,
            script_hash: 0x32,
            bech32_hrp: Some("ltc".into()),
            segwit: true,
            legacy_keys: KeyVersions::new(0x019d_9cfe, 0x019d_a462),
            nested_keys: Some(KeyVersions::new(0x01b2_6792, 0x01b2_6ef6)),
            native_keys: None,
            master_secret: default_master_secret(),
        }
    }

    /// Look up a preset by name. Returns `None` for unknown names; callers with
    /// their own tables should construct `NetworkParams` directly.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "bitcoin" | "mainnet" => Some(Self::bitcoin()),
            "testnet" | "bitcointestnet" => Some(Self::testnet()),
            "litecoin" => Some(Self::litecoin()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_by_name() {
        assert_eq!(NetworkParams::from_name("Bitcoin"), Some(NetworkParams::bitcoin()));
        assert_eq!(NetworkParams::from_name("testnet").map(|n| n.coin_type), Some(1));
        assert!(NetworkParams::from_name("dogecoin").is_none());
    }

    #[test]
    fn test_params_from_json() {
        let json = serde_json::json!({
            "name": "regtest",
            "coin_type": 1,
            "pubkey_hash": 0x6f,
            "script_hash": 0xc4,
            "bech32_hrp": "bcrt",
            "segwit": true,
            "legacy_keys": {"private": 0x0435_8394u32, "public": 0x0435_87cfu32}
        });
        let params: NetworkParams = serde_json::from_value(json).expect("params");
        assert_eq!(params.master_secret, "Bitcoin seed");
        assert!(params.native_keys.is_none());
        assert_eq!(params.bech32_hrp.as_deref(), Some("bcrt"));
    }
}
