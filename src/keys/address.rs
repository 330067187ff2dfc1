//! Address / script mapping and the Electrum script hash.
//!
//! | Script | scriptPubKey | Display |
//! |--------|--------------|---------|
//! | P2PKH | `OP_DUP OP_HASH160 <h160(pk)> OP_EQUALVERIFY OP_CHECKSIG` | Base58Check(pubkey_hash ‖ h160) |
//! | P2WPKH-in-P2SH | `OP_HASH160 <h160(0x0014 ‖ h160(pk))> OP_EQUAL` | Base58Check(script_hash ‖ h160(redeem)) |
//! | P2WPKH | `OP_0 <h160(pk)>` | Bech32(hrp, v0, h160) |

use super::format::Branch;
use super::KeyError;
use crate::codec::{self, CodecError};
use crate::crypto;
use crate::network::NetworkParams;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptType {
    P2pkh,
    P2shP2wpkh,
    P2wpkh,
}

impl ScriptType {
    pub fn script_pubkey(&self, public_key: &[u8; 33]) -> Vec<u8> {
        let key_hash = crypto::hash160(public_key);
        match self {
            ScriptType::P2pkh => p2pkh_script(&key_hash),
            ScriptType::P2shP2wpkh => p2sh_script(&crypto::hash160(&p2wpkh_script(&key_hash))),
            ScriptType::P2wpkh => p2wpkh_script(&key_hash),
        }
    }

    /// Witness program wrapped by P2SH; `None` for the other script types.
    pub fn redeem_script(&self, public_key: &[u8; 33]) -> Option<Vec<u8>> {
        match self {
            ScriptType::P2shP2wpkh => Some(p2wpkh_script(&crypto::hash160(public_key))),
            _ => None,
        }
    }

    pub fn display_address(&self, public_key: &[u8; 33], network: &NetworkParams) -> Result<String, KeyError> {
        let key_hash = crypto::hash160(public_key);
        match self {
            ScriptType::P2pkh => Ok(codec::encode_versioned(network.pubkey_hash, &key_hash)),
            ScriptType::P2shP2wpkh => {
                let redeem = p2wpkh_script(&key_hash);
                Ok(codec::encode_versioned(network.script_hash, &crypto::hash160(&redeem)))
            }
            ScriptType::P2wpkh => {
                let hrp = network
                    .bech32_hrp
                    .as_deref()
                    .ok_or_else(|| CodecError::Bech32(format!("{} has no native segwit", network.name)))?;
                Ok(codec::encode_segwit_v0(hrp, &key_hash)?)
            }
        }
    }
}

fn p2pkh_script(key_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[0x76, 0xa9, 0x14]);
    script.extend_from_slice(key_hash);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

fn p2sh_script(script_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(23);
    script.extend_from_slice(&[0xa9, 0x14]);
    script.extend_from_slice(script_hash);
    script.push(0x87);
    script
}

fn p2wpkh_script(key_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(22);
    script.extend_from_slice(&[0x00, 0x14]);
    script.extend_from_slice(key_hash);
    script
}

/// Electrum script hash: SHA-256 of the scriptPubKey, byte-reversed, hex.
pub fn script_hash(script_pubkey: &[u8]) -> String {
    let mut digest = crypto::sha256(script_pubkey);
    digest.reverse();
    hex::encode(digest)
}

/// scriptPubKey for a display address on `network`.
pub fn decode_address(text: &str, network: &NetworkParams) -> Result<Vec<u8>, KeyError> {
    let text = text.trim();
    if let Some(hrp) = network.bech32_hrp.as_deref() {
        let prefix = format!("{}1", hrp);
        if text.to_ascii_lowercase().starts_with(&prefix) {
            let program = codec::decode_segwit_v0(hrp, text)?;
            let mut script = Vec::with_capacity(program.len() + 2);
            match program.len() {
                20 | 32 => {
                    script.push(0x00);
                    script.push(program.len() as u8);
                    script.extend_from_slice(&program);
                    return Ok(script);
                }
                len => return Err(CodecError::UnsupportedWitness { version: 0, len }.into()),
            }
        }
    }

    let (version, hash) = codec::decode_versioned(text)?;
    if version == network.pubkey_hash {
        Ok(p2pkh_script(&hash))
    } else if version == network.script_hash {
        Ok(p2sh_script(&hash))
    } else {
        Err(CodecError::UnknownVersion(version).into())
    }
}

/// One derived address in a ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub display_address: String,
    pub script_hash: String,
    pub index: u32,
    pub branch: Branch,
}

impl Address {
    pub fn from_public_key(
        public_key: &[u8; 33],
        script_type: ScriptType,
        network: &NetworkParams,
        branch: Branch,
        index: u32,
    ) -> Result<Self, KeyError> {
        Ok(Self {
            display_address: script_type.display_address(public_key, network)?,
            script_hash: script_hash(&script_type.script_pubkey(public_key)),
            index,
            branch,
        })
    }

    pub fn path(&self) -> super::AddressPath { super::AddressPath::new(self.branch, self.index) }
}
