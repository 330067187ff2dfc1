//! Extended keys (BIP32) with explicit version bytes.
//!
//! Serialized layout (78 bytes, Base58Check in text form):
//!
//! ```text
//! version(4) ‖ depth(1) ‖ parent_fingerprint(4) ‖ child_number(4) ‖ chain_code(32) ‖ key_data(33)
//! ```
//!
//! `key_data` is `0x00 ‖ private_key` or the compressed public key.

use super::KeyError;
use crate::codec;
use crate::crypto::{self, CurveBackend};
use crate::network::{KeyVersions, NetworkParams};
use std::fmt;
use zeroize::Zeroizing;

const SERIALIZED_LEN: usize = 78;

#[derive(Clone, PartialEq, Eq)]
pub struct ExtendedKey {
    versions: KeyVersions,
    depth: u8,
    parent_fingerprint: [u8; 4],
    child_number: u32,
    chain_code: [u8; 32],
    private_key: Option<Zeroizing<[u8; 32]>>,
    public_key: Option<[u8; 33]>,
}

impl ExtendedKey {
    /// Master node: `HMAC-SHA512(master_secret, seed)`.
    pub fn from_seed(backend: &dyn CurveBackend, seed: &[u8], network: &NetworkParams, versions: KeyVersions) -> Result<Self, KeyError> {
        if !(16..=64).contains(&seed.len()) {
            return Err(KeyError::InvalidSeed(seed.len()));
        }
        let digest = Zeroizing::new(backend.hmac_sha512(network.master_secret.as_bytes(), seed));
        let mut private = Zeroizing::new([0u8; 32]);
        private.copy_from_slice(&digest[..32]);
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&digest[32..]);
        let public = backend.public_key(&private)?;

        Ok(Self {
            versions,
            depth: 0,
            parent_fingerprint: [0; 4],
            child_number: 0,
            chain_code,
            private_key: Some(private),
            public_key: Some(public),
        })
    }

    pub fn decode(backend: &dyn CurveBackend, text: &str, versions: KeyVersions) -> Result<Self, KeyError> {
        let data = Zeroizing::new(codec::decode_check_len(text.trim(), SERIALIZED_LEN)?);
        let version = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let is_private = if version == versions.private {
            true
        } else if version == versions.public {
            false
        } else {
            return Err(KeyError::WrongNetworkVersion { found: version, expected: versions });
        };

        let mut parent_fingerprint = [0u8; 4];
        parent_fingerprint.copy_from_slice(&data[5..9]);
        let child_number = u32::from_be_bytes([data[9], data[10], data[11], data[12]]);
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&data[13..45]);

        let (private_key, public_key) = if is_private {
            if data[45] != 0x00 {
                return Err(KeyError::InvalidKey("private key data must start with 0x00".into()));
            }
            let mut private = Zeroizing::new([0u8; 32]);
            private.copy_from_slice(&data[46..78]);
            let public = backend.public_key(&private)?;
            (Some(private), public)
        } else {
            let mut public = [0u8; 33];
            public.copy_from_slice(&data[45..78]);
            backend.validate_public(&public)?;
            (None, public)
        };

        Ok(Self {
            versions,
            depth: data[4],
            parent_fingerprint,
            child_number,
            chain_code,
            private_key,
            public_key: Some(public_key),
        })
    }

    pub fn versions(&self) -> KeyVersions { self.versions }
    pub fn depth(&self) -> u8 { self.depth }
    pub fn parent_fingerprint(&self) -> [u8; 4] { self.parent_fingerprint }
    pub fn child_number(&self) -> u32 { self.child_number }
    pub fn chain_code(&self) -> &[u8; 32] { &self.chain_code }
    pub fn private_key(&self) -> Option<&[u8; 32]> { self.private_key.as_deref() }
    pub fn has_private(&self) -> bool { self.private_key.is_some() }

    /// Public key if already computed.
    pub fn cached_public_key(&self) -> Option<&[u8; 33]> { self.public_key.as_ref() }

    pub fn public_key(&self, backend: &dyn CurveBackend) -> Result<[u8; 33], KeyError> {
        match (&self.public_key, &self.private_key) {
            (Some(public), _) => Ok(*public),
            (None, Some(private)) => backend.public_key(private),
            (None, None) => Err(KeyError::InvalidKey("extended key holds no key material".into())),
        }
    }

    /// Same key with the public half computed.
    pub fn materialize(mut self, backend: &dyn CurveBackend) -> Result<Self, KeyError> {
        if self.public_key.is_none() {
            self.public_key = Some(self.public_key(backend)?);
        }
        Ok(self)
    }

    /// Public-only copy.
    pub fn neuter(&self, backend: &dyn CurveBackend) -> Result<Self, KeyError> {
        Ok(Self {
            versions: self.versions,
            depth: self.depth,
            parent_fingerprint: self.parent_fingerprint,
            child_number: self.child_number,
            chain_code: self.chain_code,
            private_key: None,
            public_key: Some(self.public_key(backend)?),
        })
    }

    /// First 4 bytes of HASH160(public key).
    pub fn fingerprint(&self, backend: &dyn CurveBackend) -> Result<[u8; 4], KeyError> {
        let hash = crypto::hash160(&self.public_key(backend)?);
        Ok([hash[0], hash[1], hash[2], hash[3]])
    }

    pub fn derive_child(&self, backend: &dyn CurveBackend, index: u32) -> Result<Self, KeyError> {
        if self.depth == u8::MAX {
            return Err(KeyError::DepthTooHigh);
        }
        let parent_public = self.public_key(backend)?;
        let child = crypto::derive_tweak(
            backend,
            self.private_key.as_deref(),
            Some(&parent_public),
            &self.chain_code,
            index,
        )?;
        let hash = crypto::hash160(&parent_public);

        Ok(Self {
            versions: self.versions,
            depth: self.depth + 1,
            parent_fingerprint: [hash[0], hash[1], hash[2], hash[3]],
            child_number: child.index,
            chain_code: child.chain_code,
            private_key: child.private_key,
            public_key: Some(child.public_key),
        })
    }

    pub fn derive_path(&self, backend: &dyn CurveBackend, path: &[u32]) -> Result<Self, KeyError> {
        let mut key = self.clone();
        for &index in path {
            key = key.derive_child(backend, index)?;
        }
        Ok(key)
    }

    /// Same key material under other version bytes (e.g. xpub → zpub).
    pub fn with_versions(mut self, versions: KeyVersions) -> Self {
        self.versions = versions;
        self
    }

    pub fn serialize(&self) -> Result<Zeroizing<Vec<u8>>, KeyError> {
        let mut out = Zeroizing::new(Vec::with_capacity(SERIALIZED_LEN));
        let version = if self.private_key.is_some() { self.versions.private } else { self.versions.public };
        out.extend_from_slice(&version.to_be_bytes());
        out.push(self.depth);
        out.extend_from_slice(&self.parent_fingerprint);
        out.extend_from_slice(&self.child_number.to_be_bytes());
        out.extend_from_slice(&self.chain_code);
        match (&self.private_key, &self.public_key) {
            (Some(private), _) => {
                out.push(0x00);
                out.extend_from_slice(&private[..]);
            }
            (None, Some(public)) => out.extend_from_slice(public),
            (None, None) => return Err(KeyError::InvalidKey("extended key holds no key material".into())),
        }
        Ok(out)
    }

    /// Base58Check text (xprv/xpub, or the network's equivalent).
    pub fn encode(&self) -> Result<String, KeyError> {
        Ok(codec::encode_check(&self.serialize()?))
    }
}

impl fmt::Debug for ExtendedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtendedKey")
            .field("depth", &self.depth)
            .field("child_number", &self.child_number)
            .field("parent_fingerprint", &hex::encode(self.parent_fingerprint))
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("public_key", &self.public_key.map(hex::encode))
            .finish()
    }
}
