//! Crypto - curve backend and the BIP32 tweak primitive
//!
//! The curve math is injected: callers hand an `Arc<dyn CurveBackend>` to the
//! key manager once at startup. `Secp256k1Backend` (libsecp256k1 through the
//! `bitcoin` crate) is the default.
//!
//! ```text
//! derive_tweak(parent, chain_code, index)
//!     │
//!     ├── index >= 2^31 → 0x00 ‖ private ‖ index_be32   (needs private key)
//!     └── index <  2^31 → public ‖ index_be32
//!            │
//!            ▼
//!     HMAC-SHA512(chain_code, material) = IL ‖ IR
//!            │
//!            ├── IL → child private = parent + IL (mod n) / child public = parent + IL·G
//!            └── IR → child chain code
//! ```

use crate::keys::KeyError;
use bitcoin::hashes::{hash160, sha256, Hash};
use bitcoin::secp256k1::{ecdsa, All, Message, PublicKey, Scalar, Secp256k1, SecretKey};
use hmac::{Hmac, Mac};
use sha2::Sha512;
use std::fmt;
use zeroize::Zeroizing;

/// First hardened child index.
pub const HARDENED: u32 = 0x8000_0000;

/// Upper bound on out-of-range retries during one derivation step.
pub const MAX_TWEAK_ATTEMPTS: u32 = 8;

/// Tweak results that fall outside the curve order (or hit infinity).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfRange;

/// Curve and hash operations needed by key derivation and signing.
pub trait CurveBackend: Send + Sync + fmt::Debug {
    fn public_key(&self, secret: &[u8; 32]) -> Result<[u8; 33], KeyError>;
    fn tweak_secret(&self, secret: &[u8; 32], tweak: &[u8; 32]) -> Result<[u8; 32], OutOfRange>;
    fn tweak_public(&self, public: &[u8; 33], tweak: &[u8; 32]) -> Result<[u8; 33], OutOfRange>;
    fn validate_public(&self, public: &[u8; 33]) -> Result<(), KeyError>;
    fn validate_secret(&self, secret: &[u8; 32]) -> Result<(), KeyError> { self.public_key(secret).map(|_| ()) }
    /// ECDSA over a 32-byte digest, DER encoded.
    fn sign(&self, secret: &[u8; 32], digest: &[u8; 32]) -> Result<Vec<u8>, KeyError>;

    fn hmac_sha512(&self, key: &[u8], data: &[u8]) -> [u8; 64] { hmac_sha512(key, data) }
}

pub struct Secp256k1Backend {
    secp: Secp256k1<All>,
}

impl Secp256k1Backend {
    pub fn new() -> Self { Self { secp: Secp256k1::new() } }

    /// Check a DER signature; used by tests and by callers that want to
    /// double-check before broadcasting.
    pub fn verify(&self, public: &[u8; 33], digest: &[u8; 32], der: &[u8]) -> bool {
        let (Ok(pk), Ok(sig)) = (PublicKey::from_slice(public), ecdsa::Signature::from_der(der)) else {
            return false;
        };
        self.secp.verify_ecdsa(&Message::from_digest(*digest), &sig, &pk).is_ok()
    }
}

impl Default for Secp256k1Backend {
    fn default() -> Self { Self::new() }
}

impl fmt::Debug for Secp256k1Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str("Secp256k1Backend") }
}

impl CurveBackend for Secp256k1Backend {
    fn public_key(&self, secret: &[u8; 32]) -> Result<[u8; 33], KeyError> {
        let sk = SecretKey::from_slice(secret).map_err(|e| KeyError::InvalidKey(e.to_string()))?;
        Ok(PublicKey::from_secret_key(&self.secp, &sk).serialize())
    }

    fn tweak_secret(&self, secret: &[u8; 32], tweak: &[u8; 32]) -> Result<[u8; 32], OutOfRange> {
        let sk = SecretKey::from_slice(secret).map_err(|_| OutOfRange)?;
        let scalar = Scalar::from_be_bytes(*tweak).map_err(|_| OutOfRange)?;
        Ok(sk.add_tweak(&scalar).map_err(|_| OutOfRange)?.secret_bytes())
    }

    fn tweak_public(&self, public: &[u8; 33], tweak: &[u8; 32]) -> Result<[u8; 33], OutOfRange> {
        let pk = PublicKey::from_slice(public).map_err(|_| OutOfRange)?;
        let scalar = Scalar::from_be_bytes(*tweak).map_err(|_| OutOfRange)?;
        Ok(pk.add_exp_tweak(&self.secp, &scalar).map_err(|_| OutOfRange)?.serialize())
    }

    fn validate_public(&self, public: &[u8; 33]) -> Result<(), KeyError> {
        PublicKey::from_slice(public).map(|_| ()).map_err(|e| KeyError::InvalidKey(e.to_string()))
    }

    fn validate_secret(&self, secret: &[u8; 32]) -> Result<(), KeyError> {
        SecretKey::from_slice(secret).map(|_| ()).map_err(|e| KeyError::InvalidKey(e.to_string()))
    }

    fn sign(&self, secret: &[u8; 32], digest: &[u8; 32]) -> Result<Vec<u8>, KeyError> {
        let sk = SecretKey::from_slice(secret).map_err(|e| KeyError::InvalidKey(e.to_string()))?;
        let sig = self.secp.sign_ecdsa(&Message::from_digest(*digest), &sk);
        Ok(sig.serialize_der().to_vec())
    }
}

pub fn hmac_sha512(key: &[u8], data: &[u8]) -> [u8; 64] {
    let mut mac = Hmac::<Sha512>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    let mut out = [0u8; 64];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

pub fn hash160(data: &[u8]) -> [u8; 20] { hash160::Hash::hash(data).to_byte_array() }

pub fn sha256(data: &[u8]) -> [u8; 32] { sha256::Hash::hash(data).to_byte_array() }

/// Output of one successful derivation step.
pub struct ChildKey {
    /// Index actually used; differs from the requested one after a retry.
    pub index: u32,
    pub chain_code: [u8; 32],
    pub private_key: Option<Zeroizing<[u8; 32]>>,
    pub public_key: [u8; 33],
}

/// Next index to try after an out-of-range tweak, staying on the same side of
/// the hardened boundary.
pub fn retry_index(index: u32) -> u32 {
    let hardened = index >= HARDENED;
    match index.checked_add(1) {
        Some(next) if (next >= HARDENED) == hardened => next,
        Some(next) => next - HARDENED,
        None => HARDENED,
    }
}

/// Derive the child at `index` from a parent key pair and chain code.
///
/// `parent_public` may be omitted when `parent_private` is present; it is then
/// computed once up front. An invalid parent key fails with `InvalidKey`
/// before any tweak is tried.
pub fn derive_tweak(
    backend: &dyn CurveBackend,
    parent_private: Option<&[u8; 32]>,
    parent_public: Option<&[u8; 33]>,
    chain_code: &[u8; 32],
    index: u32,
) -> Result<ChildKey, KeyError> {
    if let Some(private) = parent_private {
        backend.validate_secret(private)?;
    }
    let parent_public = match (parent_public, parent_private) {
        (Some(public), _) => {
            backend.validate_public(public)?;
            *public
        }
        (None, Some(private)) => backend.public_key(private)?,
        (None, None) => return Err(KeyError::MissingPrivateKey),
    };

    let mut index = index;
    for _ in 0..MAX_TWEAK_ATTEMPTS {
        let mut material = Zeroizing::new(Vec::with_capacity(37));
        if index >= HARDENED {
            let private = parent_private.ok_or(KeyError::MissingPrivateKey)?;
            material.push(0x00);
            material.extend_from_slice(private);
        } else {
            material.extend_from_slice(&parent_public);
        }
        material.extend_from_slice(&index.to_be_bytes());

        let digest = Zeroizing::new(backend.hmac_sha512(chain_code, &material));
        let mut tweak = Zeroizing::new([0u8; 32]);
        tweak.copy_from_slice(&digest[..32]);
        let mut child_chain = [0u8; 32];
        child_chain.copy_from_slice(&digest[32..]);

        let outcome = match parent_private {
            Some(private) => backend.tweak_secret(private, &tweak).and_then(|secret| {
                let public = backend.public_key(&secret).map_err(|_| OutOfRange)?;
                Ok((Some(Zeroizing::new(secret)), public))
            }),
            None => backend.tweak_public(&parent_public, &tweak).map(|public| (None, public)),
        };

        match outcome {
            Ok((private_key, public_key)) => {
                return Ok(ChildKey { index, chain_code: child_chain, private_key, public_key });
            }
            Err(OutOfRange) => {
                let next = retry_index(index);
                tracing::warn!("Tweak out of range at index {}, retrying with {}", index, next);
                index = next;
            }
        }
    }
    Err(KeyError::TweakRetriesExhausted(MAX_TWEAK_ATTEMPTS))
}
