//! Codec - Base58Check and Bech32 with checksum verification
//!
//! Thin layer over the `bitcoin` crate's `base58` and `bech32` re-exports so
//! the rest of the crate deals in one error type and in raw version bytes
//! instead of a fixed `bitcoin::Network`.

use bitcoin::base58;
use bitcoin::bech32::{segwit, Hrp};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Base58Check: {0}")]
    Base58(String),
    #[error("Bech32: {0}")]
    Bech32(String),
    #[error("Invalid payload length: expected {expected}, got {got}")]
    InvalidLength { expected: usize, got: usize },
    #[error("Unexpected address version byte 0x{0:02x}")]
    UnknownVersion(u8),
    #[error("Unexpected human-readable part: {0}")]
    WrongHrp(String),
    #[error("Unsupported witness program (version {version}, {len} bytes)")]
    UnsupportedWitness { version: u8, len: usize },
}

pub fn encode_check(payload: &[u8]) -> String {
    base58::encode_check(payload)
}

pub fn decode_check(text: &str) -> Result<Vec<u8>, CodecError> {
    base58::decode_check(text).map_err(|e| CodecError::Base58(e.to_string()))
}

/// Decode Base58Check and require an exact payload length.
pub fn decode_check_len(text: &str, expected: usize) -> Result<Vec<u8>, CodecError> {
    let data = decode_check(text)?;
    if data.len() != expected {
        return Err(CodecError::InvalidLength { expected, got: data.len() });
    }
    Ok(data)
}

/// `version ‖ hash` as Base58Check (P2PKH / P2SH addresses).
pub fn encode_versioned(version: u8, hash: &[u8; 20]) -> String {
    let mut payload = Vec::with_capacity(21);
    payload.push(version);
    payload.extend_from_slice(hash);
    encode_check(&payload)
}

pub fn decode_versioned(text: &str) -> Result<(u8, [u8; 20]), CodecError> {
    let data = decode_check_len(text, 21)?;
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&data[1..]);
    Ok((data[0], hash))
}

/// Segwit v0 address for a 20-byte key hash.
pub fn encode_segwit_v0(hrp: &str, program: &[u8]) -> Result<String, CodecError> {
    let hrp = Hrp::parse(hrp).map_err(|e| CodecError::Bech32(e.to_string()))?;
    segwit::encode(hrp, segwit::VERSION_0, program).map_err(|e| CodecError::Bech32(e.to_string()))
}

/// Decode a segwit v0 address, checking its human-readable part.
pub fn decode_segwit_v0(expected_hrp: &str, text: &str) -> Result<Vec<u8>, CodecError> {
    let (hrp, version, program) = segwit::decode(text).map_err(|e| CodecError::Bech32(e.to_string()))?;
    if hrp.to_lowercase() != expected_hrp.to_ascii_lowercase() {
        return Err(CodecError::WrongHrp(hrp.to_lowercase()));
    }
    if version != segwit::VERSION_0 {
        return Err(CodecError::UnsupportedWitness { version: version.to_u8(), len: program.len() });
    }
    Ok(program)
}
